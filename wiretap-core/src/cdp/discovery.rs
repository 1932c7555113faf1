//! Endpoint Discovery
//!
//! HTTP discovery against the remote debugging endpoint: readiness probe
//! (`/json/version`), target listing (`/json`) and the user-page selection
//! policy used by auto-follow.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// `/json/version` reply.
#[derive(Clone, Debug, Deserialize)]
pub struct DevToolsVersion {
    #[serde(rename = "Browser", default)]
    pub browser: String,
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub web_socket_debugger_url: Option<String>,
}

/// One entry of the `/json` target listing.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescription {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

/// HTTP client for one remote debugging base URL.
pub struct Discovery {
    base_url: String,
    http: reqwest::Client,
}

impl Discovery {
    pub fn new(base_url: &str) -> CoreResult<Self> {
        if base_url.is_empty() {
            return Err(CoreError::Config("devtools URL is empty".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .map_err(|err| CoreError::Config(err.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Readiness probe used at session start and by the launcher.
    pub async fn probe(&self) -> CoreResult<DevToolsVersion> {
        let url = format!("{}/json/version", self.base_url);
        let reply = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| CoreError::Transport(err.to_string()))?
            .error_for_status()
            .map_err(|err| CoreError::Transport(err.to_string()))?;
        reply
            .json::<DevToolsVersion>()
            .await
            .map_err(|err| CoreError::Transport(err.to_string()))
    }

    pub async fn list_targets(&self) -> CoreResult<Vec<TargetDescription>> {
        let url = format!("{}/json", self.base_url);
        let reply = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| CoreError::Transport(err.to_string()))?
            .error_for_status()
            .map_err(|err| CoreError::Transport(err.to_string()))?;
        reply
            .json::<Vec<TargetDescription>>()
            .await
            .map_err(|err| CoreError::Transport(err.to_string()))
    }
}

const INTERNAL_SCHEMES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "chrome-untrusted://",
    "devtools://",
    "edge://",
    "about:",
];

/// A user page is a `page` target whose URL is not an internal browser
/// surface.
pub fn is_user_page(target: &TargetDescription) -> bool {
    target.kind == "page" && is_user_page_url(&target.url)
}

pub fn is_user_page_url(url: &str) -> bool {
    !INTERNAL_SCHEMES
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

/// Auto-follow selection: the most recently created user page (the listing
/// is oldest-first), falling back to the first listed target of any kind.
pub fn select_auto_target(targets: &[TargetDescription]) -> Option<&TargetDescription> {
    targets
        .iter()
        .rev()
        .find(|t| is_user_page(t))
        .or_else(|| targets.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, kind: &str, url: &str) -> TargetDescription {
        TargetDescription {
            id: id.to_string(),
            kind: kind.to_string(),
            title: String::new(),
            url: url.to_string(),
            web_socket_debugger_url: Some(format!("ws://127.0.0.1:9222/devtools/page/{id}")),
        }
    }

    #[test]
    fn internal_surfaces_are_not_user_pages() {
        assert!(!is_user_page_url("chrome://newtab/"));
        assert!(!is_user_page_url("devtools://devtools/bundled/inspector.html"));
        assert!(!is_user_page_url("about:blank"));
        assert!(is_user_page_url("https://example.com/"));
    }

    #[test]
    fn auto_selection_prefers_newest_user_page() {
        let targets = vec![
            target("old", "page", "https://old.example.com/"),
            target("worker", "service_worker", "https://cdn.example.com/sw.js"),
            target("new", "page", "https://new.example.com/"),
            target("internal", "page", "chrome://settings/"),
        ];
        assert_eq!(select_auto_target(&targets).unwrap().id, "new");
    }

    #[test]
    fn auto_selection_falls_back_to_first_target() {
        let targets = vec![
            target("sw", "service_worker", "https://x/sw.js"),
            target("internal", "page", "chrome://newtab/"),
        ];
        assert_eq!(select_auto_target(&targets).unwrap().id, "sw");
        assert!(select_auto_target(&[]).is_none());
    }
}
