//! Evaluation Context
//!
//! Per-request, per-stage snapshot the engine matches against. Header,
//! query and cookie keys are lower-cased once at construction; values are
//! preserved verbatim. The context is immutable after construction.

use std::collections::HashMap;

use url::Url;
use wiretap_common::Stage;

/// Raw inputs for one evaluation context. Keys may carry arbitrary case;
/// normalization happens in [`EvalContext::new`].
#[derive(Clone, Debug, Default)]
pub struct ContextSeed {
    pub url: String,
    pub method: String,
    pub resource_type: String,
    pub headers: HashMap<String, String>,
    /// Cookie pairs already split out of the `cookie` / `set-cookie`
    /// headers by the caller; merged with pairs parsed here.
    pub cookies: HashMap<String, String>,
    pub body: String,
}

/// Immutable matching snapshot for one paused event at one stage.
#[derive(Clone, Debug)]
pub struct EvalContext {
    url: String,
    method: String,
    resource_type: String,
    stage: Stage,
    content_type: String,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    cookies: HashMap<String, String>,
    body: String,
}

impl EvalContext {
    pub fn new(stage: Stage, seed: ContextSeed) -> Self {
        let mut headers = HashMap::with_capacity(seed.headers.len());
        for (name, value) in seed.headers {
            headers.insert(name.to_ascii_lowercase(), value);
        }

        let mut cookies: HashMap<String, String> = seed
            .cookies
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        if let Some(raw) = headers.get("cookie") {
            for (name, value) in parse_cookie_header(raw) {
                cookies.insert(name.to_ascii_lowercase(), value);
            }
        }

        let mut query = HashMap::new();
        if let Ok(parsed) = Url::parse(&seed.url) {
            for (key, value) in parsed.query_pairs() {
                query
                    .entry(key.to_ascii_lowercase())
                    .or_insert_with(|| value.into_owned());
            }
        }

        let content_type = headers.get("content-type").cloned().unwrap_or_default();

        Self {
            url: seed.url,
            method: seed.method,
            resource_type: seed.resource_type,
            stage,
            content_type,
            headers,
            query,
            cookies,
            body: seed.body,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Split a `Cookie` request header into name/value pairs.
pub fn parse_cookie_header(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            let (name, value) = part.split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Extract the cookie pair from a `Set-Cookie` response header, ignoring
/// attributes like `Path` or `Expires`.
pub fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let first = raw.split(';').next()?.trim();
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> ContextSeed {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/JSON".to_string());
        headers.insert("Cookie".to_string(), "SID=abc; theme=dark".to_string());
        ContextSeed {
            url: "https://api.example.com/v1/ping?Token=X&debug=1".to_string(),
            method: "GET".to_string(),
            resource_type: "XHR".to_string(),
            headers,
            cookies: HashMap::new(),
            body: String::new(),
        }
    }

    #[test]
    fn keys_normalize_values_stay_verbatim() {
        let ctx = EvalContext::new(Stage::Request, seed());
        assert_eq!(ctx.header("content-type"), Some("application/JSON"));
        assert_eq!(ctx.header("CONTENT-TYPE"), Some("application/JSON"));
        assert_eq!(ctx.query_param("token"), Some("X"));
        assert_eq!(ctx.cookie("sid"), Some("abc"));
        assert_eq!(ctx.cookie("theme"), Some("dark"));
        assert_eq!(ctx.content_type(), "application/JSON");
    }

    #[test]
    fn set_cookie_attributes_are_dropped() {
        let parsed = parse_set_cookie("sid=xyz; Path=/; HttpOnly").unwrap();
        assert_eq!(parsed, ("sid".to_string(), "xyz".to_string()));
        assert!(parse_set_cookie("; Path=/").is_none());
    }
}
