//! Action Executor
//!
//! Stateful composer bound to one paused event. Folds the action sequences
//! of every matched rule, in rule order, into a single transport-level
//! outcome: one continue / fulfill / fail, or a pause hand-off. Terminal
//! actions cut the remaining actions and rules short; mutation actions
//! accumulate with last-writer-wins semantics for singleton fields.

pub mod body;
pub mod mutation;

use std::collections::HashMap;

use tracing::warn;
use url::Url;
use wiretap_common::{ExchangeSnapshot, RuleId, RuleMatch, Stage};
use wiretap_rules::{Action, ErrorReason, MatchedRule, PauseDefault, Rewrite};

use crate::cdp::{
    to_header_entries, ContinueRequestArgs, ContinueResponseArgs, FulfillRequestArgs, PausedEvent,
};
use mutation::{RequestMutation, ResponseMutation, SyntheticResponse};

/// Response headers that must not survive a body rewrite: they describe
/// the original payload and would make the browser reject the new one.
const BODY_SENSITIVE_HEADERS: &[&str] =
    &["content-encoding", "content-length", "content-md5", "etag"];

#[derive(Clone, Copy, Debug)]
pub struct ExecutorOptions {
    /// Response bodies above this many bytes are never fetched.
    pub body_size_threshold: u64,
}

/// Terminal disposition for one stage of one paused event.
#[derive(Clone, Debug)]
pub enum ExecutionOutcome {
    ContinueRequest(ContinueRequestArgs),
    ContinueResponse(ContinueResponseArgs),
    Fulfill(FulfillRequestArgs),
    Fail(ErrorReason),
    Pause {
        timeout_ms: u64,
        default: PauseDefault,
        rule: RuleId,
    },
}

#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub modified: bool,
    pub long_connection: bool,
}

enum Terminal {
    Synthetic(SyntheticResponse),
    Fail(ErrorReason),
    Pause {
        timeout_ms: u64,
        default: PauseDefault,
        rule: RuleId,
    },
}

/// One executor instance lives for the processing of one paused event and
/// is never shared across tasks.
pub struct Executor {
    ev: PausedEvent,
    opts: ExecutorOptions,
    req_mut: RequestMutation,
    res_mut: ResponseMutation,
    original_body: String,
    running_body: String,
    terminal: Option<Terminal>,
    executed: Vec<RuleMatch>,
}

impl Executor {
    pub fn new(ev: PausedEvent, opts: ExecutorOptions) -> Self {
        Self {
            ev,
            opts,
            req_mut: RequestMutation::default(),
            res_mut: ResponseMutation::default(),
            original_body: String::new(),
            running_body: String::new(),
            terminal: None,
            executed: Vec::new(),
        }
    }

    pub fn event(&self) -> &PausedEvent {
        &self.ev
    }

    /// Whether the terminal was a synthetic response (block / fulfill
    /// action), as opposed to a body-mutation fulfill.
    pub fn has_synthetic_terminal(&self) -> bool {
        matches!(self.terminal, Some(Terminal::Synthetic(_)))
    }

    /// Rule summaries with the action tags that actually ran, for the
    /// event record.
    pub fn executed_rules(&self) -> Vec<RuleMatch> {
        self.executed.clone()
    }

    // ---- request stage -------------------------------------------------

    pub fn execute_request(&mut self, matched: &[MatchedRule]) -> ExecutionResult {
        self.original_body = self.ev.post_data().to_string();
        self.running_body = self.original_body.clone();

        'rules: for mr in matched {
            if mr.rule.stage != Stage::Request {
                continue;
            }
            let mut tags = Vec::new();
            for action in &mr.rule.actions {
                if self.fold_request_action(action, &mr.rule.id) {
                    tags.push(action.tag().to_string());
                }
                if self.terminal.is_some() {
                    self.record(mr, tags);
                    break 'rules;
                }
            }
            self.record(mr, tags);
        }

        if self.running_body != self.original_body && self.req_mut.body.is_none() {
            self.req_mut.body = Some(self.running_body.clone());
        }

        self.request_result()
    }

    fn fold_request_action(&mut self, action: &Action, rule: &RuleId) -> bool {
        match action {
            Action::SetUrl { value } => {
                self.req_mut.url = Some(value.clone());
            }
            Action::SetMethod { value } => {
                self.req_mut.method = Some(value.clone());
            }
            Action::SetHeader { name, value } => {
                self.req_mut.headers.insert(name.clone(), value.clone());
            }
            Action::RemoveHeader { name } => {
                self.req_mut.remove_headers.push(name.clone());
            }
            Action::SetQueryParam { name, value } => {
                self.req_mut.query.insert(name.clone(), value.clone());
            }
            Action::RemoveQueryParam { name } => {
                self.req_mut.remove_query.push(name.clone());
            }
            Action::SetCookie { name, value } => {
                self.req_mut.cookies.insert(name.clone(), value.clone());
            }
            Action::RemoveCookie { name } => {
                self.req_mut.remove_cookies.push(name.clone());
            }
            Action::SetBody { value, encoding } => {
                self.running_body = encoding.decode(value);
                self.req_mut.body = Some(self.running_body.clone());
            }
            Action::AppendBody { value, encoding } => {
                self.running_body.push_str(&encoding.decode(value));
                self.req_mut.body = Some(self.running_body.clone());
            }
            Action::ReplaceBodyText {
                search,
                replace,
                replace_all,
            } => {
                self.running_body = replace_text(&self.running_body, search, replace, *replace_all);
                self.req_mut.body = Some(self.running_body.clone());
            }
            Action::PatchBodyJson { patches } => {
                match body::apply_json_patches(&self.running_body, patches) {
                    Ok(patched) => {
                        self.running_body = patched;
                        self.req_mut.body = Some(self.running_body.clone());
                    }
                    Err(err) => {
                        warn!(target: "wiretap::executor", rule = %rule, error = %err,
                              "json patch skipped, body unchanged");
                        return false;
                    }
                }
            }
            Action::SetFormField { name, value } => {
                if !self.is_urlencoded_form() {
                    return self.warn_form_gap(rule);
                }
                self.running_body = body::set_form_field(&self.running_body, name, value);
                self.req_mut.body = Some(self.running_body.clone());
            }
            Action::RemoveFormField { name } => {
                if !self.is_urlencoded_form() {
                    return self.warn_form_gap(rule);
                }
                self.running_body = body::remove_form_field(&self.running_body, name);
                self.req_mut.body = Some(self.running_body.clone());
            }
            Action::Block {
                status,
                headers,
                body,
                encoding,
            } => {
                self.terminal = Some(Terminal::Synthetic(SyntheticResponse {
                    status: *status,
                    headers: headers.clone(),
                    body: encoding.decode(body),
                }));
            }
            Action::Fulfill {
                status,
                headers,
                body,
                encoding,
            } => {
                self.terminal = Some(Terminal::Synthetic(SyntheticResponse {
                    status: *status,
                    headers: headers.clone(),
                    body: encoding.decode(body),
                }));
            }
            Action::Fail { reason } => {
                self.terminal = Some(Terminal::Fail(*reason));
            }
            Action::Pause { timeout_ms, default } => {
                self.terminal = Some(Terminal::Pause {
                    timeout_ms: *timeout_ms,
                    default: default.clone(),
                    rule: rule.clone(),
                });
            }
            // Handled by the handler before execution; stage-checked at
            // install time.
            Action::Delay { .. } | Action::Drop { .. } | Action::SetStatus { .. } => return false,
        }
        true
    }

    fn request_result(&self) -> ExecutionResult {
        let long_connection = self.is_long_connection();
        match &self.terminal {
            Some(Terminal::Synthetic(synthetic)) => ExecutionResult {
                outcome: ExecutionOutcome::Fulfill(self.synthetic_args(synthetic)),
                modified: true,
                long_connection,
            },
            Some(Terminal::Fail(reason)) => ExecutionResult {
                outcome: ExecutionOutcome::Fail(*reason),
                modified: true,
                long_connection,
            },
            Some(Terminal::Pause {
                timeout_ms,
                default,
                rule,
            }) => ExecutionResult {
                outcome: ExecutionOutcome::Pause {
                    timeout_ms: *timeout_ms,
                    default: default.clone(),
                    rule: rule.clone(),
                },
                modified: self.req_mut.has_changes(),
                long_connection,
            },
            None => ExecutionResult {
                outcome: ExecutionOutcome::ContinueRequest(self.finalize_request()),
                modified: self.req_mut.has_changes(),
                long_connection,
            },
        }
    }

    /// Fold an approval rewrite on top of the accumulated mutation.
    pub fn fold_rewrite(&mut self, rw: &Rewrite) {
        self.req_mut.merge_rewrite(rw);
    }

    /// Response-stage slice of an approval rewrite: header edits and body.
    pub fn fold_response_rewrite(&mut self, rw: &Rewrite) {
        for (name, value) in &rw.headers {
            self.res_mut.headers.insert(name.clone(), value.clone());
        }
        self.res_mut.remove_headers.extend(rw.remove_headers.iter().cloned());
        if let Some(body) = &rw.body {
            self.res_mut.body = Some(body.clone());
        }
    }

    /// Final outcome for the accumulated response mutation, used when an
    /// approval resolves to "continue mutated".
    pub fn finalize_response_outcome(&self) -> ExecutionOutcome {
        self.finalize_response()
    }

    /// Final `Fetch.continueRequest` arguments for the accumulated
    /// request mutation.
    pub fn finalize_request(&self) -> ContinueRequestArgs {
        let m = &self.req_mut;
        let mut args = ContinueRequestArgs::passthrough(&self.ev.request_id);

        if m.url.is_some() || !m.query.is_empty() || !m.remove_query.is_empty() {
            let base = m.url.clone().unwrap_or_else(|| self.ev.request.url.clone());
            args.url = Some(rebuild_url(&base, &m.query, &m.remove_query));
        }
        args.method = m.method.clone();
        if !m.headers.is_empty()
            || !m.remove_headers.is_empty()
            || !m.cookies.is_empty()
            || !m.remove_cookies.is_empty()
        {
            args.headers = Some(to_header_entries(&self.final_request_headers()));
        }
        args.post_data = m.body.clone();
        args
    }

    fn final_request_headers(&self) -> HashMap<String, String> {
        let m = &self.req_mut;
        let mut headers = self.ev.request.headers.clone();

        for name in &m.remove_headers {
            headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        }
        for (name, value) in &m.headers {
            set_header_preserving_case(&mut headers, name, value);
        }

        if !m.cookies.is_empty() || !m.remove_cookies.is_empty() {
            let raw = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("cookie"))
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            let mut pairs = wiretap_rules::parse_cookie_header(&raw);
            pairs.retain(|(name, _)| !m.remove_cookies.contains(name));
            for (name, value) in &m.cookies {
                match pairs.iter_mut().find(|(n, _)| n == name) {
                    Some(pair) => pair.1 = value.clone(),
                    None => pairs.push((name.clone(), value.clone())),
                }
            }
            headers.retain(|k, _| !k.eq_ignore_ascii_case("cookie"));
            if !pairs.is_empty() {
                let joined = pairs
                    .iter()
                    .map(|(n, v)| format!("{n}={v}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                headers.insert("Cookie".to_string(), joined);
            }
        }
        headers
    }

    // ---- response stage ------------------------------------------------

    pub fn execute_response(
        &mut self,
        matched: &[MatchedRule],
        original_body: Option<String>,
    ) -> ExecutionResult {
        self.original_body = original_body.unwrap_or_default();
        self.running_body = self.original_body.clone();

        'rules: for mr in matched {
            if mr.rule.stage != Stage::Response {
                continue;
            }
            let mut tags = Vec::new();
            for action in &mr.rule.actions {
                if self.fold_response_action(action, &mr.rule.id) {
                    tags.push(action.tag().to_string());
                }
                if self.terminal.is_some() {
                    self.record(mr, tags);
                    break 'rules;
                }
            }
            self.record(mr, tags);
        }

        // A body that drifted through text/json transforms without an
        // explicit set counts as modified.
        if self.res_mut.body.is_none() && self.running_body != self.original_body {
            self.res_mut.body = Some(self.running_body.clone());
        }

        let long_connection = self.is_long_connection();
        match &self.terminal {
            Some(Terminal::Synthetic(synthetic)) => ExecutionResult {
                outcome: ExecutionOutcome::Fulfill(self.synthetic_args(synthetic)),
                modified: true,
                long_connection,
            },
            Some(Terminal::Fail(reason)) => ExecutionResult {
                outcome: ExecutionOutcome::Fail(*reason),
                modified: true,
                long_connection,
            },
            Some(Terminal::Pause {
                timeout_ms,
                default,
                rule,
            }) => ExecutionResult {
                outcome: ExecutionOutcome::Pause {
                    timeout_ms: *timeout_ms,
                    default: default.clone(),
                    rule: rule.clone(),
                },
                modified: self.res_mut.has_changes(),
                long_connection,
            },
            None => ExecutionResult {
                outcome: self.finalize_response(),
                modified: self.res_mut.has_changes(),
                long_connection,
            },
        }
    }

    fn fold_response_action(&mut self, action: &Action, rule: &RuleId) -> bool {
        match action {
            Action::SetStatus { value } => {
                self.res_mut.status = Some(*value);
            }
            Action::SetHeader { name, value } => {
                self.res_mut.headers.insert(name.clone(), value.clone());
            }
            Action::RemoveHeader { name } => {
                self.res_mut.remove_headers.push(name.clone());
            }
            Action::SetBody { value, encoding } => {
                self.running_body = encoding.decode(value);
                self.res_mut.body = Some(self.running_body.clone());
            }
            Action::AppendBody { value, encoding } => {
                self.running_body.push_str(&encoding.decode(value));
                self.res_mut.body = Some(self.running_body.clone());
            }
            Action::ReplaceBodyText {
                search,
                replace,
                replace_all,
            } => {
                self.running_body = replace_text(&self.running_body, search, replace, *replace_all);
                self.res_mut.body = Some(self.running_body.clone());
            }
            Action::PatchBodyJson { patches } => {
                match body::apply_json_patches(&self.running_body, patches) {
                    Ok(patched) => {
                        self.running_body = patched;
                        self.res_mut.body = Some(self.running_body.clone());
                    }
                    Err(err) => {
                        warn!(target: "wiretap::executor", rule = %rule, error = %err,
                              "json patch skipped, body unchanged");
                        return false;
                    }
                }
            }
            Action::Fulfill {
                status,
                headers,
                body,
                encoding,
            } => {
                self.terminal = Some(Terminal::Synthetic(SyntheticResponse {
                    status: *status,
                    headers: headers.clone(),
                    body: encoding.decode(body),
                }));
            }
            Action::Fail { reason } => {
                self.terminal = Some(Terminal::Fail(*reason));
            }
            Action::Pause { timeout_ms, default } => {
                self.terminal = Some(Terminal::Pause {
                    timeout_ms: *timeout_ms,
                    default: default.clone(),
                    rule: rule.clone(),
                });
            }
            _ => return false,
        }
        true
    }

    /// Finalize the response stage. A body change forces a fulfill; pure
    /// status/header changes ride on `continueResponse`, which needs status
    /// and headers supplied together — the status defaults from the
    /// original when only headers changed.
    fn finalize_response(&self) -> ExecutionOutcome {
        let m = &self.res_mut;
        if let Some(body) = &m.body {
            let status = m.status.unwrap_or_else(|| self.original_status());
            let headers = self.final_response_headers(true);
            return ExecutionOutcome::Fulfill(FulfillRequestArgs {
                request_id: self.ev.request_id.clone(),
                response_code: status,
                response_headers: Some(to_header_entries(&headers)),
                body: Some(body.clone()),
            });
        }

        if m.has_changes() {
            let status = m.status.unwrap_or_else(|| self.original_status());
            return ExecutionOutcome::ContinueResponse(ContinueResponseArgs {
                request_id: self.ev.request_id.clone(),
                response_code: Some(status),
                response_headers: Some(to_header_entries(&self.final_response_headers(false))),
            });
        }

        ExecutionOutcome::ContinueResponse(ContinueResponseArgs::passthrough(&self.ev.request_id))
    }

    fn final_response_headers(&self, body_changed: bool) -> HashMap<String, String> {
        let m = &self.res_mut;
        let mut headers: HashMap<String, String> = self
            .ev
            .response_headers
            .iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect();

        for name in &m.remove_headers {
            headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        }
        if body_changed {
            for name in BODY_SENSITIVE_HEADERS {
                headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
            }
        }
        for (name, value) in &m.headers {
            set_header_preserving_case(&mut headers, name, value);
        }
        headers
    }

    fn synthetic_args(&self, synthetic: &SyntheticResponse) -> FulfillRequestArgs {
        FulfillRequestArgs {
            request_id: self.ev.request_id.clone(),
            response_code: synthetic.status,
            response_headers: if synthetic.headers.is_empty() {
                None
            } else {
                Some(to_header_entries(&synthetic.headers))
            },
            body: if synthetic.body.is_empty() {
                None
            } else {
                Some(synthetic.body.clone())
            },
        }
    }

    // ---- predicates ----------------------------------------------------

    /// WebSocket/EventSource exchanges stay open indefinitely; reading
    /// their body would hang the pause.
    pub fn is_long_connection(&self) -> bool {
        if matches!(self.ev.resource_type.as_str(), "WebSocket" | "EventSource") {
            return true;
        }
        self.ev
            .request_header("upgrade")
            .map_or(false, |v| v.eq_ignore_ascii_case("websocket"))
    }

    /// Reason the response body must not be read, if any.
    pub fn unsafe_body_reason(&self) -> Option<String> {
        if self.opts.body_size_threshold > 0 {
            if let Some(raw) = self.ev.response_header("content-length") {
                if let Ok(size) = raw.trim().parse::<u64>() {
                    if size > self.opts.body_size_threshold {
                        return Some(format!("size exceeds limit ({size} bytes)"));
                    }
                }
            }
        }
        if let Some(raw) = self.ev.response_header("content-type") {
            let ct = raw.to_ascii_lowercase();
            if ct.starts_with("video/")
                || ct.starts_with("audio/")
                || ct.starts_with("text/event-stream")
                || ct == "application/octet-stream"
            {
                return Some(format!("streaming or binary content-type: {ct}"));
            }
        }
        None
    }

    /// Whether the original response body should be fetched before
    /// evaluation.
    pub fn should_fetch_body(&self) -> bool {
        self.ev.stage() == Stage::Response
            && !self.is_long_connection()
            && self.unsafe_body_reason().is_none()
    }

    // ---- snapshots -----------------------------------------------------

    pub fn original_request_snapshot(&self) -> ExchangeSnapshot {
        ExchangeSnapshot {
            url: Some(self.ev.request.url.clone()),
            method: Some(self.ev.request.method.clone()),
            headers: self.ev.request.headers.clone(),
            body: self.ev.request.post_data.clone(),
            status_code: None,
            resource_type: Some(self.ev.resource_type.clone()),
        }
    }

    pub fn final_request_snapshot(&self) -> ExchangeSnapshot {
        let m = &self.req_mut;
        let mut snapshot = self.original_request_snapshot();
        if m.has_changes() {
            if m.url.is_some() || !m.query.is_empty() || !m.remove_query.is_empty() {
                let base = m.url.clone().unwrap_or_else(|| self.ev.request.url.clone());
                snapshot.url = Some(rebuild_url(&base, &m.query, &m.remove_query));
            }
            if let Some(method) = &m.method {
                snapshot.method = Some(method.clone());
            }
            snapshot.headers = self.final_request_headers();
            if m.body.is_some() {
                snapshot.body = m.body.clone();
            }
        }
        snapshot
    }

    pub fn original_response_snapshot(&self) -> ExchangeSnapshot {
        ExchangeSnapshot {
            url: Some(self.ev.request.url.clone()),
            method: None,
            headers: self
                .ev
                .response_headers
                .iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect(),
            body: if self.original_body.is_empty() {
                None
            } else {
                Some(self.original_body.clone())
            },
            status_code: Some(self.original_status()),
            resource_type: Some(self.ev.resource_type.clone()),
        }
    }

    pub fn final_response_snapshot(&self) -> ExchangeSnapshot {
        let m = &self.res_mut;
        let mut snapshot = self.original_response_snapshot();
        if m.has_changes() {
            snapshot.headers = self.final_response_headers(m.body.is_some());
            if let Some(status) = m.status {
                snapshot.status_code = Some(status);
            }
            if m.body.is_some() {
                snapshot.body = m.body.clone();
            }
        }
        snapshot
    }

    fn original_status(&self) -> u16 {
        self.ev.response_status_code.unwrap_or(200)
    }

    fn is_urlencoded_form(&self) -> bool {
        self.ev
            .request_header("content-type")
            .map_or(false, |ct| ct.contains("application/x-www-form-urlencoded"))
    }

    fn warn_form_gap(&self, rule: &RuleId) -> bool {
        // Multipart mutation is a documented gap.
        warn!(target: "wiretap::executor", rule = %rule,
              "form-field action needs application/x-www-form-urlencoded, body unchanged");
        false
    }

    fn record(&mut self, mr: &MatchedRule, tags: Vec<String>) {
        self.executed.push(RuleMatch {
            rule_id: mr.rule.id.clone(),
            rule_name: mr.rule.name.clone(),
            actions: tags,
        });
    }
}

fn replace_text(haystack: &str, search: &str, replace: &str, all: bool) -> String {
    if search.is_empty() {
        return haystack.to_string();
    }
    if all {
        haystack.replace(search, replace)
    } else {
        haystack.replacen(search, replace, 1)
    }
}

/// Apply the set header while replacing any existing entry whose name
/// differs only by case.
fn set_header_preserving_case(headers: &mut HashMap<String, String>, name: &str, value: &str) {
    let existing: Option<String> = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case(name))
        .cloned();
    match existing {
        Some(key) => {
            headers.insert(key, value.to_string());
        }
        None => {
            headers.insert(name.to_string(), value.to_string());
        }
    }
}

fn rebuild_url(base: &str, set: &HashMap<String, String>, remove: &[String]) -> String {
    if set.is_empty() && remove.is_empty() {
        return base.to_string();
    }
    let Ok(mut url) = Url::parse(base) else {
        return base.to_string();
    };

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.retain(|(name, _)| !remove.contains(name));
    let mut sorted: Vec<(&String, &String)> = set.iter().collect();
    sorted.sort();
    for (name, value) in sorted {
        match pairs.iter_mut().find(|(n, _)| n == name) {
            Some(pair) => pair.1 = value.clone(),
            None => pairs.push((name.clone(), value.clone())),
        }
    }

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}
