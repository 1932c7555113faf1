//! Accumulated Mutations
//!
//! Mutation values composed across matched rules in rule order. `set-*`
//! singletons are last-writer-wins; remove lists concatenate.

use std::collections::HashMap;

use wiretap_rules::Rewrite;

/// Accumulated request-stage changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestMutation {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub remove_headers: Vec<String>,
    pub query: HashMap<String, String>,
    pub remove_query: Vec<String>,
    pub cookies: HashMap<String, String>,
    pub remove_cookies: Vec<String>,
    pub body: Option<String>,
}

impl RequestMutation {
    pub fn merge(&mut self, src: RequestMutation) {
        if src.url.is_some() {
            self.url = src.url;
        }
        if src.method.is_some() {
            self.method = src.method;
        }
        self.headers.extend(src.headers);
        self.remove_headers.extend(src.remove_headers);
        self.query.extend(src.query);
        self.remove_query.extend(src.remove_query);
        self.cookies.extend(src.cookies);
        self.remove_cookies.extend(src.remove_cookies);
        if src.body.is_some() {
            self.body = src.body;
        }
    }

    /// Fold an approval rewrite on top of the accumulated mutation.
    pub fn merge_rewrite(&mut self, rw: &Rewrite) {
        self.merge(RequestMutation {
            url: rw.url.clone(),
            method: rw.method.clone(),
            headers: rw.headers.clone(),
            remove_headers: rw.remove_headers.clone(),
            query: rw.query.clone(),
            remove_query: rw.remove_query.clone(),
            cookies: rw.cookies.clone(),
            remove_cookies: rw.remove_cookies.clone(),
            body: rw.body.clone(),
        });
    }

    pub fn has_changes(&self) -> bool {
        self.url.is_some()
            || self.method.is_some()
            || !self.headers.is_empty()
            || !self.remove_headers.is_empty()
            || !self.query.is_empty()
            || !self.remove_query.is_empty()
            || !self.cookies.is_empty()
            || !self.remove_cookies.is_empty()
            || self.body.is_some()
    }
}

/// Accumulated response-stage changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseMutation {
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
    pub remove_headers: Vec<String>,
    pub body: Option<String>,
}

impl ResponseMutation {
    pub fn has_changes(&self) -> bool {
        self.status.is_some()
            || !self.headers.is_empty()
            || !self.remove_headers.is_empty()
            || self.body.is_some()
    }
}

/// A synthetic response served instead of the origin's (block / fulfill).
#[derive(Clone, Debug)]
pub struct SyntheticResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}
