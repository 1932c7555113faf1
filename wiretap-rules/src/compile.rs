//! Rule Set Compilation
//!
//! Turns a declarative [`RuleSet`] into a matcher tree ready for
//! evaluation. All pattern compilation (regex, glob) and structural
//! validation happens here, at install time: a single bad rule rejects the
//! whole set, so a live engine never observes a partially valid install.

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use wildmatch::WildMatch;
use wiretap_common::{RuleId, Stage};

use crate::context::EvalContext;
use crate::spec::{Action, Condition, GroupOp, JsonPatchOp, LeafCondition, LeafOp, Rule, RuleSet};

/// Rule-set installation failure. Always refers to a specific rule.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("rule {rule}: unknown field {field:?}")]
    UnknownField { rule: RuleId, field: String },
    #[error("rule {rule}: invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        rule: RuleId,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule {rule}: operator {op:?} expects a {expected} value")]
    InvalidValue {
        rule: RuleId,
        op: &'static str,
        expected: &'static str,
    },
    #[error("rule {rule}: invalid JSON pointer path {path:?}")]
    InvalidPointerPath { rule: RuleId, path: String },
    #[error("rule {rule}: drop rate {rate} outside [0, 1]")]
    InvalidDropRate { rule: RuleId, rate: f64 },
    #[error("rule {rule}: action {action} not allowed at {stage} stage")]
    StageMismatch {
        rule: RuleId,
        action: &'static str,
        stage: Stage,
    },
}

/// The context field a leaf predicate reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldRef {
    Url,
    Method,
    ResourceType,
    ContentType,
    Body,
    Header(String),
    Query(String),
    Cookie(String),
}

impl FieldRef {
    fn parse(rule: &RuleId, raw: &str) -> Result<Self, SpecError> {
        if let Some((kind, name)) = raw.split_once(':') {
            let name = name.trim();
            if name.is_empty() {
                return Err(SpecError::UnknownField {
                    rule: rule.clone(),
                    field: raw.to_string(),
                });
            }
            return match kind {
                "header" => Ok(FieldRef::Header(name.to_ascii_lowercase())),
                "query" => Ok(FieldRef::Query(name.to_ascii_lowercase())),
                "cookie" => Ok(FieldRef::Cookie(name.to_ascii_lowercase())),
                _ => Err(SpecError::UnknownField {
                    rule: rule.clone(),
                    field: raw.to_string(),
                }),
            };
        }
        match raw {
            "url" => Ok(FieldRef::Url),
            "method" => Ok(FieldRef::Method),
            "resourceType" => Ok(FieldRef::ResourceType),
            "contentType" => Ok(FieldRef::ContentType),
            "body" => Ok(FieldRef::Body),
            _ => Err(SpecError::UnknownField {
                rule: rule.clone(),
                field: raw.to_string(),
            }),
        }
    }

    fn read<'c>(&self, ctx: &'c EvalContext) -> Option<&'c str> {
        match self {
            FieldRef::Url => Some(ctx.url()),
            FieldRef::Method => Some(ctx.method()),
            FieldRef::ResourceType => Some(ctx.resource_type()),
            FieldRef::ContentType => Some(ctx.content_type()),
            FieldRef::Body => Some(ctx.body()),
            FieldRef::Header(name) => ctx.header(name),
            FieldRef::Query(name) => ctx.query_param(name),
            FieldRef::Cookie(name) => ctx.cookie(name),
        }
    }

}

#[derive(Debug)]
enum LeafTest {
    Equals(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Regex(Regex),
    Glob(WildMatch),
    InSet(Vec<String>),
    GreaterThan(f64),
    LessThan(f64),
}

#[derive(Debug)]
struct LeafMatcher {
    field: FieldRef,
    test: LeafTest,
}

impl LeafMatcher {
    fn matches(&self, ctx: &EvalContext) -> bool {
        let Some(value) = self.field.read(ctx) else {
            return false;
        };
        match &self.test {
            LeafTest::Equals(want) => value == want,
            LeafTest::Prefix(want) => value.starts_with(want.as_str()),
            LeafTest::Suffix(want) => value.ends_with(want.as_str()),
            LeafTest::Contains(want) => value.contains(want.as_str()),
            LeafTest::Regex(re) => re.is_match(value),
            LeafTest::Glob(glob) => glob.matches(value),
            LeafTest::InSet(set) => set.iter().any(|item| item == value),
            LeafTest::GreaterThan(bound) => value.parse::<f64>().map_or(false, |n| n > *bound),
            LeafTest::LessThan(bound) => value.parse::<f64>().map_or(false, |n| n < *bound),
        }
    }
}

#[derive(Debug)]
enum Matcher {
    And(Vec<Matcher>),
    Or(Vec<Matcher>),
    Not(Box<Matcher>),
    Leaf(LeafMatcher),
}

impl Matcher {
    /// Short-circuit evaluation over the compiled condition tree.
    fn matches(&self, ctx: &EvalContext) -> bool {
        match self {
            Matcher::And(children) => children.iter().all(|c| c.matches(ctx)),
            Matcher::Or(children) => children.iter().any(|c| c.matches(ctx)),
            Matcher::Not(child) => !child.matches(ctx),
            Matcher::Leaf(leaf) => leaf.matches(ctx),
        }
    }
}

/// One rule with its compiled matcher and precomputed condition digest.
#[derive(Debug)]
pub struct CompiledRule {
    pub rule: Arc<Rule>,
    pub digest: Arc<str>,
    matcher: Matcher,
}

impl CompiledRule {
    pub fn matches(&self, ctx: &EvalContext) -> bool {
        self.rule.is_enabled() && self.matcher.matches(ctx)
    }
}

/// An installed rule set, sorted by priority (desc) then declaration order.
#[derive(Debug)]
pub struct CompiledRuleSet {
    pub version: String,
    pub rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    pub fn empty() -> Self {
        Self {
            version: String::new(),
            rules: Vec::new(),
        }
    }

    pub fn compile(set: &RuleSet) -> Result<Self, SpecError> {
        let mut rules = Vec::with_capacity(set.rules.len());
        for rule in &set.rules {
            let matcher = compile_condition(&rule.id, &rule.when)?;
            validate_actions(&rule.id, rule.stage, &rule.actions)?;
            rules.push(CompiledRule {
                digest: render_condition(&rule.when).into(),
                matcher,
                rule: Arc::new(rule.clone()),
            });
        }
        // Stable sort keeps declaration order within equal priority.
        rules.sort_by_key(|r| std::cmp::Reverse(r.rule.priority()));
        Ok(Self {
            version: set.version.clone(),
            rules,
        })
    }
}

fn compile_condition(rule: &RuleId, cond: &Condition) -> Result<Matcher, SpecError> {
    match cond {
        Condition::Group { op, children } => {
            let compiled: Result<Vec<_>, _> = children
                .iter()
                .map(|child| compile_condition(rule, child))
                .collect();
            let compiled = compiled?;
            Ok(match op {
                GroupOp::And => Matcher::And(compiled),
                GroupOp::Or => Matcher::Or(compiled),
                // `not` over several children negates their conjunction.
                GroupOp::Not => Matcher::Not(Box::new(Matcher::And(compiled))),
            })
        }
        Condition::Leaf(leaf) => compile_leaf(rule, leaf),
    }
}

fn compile_leaf(rule: &RuleId, leaf: &LeafCondition) -> Result<Matcher, SpecError> {
    let field = FieldRef::parse(rule, &leaf.field)?;
    let test = match leaf.op {
        LeafOp::Equals => LeafTest::Equals(string_value(rule, "equals", &leaf.value)?),
        LeafOp::Prefix => LeafTest::Prefix(string_value(rule, "prefix", &leaf.value)?),
        LeafOp::Suffix => LeafTest::Suffix(string_value(rule, "suffix", &leaf.value)?),
        LeafOp::Contains => LeafTest::Contains(string_value(rule, "contains", &leaf.value)?),
        LeafOp::Regex => {
            let mut pattern = string_value(rule, "regex", &leaf.value)?;
            if leaf.flags.as_deref() == Some("i") {
                pattern = format!("(?i){pattern}");
            }
            let re = Regex::new(&pattern).map_err(|source| SpecError::InvalidRegex {
                rule: rule.clone(),
                pattern,
                source,
            })?;
            LeafTest::Regex(re)
        }
        LeafOp::Glob => LeafTest::Glob(WildMatch::new(&string_value(rule, "glob", &leaf.value)?)),
        LeafOp::InSet => {
            let items = leaf
                .value
                .as_array()
                .ok_or(SpecError::InvalidValue {
                    rule: rule.clone(),
                    op: "in-set",
                    expected: "string array",
                })?
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => Ok(s.clone()),
                    serde_json::Value::Number(n) => Ok(n.to_string()),
                    _ => Err(SpecError::InvalidValue {
                        rule: rule.clone(),
                        op: "in-set",
                        expected: "string array",
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            LeafTest::InSet(items)
        }
        LeafOp::GreaterThan => LeafTest::GreaterThan(number_value(rule, "greater-than", &leaf.value)?),
        LeafOp::LessThan => LeafTest::LessThan(number_value(rule, "less-than", &leaf.value)?),
    };
    Ok(Matcher::Leaf(LeafMatcher { field, test }))
}

fn string_value(
    rule: &RuleId,
    op: &'static str,
    value: &serde_json::Value,
) -> Result<String, SpecError> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(SpecError::InvalidValue {
            rule: rule.clone(),
            op,
            expected: "string",
        }),
    }
}

fn number_value(
    rule: &RuleId,
    op: &'static str,
    value: &serde_json::Value,
) -> Result<f64, SpecError> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().ok_or(SpecError::InvalidValue {
            rule: rule.clone(),
            op,
            expected: "number",
        }),
        serde_json::Value::String(s) => s.parse::<f64>().map_err(|_| SpecError::InvalidValue {
            rule: rule.clone(),
            op,
            expected: "number",
        }),
        _ => Err(SpecError::InvalidValue {
            rule: rule.clone(),
            op,
            expected: "number",
        }),
    }
}

/// Structural action checks that cannot be expressed in serde alone.
fn validate_actions(rule: &RuleId, stage: Stage, actions: &[Action]) -> Result<(), SpecError> {
    for action in actions {
        match action {
            Action::PatchBodyJson { patches } => {
                for patch in patches {
                    validate_pointer(rule, patch)?;
                }
            }
            Action::Drop { rate } => {
                if !(0.0..=1.0).contains(rate) {
                    return Err(SpecError::InvalidDropRate {
                        rule: rule.clone(),
                        rate: *rate,
                    });
                }
            }
            _ => {}
        }
        if let Some(required) = required_stage(action) {
            if required != stage {
                return Err(SpecError::StageMismatch {
                    rule: rule.clone(),
                    action: action.tag(),
                    stage,
                });
            }
        }
    }
    Ok(())
}

/// Actions bound to one stage. Header and body edits apply at both.
fn required_stage(action: &Action) -> Option<Stage> {
    match action {
        Action::SetStatus { .. } => Some(Stage::Response),
        Action::Block { .. }
        | Action::SetUrl { .. }
        | Action::SetMethod { .. }
        | Action::SetQueryParam { .. }
        | Action::RemoveQueryParam { .. }
        | Action::SetCookie { .. }
        | Action::RemoveCookie { .. }
        | Action::SetFormField { .. }
        | Action::RemoveFormField { .. } => Some(Stage::Request),
        _ => None,
    }
}

fn validate_pointer(rule: &RuleId, patch: &JsonPatchOp) -> Result<(), SpecError> {
    // RFC 6901: "" addresses the whole document, otherwise the path must
    // start with '/'.
    if patch.path.is_empty() || patch.path.starts_with('/') {
        Ok(())
    } else {
        Err(SpecError::InvalidPointerPath {
            rule: rule.clone(),
            path: patch.path.clone(),
        })
    }
}

fn render_condition(cond: &Condition) -> String {
    match cond {
        Condition::Group { op, children } => {
            let joined: Vec<String> = children.iter().map(render_condition).collect();
            match op {
                GroupOp::And => format!("({})", joined.join(" && ")),
                GroupOp::Or => format!("({})", joined.join(" || ")),
                GroupOp::Not => format!("!({})", joined.join(" && ")),
            }
        }
        Condition::Leaf(leaf) => {
            let op = match leaf.op {
                LeafOp::Equals => "equals",
                LeafOp::Prefix => "prefix",
                LeafOp::Suffix => "suffix",
                LeafOp::Contains => "contains",
                LeafOp::Regex => "regex",
                LeafOp::Glob => "glob",
                LeafOp::InSet => "in-set",
                LeafOp::GreaterThan => "greater-than",
                LeafOp::LessThan => "less-than",
            };
            format!("{} {} {}", leaf.field, op, leaf.value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use wiretap_common::Stage;

    use crate::context::ContextSeed;

    fn ctx(url: &str) -> EvalContext {
        let mut headers = HashMap::new();
        headers.insert("Content-Length".to_string(), "2048".to_string());
        EvalContext::new(
            Stage::Request,
            ContextSeed {
                url: url.to_string(),
                method: "GET".to_string(),
                resource_type: "Document".to_string(),
                headers,
                cookies: HashMap::new(),
                body: String::new(),
            },
        )
    }

    fn compile_one(when: serde_json::Value) -> Result<CompiledRuleSet, SpecError> {
        let set: RuleSet = serde_json::from_value(json!({
            "version": "1",
            "rules": [{
                "id": "r1", "name": "t", "stage": "request",
                "when": when,
                "actions": []
            }]
        }))
        .unwrap();
        CompiledRuleSet::compile(&set)
    }

    #[test]
    fn bad_regex_rejects_set() {
        let err = compile_one(json!({"field": "url", "op": "regex", "value": "("})).unwrap_err();
        assert!(matches!(err, SpecError::InvalidRegex { .. }));
    }

    #[test]
    fn unknown_field_rejects_set() {
        let err = compile_one(json!({"field": "planet", "op": "equals", "value": "mars"}))
            .unwrap_err();
        assert!(matches!(err, SpecError::UnknownField { .. }));
    }

    #[test]
    fn glob_and_numeric_leaves_match() {
        let set =
            compile_one(json!({"field": "url", "op": "glob", "value": "https://*.example.com/*"}))
                .unwrap();
        assert!(set.rules[0].matches(&ctx("https://api.example.com/v1")));
        assert!(!set.rules[0].matches(&ctx("https://example.org/v1")));

        let set = compile_one(
            json!({"field": "header:content-length", "op": "greater-than", "value": 1024}),
        )
        .unwrap();
        assert!(set.rules[0].matches(&ctx("https://x/")));

        let set = compile_one(
            json!({"field": "header:content-length", "op": "less-than", "value": 1024}),
        )
        .unwrap();
        assert!(!set.rules[0].matches(&ctx("https://x/")));
    }

    #[test]
    fn case_insensitive_regex_flag() {
        let set = compile_one(
            json!({"field": "url", "op": "regex", "value": "EXAMPLE", "flags": "i"}),
        )
        .unwrap();
        assert!(set.rules[0].matches(&ctx("https://api.example.com/")));
    }

    #[test]
    fn in_set_matches_membership() {
        let set =
            compile_one(json!({"field": "method", "op": "in-set", "value": ["GET", "HEAD"]}))
                .unwrap();
        assert!(set.rules[0].matches(&ctx("https://x/")));
    }

    #[test]
    fn invalid_pointer_path_rejects_set() {
        let set: RuleSet = serde_json::from_value(json!({
            "version": "1",
            "rules": [{
                "id": "r1", "name": "t", "stage": "response",
                "when": {"field": "contentType", "op": "contains", "value": "json"},
                "actions": [
                    {"type": "patchBodyJson", "patches": [{"op": "replace", "path": "status", "value": "ok"}]}
                ]
            }]
        }))
        .unwrap();
        let err = CompiledRuleSet::compile(&set).unwrap_err();
        assert!(matches!(err, SpecError::InvalidPointerPath { .. }));
    }

    #[test]
    fn stage_bound_actions_reject_wrong_stage() {
        let set: RuleSet = serde_json::from_value(json!({
            "version": "1",
            "rules": [{
                "id": "r1", "name": "t", "stage": "response",
                "when": {"field": "url", "op": "contains", "value": "x"},
                "actions": [{"type": "block", "status": 403}]
            }]
        }))
        .unwrap();
        let err = CompiledRuleSet::compile(&set).unwrap_err();
        assert!(matches!(err, SpecError::StageMismatch { .. }));

        let set: RuleSet = serde_json::from_value(json!({
            "version": "1",
            "rules": [{
                "id": "r2", "name": "t", "stage": "request",
                "when": {"field": "url", "op": "contains", "value": "x"},
                "actions": [{"type": "setStatus", "value": 204}]
            }]
        }))
        .unwrap();
        assert!(CompiledRuleSet::compile(&set).is_err());
    }

    #[test]
    fn condition_digest_renders_tree() {
        let set = compile_one(json!({
            "op": "and",
            "children": [
                {"field": "url", "op": "prefix", "value": "https://a"},
                {"op": "not", "children": [{"field": "method", "op": "equals", "value": "POST"}]}
            ]
        }))
        .unwrap();
        assert_eq!(
            &*set.rules[0].digest,
            "(url prefix \"https://a\" && !(method equals \"POST\"))"
        );
    }
}
