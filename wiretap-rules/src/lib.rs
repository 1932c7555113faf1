//! Wiretap Rule Model & Engine
//!
//! Declarative interception rules and their evaluation engine:
//!
//! - **spec**: the JSON data model (rules, condition trees, actions)
//! - **compile**: install-time validation and pattern compilation
//! - **context**: the per-event evaluation snapshot
//! - **engine**: concurrent evaluation with snapshot-swap hot replacement

pub mod compile;
pub mod context;
pub mod engine;
pub mod spec;

pub use compile::{CompiledRuleSet, SpecError};
pub use context::{parse_cookie_header, parse_set_cookie, ContextSeed, EvalContext};
pub use engine::{Engine, MatchedRule};
pub use spec::{
    Action, BodyEncoding, Condition, ErrorReason, GroupOp, JsonPatchOp, LeafCondition, LeafOp,
    PatchOp, PauseDefault, Rewrite, Rule, RuleSet,
};
