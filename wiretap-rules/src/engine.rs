//! Rule Evaluation Engine
//!
//! Concurrent-safe evaluation over an installed rule set with hot
//! replacement. Readers snapshot the current set (one `Arc` clone under a
//! briefly-held lock), so in-flight evaluations always see the set they
//! started with, and `update` is a single pointer swap from the readers'
//! perspective.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use wiretap_common::{EngineStats, RuleId};

use crate::compile::{CompiledRuleSet, SpecError};
use crate::context::EvalContext;
use crate::spec::{Rule, RuleSet};

/// One rule that matched an evaluation, in engine output order.
#[derive(Clone)]
pub struct MatchedRule {
    pub rule: Arc<Rule>,
    /// Human-readable rendering of the condition that matched.
    pub digest: Arc<str>,
}

pub struct Engine {
    current: RwLock<Arc<CompiledRuleSet>>,
    evaluated: AtomicU64,
    matched: AtomicU64,
    by_rule: DashMap<RuleId, u64>,
}

impl Engine {
    /// Engine with no rules installed; every evaluation returns empty.
    pub fn empty() -> Self {
        Self {
            current: RwLock::new(Arc::new(CompiledRuleSet::empty())),
            evaluated: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            by_rule: DashMap::new(),
        }
    }

    pub fn new(set: &RuleSet) -> Result<Self, SpecError> {
        let engine = Self::empty();
        engine.update(set)?;
        Ok(engine)
    }

    /// Atomically replace the installed rule set. On error the previous
    /// set stays installed untouched.
    pub fn update(&self, set: &RuleSet) -> Result<(), SpecError> {
        let compiled = Arc::new(CompiledRuleSet::compile(set)?);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = compiled;
        Ok(())
    }

    pub fn version(&self) -> String {
        self.snapshot().version.clone()
    }

    fn snapshot(&self) -> Arc<CompiledRuleSet> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Return every enabled rule at the context's stage whose condition
    /// holds, in priority-then-declaration order. Composition of matched
    /// rules is the executor's concern; no rule is skipped here because an
    /// earlier one carries a terminal action.
    pub fn evaluate(&self, ctx: &EvalContext) -> Vec<MatchedRule> {
        let set = self.snapshot();
        self.evaluated.fetch_add(1, Ordering::Relaxed);

        let mut out = Vec::new();
        for compiled in &set.rules {
            if compiled.rule.stage != ctx.stage() {
                continue;
            }
            if !compiled.matches(ctx) {
                continue;
            }
            *self.by_rule.entry(compiled.rule.id.clone()).or_insert(0) += 1;
            out.push(MatchedRule {
                rule: compiled.rule.clone(),
                digest: compiled.digest.clone(),
            });
        }
        if !out.is_empty() {
            self.matched.fetch_add(1, Ordering::Relaxed);
        }
        out
    }

    /// Monotonic hit counters, preserved across rule-set updates.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            by_rule: self
                .by_rule
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}
