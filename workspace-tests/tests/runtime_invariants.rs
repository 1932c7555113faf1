//! Property-style invariants over the engine, the mutation algebra and
//! the worker pool.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;
use wiretap_core::executor::mutation::RequestMutation;
use wiretap_core::WorkerPool;
use wiretap_rules::{ContextSeed, Engine, EvalContext, RuleSet};
use wiretap_common::Stage;

fn rule_set(rules: serde_json::Value) -> RuleSet {
    serde_json::from_value(json!({"version": "1", "rules": rules})).unwrap()
}

fn ctx() -> EvalContext {
    EvalContext::new(
        Stage::Request,
        ContextSeed {
            url: "https://example.com/".into(),
            method: "GET".into(),
            resource_type: "Document".into(),
            ..ContextSeed::default()
        },
    )
}

/// Hot replacement is a pointer swap: every evaluation sees a complete
/// set, never a mix of the old and new rules.
#[test]
fn rule_set_swap_is_atomic() {
    let set_a = rule_set(json!([
        {"id": "a1", "name": "a1", "stage": "request",
         "when": {"field": "url", "op": "contains", "value": "example"},
         "actions": [{"type": "setHeader", "name": "X", "value": "1"}]},
        {"id": "a2", "name": "a2", "stage": "request",
         "when": {"field": "url", "op": "contains", "value": "example"},
         "actions": [{"type": "setHeader", "name": "Y", "value": "2"}]}
    ]));
    let set_b = rule_set(json!([
        {"id": "b1", "name": "b1", "stage": "request",
         "when": {"field": "url", "op": "contains", "value": "example"},
         "actions": [{"type": "setHeader", "name": "Z", "value": "3"}]}
    ]));

    let engine = Arc::new(Engine::new(&set_a).unwrap());

    std::thread::scope(|scope| {
        let writer_engine = engine.clone();
        let writer = scope.spawn(move || {
            for round in 0..200 {
                let set = if round % 2 == 0 { &set_b } else { &set_a };
                writer_engine.update(set).unwrap();
            }
        });

        for _ in 0..4 {
            let reader_engine = engine.clone();
            scope.spawn(move || {
                let ctx = ctx();
                for _ in 0..500 {
                    let ids: Vec<String> = reader_engine
                        .evaluate(&ctx)
                        .iter()
                        .map(|m| m.rule.id.0.clone())
                        .collect();
                    let from_a = ids.iter().filter(|id| id.starts_with('a')).count();
                    let from_b = ids.iter().filter(|id| id.starts_with('b')).count();
                    assert!(
                        (from_a == 2 && from_b == 0) || (from_a == 0 && from_b == 1),
                        "mixed snapshot observed: {ids:?}"
                    );
                }
            });
        }

        writer.join().unwrap();
    });
}

fn arb_mutation() -> impl Strategy<Value = RequestMutation> {
    (
        prop::option::of("[a-z]{1,8}"),
        prop::option::of(prop::sample::select(vec!["GET", "POST", "PUT", "DELETE"])),
        prop::collection::hash_map("[a-c]", "[0-9]{1,3}", 0..3),
        prop::collection::vec("[a-c]", 0..2),
        prop::option::of("[a-z]{0,6}"),
    )
        .prop_map(|(host, method, headers, remove_headers, body)| RequestMutation {
            url: host.map(|h| format!("https://{h}.example.com/")),
            method: method.map(str::to_string),
            headers,
            remove_headers,
            body,
            ..RequestMutation::default()
        })
}

proptest! {
    /// Folding [A, B, C] at once equals folding [A] then the composition
    /// of [B, C] — last-writer-wins for singletons, concatenation for
    /// remove lists.
    #[test]
    fn mutation_composition_is_associative(
        muts in prop::collection::vec(arb_mutation(), 1..6),
        split_at in 0usize..6,
    ) {
        let split_at = split_at.min(muts.len());

        let mut all = RequestMutation::default();
        for m in &muts {
            all.merge(m.clone());
        }

        let mut left = RequestMutation::default();
        for m in &muts[..split_at] {
            left.merge(m.clone());
        }
        let mut right = RequestMutation::default();
        for m in &muts[split_at..] {
            right.merge(m.clone());
        }
        left.merge(right);

        prop_assert_eq!(all, left);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// With every job parked, accepted submissions can never exceed the
    /// workers plus the queue.
    #[test]
    fn pool_pending_work_is_bounded(
        concurrency in 1usize..4,
        capacity in 1usize..4,
        jobs in 1usize..16,
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let accepted = rt.block_on(async move {
            let pool = WorkerPool::new(concurrency, capacity);
            pool.start();
            let gate = Arc::new(tokio::sync::Notify::new());
            let mut accepted = 0usize;
            for _ in 0..jobs {
                let gate = gate.clone();
                if pool.submit(async move {
                    gate.notified().await;
                }) {
                    accepted += 1;
                }
                tokio::task::yield_now().await;
            }
            accepted
        });
        rt.shutdown_timeout(Duration::from_millis(200));

        prop_assert!(accepted <= concurrency + capacity,
                     "accepted {} > workers {} + queue {}", accepted, concurrency, capacity);
    }
}
