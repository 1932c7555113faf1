//! Dispatch policy under load: with a bounded pool, one event executes,
//! one queues, and the overflow event is continued immediately as
//! degraded — the consumer never blocks.

mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;
use wiretap_common::{NetworkEvent, TargetId};
use wiretap_core::{Interceptor, TargetSession, WorkerPool};

use support::{drain_events, fixture, request_paused};

#[tokio::test]
async fn overflow_event_degrades_immediately() {
    let _ = tracing_subscriber::fmt::try_init();

    // The delay keeps the single worker busy long enough for the queue
    // to fill.
    let mut fx = fixture(json!([{
        "id": "slow", "name": "slow lane", "stage": "request",
        "when": {"field": "url", "op": "contains", "value": "example"},
        "actions": [
            {"type": "delay", "delayMs": 300},
            {"type": "setHeader", "name": "X-Lane", "value": "slow"}
        ]
    }]));

    let pool = Arc::new(WorkerPool::new(1, 1));
    let interceptor = Arc::new(Interceptor::new(fx.handler.clone(), Some(pool.clone())));
    let session = Arc::new(TargetSession {
        id: TargetId("target-1".into()),
        client: fx.client.clone(),
        cancel: fx.cancel.clone(),
        attached_at: 0,
    });

    interceptor.set_enabled(true);
    interceptor.enable_target(&session).await.unwrap();
    assert_eq!(fx.transport.call_count("Fetch.enable"), 1);

    for (i, delay_ms) in [(1, 0u64), (2, 100), (3, 50)] {
        sleep(Duration::from_millis(delay_ms)).await;
        let ev = request_paused(&format!("req-{i}"), "https://api.example.com/slow", "GET");
        fx.transport
            .push_event("Fetch.requestPaused", serde_json::to_value(&ev).unwrap())
            .await;
    }

    // First finishes ~300ms, second ~600ms, third degrades right away.
    sleep(Duration::from_millis(1200)).await;

    assert_eq!(fx.transport.call_count("Fetch.continueRequest"), 3);

    let events = drain_events(&mut fx.events);
    let degraded: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, NetworkEvent::Degraded { .. }))
        .collect();
    assert_eq!(degraded.len(), 1);

    let matched = events
        .iter()
        .filter(|e| matches!(e, NetworkEvent::Matched(_)))
        .count();
    assert_eq!(matched, 2);

    let stats = pool.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.dropped, 1);

    fx.cancel.cancel();
    pool.stop().await;
}
