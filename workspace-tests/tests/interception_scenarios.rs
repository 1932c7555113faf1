//! End-to-end scenarios through the handler against a scripted transport:
//! each paused event must reach exactly one terminal protocol call with
//! the composed mutation applied.

mod support;

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use wiretap_common::{FinalResult, NetworkEvent, TargetId};
use wiretap_rules::Rewrite;

use support::{drain_events, fixture, header_value, request_paused, response_paused};

fn target() -> TargetId {
    TargetId("target-1".into())
}

#[tokio::test]
async fn header_inject_continues_with_header() {
    let mut fx = fixture(json!([{
        "id": "trace", "name": "trace header", "stage": "request",
        "when": {"field": "url", "op": "prefix", "value": "https://api.example.com"},
        "actions": [{"type": "setHeader", "name": "X-Trace", "value": "abc"}]
    }]));

    fx.handler
        .handle(
            fx.client.clone(),
            fx.cancel.clone(),
            target(),
            request_paused("req-1", "https://api.example.com/v1/ping", "GET"),
        )
        .await;

    let continues = fx.transport.calls("Fetch.continueRequest");
    assert_eq!(continues.len(), 1);
    assert_eq!(continues[0]["requestId"], "req-1");
    assert_eq!(header_value(&continues[0], "X-Trace").as_deref(), Some("abc"));

    let events = drain_events(&mut fx.events);
    let matched = events
        .iter()
        .find_map(|e| match e {
            NetworkEvent::Matched(m) => Some(m),
            _ => None,
        })
        .expect("matched event");
    assert_eq!(matched.final_result, FinalResult::Modified);
    assert_eq!(matched.matched_rules[0].actions, vec!["setHeader"]);
}

#[tokio::test]
async fn block_fulfills_with_synthetic_response() {
    let mut fx = fixture(json!([{
        "id": "ads", "name": "block ads", "stage": "request",
        "when": {"field": "url", "op": "contains", "value": "/ads/"},
        "actions": [{"type": "block", "status": 403, "body": "blocked"}]
    }]));

    fx.handler
        .handle(
            fx.client.clone(),
            fx.cancel.clone(),
            target(),
            request_paused("req-2", "https://cdn.example.com/ads/banner.js", "GET"),
        )
        .await;

    assert_eq!(fx.transport.call_count("Fetch.continueRequest"), 0);
    let fulfills = fx.transport.calls("Fetch.fulfillRequest");
    assert_eq!(fulfills.len(), 1);
    assert_eq!(fulfills[0]["responseCode"], 403);
    assert_eq!(
        fulfills[0]["body"].as_str().unwrap(),
        BASE64.encode("blocked")
    );

    let events = drain_events(&mut fx.events);
    assert!(events.iter().any(|e| matches!(
        e,
        NetworkEvent::Matched(m) if m.final_result == FinalResult::Blocked
    )));
}

#[tokio::test]
async fn json_patch_rewrites_response_body() {
    let mut fx = fixture(json!([{
        "id": "patch", "name": "patch status", "stage": "response",
        "when": {"field": "contentType", "op": "contains", "value": "json"},
        "actions": [{"type": "patchBodyJson", "patches": [
            {"op": "replace", "path": "/status", "value": "ok"}
        ]}]
    }]));

    fx.transport.reply(
        "Fetch.getResponseBody",
        json!({"body": "{\"status\":\"err\",\"v\":1}", "base64Encoded": false}),
    );

    fx.handler
        .handle(
            fx.client.clone(),
            fx.cancel.clone(),
            target(),
            response_paused(
                "req-3",
                "https://api.example.com/v1/state",
                200,
                &[
                    ("Content-Type", "application/json"),
                    ("Content-Length", "23"),
                    ("Content-Encoding", "identity"),
                ],
            ),
        )
        .await;

    let fulfills = fx.transport.calls("Fetch.fulfillRequest");
    assert_eq!(fulfills.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(
        &BASE64
            .decode(fulfills[0]["body"].as_str().unwrap())
            .unwrap(),
    )
    .unwrap();
    assert_eq!(body, json!({"status": "ok", "v": 1}));

    assert!(header_value(&fulfills[0], "content-length").is_none());
    assert!(header_value(&fulfills[0], "content-encoding").is_none());
    assert_eq!(
        header_value(&fulfills[0], "content-type").as_deref(),
        Some("application/json")
    );

    let events = drain_events(&mut fx.events);
    assert!(events.iter().any(|e| matches!(
        e,
        NetworkEvent::Matched(m) if m.final_result == FinalResult::Modified
    )));
}

#[tokio::test]
async fn pause_approval_applies_rewrite() {
    let mut fx = fixture(json!([{
        "id": "hold", "name": "hold for review", "stage": "request",
        "when": {"field": "url", "op": "contains", "value": "/checkout"},
        "actions": [{"type": "pause", "timeoutMs": 5000,
                     "default": {"type": "continueMutated"}}]
    }]));

    let handler = fx.handler.clone();
    let client = fx.client.clone();
    let cancel = fx.cancel.clone();
    let task = tokio::spawn(async move {
        handler
            .handle(
                client,
                cancel,
                target(),
                request_paused("req-4", "https://shop.example.com/checkout", "GET"),
            )
            .await;
    });

    let item = fx.pending.recv().await.expect("pending item");
    assert_eq!(item.id, "req-4");
    assert_eq!(item.rule.as_ref().unwrap().0, "hold");

    assert!(fx.approvals.approve(
        "req-4",
        Rewrite {
            method: Some("POST".into()),
            ..Rewrite::default()
        },
    ));
    task.await.unwrap();

    let continues = fx.transport.calls("Fetch.continueRequest");
    assert_eq!(continues.len(), 1);
    assert_eq!(continues[0]["method"], "POST");
    assert_eq!(fx.approvals.pending_count(), 0);
}

#[tokio::test]
async fn pause_timeout_applies_declared_fail() {
    let mut fx = fixture(json!([{
        "id": "hold", "name": "hold", "stage": "request",
        "when": {"field": "url", "op": "contains", "value": "/"},
        "actions": [{"type": "pause", "timeoutMs": 100,
                     "default": {"type": "fail", "reason": "Aborted"}}]
    }]));

    let started = Instant::now();
    fx.handler
        .handle(
            fx.client.clone(),
            fx.cancel.clone(),
            target(),
            request_paused("req-5", "https://x.example.com/", "GET"),
        )
        .await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");

    let fails = fx.transport.calls("Fetch.failRequest");
    assert_eq!(fails.len(), 1);
    assert_eq!(fails[0]["errorReason"], "Aborted");
    assert_eq!(fx.approvals.pending_count(), 0);

    let events = drain_events(&mut fx.events);
    assert!(events.iter().any(|e| matches!(
        e,
        NetworkEvent::Matched(m) if m.final_result == FinalResult::Failed
    )));
}

#[tokio::test]
async fn pause_noop_approval_is_plain_continue() {
    let fx = fixture(json!([{
        "id": "hold", "name": "hold", "stage": "request",
        "when": {"field": "url", "op": "contains", "value": "/"},
        "actions": [{"type": "pause", "timeoutMs": 5000,
                     "default": {"type": "continueMutated"}}]
    }]));

    let handler = fx.handler.clone();
    let client = fx.client.clone();
    let cancel = fx.cancel.clone();
    let mut pending = fx.pending;
    let task = tokio::spawn(async move {
        handler
            .handle(
                client,
                cancel,
                target(),
                request_paused("req-6", "https://x.example.com/", "GET"),
            )
            .await;
    });

    pending.recv().await.expect("pending item");
    assert!(fx.approvals.approve("req-6", Rewrite::default()));
    task.await.unwrap();

    let continues = fx.transport.calls("Fetch.continueRequest");
    assert_eq!(continues.len(), 1);
    assert_eq!(continues[0], json!({"requestId": "req-6"}));
}

#[tokio::test]
async fn rejection_fails_with_aborted() {
    let fx = fixture(json!([{
        "id": "hold", "name": "hold", "stage": "request",
        "when": {"field": "url", "op": "contains", "value": "/"},
        "actions": [{"type": "pause", "timeoutMs": 5000,
                     "default": {"type": "continueMutated"}}]
    }]));

    let handler = fx.handler.clone();
    let client = fx.client.clone();
    let cancel = fx.cancel.clone();
    let mut pending = fx.pending;
    let task = tokio::spawn(async move {
        handler
            .handle(
                client,
                cancel,
                target(),
                request_paused("req-7", "https://x.example.com/", "GET"),
            )
            .await;
    });

    pending.recv().await.expect("pending item");
    assert!(fx.approvals.reject("req-7"));
    task.await.unwrap();

    let fails = fx.transport.calls("Fetch.failRequest");
    assert_eq!(fails.len(), 1);
    assert_eq!(fails[0]["errorReason"], "Aborted");
}

#[tokio::test]
async fn unmatched_event_continues_untouched() {
    let mut fx = fixture(json!([]));

    fx.handler
        .handle(
            fx.client.clone(),
            fx.cancel.clone(),
            target(),
            request_paused("req-8", "https://plain.example.com/", "GET"),
        )
        .await;

    let continues = fx.transport.calls("Fetch.continueRequest");
    assert_eq!(continues.len(), 1);
    assert_eq!(continues[0], json!({"requestId": "req-8"}));

    let events = drain_events(&mut fx.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, NetworkEvent::Unmatched { .. })));
    assert!(!events.iter().any(|e| matches!(e, NetworkEvent::Matched(_))));
}

#[tokio::test]
async fn full_event_channel_never_blocks_terminal_calls() {
    // Channel of capacity 1 loses events; the paused requests still
    // resolve.
    let mut fx = support::fixture_with(json!([]), 1, Duration::from_secs(5));

    for i in 0..4 {
        fx.handler
            .handle(
                fx.client.clone(),
                fx.cancel.clone(),
                target(),
                request_paused(&format!("req-{i}"), "https://x.example.com/", "GET"),
            )
            .await;
    }

    assert_eq!(fx.transport.call_count("Fetch.continueRequest"), 4);
    assert!(fx.handler.dropped_events() > 0);
    drain_events(&mut fx.events);
}
