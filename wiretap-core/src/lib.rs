//! Wiretap Core — Interception Runtime
//!
//! Attaches to a running Chromium-family browser over its remote debugging
//! endpoint, pauses requests and responses, evaluates them against the
//! installed rule set and resolves each one with exactly one terminal
//! protocol call: continue, fulfill or fail — or holds it for human
//! approval first.
//!
//! Layering, leaves first:
//!
//! - **cdp**: discovery, per-target WebSocket transport, typed protocol ops
//! - **executor**: composes matched rules into one transport-level outcome
//! - **pool**: bounded-concurrency dispatch with drop-on-overflow
//! - **approval**: pending-decision coordination with timeouts
//! - **handler**: per-event orchestration and the event stream
//! - **interceptor**: per-target paused-stream consumers
//! - **targets**: attachment, auto-follow, reconnect
//! - **service**: session registry and the embedding surface
//! - **browser**: launcher helper producing a debugging base URL

pub mod approval;
pub mod browser;
pub mod cdp;
pub mod error;
pub mod executor;
pub mod handler;
pub mod interceptor;
pub mod pool;
pub mod service;
pub mod targets;

pub use approval::{ApprovalCoordinator, Decision};
pub use browser::{launch, BrowserHandle, LaunchOptions};
pub use cdp::{CdpClient, Discovery, PausedEvent};
pub use error::{CoreError, CoreResult};
pub use executor::{ExecutionOutcome, ExecutionResult, Executor, ExecutorOptions};
pub use handler::{Handler, HandlerConfig};
pub use interceptor::Interceptor;
pub use pool::WorkerPool;
pub use service::InterceptService;
pub use targets::{TargetManager, TargetSession};
