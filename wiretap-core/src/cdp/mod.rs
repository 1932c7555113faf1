//! Remote Debugging Protocol Adapter
//!
//! Everything that talks the wire lives here: endpoint discovery over
//! HTTP, the per-target WebSocket transport, and the typed client for the
//! Fetch/Network/Page domains.

pub mod client;
pub mod discovery;
pub mod transport;

pub use client::{
    to_header_entries, CdpClient, ContinueRequestArgs, ContinueResponseArgs, FulfillRequestArgs,
    HeaderEntry, LifecycleEvent, PausedEvent, RequestPayload, BODY_FETCH_DEADLINE,
    COMMAND_DEADLINE,
};
pub use discovery::{
    is_user_page, is_user_page_url, select_auto_target, DevToolsVersion, Discovery,
    TargetDescription,
};
pub use transport::{Transport, TransportEvent, WsTransport};
