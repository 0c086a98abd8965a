//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, the per-client WebSocket event
//! stream, HTTP API wrappers, workflow template patching and history
//! output lookup for driving a ComfyUI image-generation server.

pub mod api;
pub mod client;
pub mod history;
pub mod messages;
pub mod workflow;
