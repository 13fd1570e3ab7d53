//! HTTP surface of a node and the adapter that talks to it.

mod client;
mod server;
mod sse;

pub use client::{HttpAdapter, PEER_HEADER};
pub use server::{ApiError, AppState, router, serve};
pub use sse::{SseEvent, SseParser};
