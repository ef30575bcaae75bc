//! Signaling client: the single durable WebSocket to the cloud.
//!
//! The client owns at most one open socket at a time. Incoming frames are
//! dispatched to handlers registered by message type; outgoing traffic
//! either goes through [`SignalingClient::send`] (synchronous, fails when
//! disconnected) or the bounded fire-and-forget outbound queue. A broken
//! connection triggers a background reconnect loop with exponential
//! backoff, and every successful (re)connection re-runs the registered
//! on-connect handlers so upper layers can resynchronize.

mod client;
mod error;

pub use client::{OutboundMessage, SignalingClient};
pub use error::{HandlerError, SignalingError};
