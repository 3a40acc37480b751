//! Streaming bridge between the page context and the background context.
//!
//! The two sides share nothing but a [`Channel`] of JSON strings. The
//! background side runs a [`BridgeServer`] that owns provider sessions and
//! storage; the page side talks to it through a [`BridgeClient`].

mod channel;
mod client;
pub mod protocol;
mod server;
mod stdio;

pub use channel::{channel_pair, Channel, DEFAULT_CHANNEL_CAPACITY};
pub use client::{BridgeClient, ResponseStream};
pub use protocol::{Command, Frame, RequestFrame, ResponseFrame, StreamEnvelope, SynthesisReply};
pub use server::BridgeServer;
pub use stdio::stdio_channel;
