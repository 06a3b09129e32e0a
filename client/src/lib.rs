//! Interlink Outbound Client Library
//!
//! This crate provides the outbound side of the inter-controller channel: a
//! single-peer, non-blocking connection that multiplexes calls and matches
//! answers to them strictly in call order. Nothing happens in the background;
//! the host drives the channel by calling [`OutboundChannel::tick`] once per
//! loop iteration.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use interlink_client::{OutboundChannel, PeerAddress};
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let peer: PeerAddress = "127.0.0.1:31500".parse()?;
//! let mut channel = OutboundChannel::connect(peer, "shared-secret")?;
//!
//! channel.call(
//!     |answer| println!("error={} data={}", answer.error, answer.data),
//!     "Ping",
//!     json!({ "n": 1 }),
//! )?;
//!
//! loop {
//!     channel.tick();
//!     if channel.pending_calls() == 0 {
//!         break;
//!     }
//!     std::thread::sleep(Duration::from_millis(20));
//! }
//! # Ok(())
//! # }
//! ```

mod channel;
mod pending;

pub use channel::*;
pub use pending::{AnswerCallback, PendingCalls, Resolution};
// Re-export important types from interlink-common for convenience
pub use interlink_common::{Answer, CipherScheme, ConnectError, LegacyIv, PeerAddress, Secret};
