//! Interlink Communication Server
//!
//! The listening side of the inter-controller channel. A
//! [`CommunicationServer`] accepts connections from peer controllers, decodes
//! their requests, dispatches them to the handler registered for the method
//! and writes the answers back in arrival order. It also owns the outbound
//! channels the host opens to other controllers.
//!
//! Everything is single-threaded and non-blocking: the host calls
//! [`CommunicationServer::tick`] from its main loop and
//! [`CommunicationServer::on_shutdown`] when it exits.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use interlink_server::{Answer, CommConfig, CommunicationServer, SharedHandler};
//! use serde_json::{json, Value};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = CommConfig::for_server_index(0)?
//!     .with_enabled(true)
//!     .with_secret("shared-secret");
//! let mut server = CommunicationServer::new(config);
//!
//! let ping: SharedHandler = Arc::new(|data: Value| {
//!     let n = data.get("n")?.as_i64()?;
//!     Some(Answer::ok(json!({ "n": n + 1 })))
//! });
//! server.register_listener("Ping", ping)?;
//! server.enable()?;
//!
//! loop {
//!     server.tick();
//!     std::thread::sleep(Duration::from_millis(50));
//! }
//! # }
//! ```

mod connection;
mod registry;
mod server;

pub use connection::{answer_request, ConnectionHandler, ConnectionId};
pub use registry::{ListenerRegistry, MethodHandler, RegistryError, SharedHandler};
pub use server::{ChannelId, CommunicationServer, EnableError, ServerState};
// Re-export important types from the other Interlink crates for convenience
pub use interlink_client::{ChannelError, OutboundChannel};
pub use interlink_common::{
    Answer, CipherScheme, CommConfig, LegacyIv, PeerAddress, Request, Secret,
};
