//! Interlink Common Library
//!
//! This crate provides the wire protocol and shared utilities used by both the
//! Interlink outbound client and the communication server. It includes:
//!
//! - Request/answer envelope definitions
//! - The AES-192-CBC wire codec and length-prefixed framing
//! - Non-blocking TCP listener and connect helpers
//! - Configuration structures and the error taxonomy
//!
//! # Wire format
//!
//! Every frame is the ASCII decimal length of its ciphertext, a newline, then
//! exactly that many ciphertext bytes. Frames follow each other back to back.

/// Symmetric encryption and frame encoding
pub mod codec;

/// Configuration structures and peer addresses
pub mod config;

/// Request and answer envelopes
pub mod envelope;

/// Error types
pub mod error;

/// Receive buffering and frame-oriented streams
pub mod frame_stream;

/// TCP listener and outbound connect helpers
pub mod platform_socket;

// Re-export commonly used types for convenience
pub use codec::{CipherScheme, LegacyIv, Secret, WireCodec};
pub use config::{CommConfig, PeerAddress, DEFAULT_BASE_PORT};
pub use envelope::{Answer, Request, NO_LISTENER_MESSAGE};
pub use error::{CapabilityMissing, ConfigError, ConnectError, DecodeError, EncodeError, FrameError};
pub use frame_stream::{FrameBuffer, FrameStream, ReadOutcome};
pub use platform_socket::{connect_socket, PlatformListener};
