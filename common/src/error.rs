//! Error taxonomy for the communication channel.
//!
//! Protocol-level failures ([`DecodeError`], [`FrameError`]) are recovered by
//! the caller and turned into error answers. Only construction-time problems
//! ([`ConfigError`], [`ConnectError`]) cross the public API as hard errors.

use std::io;

use thiserror::Error;

/// Outbound socket could not be opened.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The peer host name did not resolve to any socket address.
    #[error("could not resolve peer address {peer}")]
    Unresolved {
        /// Peer as configured
        peer: String,
    },
    /// Name resolution itself failed.
    #[error("failed to resolve {peer}: {source}")]
    Resolve {
        /// Peer as configured
        peer:   String,
        /// Underlying resolver error
        #[source]
        source: io::Error,
    },
    /// The TCP connection attempt failed or timed out.
    #[error("failed to connect to {peer}: {source}")]
    Io {
        /// Peer as configured
        peer:   String,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },
}

/// A frame payload could not be turned back into an envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Ciphertext is not a whole number of cipher blocks.
    #[error("ciphertext length {0} is not a multiple of the block size")]
    Truncated(usize),
    /// Decryption produced invalid padding, usually a wrong secret.
    #[error("ciphertext did not decrypt cleanly (wrong secret or tampered frame)")]
    Decrypt,
    /// Decrypted bytes are not valid JSON for the expected envelope.
    #[error("decrypted payload is not a valid envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The decrypted JSON value is not an object.
    #[error("envelope is not a JSON object")]
    NotAnObject,
    /// A required envelope key is missing or has the wrong type.
    #[error("envelope is missing required key `{0}`")]
    MissingKey(&'static str),
}

/// An envelope could not be serialized or encrypted.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// JSON serialization failed.
    #[error("failed to serialize envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The serialized frame exceeds the configured maximum.
    #[error("encoded frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Ciphertext size
        size: usize,
        /// Configured limit
        max:  usize,
    },
}

/// The length prefix of a frame is unusable. The byte stream cannot be
/// resynchronized after this, so the owning socket is closed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The header is not an ASCII decimal number.
    #[error("invalid frame length prefix {0:?}")]
    InvalidLength(String),
    /// No newline was found within the maximum header length.
    #[error("frame header exceeds {0} bytes without a newline")]
    HeaderTooLong(usize),
    /// The announced length is larger than allowed.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Announced size
        size: usize,
        /// Configured limit
        max:  usize,
    },
}

/// Invalid configuration or construction input.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Peer address is not `host:port`.
    #[error("invalid peer address {0:?}, expected host:port")]
    InvalidPeerAddress(String),
    /// An environment variable holds an unparsable value.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Variable or field name
        key:   &'static str,
        /// Offending value
        value: String,
    },
    /// Port arithmetic left the valid range.
    #[error("port {base} + server index {index} is out of range")]
    PortOutOfRange {
        /// Base port
        base:  u16,
        /// Server index
        index: u32,
    },
}

/// The cipher self-test failed, so no traffic can be encrypted.
#[derive(Debug, Error)]
#[error("cryptographic capability unavailable: {0}")]
pub struct CapabilityMissing(pub String);
