//! Wire codec: JSON envelopes encrypted with AES-192-CBC and framed as
//! `<ascii decimal length>\n<ciphertext>`.
//!
//! The [`CipherScheme::Legacy`] scheme derives the key directly from the
//! secret string and uses one fixed IV for every message. It is weak:
//! identical envelopes produce identical ciphertext. Legacy peers only
//! understand each other when they share the same [`LegacyIv`]; the default is
//! [`LEGACY_IV`] and deployments override it through configuration.
//! [`CipherScheme::Hardened`] hashes the secret into the key and prefixes a
//! random IV to every ciphertext. Peers must agree on the scheme.

use std::{fmt, str::FromStr};

use aes::Aes192;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    error::{CapabilityMissing, ConfigError, DecodeError, EncodeError},
    frame_stream::DEFAULT_MAX_FRAME_BYTES,
};

type Aes192CbcEnc = cbc::Encryptor<Aes192>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;

/// AES-192 key length in bytes
pub const KEY_LEN: usize = 24;
/// CBC initialization vector length in bytes
pub const IV_LEN: usize = 16;
/// AES block length in bytes
pub const BLOCK_LEN: usize = 16;
/// Default IV shared by every message under [`CipherScheme::Legacy`]
pub const LEGACY_IV: [u8; IV_LEN] = *b"kZ2Kt0CzKUjN2MJX";

/// Shared secret configured on both ends of a channel.
///
/// `Debug` never prints the secret itself, only [`Secret::fingerprint`].
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret string
    pub fn new<S: Into<String>>(secret: S) -> Self {
        Self(secret.into())
    }

    /// Raw secret
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether no secret was configured
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First eight hex digits of the SHA-256 of the secret, safe to log
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.fingerprint())
    }
}

impl From<&str> for Secret {
    fn from(secret: &str) -> Self {
        Self::new(secret)
    }
}

impl From<String> for Secret {
    fn from(secret: String) -> Self {
        Self(secret)
    }
}

/// Key derivation and IV policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherScheme {
    /// Raw secret bytes as key (zero padded or truncated to 24 bytes), one
    /// fixed IV for every message.
    #[default]
    Legacy,
    /// SHA-256 derived key, random IV prepended to each ciphertext.
    Hardened,
}

impl FromStr for CipherScheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "hardened" => Ok(Self::Hardened),
            _ => {
                Err(ConfigError::InvalidValue {
                    key:   "cipher scheme",
                    value: s.to_string(),
                })
            }
        }
    }
}

impl fmt::Display for CipherScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::Hardened => f.write_str("hardened"),
        }
    }
}

/// Fixed IV of the legacy scheme.
///
/// Parses from exactly 16 characters taken as raw bytes, or from 32 hex
/// digits. Serializes as hex.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LegacyIv([u8; IV_LEN]);

impl LegacyIv {
    /// Wraps raw IV bytes
    pub const fn new(bytes: [u8; IV_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw IV bytes
    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

impl Default for LegacyIv {
    fn default() -> Self {
        Self(LEGACY_IV)
    }
}

impl FromStr for LegacyIv {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; IV_LEN];
        if s.len() == IV_LEN {
            bytes.copy_from_slice(s.as_bytes());
            return Ok(Self(bytes));
        }
        if s.len() == 2 * IV_LEN && hex::decode_to_slice(s, &mut bytes).is_ok() {
            return Ok(Self(bytes));
        }
        Err(ConfigError::InvalidValue {
            key:   "legacy IV",
            value: s.to_string(),
        })
    }
}

impl TryFrom<String> for LegacyIv {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LegacyIv> for String {
    fn from(iv: LegacyIv) -> Self {
        hex::encode(iv.0)
    }
}

impl fmt::Display for LegacyIv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for LegacyIv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LegacyIv({self})")
    }
}

/// Derives the AES-192 key for `secret` under `scheme`
fn derive_key(secret: &Secret, scheme: CipherScheme) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    match scheme {
        CipherScheme::Legacy => {
            let raw = secret.expose().as_bytes();
            let n = raw.len().min(KEY_LEN);
            key[..n].copy_from_slice(&raw[..n]);
        }
        CipherScheme::Hardened => {
            let digest = Sha256::digest(secret.expose().as_bytes());
            key.copy_from_slice(&digest[..KEY_LEN]);
        }
    }
    key
}

/// Encrypts and decrypts frame payloads for one secret.
#[derive(Clone)]
pub struct WireCodec {
    key:             [u8; KEY_LEN],
    scheme:          CipherScheme,
    legacy_iv:       LegacyIv,
    max_frame_bytes: usize,
}

impl fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireCodec")
            .field("scheme", &self.scheme)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

impl WireCodec {
    /// Creates a codec for `secret`
    pub fn new(secret: &Secret, scheme: CipherScheme) -> Self {
        Self {
            key: derive_key(secret, scheme),
            scheme,
            legacy_iv: LegacyIv::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Replaces the fixed IV used by [`CipherScheme::Legacy`]
    pub fn with_legacy_iv(mut self, legacy_iv: LegacyIv) -> Self {
        self.legacy_iv = legacy_iv;
        self
    }

    /// Caps the ciphertext size this codec will produce
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Scheme in use
    pub fn scheme(&self) -> CipherScheme {
        self.scheme
    }

    /// Largest ciphertext accepted in either direction
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Serializes, encrypts and frames an envelope.
    pub fn encode<T: Serialize>(&self, envelope: &T) -> Result<Vec<u8>, EncodeError> {
        let plaintext = serde_json::to_vec(envelope)?;
        let ciphertext = self.encrypt(&plaintext);
        if ciphertext.len() > self.max_frame_bytes {
            return Err(EncodeError::TooLarge {
                size: ciphertext.len(),
                max:  self.max_frame_bytes,
            });
        }
        Ok(encode_frame(&ciphertext))
    }

    /// Decrypts a frame payload (the bytes after the length line) into an
    /// envelope.
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, DecodeError> {
        let plaintext = self.decrypt(payload)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Like [`WireCodec::decode`] but stops at an untyped JSON value
    pub fn decode_value(&self, payload: &[u8]) -> Result<Value, DecodeError> {
        self.decode(payload)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        match self.scheme {
            CipherScheme::Legacy => {
                Aes192CbcEnc::new(&self.key.into(), &self.legacy_iv.0.into())
                    .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
            }
            CipherScheme::Hardened => {
                let iv: [u8; IV_LEN] = rand::random();
                let ciphertext = Aes192CbcEnc::new(&self.key.into(), &iv.into())
                    .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
                let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
                out.extend_from_slice(&iv);
                out.extend_from_slice(&ciphertext);
                out
            }
        }
    }

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let (iv, ciphertext) = match self.scheme {
            CipherScheme::Legacy => (self.legacy_iv.0, payload),
            CipherScheme::Hardened => {
                if payload.len() < IV_LEN {
                    return Err(DecodeError::Truncated(payload.len()));
                }
                let (iv, rest) = payload.split_at(IV_LEN);
                let mut fixed = [0u8; IV_LEN];
                fixed.copy_from_slice(iv);
                (fixed, rest)
            }
        };

        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(DecodeError::Truncated(ciphertext.len()));
        }

        Aes192CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| DecodeError::Decrypt)
    }
}

/// Prepends the ASCII decimal length line to a payload
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = payload.len().to_string();
    let mut frame = Vec::with_capacity(header.len() + 1 + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.push(b'\n');
    frame.extend_from_slice(payload);
    frame
}

/// Encodes an envelope with the legacy scheme.
pub fn encode<T: Serialize>(secret: &Secret, envelope: &T) -> Result<Vec<u8>, EncodeError> {
    WireCodec::new(secret, CipherScheme::Legacy).encode(envelope)
}

/// Decodes a frame payload with the legacy scheme.
pub fn decode<T: DeserializeOwned>(secret: &Secret, payload: &[u8]) -> Result<T, DecodeError> {
    WireCodec::new(secret, CipherScheme::Legacy).decode(payload)
}

/// Runs one encrypt/decrypt cycle to confirm the cipher works before any
/// socket is opened.
pub fn probe_cipher(scheme: CipherScheme) -> Result<(), CapabilityMissing> {
    let probe = serde_json::json!({ "probe": "interlink" });
    let codec = WireCodec::new(&Secret::new("capability-probe"), scheme);

    let frame = codec
        .encode(&probe)
        .map_err(|e| CapabilityMissing(e.to_string()))?;
    let newline = frame
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| CapabilityMissing("probe frame has no header".to_string()))?;
    let decoded: Value = codec
        .decode(&frame[newline + 1..])
        .map_err(|e| CapabilityMissing(e.to_string()))?;

    if decoded != probe {
        return Err(CapabilityMissing(format!(
            "{scheme} cipher round trip altered the probe"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::envelope::{Answer, Request};

    fn payload(frame: &[u8]) -> &[u8] {
        let newline = frame.iter().position(|&b| b == b'\n').unwrap();
        let len: usize = std::str::from_utf8(&frame[..newline]).unwrap().parse().unwrap();
        assert_eq!(frame.len(), newline + 1 + len);
        &frame[newline + 1..]
    }

    #[test]
    fn request_survives_encode_decode() {
        let secret = Secret::new("hunter2");
        let request = Request::new("Ping", json!({ "n": 1, "tags": ["a", "b"] }));

        let frame = encode(&secret, &request).unwrap();
        let decoded: Request = decode(&secret, payload(&frame)).unwrap();

        assert_eq!(decoded, request);
    }

    #[test]
    fn header_is_ascii_length_of_ciphertext() {
        let frame = encode(&Secret::new("s"), &Answer::ok(json!("x"))).unwrap();
        let newline = frame.iter().position(|&b| b == b'\n').unwrap();
        let header = std::str::from_utf8(&frame[..newline]).unwrap();

        assert!(header.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(header.parse::<usize>().unwrap() % BLOCK_LEN, 0);
    }

    #[test]
    fn legacy_scheme_is_deterministic() {
        let secret = Secret::new("fixed-iv");
        let a = encode(&secret, &json!({ "k": 1 })).unwrap();
        let b = encode(&secret, &json!({ "k": 1 })).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn long_and_short_secrets_are_usable() {
        for secret in ["", "x", "exactly-twenty-four-byte", "a secret well beyond the key length"] {
            let secret = Secret::new(secret);
            let frame = encode(&secret, &json!([1, 2, 3])).unwrap();
            let value: Value = decode(&secret, payload(&frame)).unwrap();
            assert_eq!(value, json!([1, 2, 3]));
        }
    }

    #[test]
    fn wrong_secret_does_not_panic() {
        let frame = encode(&Secret::new("right"), &Request::new("Ping", json!(null))).unwrap();
        let result: Result<Request, _> = decode(&Secret::new("wrong"), payload(&frame));
        assert!(result.is_err());
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let frame = encode(&Secret::new("k"), &json!({ "a": "b" })).unwrap();
        let body = payload(&frame);
        let result: Result<Value, _> = decode(&Secret::new("k"), &body[..body.len() - 3]);
        assert!(matches!(result, Err(DecodeError::Truncated(_))));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let result: Result<Value, _> = decode(&Secret::new("k"), b"definitely not ciphertext");
        assert!(result.is_err());
    }

    #[test]
    fn hardened_scheme_uses_fresh_iv() {
        let codec = WireCodec::new(&Secret::new("k"), CipherScheme::Hardened);
        let a = codec.encode(&json!({ "same": true })).unwrap();
        let b = codec.encode(&json!({ "same": true })).unwrap();
        assert_ne!(a, b);

        let value = codec.decode_value(payload(&a)).unwrap();
        assert_eq!(value, json!({ "same": true }));
    }

    #[test]
    fn schemes_do_not_interoperate() {
        let secret = Secret::new("shared");
        let hardened = WireCodec::new(&secret, CipherScheme::Hardened);
        let frame = encode(&secret, &json!({ "v": 1 })).unwrap();
        assert!(hardened.decode_value(payload(&frame)).is_err());
    }

    #[test]
    fn oversized_envelope_is_refused() {
        let codec = WireCodec::new(&Secret::new("k"), CipherScheme::Legacy).with_max_frame_bytes(32);
        let err = codec.encode(&json!({ "blob": "x".repeat(64) })).unwrap_err();
        assert!(matches!(err, EncodeError::TooLarge { max: 32, .. }));
    }

    #[test]
    fn probe_succeeds_for_both_schemes() {
        probe_cipher(CipherScheme::Legacy).unwrap();
        probe_cipher(CipherScheme::Hardened).unwrap();
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("do-not-print-me");
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("do-not-print-me"));
        assert_eq!(secret.fingerprint().len(), 8);
    }

    #[test]
    fn legacy_iv_must_match_on_both_ends() {
        let secret = Secret::new("shared");
        let custom: LegacyIv = "0123456789abcdef".parse().unwrap();
        let ours = WireCodec::new(&secret, CipherScheme::Legacy).with_legacy_iv(custom);
        let theirs = WireCodec::new(&secret, CipherScheme::Legacy);

        let frame = ours.encode(&json!({ "v": 1 })).unwrap();
        assert_eq!(ours.decode_value(payload(&frame)).unwrap(), json!({ "v": 1 }));
        assert_ne!(frame, theirs.encode(&json!({ "v": 1 })).unwrap());
    }

    #[test]
    fn legacy_iv_parses_raw_or_hex() {
        let raw: LegacyIv = "kZ2Kt0CzKUjN2MJX".parse().unwrap();
        assert_eq!(raw, LegacyIv::default());

        let hex: LegacyIv = raw.to_string().parse().unwrap();
        assert_eq!(hex, raw);
        assert_eq!(hex.as_bytes(), &LEGACY_IV);

        for bad in ["", "too-short", "zz".repeat(16).as_str()] {
            assert!(bad.parse::<LegacyIv>().is_err(), "{bad:?} should not parse");
        }

        let json = serde_json::to_string(&raw).unwrap();
        assert_eq!(serde_json::from_str::<LegacyIv>(&json).unwrap(), raw);
    }

    #[test]
    fn scheme_parses_case_insensitively() {
        assert_eq!("Hardened".parse::<CipherScheme>().unwrap(), CipherScheme::Hardened);
        assert_eq!(" legacy ".parse::<CipherScheme>().unwrap(), CipherScheme::Legacy);
        assert!("rot13".parse::<CipherScheme>().is_err());
    }
}
