//! Detached payload signatures
//!
//! Signatures ride in an optional `signatures` array inside the JSON
//! payload. The signing input binds the message's action and request id
//! ahead of a canonical serialization of the payload (object keys
//! sorted recursively, signature slot excluded): a relay that parses
//! and re-serializes a message cannot invalidate it by reordering keys,
//! and a signature lifted off one request never verifies on another.

use std::collections::HashMap;

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::wire::ids::RequestId;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNING_HMAC_SHA256: &str = "HMAC-SHA256";
pub const ENCODING_BASE64: &str = "base64";
pub const ENCODING_HEX: &str = "hex";

// ── Signature ──────────────────────────────────────────────────

/// One detached signature over a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    /// Names the shared key that produced this signature.
    pub key_id: String,
    /// Encoded MAC value.
    pub value: String,
    pub signing_method: String,
    pub encoding_method: String,
}

// ── VerifyMode ─────────────────────────────────────────────────

/// How strictly inbound signatures are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMode {
    /// Ignore signatures entirely.
    #[default]
    Off,
    /// Verify whatever is present; unsigned messages pass.
    IfPresent,
    /// Unsigned messages are rejected.
    Require,
}

// ── SignatureKeyring ───────────────────────────────────────────

/// Shared-key store used for signing and verification.
#[derive(Debug, Clone, Default)]
pub struct SignatureKeyring {
    keys: HashMap<String, Vec<u8>>,
}

impl SignatureKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_id: impl Into<String>, secret: impl Into<Vec<u8>>) {
        self.keys.insert(key_id.into(), secret.into());
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Sign `payload` with the named key, bound to one message's
    /// action and request id.
    pub fn sign(
        &self,
        action: &str,
        request_id: &RequestId,
        payload: &Value,
        key_id: &str,
    ) -> Result<Signature, SignatureFault> {
        let secret = self
            .keys
            .get(key_id)
            .ok_or_else(|| SignatureFault::UnknownKey(key_id.to_string()))?;

        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| SignatureFault::BadKey(key_id.to_string()))?;
        mac.update(digest_input(action, request_id, payload).as_bytes());
        let value = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(Signature {
            key_id: key_id.to_string(),
            value,
            signing_method: SIGNING_HMAC_SHA256.to_string(),
            encoding_method: ENCODING_BASE64.to_string(),
        })
    }

    /// Check one signature against the message it claims to cover.
    pub fn verify_one(
        &self,
        action: &str,
        request_id: &RequestId,
        payload: &Value,
        signature: &Signature,
    ) -> Result<(), SignatureFault> {
        if signature.signing_method != SIGNING_HMAC_SHA256 {
            return Err(SignatureFault::UnsupportedMethod(
                signature.signing_method.clone(),
            ));
        }

        let secret = self
            .keys
            .get(&signature.key_id)
            .ok_or_else(|| SignatureFault::UnknownKey(signature.key_id.clone()))?;

        let expected = match signature.encoding_method.as_str() {
            ENCODING_BASE64 => base64::engine::general_purpose::STANDARD
                .decode(&signature.value)
                .map_err(|_| SignatureFault::BadEncoding)?,
            ENCODING_HEX => hex::decode(&signature.value).map_err(|_| SignatureFault::BadEncoding)?,
            other => return Err(SignatureFault::UnsupportedMethod(other.to_string())),
        };

        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| SignatureFault::BadKey(signature.key_id.clone()))?;
        mac.update(digest_input(action, request_id, payload).as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| SignatureFault::Mismatch(signature.key_id.clone()))
    }

    /// Apply `mode` to a message's signature set.
    ///
    /// All present signatures must check out; `Require` additionally
    /// insists on at least one.
    pub fn verify(
        &self,
        action: &str,
        request_id: &RequestId,
        payload: &Value,
        signatures: &[Signature],
        mode: VerifyMode,
    ) -> Result<(), SignatureFault> {
        match mode {
            VerifyMode::Off => Ok(()),
            VerifyMode::IfPresent | VerifyMode::Require => {
                if signatures.is_empty() {
                    return if mode == VerifyMode::Require {
                        Err(SignatureFault::MissingSignature)
                    } else {
                        Ok(())
                    };
                }
                for signature in signatures {
                    self.verify_one(action, request_id, payload, signature)?;
                }
                Ok(())
            }
        }
    }
}

// ── Canonical form ─────────────────────────────────────────────

/// MAC input: JSON-escaped action and request id joined ahead of the
/// canonical payload. The escaping keeps the three parts unambiguous
/// whatever characters the strings carry.
fn digest_input(action: &str, request_id: &RequestId, payload: &Value) -> String {
    let mut out = String::new();
    // to_string on a scalar never fails
    out.push_str(&serde_json::to_string(action).unwrap());
    out.push(':');
    out.push_str(&serde_json::to_string(request_id.as_str()).unwrap());
    out.push(':');
    write_canonical(payload, &mut out);
    out
}

/// Deterministic serialization of the payload part of the signing
/// input.
///
/// Object keys sort recursively; arrays keep their order; scalars
/// serialize as serde_json would.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // to_string on a scalar never fails
                out.push_str(&serde_json::to_string(key).unwrap());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).unwrap()),
    }
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SignatureFault {
    #[error("no key registered for key id '{0}'")]
    UnknownKey(String),

    #[error("key material for '{0}' is unusable")]
    BadKey(String),

    #[error("signature required but none present")]
    MissingSignature,

    #[error("unsupported signing or encoding method: {0}")]
    UnsupportedMethod(String),

    #[error("signature value is not valid for its encoding method")]
    BadEncoding,

    #[error("signature mismatch for key id '{0}'")]
    Mismatch(String),
}
