//! Security helpers (random identifiers, session secrets, constant-time compare)

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Entropy of a room identifier, in bytes.
pub const ROOM_ID_BYTES: usize = 8;

/// Entropy of a session identifier, in bytes.
pub const SESSION_ID_BYTES: usize = 16;

/// Entropy of a generated server key, in bytes.
pub const SERVER_KEY_BYTES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Invalid session key: {0}")]
    InvalidKey(String),
}

/// Generate `byte_length` cryptographically random bytes, URL-safe base64 encoded.
pub fn new_identifier(byte_length: usize) -> String {
    let mut bytes = vec![0u8; byte_length];
    rand::rng().fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time equality for encoded secrets.
pub fn ct_eq_str(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Derives and verifies session secrets.
///
/// A session secret is `HMAC-SHA256(server_key, session_id)`, so the broker can
/// check ownership of a session without keeping a per-session secret table.
#[derive(Clone)]
pub struct SessionKeys {
    mac: HmacSha256,
}

impl SessionKeys {
    pub fn new(server_key: &[u8]) -> Result<Self, SecurityError> {
        let mac = HmacSha256::new_from_slice(server_key)
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Use the configured key, or generate one for the lifetime of the process.
    ///
    /// A generated key invalidates every outstanding secret on restart.
    pub fn from_config(configured: Option<&str>) -> Result<Self, SecurityError> {
        match configured {
            Some(key) => Self::new(key.as_bytes()),
            None => {
                tracing::warn!("SESSION_SECRET not set, generating a process-local key");
                Self::new(new_identifier(SERVER_KEY_BYTES).as_bytes())
            }
        }
    }

    pub fn derive_secret(&self, session_id: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(session_id.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Missing input or a length mismatch is rejected before the
    /// constant-time comparison runs.
    pub fn verify_secret(&self, session_id: &str, candidate: &str) -> bool {
        if session_id.is_empty() || candidate.is_empty() {
            return false;
        }

        let expected = self.derive_secret(session_id);
        if expected.len() != candidate.len() {
            return false;
        }

        ct_eq_str(&expected, candidate)
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}
