use std::fmt;

use sha2::{Digest, Sha256};

use crate::event::{EventEnvelope, EventError};

/// Lowercase hex SHA-256 of an event's canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const HEX_LEN: usize = 64;

    pub fn of(canonical: &[u8]) -> Self {
        let digest = Sha256::digest(canonical);
        Self(format!("{digest:x}"))
    }

    /// Canonicalize and hash an envelope.
    pub fn of_envelope(envelope: &EventEnvelope) -> Result<Self, EventError> {
        Ok(Self::of(&envelope.canonical_bytes()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
