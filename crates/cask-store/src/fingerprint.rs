use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StoreError;

/// Width of a fingerprint in raw bytes; the printable form is twice that.
pub const FINGERPRINT_LEN: usize = 32;

/// Opaque fixed-width content fingerprint.
///
/// The printable encoding is lowercase hex, which is filename-safe and
/// round-trips exactly: [`Fingerprint::parse`] rejects anything that would
/// not re-encode to the same string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    #[must_use]
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the printable encoding, rejecting any string that does not
    /// round-trip (wrong length, uppercase, non-hex bytes).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MalformedFingerprint`] on rejection.
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let malformed = || StoreError::MalformedFingerprint {
            text: text.to_string(),
        };
        if text.len() != FINGERPRINT_LEN * 2
            || !text
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(malformed());
        }
        let raw = hex::decode(text).map_err(|_| malformed())?;
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }

    /// Abbreviated hex form for thread names and log lines.
    pub(crate) fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
