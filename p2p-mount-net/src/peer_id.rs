//! Peer identity on the overlay.
//!
//! A peer is identified by its Ed25519 public key. The textual form is ID52:
//! the 32 key bytes encoded with `BASE32_DNSSEC`, which yields exactly 52
//! lowercase characters that are safe in DNS labels and URLs.

/// Secret key of a peer. The matching [`PeerId`] is derived from its
/// verifying key.
pub use ed25519_dalek::SigningKey as SecretKey;

/// Length of the ID52 textual form.
pub const ID52_LEN: usize = 52;

/// Identity of a peer on the overlay network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

/// Errors when parsing a peer id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParsePeerIdError {
    #[error("expected {ID52_LEN} characters, got {0}")]
    InvalidLength(usize),

    #[error("not valid ID52 encoding")]
    InvalidEncoding,

    #[error("not a valid ed25519 public key")]
    InvalidKey,
}

impl PeerId {
    /// Build a peer id from raw public key bytes, rejecting bytes that are
    /// not a valid Ed25519 point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, ParsePeerIdError> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| ParsePeerIdError::InvalidKey)?;
        Ok(Self(*bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The ID52 textual form.
    pub fn id52(&self) -> String {
        data_encoding::BASE32_DNSSEC.encode(&self.0)
    }
}

impl From<&SecretKey> for PeerId {
    fn from(secret: &SecretKey) -> Self {
        Self(secret.verifying_key().to_bytes())
    }
}

impl From<ed25519_dalek::VerifyingKey> for PeerId {
    fn from(key: ed25519_dalek::VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

/// Generate a fresh secret key from the operating system's RNG.
pub fn generate_secret_key() -> SecretKey {
    SecretKey::generate(&mut rand::rngs::OsRng)
}

impl std::str::FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID52_LEN {
            return Err(ParsePeerIdError::InvalidLength(s.len()));
        }
        let decoded = data_encoding::BASE32_DNSSEC
            .decode(s.as_bytes())
            .map_err(|_| ParsePeerIdError::InvalidEncoding)?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| ParsePeerIdError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id52())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.id52())
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.id52())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
