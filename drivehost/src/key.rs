//! Archive keys and the discovery keys derived from them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Context mixed into the discovery key derivation.
const DISCOVERY_CONTEXT: &[u8] = b"hypercore";

/// Length of a key in bytes.
pub const KEY_LEN: usize = 32;

/// Error when parsing an [`ArchiveKey`] or [`DiscoveryKey`] from a string.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum KeyParseError {
    /// The string did not have exactly 64 characters.
    #[error("invalid key length {0}, expected 64 hex characters")]
    Length(usize),
    /// The string was not valid hex.
    #[error("invalid hex in key: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Stable content identifier of an archive.
///
/// Displayed and parsed as 64 lowercase hex characters.
#[derive(PartialEq, Eq, Copy, Clone, Hash, PartialOrd, Ord)]
pub struct ArchiveKey([u8; KEY_LEN]);

impl ArchiveKey {
    /// Create a key from its raw bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Bytes of the key.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex encoding of the key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The key under which this archive is announced and looked up in the swarm.
    ///
    /// Peers that do not know the archive key cannot learn it from the discovery key.
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey(*blake3::keyed_hash(&self.0, DISCOVERY_CONTEXT).as_bytes())
    }

    /// Short form of the key, for logging.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

/// Topic identifier of an archive in the swarm.
#[derive(PartialEq, Eq, Copy, Clone, Hash, PartialOrd, Ord)]
pub struct DiscoveryKey([u8; KEY_LEN]);

impl DiscoveryKey {
    /// Create a discovery key from its raw bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Bytes of the discovery key.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short form of the key, for logging.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

macro_rules! impl_key_fmt {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.fmt_short())
            }
        }

        impl FromStr for $ty {
            type Err = KeyParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != KEY_LEN * 2 {
                    return Err(KeyParseError::Length(s.len()));
                }
                let mut bytes = [0u8; KEY_LEN];
                hex::decode_to_slice(s, &mut bytes)?;
                Ok(Self(bytes))
            }
        }

        impl From<[u8; KEY_LEN]> for $ty {
            fn from(value: [u8; KEY_LEN]) -> Self {
                Self(value)
            }
        }

        impl AsRef<[u8]> for $ty {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_key_fmt!(ArchiveKey);
impl_key_fmt!(DiscoveryKey);
