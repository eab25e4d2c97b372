//! Node identity on the bus.
//!
//! `PeerId` is the human-assigned name of a node (e.g. `NODE_NAME=nodeA`).
//! `InstanceId` is a random tag generated once per process start, so two
//! processes that were misconfigured with the same name can be told apart.

use std::borrow::Borrow;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Longest accepted node name, in bytes.
pub const MAX_PEER_ID_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Peer ID must not be empty")]
    Empty,
    #[error("Peer ID is {0} bytes, maximum is {MAX_PEER_ID_LEN}")]
    TooLong(usize),
    #[error("Peer ID contains whitespace or control character {0:?}")]
    InvalidChar(char),
}

/// Identity of a node on the bus.
///
/// Immutable for the lifetime of the process. Cloning is cheap (shared
/// string), so recipient lists and membership keys can hold copies freely.
///
/// # Examples
/// ```
/// use sensor_bus::PeerId;
///
/// let id: PeerId = "nodeA".parse().unwrap();
/// assert_eq!(id.as_str(), "nodeA");
/// assert!("".parse::<PeerId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Arc<str>);

impl PeerId {
    /// Validate and wrap a node name.
    pub fn new(name: impl AsRef<str>) -> Result<Self, PeerIdError> {
        let name = name.as_ref();
        validate(name)?;
        Ok(Self(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(name: &str) -> Result<(), PeerIdError> {
    if name.is_empty() {
        return Err(PeerIdError::Empty);
    }
    if name.len() > MAX_PEER_ID_LEN {
        return Err(PeerIdError::TooLong(name.len()));
    }
    if let Some(c) = name.chars().find(|c| c.is_whitespace() || c.is_control()) {
        return Err(PeerIdError::InvalidChar(c));
    }
    Ok(())
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PeerId {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for PeerId {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

// Serialize as a plain string, validating on the way back in
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Random tag for one process lifetime of a node.
///
/// Displays as a 16-character hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Generate a new random instance ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for InstanceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: PeerId = "sensor-7".parse().unwrap();
        assert_eq!(id.to_string(), "sensor-7");
        assert_eq!(id, "sensor-7");
    }

    #[test]
    fn test_reject_empty() {
        assert_eq!(PeerId::new(""), Err(PeerIdError::Empty));
    }

    #[test]
    fn test_reject_too_long() {
        let name = "x".repeat(MAX_PEER_ID_LEN + 1);
        assert_eq!(
            PeerId::new(&name),
            Err(PeerIdError::TooLong(MAX_PEER_ID_LEN + 1))
        );
        assert!(PeerId::new("x".repeat(MAX_PEER_ID_LEN)).is_ok());
    }

    #[test]
    fn test_reject_whitespace_and_control() {
        assert_eq!(PeerId::new("node A"), Err(PeerIdError::InvalidChar(' ')));
        assert_eq!(PeerId::new("node\n"), Err(PeerIdError::InvalidChar('\n')));
    }

    #[test]
    fn test_ordering_follows_name() {
        let a: PeerId = "a".parse().unwrap();
        let b: PeerId = "b".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_serde_as_plain_string() {
        let id: PeerId = "nodeA".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"nodeA\"");
        let parsed: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_serde_rejects_invalid() {
        assert!(serde_json::from_str::<PeerId>("\"\"").is_err());
        assert!(serde_json::from_str::<PeerId>("\"has space\"").is_err());
    }

    #[test]
    fn test_instance_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(InstanceId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_instance_display_zero_padded() {
        assert_eq!(InstanceId::from(0xff).to_string(), "00000000000000ff");
    }
}
