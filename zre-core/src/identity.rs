//! Node identity: 16 random bytes for the process lifetime, plus the
//! short-hex default display name derived from them.

use std::fmt;

/// Node UUID: 16 raw bytes. Used as the routing identity on peer links
/// and as the key of the peer table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeUuid([u8; 16]);

impl NodeUuid {
    /// Generate a fresh random identity (UUID v4).
    pub fn random() -> Self {
        NodeUuid(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeUuid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First 6 hex characters; the default node name.
    pub fn short_hex(&self) -> String {
        let mut s = String::with_capacity(6);
        for b in &self.0[..3] {
            s.push_str(&format!("{:02X}", b));
        }
        s
    }
}

impl fmt::Display for NodeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeUuid({})", self)
    }
}
