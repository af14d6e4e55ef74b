use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Width of every identifier in the system: a raw SHA-1 digest.
pub const ID_LEN: usize = 20;

// Every object is named by the hash of its canonical byte form, and
// merkle subtree slots carry the hash of the child node's byte form,
// so the whole protocol traffics in exactly one identifier shape.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub [u8; ID_LEN]);

impl Id {
    pub const ZERO: Id = Id([0; ID_LEN]);

    /// Hash arbitrary bytes down to an identifier.
    pub fn of(bytes: &[u8]) -> Id {
        let mut h = Sha1::new();
        h.update(bytes);
        Id(h.finalize().into())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Id> {
        let arr: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Id(arr))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// The 4-bit slot index this id selects at a given trie level:
    /// low nibble of the byte for even levels, high nibble for odd.
    pub fn nibble(&self, level: usize) -> usize {
        debug_assert!(level < ID_LEN * 2);
        let byte = self.0[level / 2];
        ((byte >> (4 * (level & 1))) & 0x0f) as usize
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for Id {
    type Err = hex::FromHexError;
    fn from_str(s: &str) -> std::result::Result<Id, Self::Err> {
        let bytes = hex::decode(s)?;
        Id::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}
