// Canonical byte forms for the objects the protocol carries, and how
// each object's id is derived. The wire treats all of these as opaque
// payload bytes; both ends just have to derive the same ids.

use serde::{Deserialize, Serialize};
use tideway_base::{Id, Result};
use tideway_wire::{
    extract_bytes, extract_utf8_prefixed, require_end, write_len_prefixed, DecodeResult,
};

pub const EPOCH_LEN: usize = 20;
pub type Epoch = [u8; EPOCH_LEN];
pub const EPOCH_ZERO: Epoch = [0; EPOCH_LEN];

/// Branch membership is asserted by a cert with this name whose value
/// is the branch name.
pub const BRANCH_CERT: &str = "branch";

/// A revision: its parents and the file versions it names. `base` is
/// the file's version in the revision this entry descends from, when
/// there is one; it is what delta transmission builds on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub parents: Vec<Id>,
    pub files: Vec<FileEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file: Id,
    pub base: Option<Id>,
}

impl Revision {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Revision> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn id(&self) -> Result<Id> {
        Ok(Id::of(&self.encode()?))
    }
}

/// A statement about a revision, signed by a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cert {
    pub rev: Id,
    pub name: String,
    pub value: String,
    pub key_id: Id,
    pub sig: Vec<u8>,
}

impl Cert {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Cert> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

pub fn cert_id(encoded: &[u8]) -> Id {
    Id::of(encoded)
}

/// A named public key as it travels on the wire and sits in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKey {
    pub name: String,
    pub key: Vec<u8>,
}

impl PubKey {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<PubKey> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn id(&self) -> Id {
        key_id(&self.name, &self.key)
    }
}

/// A key's item id covers its name and its material, so renaming a key
/// or rotating it makes a different object.
pub fn key_id(name: &str, key: &[u8]) -> Id {
    let mut buf = Vec::with_capacity(name.len() + 1 + key.len());
    buf.extend_from_slice(name.as_bytes());
    buf.push(b':');
    buf.extend_from_slice(key);
    Id::of(&buf)
}

/// An epoch's item id covers the branch name and the epoch value.
pub fn epoch_id(branch: &str, epoch: &Epoch) -> Id {
    let mut buf = Vec::new();
    buf.extend_from_slice(branch.as_bytes());
    buf.push(b':');
    buf.extend_from_slice(hex::encode(epoch).as_bytes());
    Id::of(&buf)
}

/// Epoch wire payload: length-prefixed branch name, then the raw epoch
/// bytes.
pub fn encode_epoch(branch: &str, epoch: &Epoch) -> Vec<u8> {
    let mut out = Vec::new();
    write_len_prefixed(&mut out, branch.as_bytes());
    out.extend_from_slice(epoch);
    out
}

pub fn decode_epoch(bytes: &[u8]) -> DecodeResult<(String, Epoch)> {
    let mut pos = 0;
    let branch = extract_utf8_prefixed(bytes, &mut pos, 1 << 12, "epoch branch name")?;
    let raw = extract_bytes(bytes, &mut pos, EPOCH_LEN, "epoch data")?;
    require_end(bytes, pos, "epoch")?;
    let epoch: Epoch = raw.try_into().expect("fixed-width epoch");
    Ok((branch, epoch))
}

pub fn random_epoch() -> Epoch {
    let mut e = EPOCH_ZERO;
    rand::Rng::fill(&mut rand::thread_rng(), &mut e[..]);
    e
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_revision_round_trip() {
        let rev = Revision {
            parents: vec![Id::of(b"p1"), Id::of(b"p2")],
            files: vec![
                FileEntry {
                    file: Id::of(b"f1"),
                    base: None,
                },
                FileEntry {
                    file: Id::of(b"f2"),
                    base: Some(Id::of(b"f0")),
                },
            ],
        };
        let bytes = rev.encode().unwrap();
        assert_eq!(Revision::decode(&bytes).unwrap(), rev);
        assert_eq!(Id::of(&bytes), rev.id().unwrap());
    }

    #[test]
    fn test_epoch_round_trip() {
        let e = random_epoch();
        let bytes = encode_epoch("branch.main", &e);
        let (branch, back) = decode_epoch(&bytes).unwrap();
        assert_eq!(branch, "branch.main");
        assert_eq!(back, e);
    }

    #[test]
    fn test_epoch_id_depends_on_both_parts() {
        let e1 = random_epoch();
        let e2 = random_epoch();
        assert_ne!(epoch_id("a", &e1), epoch_id("a", &e2));
        assert_ne!(epoch_id("a", &e1), epoch_id("b", &e1));
    }

    #[test]
    fn test_truncated_epoch_rejected() {
        let e = random_epoch();
        let bytes = encode_epoch("b", &e);
        assert!(decode_epoch(&bytes[..bytes.len() - 1]).is_err());
    }
}
