use crate::payload::{Epoch, PubKey};
use std::collections::{BTreeMap, BTreeSet};
use tideway_base::{Id, ObjectType, Result};

/// Content-addressed object access. `get` returning `None` is not an
/// error at this layer; the protocol answers a request for a missing
/// object with `nonexistent` and carries on.
pub trait ObjectStore {
    fn exists(&self, ty: ObjectType, id: &Id) -> bool;
    fn get(&self, ty: ObjectType, id: &Id) -> Option<Vec<u8>>;
    fn put(&mut self, ty: ObjectType, id: &Id, data: &[u8]) -> Result<()>;

    /// A delta carrying `base` forward to `target`, in whatever format
    /// the host's file storage uses; both ends of a sync must agree on
    /// it. `None` if either version is missing.
    fn get_file_delta(&self, base: &Id, target: &Id) -> Option<Vec<u8>>;
    fn apply_file_delta(&mut self, base: &Id, target: &Id, delta: &[u8]) -> Result<()>;
}

/// The shape of the revision graph, plus the branch metadata hung off
/// it via certs.
pub trait AncestryProvider {
    fn parents(&self, rev: &Id) -> Vec<Id>;
    fn children(&self, rev: &Id) -> Vec<Id>;
    /// All revisions carrying a branch cert for any of `branches`,
    /// closed under ancestry.
    fn revisions_in_branches(&self, branches: &BTreeSet<String>) -> BTreeSet<Id>;
    fn branches(&self) -> Vec<String>;
    fn certs_of(&self, rev: &Id) -> Vec<Id>;
}

/// The per-branch epoch table. Two peers must agree on a branch's
/// epoch before exchanging anything in it.
pub trait EpochStore {
    fn epochs(&self) -> BTreeMap<String, Epoch>;
    fn epoch_of(&self, branch: &str) -> Option<Epoch>;
    fn set_epoch(&mut self, branch: &str, epoch: Epoch) -> Result<()>;
}

/// Everything a session needs from the host's database.
pub trait Database: ObjectStore + AncestryProvider + EpochStore {}
impl<T: ObjectStore + AncestryProvider + EpochStore> Database for T {}

/// Public-key operations, all opaque to the protocol: it never looks
/// inside keys, signatures or sealed session keys.
pub trait KeyStore {
    /// The local signing identity, if one is configured. A client
    /// without one can only connect anonymously; a server cannot
    /// operate without one.
    fn local_name(&self) -> Option<&str>;
    fn local_pub(&self) -> Option<PubKey>;
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>>;
    fn verify(&self, pubkey: &[u8], msg: &[u8], sig: &[u8]) -> bool;
    fn encrypt_session_key(&self, server_pub: &[u8], key: &[u8; 20]) -> Result<Vec<u8>>;
    fn decrypt_session_key(&self, blob: &[u8]) -> Result<Vec<u8>>;
}

/// Access-control and trust decisions the host gets to make.
pub trait PolicyHooks {
    fn read_allowed(&self, branch: &str, client: Option<&Id>) -> bool;
    fn write_allowed(&self, branch: &str, client: &Id) -> bool;
    fn known_server_key(&self, peer: &str) -> Option<Id>;
    fn remember_server_key(&mut self, peer: &str, fingerprint: &Id) -> Result<()>;
}
