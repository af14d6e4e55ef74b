use crate::payload::{
    cert_id, decode_epoch, encode_epoch, Cert, Epoch, PubKey, Revision, BRANCH_CERT,
};
use crate::traits::{AncestryProvider, EpochStore, ObjectStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tideway_base::{err, Id, ObjectType, Result};
use tracing::debug;

/// The reference store: five maps and a file image. Real hosts bring a
/// real database behind the same traits; this one exists so the
/// executable and the tests have something to sync.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemStore {
    files: BTreeMap<Id, Vec<u8>>,
    revisions: BTreeMap<Id, Vec<u8>>,
    certs: BTreeMap<Id, Vec<u8>>,
    keys: BTreeMap<Id, Vec<u8>>,
    epochs: BTreeMap<String, Epoch>,
    #[serde(skip)]
    index: Index,
}

#[derive(Clone, Debug, Default)]
struct Index {
    parents: BTreeMap<Id, Vec<Id>>,
    children: BTreeMap<Id, Vec<Id>>,
    certs_of: BTreeMap<Id, Vec<Id>>,
    branch_revs: BTreeMap<String, BTreeSet<Id>>,
    epoch_items: BTreeMap<Id, String>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    pub fn load(path: &Path) -> Result<MemStore> {
        let bytes = std::fs::read(path)?;
        let mut store: MemStore = rmp_serde::from_slice(&bytes)?;
        store.rebuild_index()?;
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = rmp_serde::to_vec(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn object_count(&self, ty: ObjectType) -> usize {
        match ty {
            ObjectType::File => self.files.len(),
            ObjectType::Revision => self.revisions.len(),
            ObjectType::Cert => self.certs.len(),
            ObjectType::Key => self.keys.len(),
            ObjectType::Epoch => self.epochs.len(),
        }
    }

    // Authoring conveniences used by the executable and tests.

    pub fn add_file(&mut self, bytes: &[u8]) -> Id {
        let id = Id::of(bytes);
        self.files.insert(id, bytes.to_vec());
        id
    }

    pub fn add_revision(&mut self, rev: &Revision) -> Result<Id> {
        let bytes = rev.encode()?;
        let id = Id::of(&bytes);
        self.index_revision(&id, rev);
        self.revisions.insert(id, bytes);
        Ok(id)
    }

    pub fn add_cert(&mut self, cert: &Cert) -> Result<Id> {
        let bytes = cert.encode()?;
        let id = cert_id(&bytes);
        self.index_cert(&id, cert);
        self.certs.insert(id, bytes);
        Ok(id)
    }

    pub fn add_key(&mut self, key: &PubKey) -> Result<Id> {
        let bytes = key.encode()?;
        let id = key.id();
        self.keys.insert(id, bytes);
        Ok(id)
    }

    pub fn head_of(&self, branch: &str) -> Option<Id> {
        // A head is a branch revision none of whose children are on
        // the branch.
        let revs = self.index.branch_revs.get(branch)?;
        revs.iter()
            .find(|r| {
                self.children(r)
                    .iter()
                    .all(|c| !revs.contains(c))
            })
            .copied()
    }

    fn rebuild_index(&mut self) -> Result<()> {
        self.index = Index::default();
        let revisions = std::mem::take(&mut self.revisions);
        for (id, bytes) in &revisions {
            let rev = Revision::decode(bytes)?;
            self.index_revision(id, &rev);
        }
        self.revisions = revisions;
        let certs = std::mem::take(&mut self.certs);
        for (id, bytes) in &certs {
            let cert = Cert::decode(bytes)?;
            self.index_cert(id, &cert);
        }
        self.certs = certs;
        let epochs = self.epochs.clone();
        for (branch, epoch) in &epochs {
            self.index
                .epoch_items
                .insert(crate::payload::epoch_id(branch, epoch), branch.clone());
        }
        Ok(())
    }

    fn index_revision(&mut self, id: &Id, rev: &Revision) {
        self.index.parents.insert(*id, rev.parents.clone());
        for p in &rev.parents {
            self.index.children.entry(*p).or_default().push(*id);
        }
    }

    fn index_cert(&mut self, id: &Id, cert: &Cert) {
        self.index.certs_of.entry(cert.rev).or_default().push(*id);
        if cert.name == BRANCH_CERT {
            self.index
                .branch_revs
                .entry(cert.value.clone())
                .or_default()
                .insert(cert.rev);
        }
    }
}

impl ObjectStore for MemStore {
    fn exists(&self, ty: ObjectType, id: &Id) -> bool {
        match ty {
            ObjectType::File => self.files.contains_key(id),
            ObjectType::Revision => self.revisions.contains_key(id),
            ObjectType::Cert => self.certs.contains_key(id),
            ObjectType::Key => self.keys.contains_key(id),
            ObjectType::Epoch => self.index.epoch_items.contains_key(id),
        }
    }

    fn get(&self, ty: ObjectType, id: &Id) -> Option<Vec<u8>> {
        match ty {
            ObjectType::File => self.files.get(id).cloned(),
            ObjectType::Revision => self.revisions.get(id).cloned(),
            ObjectType::Cert => self.certs.get(id).cloned(),
            ObjectType::Key => self.keys.get(id).cloned(),
            ObjectType::Epoch => {
                let branch = self.index.epoch_items.get(id)?;
                let epoch = self.epochs.get(branch)?;
                Some(encode_epoch(branch, epoch))
            }
        }
    }

    fn put(&mut self, ty: ObjectType, id: &Id, data: &[u8]) -> Result<()> {
        match ty {
            ObjectType::File => {
                self.files.insert(*id, data.to_vec());
            }
            ObjectType::Revision => {
                let rev = Revision::decode(data)?;
                self.index_revision(id, &rev);
                self.revisions.insert(*id, data.to_vec());
            }
            ObjectType::Cert => {
                let cert = Cert::decode(data)?;
                self.index_cert(id, &cert);
                self.certs.insert(*id, data.to_vec());
            }
            ObjectType::Key => {
                PubKey::decode(data)?;
                self.keys.insert(*id, data.to_vec());
            }
            ObjectType::Epoch => {
                let (branch, epoch) = decode_epoch(data)?;
                self.set_epoch(&branch, epoch)?;
            }
        }
        debug!(target: "tideway", ty = %ty, %id, "stored object");
        Ok(())
    }

    fn get_file_delta(&self, base: &Id, target: &Id) -> Option<Vec<u8>> {
        // The reference delta format is simply the new text.
        if !self.files.contains_key(base) {
            return None;
        }
        self.files.get(target).cloned()
    }

    fn apply_file_delta(&mut self, base: &Id, target: &Id, delta: &[u8]) -> Result<()> {
        if !self.files.contains_key(base) {
            return Err(err(format!("delta base {} not in store", base)));
        }
        if Id::of(delta) != *target {
            return Err(err(format!("delta does not reconstruct {}", target)));
        }
        self.files.insert(*target, delta.to_vec());
        Ok(())
    }
}

impl AncestryProvider for MemStore {
    fn parents(&self, rev: &Id) -> Vec<Id> {
        self.index.parents.get(rev).cloned().unwrap_or_default()
    }

    fn children(&self, rev: &Id) -> Vec<Id> {
        self.index.children.get(rev).cloned().unwrap_or_default()
    }

    fn revisions_in_branches(&self, branches: &BTreeSet<String>) -> BTreeSet<Id> {
        let mut out = BTreeSet::new();
        let mut work: VecDeque<Id> = branches
            .iter()
            .filter_map(|b| self.index.branch_revs.get(b))
            .flatten()
            .copied()
            .collect();
        while let Some(rev) = work.pop_front() {
            if !self.revisions.contains_key(&rev) || !out.insert(rev) {
                continue;
            }
            work.extend(self.parents(&rev));
        }
        out
    }

    fn branches(&self) -> Vec<String> {
        self.index.branch_revs.keys().cloned().collect()
    }

    fn certs_of(&self, rev: &Id) -> Vec<Id> {
        self.index.certs_of.get(rev).cloned().unwrap_or_default()
    }
}

impl EpochStore for MemStore {
    fn epochs(&self) -> BTreeMap<String, Epoch> {
        self.epochs.clone()
    }

    fn epoch_of(&self, branch: &str) -> Option<Epoch> {
        self.epochs.get(branch).copied()
    }

    fn set_epoch(&mut self, branch: &str, epoch: Epoch) -> Result<()> {
        if let Some(old) = self.epochs.get(branch) {
            self.index
                .epoch_items
                .remove(&crate::payload::epoch_id(branch, old));
        }
        self.index
            .epoch_items
            .insert(crate::payload::epoch_id(branch, &epoch), branch.to_string());
        self.epochs.insert(branch.to_string(), epoch);
        Ok(())
    }
}

/// A `MemStore` shareable between concurrent sessions; each trait call
/// takes the lock for its own duration, which is all the write-grouping
/// the reference store does.
#[derive(Clone, Debug)]
pub struct SharedStore(Arc<Mutex<MemStore>>);

impl SharedStore {
    pub fn new(store: MemStore) -> SharedStore {
        SharedStore(Arc::new(Mutex::new(store)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MemStore) -> R) -> R {
        let mut guard = self.0.lock().expect("store lock poisoned");
        f(&mut guard)
    }
}

impl ObjectStore for SharedStore {
    fn exists(&self, ty: ObjectType, id: &Id) -> bool {
        self.with(|s| s.exists(ty, id))
    }
    fn get(&self, ty: ObjectType, id: &Id) -> Option<Vec<u8>> {
        self.with(|s| s.get(ty, id))
    }
    fn put(&mut self, ty: ObjectType, id: &Id, data: &[u8]) -> Result<()> {
        self.with(|s| s.put(ty, id, data))
    }
    fn get_file_delta(&self, base: &Id, target: &Id) -> Option<Vec<u8>> {
        self.with(|s| s.get_file_delta(base, target))
    }
    fn apply_file_delta(&mut self, base: &Id, target: &Id, delta: &[u8]) -> Result<()> {
        self.with(|s| s.apply_file_delta(base, target, delta))
    }
}

impl AncestryProvider for SharedStore {
    fn parents(&self, rev: &Id) -> Vec<Id> {
        self.with(|s| s.parents(rev))
    }
    fn children(&self, rev: &Id) -> Vec<Id> {
        self.with(|s| s.children(rev))
    }
    fn revisions_in_branches(&self, branches: &BTreeSet<String>) -> BTreeSet<Id> {
        self.with(|s| s.revisions_in_branches(branches))
    }
    fn branches(&self) -> Vec<String> {
        self.with(|s| s.branches())
    }
    fn certs_of(&self, rev: &Id) -> Vec<Id> {
        self.with(|s| s.certs_of(rev))
    }
}

impl EpochStore for SharedStore {
    fn epochs(&self) -> BTreeMap<String, Epoch> {
        self.with(|s| s.epochs())
    }
    fn epoch_of(&self, branch: &str) -> Option<Epoch> {
        self.with(|s| s.epoch_of(branch))
    }
    fn set_epoch(&mut self, branch: &str, epoch: Epoch) -> Result<()> {
        self.with(|s| s.set_epoch(branch, epoch))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::payload::{random_epoch, FileEntry};
    use test_log::test;

    fn store_with_chain(branch: &str, texts: &[&[u8]]) -> (MemStore, Vec<Id>) {
        let mut s = MemStore::new();
        let mut revs = Vec::new();
        let mut parent: Option<Id> = None;
        let mut base: Option<Id> = None;
        for text in texts {
            let f = s.add_file(text);
            let rev = Revision {
                parents: parent.into_iter().collect(),
                files: vec![FileEntry { file: f, base }],
            };
            let rid = s.add_revision(&rev).unwrap();
            s.add_cert(&Cert {
                rev: rid,
                name: BRANCH_CERT.into(),
                value: branch.into(),
                key_id: Id::of(b"k"),
                sig: vec![],
            })
            .unwrap();
            parent = Some(rid);
            base = Some(f);
            revs.push(rid);
        }
        (s, revs)
    }

    #[test]
    fn test_branch_closure_and_heads() {
        let (s, revs) = store_with_chain("main", &[b"one", b"two", b"three"]);
        let set = s.revisions_in_branches(&BTreeSet::from(["main".to_string()]));
        assert_eq!(set, revs.iter().copied().collect());
        assert_eq!(s.head_of("main"), Some(revs[2]));
        assert_eq!(s.parents(&revs[1]), vec![revs[0]]);
        assert_eq!(s.children(&revs[0]), vec![revs[1]]);
        assert!(s.revisions_in_branches(&BTreeSet::from(["other".to_string()])).is_empty());
    }

    #[test]
    fn test_object_round_trips() {
        let (mut s, revs) = store_with_chain("main", &[b"text"]);
        let rev_bytes = s.get(ObjectType::Revision, &revs[0]).unwrap();
        assert_eq!(Id::of(&rev_bytes), revs[0]);

        let e = random_epoch();
        s.set_epoch("main", e).unwrap();
        let eid = crate::payload::epoch_id("main", &e);
        assert!(s.exists(ObjectType::Epoch, &eid));
        let (branch, back) = decode_epoch(&s.get(ObjectType::Epoch, &eid).unwrap()).unwrap();
        assert_eq!((branch.as_str(), back), ("main", e));

        // Replacing the epoch retires the old item id.
        let e2 = random_epoch();
        s.set_epoch("main", e2).unwrap();
        assert!(!s.exists(ObjectType::Epoch, &eid));
    }

    #[test]
    fn test_whole_text_delta() {
        let (mut s, _) = store_with_chain("main", &[b"old"]);
        let base = Id::of(b"old");
        let target = Id::of(b"new contents");
        assert!(s.get_file_delta(&base, &target).is_none());
        s.apply_file_delta(&base, &target, b"new contents").unwrap();
        assert!(s.exists(ObjectType::File, &target));
        assert!(s.apply_file_delta(&base, &target, b"wrong").is_err());
    }

    #[test]
    fn test_persistence() {
        let (s, revs) = store_with_chain("main", &[b"a", b"b"]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.tw");
        s.save(&path).unwrap();
        let back = MemStore::load(&path).unwrap();
        assert_eq!(back.object_count(ObjectType::Revision), 2);
        assert_eq!(back.head_of("main"), Some(revs[1]));
    }
}
