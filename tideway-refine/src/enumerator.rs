use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tideway_base::{err, Id, ObjectType, Result};
use tideway_store::{AncestryProvider, ObjectStore, Revision};
use tracing::debug;

/// One transmission the enumerator wants made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnumItem {
    FileData(Id),
    FileDelta { base: Id, target: Id },
    RevData(Id),
    CertData(Id),
}

/// Walks the agreed revision set in ancestor-first order once the
/// revision and cert refinements have settled, producing the stream of
/// file, revision and cert transmissions the peer is owed.
///
/// Every revision in the set is visited, not just the ones being sent:
/// a cert can be new to the peer even when its revision is not. File
/// versions ride with the revisions being sent, as deltas whenever the
/// base version is already on the peer's side of the fence.
pub struct RevEnumerator {
    queue: VecDeque<Id>,
    revs_to_send: BTreeSet<Id>,
    certs_to_send: BTreeSet<Id>,
    /// Files the peer is assumed to hold: versions named by revisions
    /// it already has, plus everything sent earlier in this session.
    files_known: BTreeSet<Id>,
}

impl RevEnumerator {
    pub fn new<D: ObjectStore + AncestryProvider>(
        db: &D,
        sync_revs: &BTreeSet<Id>,
        revs_to_send: BTreeSet<Id>,
        certs_to_send: BTreeSet<Id>,
    ) -> Result<RevEnumerator> {
        // Ancestor-first order over the agreed set, ignoring parents
        // outside it.
        let mut indegree: BTreeMap<Id, usize> = BTreeMap::new();
        let mut kids: BTreeMap<Id, Vec<Id>> = BTreeMap::new();
        for rev in sync_revs {
            let in_set: Vec<Id> = db
                .parents(rev)
                .into_iter()
                .filter(|p| sync_revs.contains(p))
                .collect();
            indegree.insert(*rev, in_set.len());
            for p in in_set {
                kids.entry(p).or_default().push(*rev);
            }
        }
        let mut ready: BTreeSet<Id> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(r, _)| *r)
            .collect();
        let mut queue = VecDeque::new();
        while let Some(rev) = ready.iter().next().copied() {
            ready.remove(&rev);
            queue.push_back(rev);
            for kid in kids.get(&rev).cloned().unwrap_or_default() {
                let d = indegree.get_mut(&kid).expect("kid is in the agreed set");
                *d -= 1;
                if *d == 0 {
                    ready.insert(kid);
                }
            }
        }
        if queue.len() != sync_revs.len() {
            return Err(err("revision ancestry contains a cycle"));
        }

        // The peer already holds the file versions of every revision
        // we are not sending.
        let mut files_known = BTreeSet::new();
        for rev in sync_revs.difference(&revs_to_send) {
            if let Some(bytes) = db.get(ObjectType::Revision, rev) {
                let r = Revision::decode(&bytes)?;
                files_known.extend(r.files.iter().map(|f| f.file));
            }
        }

        debug!(target: "tideway", revs = queue.len(), sending = revs_to_send.len(),
               certs = certs_to_send.len(), "enumerator ready");
        Ok(RevEnumerator {
            queue,
            revs_to_send,
            certs_to_send,
            files_known,
        })
    }

    pub fn finished(&self) -> bool {
        self.queue.is_empty()
    }

    /// Emit the transmissions for one revision. Bounded work per call,
    /// so the session can stop stepping while its output queue is
    /// backed up.
    pub fn step<D: ObjectStore + AncestryProvider>(
        &mut self,
        db: &D,
        out: &mut Vec<EnumItem>,
    ) -> Result<()> {
        let Some(rev) = self.queue.pop_front() else {
            return Ok(());
        };

        if self.revs_to_send.contains(&rev) {
            let bytes = db
                .get(ObjectType::Revision, &rev)
                .ok_or_else(|| err(format!("revision {} vanished from the store", rev)))?;
            let r = Revision::decode(&bytes)?;
            for entry in &r.files {
                if self.files_known.contains(&entry.file) {
                    continue;
                }
                match entry.base {
                    Some(base) if base != entry.file && self.files_known.contains(&base) => {
                        out.push(EnumItem::FileDelta {
                            base,
                            target: entry.file,
                        });
                    }
                    _ => out.push(EnumItem::FileData(entry.file)),
                }
                self.files_known.insert(entry.file);
            }
            out.push(EnumItem::RevData(rev));
        }

        for cert in db.certs_of(&rev) {
            if self.certs_to_send.contains(&cert) {
                out.push(EnumItem::CertData(cert));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;
    use tideway_store::{Cert, FileEntry, MemStore, BRANCH_CERT};

    fn chain(store: &mut MemStore, branch: &str, texts: &[&[u8]]) -> (Vec<Id>, Vec<Id>, Vec<Id>) {
        let mut revs = Vec::new();
        let mut certs = Vec::new();
        let mut files = Vec::new();
        let mut parent = None;
        let mut base = None;
        for text in texts {
            let f = store.add_file(text);
            let rid = store
                .add_revision(&Revision {
                    parents: parent.into_iter().collect(),
                    files: vec![FileEntry { file: f, base }],
                })
                .unwrap();
            let cid = store
                .add_cert(&Cert {
                    rev: rid,
                    name: BRANCH_CERT.into(),
                    value: branch.into(),
                    key_id: Id::of(b"k"),
                    sig: vec![],
                })
                .unwrap();
            revs.push(rid);
            certs.push(cid);
            files.push(f);
            parent = Some(rid);
            base = Some(f);
        }
        (revs, certs, files)
    }

    fn drain(e: &mut RevEnumerator, db: &MemStore) -> Vec<EnumItem> {
        let mut out = Vec::new();
        while !e.finished() {
            e.step(db, &mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_full_transfer_sends_everything_ancestors_first() {
        let mut store = MemStore::new();
        let (revs, certs, files) = chain(&mut store, "main", &[b"one", b"two"]);
        let sync: BTreeSet<Id> = revs.iter().copied().collect();
        let mut e = RevEnumerator::new(
            &store,
            &sync,
            sync.clone(),
            certs.iter().copied().collect(),
        )
        .unwrap();
        let out = drain(&mut e, &store);
        assert_eq!(
            out,
            vec![
                EnumItem::FileData(files[0]),
                EnumItem::RevData(revs[0]),
                EnumItem::CertData(certs[0]),
                // The second file's base was sent above, so it can go
                // as a delta.
                EnumItem::FileDelta {
                    base: files[0],
                    target: files[1]
                },
                EnumItem::RevData(revs[1]),
                EnumItem::CertData(certs[1]),
            ]
        );
    }

    #[test]
    fn test_partial_transfer_uses_deltas_against_peer_files() {
        let mut store = MemStore::new();
        let (revs, certs, files) = chain(&mut store, "main", &[b"one", b"two", b"three"]);
        let sync: BTreeSet<Id> = revs.iter().copied().collect();
        // Peer already has the first revision.
        let to_send: BTreeSet<Id> = revs[1..].iter().copied().collect();
        let cert_send: BTreeSet<Id> = certs[1..].iter().copied().collect();
        let mut e = RevEnumerator::new(&store, &sync, to_send, cert_send).unwrap();
        let out = drain(&mut e, &store);
        assert_eq!(
            out,
            vec![
                EnumItem::FileDelta {
                    base: files[0],
                    target: files[1]
                },
                EnumItem::RevData(revs[1]),
                EnumItem::CertData(certs[1]),
                EnumItem::FileDelta {
                    base: files[1],
                    target: files[2]
                },
                EnumItem::RevData(revs[2]),
                EnumItem::CertData(certs[2]),
            ]
        );
    }

    #[test]
    fn test_cert_only_transfer_visits_shared_revisions() {
        let mut store = MemStore::new();
        let (revs, _certs, _) = chain(&mut store, "main", &[b"one"]);
        // A second cert on a revision the peer already has.
        let extra = store
            .add_cert(&Cert {
                rev: revs[0],
                name: "tag".into(),
                value: "v1".into(),
                key_id: Id::of(b"k"),
                sig: vec![],
            })
            .unwrap();
        let sync: BTreeSet<Id> = revs.iter().copied().collect();
        let mut e =
            RevEnumerator::new(&store, &sync, BTreeSet::new(), BTreeSet::from([extra])).unwrap();
        let out = drain(&mut e, &store);
        assert_eq!(out, vec![EnumItem::CertData(extra)]);
    }

    #[test]
    fn test_merge_ordering() {
        // A merge: both parents must precede the child.
        let mut store = MemStore::new();
        let f1 = store.add_file(b"left");
        let f2 = store.add_file(b"right");
        let left = store
            .add_revision(&Revision {
                parents: vec![],
                files: vec![FileEntry { file: f1, base: None }],
            })
            .unwrap();
        let right = store
            .add_revision(&Revision {
                parents: vec![],
                files: vec![FileEntry { file: f2, base: None }],
            })
            .unwrap();
        let f3 = store.add_file(b"merged");
        let merge = store
            .add_revision(&Revision {
                parents: vec![left, right],
                files: vec![FileEntry {
                    file: f3,
                    base: Some(f1),
                }],
            })
            .unwrap();
        let sync = BTreeSet::from([left, right, merge]);
        let mut e = RevEnumerator::new(&store, &sync, sync.clone(), BTreeSet::new()).unwrap();
        let out = drain(&mut e, &store);
        let pos = |item: &EnumItem| out.iter().position(|x| x == item).unwrap();
        assert!(pos(&EnumItem::RevData(left)) < pos(&EnumItem::RevData(merge)));
        assert!(pos(&EnumItem::RevData(right)) < pos(&EnumItem::RevData(merge)));
    }
}
