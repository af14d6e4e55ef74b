// The seams between the sync engine and its host. The engine sees an
// opaque object store keyed by 20-byte hashes, an ancestry oracle over
// revisions, a keystore for public-key operations, and a policy object
// for access decisions. Everything else about how a host models
// revisions, certs and keys stays on the host's side of these traits.
//
// Reference implementations live here too: an in-memory store with a
// whole-image file persistence, an ed25519 keystore, and a
// pattern-list policy. They are what the executable and the tests run
// on; a real host would bring its own.

mod keys;
mod mem;
mod payload;
mod policy;
mod traits;

pub use keys::SealedKeys;
pub use mem::{MemStore, SharedStore};
pub use payload::{
    cert_id, decode_epoch, encode_epoch, epoch_id, key_id, Cert, Epoch, FileEntry, PubKey,
    Revision, BRANCH_CERT, EPOCH_LEN, EPOCH_ZERO,
};
pub use policy::StandardPolicy;
pub use traits::{AncestryProvider, Database, EpochStore, KeyStore, ObjectStore, PolicyHooks};
