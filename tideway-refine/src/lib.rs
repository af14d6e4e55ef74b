// The two engines that decide what a session transmits: the refiner,
// which reconciles one merkle trie against a peer's to find the set
// difference, and the revision enumerator, which turns the refined
// revision set into an ordered stream of file, revision and cert
// transmissions.
//
// Both are sans-io. They push the traffic they want sent into internal
// queues and the session drains those queues into wire frames, so the
// whole reconciliation logic can be exercised without a socket in
// sight.

mod enumerator;
mod refiner;

pub use enumerator::{EnumItem, RevEnumerator};
pub use refiner::{Refiner, RefinerMsg};
