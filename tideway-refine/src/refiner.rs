use std::collections::{BTreeSet, VecDeque};
use tideway_base::{err, Id, ObjectType, RefineKind, Result, Voice};
use tideway_merkle::{MerkleNode, MerkleTable, Prefix, SlotState, NUM_SLOTS};
use tracing::{debug, trace};

// Our goal is to learn the complete set of items to send. To do this
// we exchange two kinds of refinement traffic: queries and responses.
//
//  - On receiving a query for a node (p,l): compare it to our node at
//    (p,l) (synthesizing an empty one if we have none), noting every
//    leaf the peer shows us; descend with subqueries where our
//    subtrees differ from theirs; and always answer with a response
//    carrying our node.
//
//  - On receiving a response: do the same comparison, but never spawn
//    subqueries from it, and decrement the query-in-flight counter.
//
// The client kicks things off with a query for the root. When the
// client's counter drops to zero it sends done with the number of
// items it will transmit; the server echoes done with its own count.
// Only queries may provoke queries, which is what keeps the counter's
// zero crossing meaningful; the synthetic subquery below exists purely
// to preserve that bracketing in the one asymmetric case.

/// Traffic a refiner wants sent, drained by the session after each
/// call into the refiner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefinerMsg {
    Refine { kind: RefineKind, node: MerkleNode },
    Done { ty: ObjectType, n_items: u64 },
}

/// One instance reconciles one object type for one session.
pub struct Refiner {
    ty: ObjectType,
    voice: Voice,
    table: MerkleTable,
    local_items: BTreeSet<Id>,
    peer_items: BTreeSet<Id>,
    queries_in_flight: usize,
    sent_initial_query: bool,
    calculated_items_to_send: bool,
    outgoing: VecDeque<RefinerMsg>,

    // Populated as the done frames arrive.
    pub done: bool,
    pub items_to_send: BTreeSet<Id>,
    pub items_to_receive: u64,
}

impl Refiner {
    pub fn new(ty: ObjectType, voice: Voice) -> Refiner {
        Refiner {
            ty,
            voice,
            table: MerkleTable::new(ty),
            local_items: BTreeSet::new(),
            peer_items: BTreeSet::new(),
            queries_in_flight: 0,
            sent_initial_query: false,
            calculated_items_to_send: false,
            outgoing: VecDeque::new(),
            done: false,
            items_to_send: BTreeSet::new(),
            items_to_receive: 0,
        }
    }

    pub fn ty(&self) -> ObjectType {
        self.ty
    }

    pub fn local_items(&self) -> &BTreeSet<Id> {
        &self.local_items
    }

    pub fn peer_items(&self) -> &BTreeSet<Id> {
        &self.peer_items
    }

    pub fn pop_outgoing(&mut self) -> Option<RefinerMsg> {
        self.outgoing.pop_front()
    }

    pub fn note_local_item(&mut self, item: Id) {
        self.local_items.insert(item);
        self.table.insert(item, true);
    }

    /// Must run after the last `note_local_item` and before
    /// refinement; the trie is not usable until its codes are fresh.
    pub fn reindex_local_items(&mut self) {
        let code = self.table.recompute_codes();
        debug!(target: "tideway", ty = %self.ty, items = self.local_items.len(),
               root = %code, "indexed local items");
    }

    pub fn begin_refinement(&mut self) {
        let root = self.table.root().clone();
        self.outgoing.push_back(RefinerMsg::Refine {
            kind: RefineKind::Query,
            node: root,
        });
        self.queries_in_flight += 1;
        self.sent_initial_query = true;
        debug!(target: "tideway", ty = %self.ty, voice = ?self.voice, "beginning refinement");
    }

    pub fn process_done_command(&mut self, n_items: u64) {
        self.calculate_items_to_send();
        self.items_to_receive = n_items;

        debug!(target: "tideway", ty = %self.ty, voice = ?self.voice,
               to_send = self.items_to_send.len(), to_receive = self.items_to_receive,
               "finished refinement");

        if self.voice == Voice::Server {
            self.queue_done();
        }
        self.done = true;

        // The trie's memory can go now.
        self.table.clear();
    }

    pub fn process_refinement_command(
        &mut self,
        kind: RefineKind,
        their_node: &MerkleNode,
    ) -> Result<()> {
        let our_node = match self.table.node(their_node.level, &their_node.prefix) {
            Some(n) => n.clone(),
            // Synthesize an empty node if we don't have one.
            None => MerkleNode::new(self.ty, their_node.level, their_node.prefix.clone()),
        };
        trace!(target: "tideway", ty = %self.ty, kind = ?kind,
               level = their_node.level, prefix = %their_node.prefix, "received refinement");

        for slot in 0..NUM_SLOTS {
            let theirs = their_node.slot_state(slot);
            let ours = our_node.slot_state(slot);

            // Note any leaves they have.
            if theirs.is_leaf() {
                self.peer_items.insert(their_node.slot_id(slot));
            }

            if kind == RefineKind::Query {
                // The asymmetric leaf-vs-subtree cases. Responses are
                // never allowed to provoke new queries, which is why
                // both cases below go out as queries even though one
                // of them is logically an answer.
                if theirs.is_leaf() && ours == SlotState::Subtree {
                    // They have a leaf where we have a subtree: if
                    // their leaf is somewhere in our subtree, querying
                    // with its containing node tells them so in
                    // passing.
                    let their_slotval = their_node.slot_id(slot);
                    if let Some((_, containing)) = self.table.locate_item(&their_slotval) {
                        let containing = containing.clone();
                        self.send_query(containing);
                    }
                } else if theirs == SlotState::Subtree && ours.is_leaf() {
                    // They have a subtree where we have a leaf: we
                    // must prompt them to explore their subtree, and
                    // it has to travel as a query so that their reply
                    // does not zero our counter early.
                    self.send_synthetic_subquery(&our_node, slot);
                }
            }

            if theirs == SlotState::Subtree && ours == SlotState::Subtree {
                if their_node.slot_id(slot) == our_node.slot_id(slot) {
                    // Identical subtrees: everything below ours is
                    // known to the peer, with no more traffic.
                    self.note_subtree_shared_with_peer(&our_node, slot);
                } else if kind == RefineKind::Query {
                    self.send_subquery(&our_node, slot);
                }
            }
        }

        match kind {
            RefineKind::Response => {
                if self.queries_in_flight == 0 {
                    return Err(err("underflow on query-in-flight counter"));
                }
                self.queries_in_flight -= 1;

                // Possibly this signals the end of refinement.
                if self.voice == Voice::Client && self.queries_in_flight == 0 {
                    self.calculate_items_to_send();
                    self.queue_done();
                }
            }
            RefineKind::Query => {
                // Always reply to a query with the node at the same
                // position.
                self.outgoing.push_back(RefinerMsg::Refine {
                    kind: RefineKind::Response,
                    node: our_node,
                });
            }
        }
        Ok(())
    }

    fn queue_done(&mut self) {
        self.outgoing.push_back(RefinerMsg::Done {
            ty: self.ty,
            n_items: self.items_to_send.len() as u64,
        });
    }

    fn send_query(&mut self, node: MerkleNode) {
        self.outgoing.push_back(RefinerMsg::Refine {
            kind: RefineKind::Query,
            node,
        });
        self.queries_in_flight += 1;
    }

    fn send_subquery(&mut self, our_node: &MerkleNode, slot: usize) {
        let sub = self
            .table
            .node(our_node.level + 1, &our_node.prefix.child(slot))
            .expect("subtree slot has a child node")
            .clone();
        self.send_query(sub);
    }

    fn send_synthetic_subquery(&mut self, our_node: &MerkleNode, slot: usize) {
        let val = our_node.slot_id(slot);
        let sublevel = our_node.level + 1;
        let mut synth = MerkleNode::new(self.ty, sublevel, Prefix::of_id(&val, sublevel));
        synth.set_slot(val.nibble(sublevel), our_node.slot_state(slot), val);
        self.send_query(synth);
    }

    fn note_subtree_shared_with_peer(&mut self, our_node: &MerkleNode, slot: usize) {
        let mut items = BTreeSet::new();
        self.table.collect_items_in_subtree(
            our_node.level + 1,
            &our_node.prefix.child(slot),
            &mut items,
        );
        self.peer_items.extend(items);
    }

    fn calculate_items_to_send(&mut self) {
        if self.calculated_items_to_send {
            return;
        }
        self.items_to_send = self.local_items.difference(&self.peer_items).copied().collect();
        self.calculated_items_to_send = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use test_log::test;
    use tideway_base::ID_LEN;

    // A mock session: two refiners wired back to back, every message
    // routed across and counted, then the outcome checked against the
    // plain set differences.
    struct RefinerPair {
        client: Refiner,
        server: Refiner,
        n_msgs: usize,
    }

    impl RefinerPair {
        fn run(client_items: &BTreeSet<Id>, server_items: &BTreeSet<Id>) -> RefinerPair {
            let mut client = Refiner::new(ObjectType::Revision, Voice::Client);
            let mut server = Refiner::new(ObjectType::Revision, Voice::Server);
            for i in client_items {
                client.note_local_item(*i);
            }
            for i in server_items {
                server.note_local_item(*i);
            }
            client.reindex_local_items();
            server.reindex_local_items();
            client.begin_refinement();

            let mut events: VecDeque<(bool, RefinerMsg)> = VecDeque::new();
            let mut n_msgs = 0;
            while let Some(msg) = client.pop_outgoing() {
                events.push_back((true, msg));
            }
            while let Some((to_server, msg)) = events.pop_front() {
                n_msgs += 1;
                let target = if to_server { &mut server } else { &mut client };
                match msg {
                    RefinerMsg::Refine { kind, node } => {
                        target.process_refinement_command(kind, &node).unwrap()
                    }
                    RefinerMsg::Done { n_items, .. } => target.process_done_command(n_items),
                }
                while let Some(out) = target.pop_outgoing() {
                    events.push_back((!to_server, out));
                }
            }

            let pair = RefinerPair {
                client,
                server,
                n_msgs,
            };
            pair.check(client_items, server_items);
            pair
        }

        fn check(&self, client_items: &BTreeSet<Id>, server_items: &BTreeSet<Id>) {
            assert!(self.client.done);
            assert!(self.server.done);

            let c_minus_s: BTreeSet<Id> =
                client_items.difference(server_items).copied().collect();
            let s_minus_c: BTreeSet<Id> =
                server_items.difference(client_items).copied().collect();

            assert_eq!(self.client.items_to_send, c_minus_s);
            assert_eq!(self.server.items_to_send, s_minus_c);
            assert_eq!(self.client.items_to_receive, s_minus_c.len() as u64);
            assert_eq!(self.server.items_to_receive, c_minus_s.len() as u64);

            // Nothing queued for sending is already on the other side.
            assert!(self.client.items_to_send.is_disjoint(server_items));
            assert!(self.server.items_to_send.is_disjoint(client_items));
        }
    }

    fn random_id(rng: &mut StdRng) -> Id {
        let mut raw = [0u8; ID_LEN];
        rng.fill(&mut raw);
        Id(raw)
    }

    /// Random ids, optionally clumped into near-identical runs so the
    /// tries grow deep shared paths.
    fn build_random_set(rng: &mut StdRng, size: usize, clumpy: bool) -> BTreeSet<Id> {
        let mut set = BTreeSet::new();
        while set.len() < size {
            let id = random_id(rng);
            set.insert(id);
            if clumpy && rng.gen_bool(0.5) {
                let mut raw = *id.as_bytes();
                let pos = if rng.gen_bool(0.5) {
                    ID_LEN - 1
                } else {
                    rng.gen_range(0..ID_LEN)
                };
                for _ in 0..rng.gen_range(1..8) {
                    if set.len() >= size || raw[pos] == 0xff {
                        break;
                    }
                    raw[pos] += 1;
                    set.insert(Id(raw));
                }
            }
        }
        set
    }

    #[test]
    fn test_empty_vs_empty() {
        let empty = BTreeSet::new();
        let pair = RefinerPair::run(&empty, &empty);
        // Root query, root response, done, done-echo.
        assert_eq!(pair.n_msgs, 4);
    }

    #[test]
    fn test_one_sided_small_delta() {
        let ids: Vec<Id> = (0..3u32).map(|i| Id::of(&i.to_le_bytes())).collect();
        let all: BTreeSet<Id> = ids.iter().copied().collect();
        let most: BTreeSet<Id> = ids[..2].iter().copied().collect();
        let pair = RefinerPair::run(&all, &most);
        assert_eq!(pair.client.items_to_send, BTreeSet::from([ids[2]]));
        assert_eq!(pair.server.items_to_receive, 1);
        assert_eq!(pair.server.items_to_send.len(), 0);
    }

    #[test]
    fn test_large_shared_core_stays_sublinear() {
        let mut rng = StdRng::seed_from_u64(42);
        let shared = build_random_set(&mut rng, 1000, false);
        let mut a = shared.clone();
        let mut b = shared.clone();
        a.insert(random_id(&mut rng));
        b.insert(random_id(&mut rng));
        let pair = RefinerPair::run(&a, &b);
        // Refinement should descend only along the two unshared
        // paths: a handful of messages, nowhere near the set size.
        assert!(
            pair.n_msgs < 40,
            "expected a few dozen messages at most, got {}",
            pair.n_msgs
        );
    }

    #[test]
    fn test_combinations_of_random_sets() {
        let mut rng = StdRng::seed_from_u64(7);
        for &base_size in &[1usize, 64, 256] {
            for &clumpy in &[false, true] {
                let s0 = build_random_set(&mut rng, base_size, clumpy);
                for &side_size in &[1usize, 3, base_size / 2 + 1] {
                    let a = build_random_set(&mut rng, side_size, false);
                    let b = build_random_set(&mut rng, side_size, false);
                    let u: BTreeSet<Id> = s0.union(&a).copied().collect();
                    let v: BTreeSet<Id> = s0.union(&b).copied().collect();
                    let e = BTreeSet::new();

                    RefinerPair::run(&e, &u); // a large initial transfer
                    RefinerPair::run(&u, &e);
                    RefinerPair::run(&s0, &u); // a mostly-shared superset/subset
                    RefinerPair::run(&u, &s0);
                    RefinerPair::run(&a, &u); // a mostly-unshared superset/subset
                    RefinerPair::run(&u, &a);
                    RefinerPair::run(&u, &v); // things to send in both directions
                    RefinerPair::run(&v, &u);
                    RefinerPair::run(&u, &u); // a large no-op
                }
            }
        }
    }

    #[test]
    fn test_underflow_is_an_error() {
        let mut r = Refiner::new(ObjectType::Key, Voice::Client);
        r.reindex_local_items();
        let node = MerkleNode::root(ObjectType::Key);
        assert!(r
            .process_refinement_command(RefineKind::Response, &node)
            .is_err());
    }
}
