use crate::OUTBUF_THROTTLE;
use std::collections::{BTreeSet, VecDeque};
use tideway_base::{err, Id, ObjectType, RefineKind, Result, Role, Voice};
use tideway_merkle::MerkleNode;
use tideway_refine::{EnumItem, Refiner, RefinerMsg, RevEnumerator};
use tideway_store::{
    cert_id, decode_epoch, epoch_id, Cert, Database, KeyStore, PolicyHooks, PubKey, EPOCH_ZERO,
};
use tideway_wire::{ByteQueue, ChainedHmac, Netcmd};
use tracing::{debug, info, trace, warn};

/// Session-fatal failure: carries the message that goes out in the
/// final error frame before the unwind.
struct Fail(String);

type Step<T = ()> = std::result::Result<T, Fail>;

fn fail<T>(msg: impl Into<String>) -> Step<T> {
    Err(Fail(msg.into()))
}

fn require(check: bool, context: &str) -> Step<()> {
    if check {
        Ok(())
    } else {
        Err(Fail(format!("check of '{}' failed", context)))
    }
}

/// Branch name matching for include/exclude patterns. An empty include
/// matches everything; an empty exclude excludes nothing.
#[derive(Clone, Debug)]
pub struct BranchMatcher {
    include: glob::Pattern,
    exclude: Option<glob::Pattern>,
}

impl BranchMatcher {
    pub fn new(include: &str, exclude: &str) -> Result<BranchMatcher> {
        let include = if include.is_empty() { "*" } else { include };
        let include = glob::Pattern::new(include)
            .map_err(|e| err(format!("bad include pattern '{}': {}", include, e)))?;
        let exclude = if exclude.is_empty() {
            None
        } else {
            Some(
                glob::Pattern::new(exclude)
                    .map_err(|e| err(format!("bad exclude pattern '{}': {}", exclude, e)))?,
            )
        };
        Ok(BranchMatcher { include, exclude })
    }

    pub fn matches(&self, branch: &str) -> bool {
        self.include.matches(branch)
            && !self
                .exclude
                .as_ref()
                .map(|p| p.matches(branch))
                .unwrap_or(false)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub role: Role,
    pub include: String,
    pub exclude: String,
}

enum PendingWrite {
    Data {
        ty: ObjectType,
        item: Id,
        bytes: Vec<u8>,
    },
    Delta {
        base: Id,
        target: Id,
        bytes: Vec<u8>,
    },
}

/// One peer-to-peer exchange, from hello to bye (or to error unwind).
///
/// The session owns byte queues on both sides rather than a socket:
/// `receive_bytes` feeds it, `peek_out`/`consumed` drain it, and
/// `step` turns complete inbound frames into protocol actions. All of
/// the actual work happens inside `step`; the caller only moves bytes.
pub struct Session<D, K, P> {
    role: Role,
    voice: Voice,
    include: String,
    exclude: String,
    matcher: BranchMatcher,
    db: D,
    keys: K,
    policy: P,
    peer_id: String,

    inbuf: ByteQueue,
    outbuf: VecDeque<Vec<u8>>,
    outbuf_front_written: usize,
    outbuf_size: usize,
    read_hmac: ChainedHmac,
    write_hmac: ChainedHmac,

    authenticated: bool,
    remote_key_hash: Option<Id>,
    remote_key_name: Option<String>,
    saved_nonce: Option<Id>,

    received_goodbye: bool,
    sent_goodbye: bool,
    encountered_error: bool,
    remote_error: Option<String>,

    // Nothing but epochs may touch the database until the epoch
    // exchange has settled; everything else waits here.
    valve_open: bool,
    pending_writes: Vec<PendingWrite>,

    epoch_refiner: Refiner,
    key_refiner: Refiner,
    cert_refiner: Refiner,
    rev_refiner: Refiner,
    sync_revs: BTreeSet<Id>,
    enumerator: Option<RevEnumerator>,

    bytes_in: u64,
    bytes_out: u64,
}

impl<D: Database, K: KeyStore, P: PolicyHooks> Session<D, K, P> {
    fn new(voice: Voice, cfg: SessionConfig, db: D, keys: K, policy: P, peer_id: String) -> Result<Self> {
        let matcher = BranchMatcher::new(&cfg.include, &cfg.exclude)?;
        Ok(Session {
            role: cfg.role,
            voice,
            include: cfg.include,
            exclude: cfg.exclude,
            matcher,
            db,
            keys,
            policy,
            peer_id,
            inbuf: ByteQueue::new(),
            outbuf: VecDeque::new(),
            outbuf_front_written: 0,
            outbuf_size: 0,
            read_hmac: ChainedHmac::new(),
            write_hmac: ChainedHmac::new(),
            authenticated: false,
            remote_key_hash: None,
            remote_key_name: None,
            saved_nonce: None,
            received_goodbye: false,
            sent_goodbye: false,
            encountered_error: false,
            remote_error: None,
            valve_open: false,
            pending_writes: Vec::new(),
            epoch_refiner: Refiner::new(ObjectType::Epoch, voice),
            key_refiner: Refiner::new(ObjectType::Key, voice),
            cert_refiner: Refiner::new(ObjectType::Cert, voice),
            rev_refiner: Refiner::new(ObjectType::Revision, voice),
            sync_revs: BTreeSet::new(),
            enumerator: None,
            bytes_in: 0,
            bytes_out: 0,
        })
    }

    pub fn new_client(cfg: SessionConfig, db: D, keys: K, policy: P, peer_id: String) -> Result<Self> {
        Self::new(Voice::Client, cfg, db, keys, policy, peer_id)
    }

    pub fn new_server(cfg: SessionConfig, db: D, keys: K, policy: P, peer_id: String) -> Result<Self> {
        Self::new(Voice::Server, cfg, db, keys, policy, peer_id)
    }

    /// Server voice: open the conversation with hello.
    pub fn begin_service(&mut self) -> Result<()> {
        let local = self
            .keys
            .local_pub()
            .ok_or_else(|| err("server has no signing identity"))?;
        let nonce = self.mk_nonce();
        self.write_netcmd(&Netcmd::Hello {
            key_name: local.name,
            key: local.key,
            nonce,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // The byte-queue surface the drivers use.

    pub fn wants_read(&self) -> bool {
        // Bytes keep flowing even while our output is backed up (the
        // throttle gates dispatch, not intake); only a frame larger
        // than any legal frame stops the intake.
        self.inbuf.len() < tideway_wire::MAX_PAYLOAD_LEN + (64 << 10)
    }

    pub fn receive_bytes(&mut self, bytes: &[u8]) {
        self.bytes_in += bytes.len() as u64;
        if self.encountered_error {
            trace!(target: "tideway", peer = %self.peer_id,
                   "in error unwind mode, discarding {} inbound bytes", bytes.len());
            return;
        }
        self.inbuf.append(bytes);
    }

    pub fn wants_write(&self) -> bool {
        !self.outbuf.is_empty()
    }

    pub fn peek_out(&self) -> Option<&[u8]> {
        self.outbuf.front().map(|b| &b[self.outbuf_front_written..])
    }

    pub fn consumed(&mut self, n: usize) {
        self.bytes_out += n as u64;
        self.outbuf_size -= n;
        self.outbuf_front_written += n;
        if let Some(front) = self.outbuf.front() {
            if self.outbuf_front_written >= front.len() {
                self.outbuf_front_written = 0;
                self.outbuf.pop_front();
            }
        }
    }

    /// Advance the state machine: dispatch every complete inbound
    /// frame (unless output is backed up), feed the enumerator, and
    /// consider saying goodbye. Returns true if anything happened.
    pub fn step(&mut self) -> bool {
        if self.encountered_error {
            return false;
        }
        let mut progress = false;
        loop {
            if self.outbuf_size > OUTBUF_THROTTLE {
                break;
            }
            match Netcmd::read(&mut self.inbuf, &mut self.read_hmac) {
                Ok(None) => break,
                Ok(Some(cmd)) => {
                    progress = true;
                    trace!(target: "tideway", peer = %self.peer_id, cmd = cmd.name(), "dispatch");
                    if let Err(Fail(msg)) = self.dispatch(cmd) {
                        self.unwind(msg);
                        return true;
                    }
                }
                Err(bd) => {
                    progress = true;
                    self.unwind(bd.to_string());
                    return true;
                }
            }
        }
        progress |= self.maybe_step_enumerator();
        self.maybe_say_goodbye();
        progress
    }

    // ------------------------------------------------------------------
    // Lifecycle queries.

    pub fn finished_ok(&self) -> bool {
        !self.encountered_error
            && self.sent_goodbye
            && self.received_goodbye
            && self.outbuf.is_empty()
    }

    /// A failed session is done once its error frame has drained.
    pub fn finished_failed(&self) -> bool {
        self.encountered_error && self.outbuf.is_empty()
    }

    pub fn encountered_error(&self) -> bool {
        self.encountered_error
    }

    pub fn sent_goodbye(&self) -> bool {
        self.sent_goodbye
    }

    pub fn remote_error(&self) -> Option<&str> {
        self.remote_error.as_deref()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The authenticated peer's key name, once known.
    pub fn remote_key_name(&self) -> Option<&str> {
        self.remote_key_name.as_deref()
    }

    pub fn byte_counts(&self) -> (u64, u64) {
        (self.bytes_in, self.bytes_out)
    }

    // ------------------------------------------------------------------
    // Internals.

    fn mk_nonce(&mut self) -> Id {
        let mut raw = [0u8; 20];
        rand::Rng::fill(&mut rand::thread_rng(), &mut raw[..]);
        let nonce = Id(raw);
        self.saved_nonce = Some(nonce);
        nonce
    }

    fn set_session_key(&mut self, key: &[u8]) -> Step<()> {
        let key: &[u8; 20] = match key.try_into() {
            Ok(k) => k,
            Err(_) => return fail("negotiated session key has the wrong length"),
        };
        self.read_hmac.set_key(key);
        self.write_hmac.set_key(key);
        Ok(())
    }

    fn write_netcmd(&mut self, cmd: &Netcmd) {
        if self.encountered_error {
            debug!(target: "tideway", peer = %self.peer_id,
                   "dropping outgoing {} frame during error unwind", cmd.name());
            return;
        }
        let mut buf = Vec::new();
        cmd.write(&mut buf, &mut self.write_hmac);
        self.outbuf_size += buf.len();
        self.outbuf.push_back(buf);
    }

    /// Enter error-unwind mode: one last error frame, then nothing but
    /// draining.
    fn unwind(&mut self, msg: String) {
        if self.encountered_error {
            return;
        }
        warn!(target: "tideway", peer = %self.peer_id, "error: {}", msg);
        self.write_netcmd(&Netcmd::Error { msg });
        self.sent_goodbye = true;
        self.encountered_error = true;
        self.inbuf.clear();
        self.pending_writes.clear();
    }

    fn refiner_mut(&mut self, ty: ObjectType) -> Option<&mut Refiner> {
        match ty {
            ObjectType::Epoch => Some(&mut self.epoch_refiner),
            ObjectType::Key => Some(&mut self.key_refiner),
            ObjectType::Cert => Some(&mut self.cert_refiner),
            ObjectType::Revision => Some(&mut self.rev_refiner),
            ObjectType::File => None,
        }
    }

    fn drain_refiner(&mut self, ty: ObjectType) {
        loop {
            let Some(msg) = self.refiner_mut(ty).and_then(|r| r.pop_outgoing()) else {
                break;
            };
            let cmd = match msg {
                RefinerMsg::Refine { kind, node } => Netcmd::Refine {
                    kind,
                    node: node.encode(),
                },
                RefinerMsg::Done { ty, n_items } => Netcmd::Done {
                    level: 0,
                    ty,
                    n_items,
                },
            };
            self.write_netcmd(&cmd);
        }
    }

    fn done_all_refinements(&self) -> bool {
        self.epoch_refiner.done
            && self.key_refiner.done
            && self.cert_refiner.done
            && self.rev_refiner.done
    }

    /// Have we received everything we were promised? A peer that
    /// cannot receive (pure source) is trivially satisfied.
    fn got_all_data(&self) -> bool {
        !self.role.can_receive()
            || (self.epoch_refiner.items_to_receive == 0
                && self.key_refiner.items_to_receive == 0
                && self.cert_refiner.items_to_receive == 0
                && self.rev_refiner.items_to_receive == 0)
    }

    fn send_work_done(&self) -> bool {
        !self.role.can_send()
            || self
                .enumerator
                .as_ref()
                .map(|e| e.finished())
                .unwrap_or(false)
    }

    fn maybe_say_goodbye(&mut self) {
        if !self.sent_goodbye
            && self.authenticated
            && self.done_all_refinements()
            && self.got_all_data()
            && self.send_work_done()
        {
            debug!(target: "tideway", peer = %self.peer_id, "queueing goodbye");
            self.write_netcmd(&Netcmd::Bye);
            self.sent_goodbye = true;
        }
    }

    fn note_item_arrived(&mut self, ty: ObjectType, _item: &Id) {
        if let Some(r) = self.refiner_mut(ty) {
            r.items_to_receive = r.items_to_receive.saturating_sub(1);
        }
    }

    fn maybe_open_valve(&mut self) -> Step<()> {
        if self.valve_open {
            return Ok(());
        }
        if !self.epoch_refiner.done || self.epoch_refiner.items_to_receive != 0 {
            return Ok(());
        }
        debug!(target: "tideway", peer = %self.peer_id,
               "all epochs processed, opening database valve");
        self.valve_open = true;
        for w in std::mem::take(&mut self.pending_writes) {
            self.apply_write(w)?;
        }
        Ok(())
    }

    fn valve_write(&mut self, w: PendingWrite) -> Step<()> {
        if self.valve_open {
            self.apply_write(w)
        } else {
            self.pending_writes.push(w);
            Ok(())
        }
    }

    fn apply_write(&mut self, w: PendingWrite) -> Step<()> {
        let res = match w {
            PendingWrite::Data { ty, item, bytes } => self.db.put(ty, &item, &bytes),
            PendingWrite::Delta {
                base,
                target,
                bytes,
            } => self.db.apply_file_delta(&base, &target, &bytes),
        };
        res.map_err(|e| Fail(format!("database write failed: {:?}", e)))
    }

    fn queue_data_cmd(&mut self, ty: ObjectType, item: Id, payload: Vec<u8>) {
        if !self.role.can_send() {
            debug!(target: "tideway", ty = %ty, %item,
                   "not queueing data as we are in pure sink role");
            return;
        }
        self.write_netcmd(&Netcmd::Data { ty, item, payload });
    }

    fn queue_delta_cmd(&mut self, base: Id, target: Id, delta: Vec<u8>) {
        if !self.role.can_send() {
            debug!(target: "tideway", %target,
                   "not queueing delta as we are in pure sink role");
            return;
        }
        self.write_netcmd(&Netcmd::Delta {
            ty: ObjectType::File,
            base,
            target,
            delta,
        });
    }

    fn send_all_data(&mut self, ty: ObjectType) {
        let items = match self.refiner_mut(ty) {
            Some(r) => r.items_to_send.clone(),
            None => return,
        };
        for item in items {
            match self.db.get(ty, &item) {
                Some(bytes) => self.queue_data_cmd(ty, item, bytes),
                None => warn!(target: "tideway", ty = %ty, %item,
                              "refined item is missing from the store; peer will not get it"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Trie construction.

    fn rebuild_merkle_trees(&mut self, branches: &BTreeSet<String>) -> Step<()> {
        info!(target: "tideway", peer = %self.peer_id, branches = branches.len(),
              "finding items to synchronize");

        for branch in branches {
            let epoch = match self.db.epoch_of(branch) {
                Some(e) => e,
                None => {
                    // A branch nobody stamped yet starts at epoch zero.
                    debug!(target: "tideway", branch = branch.as_str(), "setting epoch to zero");
                    self.db
                        .set_epoch(branch, EPOCH_ZERO)
                        .map_err(|e| Fail(format!("database write failed: {:?}", e)))?;
                    EPOCH_ZERO
                }
            };
            self.epoch_refiner.note_local_item(epoch_id(branch, &epoch));
        }

        let revs = self.db.revisions_in_branches(branches);
        let mut key_ids = BTreeSet::new();
        for rev in &revs {
            self.rev_refiner.note_local_item(*rev);
            for cid in self.db.certs_of(rev) {
                let Some(bytes) = self.db.get(ObjectType::Cert, &cid) else {
                    warn!(target: "tideway", cert = %cid, "cert index names a missing cert");
                    continue;
                };
                let cert = match Cert::decode(&bytes) {
                    Ok(c) => c,
                    Err(_) => return fail(format!("stored cert {} is malformed", cid)),
                };
                // Branch certs for branches outside the agreed filter
                // stay home.
                if cert.name == tideway_store::BRANCH_CERT && !branches.contains(&cert.value) {
                    continue;
                }
                self.cert_refiner.note_local_item(cid);
                key_ids.insert(cert.key_id);
            }
        }
        for key in key_ids {
            if self.db.exists(ObjectType::Key, &key) {
                self.key_refiner.note_local_item(key);
            }
        }

        self.epoch_refiner.reindex_local_items();
        self.key_refiner.reindex_local_items();
        self.cert_refiner.reindex_local_items();
        self.rev_refiner.reindex_local_items();
        self.sync_revs = revs;
        Ok(())
    }

    fn begin_all_refinements(&mut self) {
        for ty in ObjectType::REFINED {
            if let Some(r) = self.refiner_mut(ty) {
                r.begin_refinement();
            }
            self.drain_refiner(ty);
        }
    }

    // ------------------------------------------------------------------
    // Dispatch.

    fn dispatch(&mut self, cmd: Netcmd) -> Step<()> {
        match cmd {
            Netcmd::Error { msg } => {
                warn!(target: "tideway", peer = %self.peer_id, "received network error: {}", msg);
                self.remote_error = Some(msg);
                self.encountered_error = true;
                self.inbuf.clear();
                self.pending_writes.clear();
                Ok(())
            }
            Netcmd::Bye => {
                self.received_goodbye = true;
                Ok(())
            }
            Netcmd::Hello {
                key_name,
                key,
                nonce,
            } => {
                require(!self.authenticated, "hello received before authentication")?;
                require(self.voice == Voice::Client, "hello received in server voice")?;
                self.process_hello(key_name, key, nonce)
            }
            Netcmd::Anonymous {
                role,
                include,
                exclude,
                key_blob,
            } => {
                require(!self.authenticated, "anonymous received before authentication")?;
                require(self.voice == Voice::Server, "anonymous received in client voice")?;
                self.process_anonymous(role, include, exclude, key_blob)
            }
            Netcmd::Auth {
                role,
                include,
                exclude,
                client,
                nonce_echo,
                key_blob,
                signature,
            } => {
                require(!self.authenticated, "auth received before authentication")?;
                require(self.voice == Voice::Server, "auth received in client voice")?;
                self.process_auth(role, include, exclude, client, nonce_echo, key_blob, signature)
            }
            Netcmd::Confirm => {
                require(!self.authenticated, "confirm received before authentication")?;
                require(self.voice == Voice::Client, "confirm received in server voice")?;
                info!(target: "tideway", peer = %self.peer_id, role = %self.role,
                      include = self.include.as_str(), exclude = self.exclude.as_str(),
                      "server confirmed; beginning refinement");
                self.authenticated = true;
                self.begin_all_refinements();
                Ok(())
            }
            Netcmd::Refine { kind, node } => {
                require(self.authenticated, "refine received when authenticated")?;
                let node = match MerkleNode::read(&node) {
                    Ok(n) => n,
                    Err(bd) => return fail(bd.to_string()),
                };
                self.process_refine(kind, node)
            }
            Netcmd::Done { ty, n_items, .. } => {
                require(self.authenticated, "done received when authenticated")?;
                self.process_done(ty, n_items)
            }
            Netcmd::SendData { ty, item } => {
                require(self.authenticated, "send_data received when authenticated")?;
                self.process_send_data(ty, item)
            }
            Netcmd::SendDelta { ty, base, target } => {
                require(self.authenticated, "send_delta received when authenticated")?;
                require(ty == ObjectType::File, "send_delta names a non-file type")?;
                self.process_send_delta(base, target)
            }
            Netcmd::Data { ty, item, payload } => {
                require(self.authenticated, "data received when authenticated")?;
                require(
                    self.role.can_receive(),
                    "data received while in pure source role",
                )?;
                self.process_data(ty, item, payload)
            }
            Netcmd::Delta {
                ty,
                base,
                target,
                delta,
            } => {
                require(self.authenticated, "delta received when authenticated")?;
                require(
                    self.role.can_receive(),
                    "delta received while in pure source role",
                )?;
                self.process_delta(ty, base, target, delta)
            }
            Netcmd::Nonexistent { ty, item } => {
                require(self.authenticated, "nonexistent received when authenticated")?;
                debug!(target: "tideway", ty = %ty, %item, "peer does not have the item");
                self.note_item_arrived(ty, &item);
                Ok(())
            }
            Netcmd::Usher { greeting } => {
                require(self.voice == Voice::Client, "usher received in server voice")?;
                require(!self.authenticated, "usher received after authentication")?;
                if let Some(warning) = greeting.strip_prefix('!') {
                    info!(target: "tideway", "received warning from usher: {}", warning);
                } else if !greeting.is_empty() {
                    debug!(target: "tideway", "received greeting from usher: {}", greeting);
                }
                let reply = Netcmd::UsherReply {
                    server: self.peer_id.clone(),
                    pattern: self.include.clone(),
                };
                self.write_netcmd(&reply);
                Ok(())
            }
            Netcmd::UsherReply { .. } => fail("unexpected usher_reply"),
        }
    }

    // ------------------------------------------------------------------
    // Handshake, client side.

    fn process_hello(&mut self, key_name: String, key: Vec<u8>, nonce: Id) -> Step<()> {
        require(self.remote_key_hash.is_none(), "server identity not yet set")?;

        let server_key = PubKey {
            name: key_name.clone(),
            key: key.clone(),
        };
        let fingerprint = server_key.id();

        match self.policy.known_server_key(&self.peer_id) {
            Some(expected) if expected != fingerprint => {
                warn!(target: "tideway", peer = %self.peer_id,
                      "SERVER IDENTIFICATION HAS CHANGED: it is possible that someone \
                       is doing something nasty, or the server key was replaced; \
                       remove the recorded fingerprint to override");
                return fail(format!(
                    "server key changed: {} sent key {}, expected {}",
                    self.peer_id, fingerprint, expected
                ));
            }
            Some(_) => {}
            None => {
                if let Err(e) = self.policy.remember_server_key(&self.peer_id, &fingerprint) {
                    return fail(format!("failed to record server key: {:?}", e));
                }
            }
        }
        debug!(target: "tideway", peer = %self.peer_id, server_key = %fingerprint,
               name = key_name.as_str(), "received hello");

        if !self.db.exists(ObjectType::Key, &fingerprint) {
            let encoded = server_key
                .encode()
                .map_err(|e| Fail(format!("failed to encode server key: {:?}", e)))?;
            self.db
                .put(ObjectType::Key, &fingerprint, &encoded)
                .map_err(|e| Fail(format!("database write failed: {:?}", e)))?;
        }
        self.remote_key_hash = Some(fingerprint);
        self.remote_key_name = Some(key_name);

        // Clients sync every local branch the user's patterns accept.
        let branches: BTreeSet<String> = self
            .db
            .branches()
            .into_iter()
            .filter(|b| self.matcher.matches(b))
            .collect();
        self.rebuild_merkle_trees(&branches)?;

        let mut session_key = [0u8; 20];
        rand::Rng::fill(&mut rand::thread_rng(), &mut session_key[..]);
        let key_blob = match self.keys.encrypt_session_key(&key, &session_key) {
            Ok(b) => b,
            Err(e) => return fail(format!("failed to seal session key: {:?}", e)),
        };

        if self.keys.local_name().is_some() {
            let local = self.keys.local_pub().expect("identity has a public key");
            let signature = match self.keys.sign(nonce.as_bytes()) {
                Ok(s) => s,
                Err(e) => return fail(format!("failed to sign nonce: {:?}", e)),
            };
            self.write_netcmd(&Netcmd::Auth {
                role: self.role,
                include: self.include.clone(),
                exclude: self.exclude.clone(),
                client: local.id(),
                nonce_echo: nonce,
                key_blob,
                signature,
            });
        } else {
            self.write_netcmd(&Netcmd::Anonymous {
                role: self.role,
                include: self.include.clone(),
                exclude: self.exclude.clone(),
                key_blob,
            });
        }
        // Everything after the request runs under the session key.
        self.set_session_key(&session_key)
    }

    // ------------------------------------------------------------------
    // Handshake, server side.

    fn install_offered_key(&mut self, key_blob: &[u8]) -> Step<()> {
        let session_key = match self.keys.decrypt_session_key(key_blob) {
            Ok(k) => k,
            Err(e) => return fail(format!("failed to open sealed session key: {:?}", e)),
        };
        self.set_session_key(&session_key)
    }

    /// The agreed branch set: branches both filters accept, each one
    /// checked against policy for the directions the client asked for.
    fn permitted_branches(
        &self,
        their_matcher: &BranchMatcher,
        their_role: Role,
        client: Option<&Id>,
    ) -> Step<BTreeSet<String>> {
        let mut ok = BTreeSet::new();
        for branch in self.db.branches() {
            if !their_matcher.matches(&branch) {
                continue;
            }
            let readable = self.matcher.matches(&branch)
                && self.policy.read_allowed(&branch, client);
            if their_role.can_receive() && !readable {
                if client.is_none() {
                    return fail(format!(
                        "anonymous access to branch '{}' denied by server",
                        branch
                    ));
                }
                return fail(format!("access to branch '{}' denied by server", branch));
            }
            if their_role.can_send() {
                let client = client.expect("write access requires authentication");
                if !(self.matcher.matches(&branch) && self.policy.write_allowed(&branch, client)) {
                    return fail(format!(
                        "write access to branch '{}' denied by server",
                        branch
                    ));
                }
            }
            ok.insert(branch);
        }
        Ok(ok)
    }

    fn process_anonymous(
        &mut self,
        their_role: Role,
        include: String,
        exclude: String,
        key_blob: Vec<u8>,
    ) -> Step<()> {
        self.install_offered_key(&key_blob)?;

        // Anonymous peers may only pull.
        if their_role != Role::Sink {
            return fail("anonymous write access refused by server");
        }
        if !self.role.can_send() {
            return fail("server is not serving as a source");
        }

        let their_matcher = match BranchMatcher::new(&include, &exclude) {
            Ok(m) => m,
            Err(e) => return fail(format!("bad patterns in anonymous request: {:?}", e)),
        };
        let ok = self.permitted_branches(&their_matcher, their_role, None)?;
        info!(target: "tideway", peer = %self.peer_id,
              include = include.as_str(), exclude = exclude.as_str(),
              branches = ok.len(), "allowed anonymous read access");

        self.rebuild_merkle_trees(&ok)?;
        self.role = Role::Source;
        self.authenticated = true;
        self.write_netcmd(&Netcmd::Confirm);
        self.begin_all_refinements();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_auth(
        &mut self,
        their_role: Role,
        include: String,
        exclude: String,
        client: Id,
        nonce_echo: Id,
        key_blob: Vec<u8>,
        signature: Vec<u8>,
    ) -> Step<()> {
        self.install_offered_key(&key_blob)?;

        // The nonce must be the one we issued in hello.
        match self.saved_nonce.take() {
            Some(nonce) if nonce == nonce_echo => {}
            _ => return fail("detected replay attack in auth request"),
        }

        // We can only authenticate keys we already hold.
        let Some(key_bytes) = self.db.get(ObjectType::Key, &client) else {
            return fail(format!("remote public key hash '{}' is unknown", client));
        };
        let client_key = match PubKey::decode(&key_bytes) {
            Ok(k) => k,
            Err(_) => return fail(format!("stored key {} is malformed", client)),
        };

        // The client states the role it wants; we must be able to play
        // the opposite.
        if their_role.can_receive() && !self.role.can_send() {
            return fail("read access refused: server is running as a pure sink");
        }
        if their_role.can_send() && !self.role.can_receive() {
            return fail("write access refused: server is running as a pure source");
        }

        let their_matcher = match BranchMatcher::new(&include, &exclude) {
            Ok(m) => m,
            Err(e) => return fail(format!("bad patterns in auth request: {:?}", e)),
        };
        let ok = self.permitted_branches(&their_matcher, their_role, Some(&client))?;

        if !self.keys.verify(&client_key.key, nonce_echo.as_bytes(), &signature) {
            return fail("bad client signature");
        }

        info!(target: "tideway", peer = %self.peer_id, client = client_key.name.as_str(),
              role = %their_role, include = include.as_str(), exclude = exclude.as_str(),
              branches = ok.len(), "client authenticated");

        self.remote_key_hash = Some(client);
        self.remote_key_name = Some(client_key.name);

        // Assume the (possibly degraded) opposite role.
        self.role = match their_role {
            Role::Sink => Role::Source,
            Role::Source => Role::Sink,
            Role::SourceAndSink => Role::SourceAndSink,
        };

        self.rebuild_merkle_trees(&ok)?;
        self.authenticated = true;
        self.write_netcmd(&Netcmd::Confirm);
        self.begin_all_refinements();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Refinement and transmission.

    fn process_refine(&mut self, kind: RefineKind, node: MerkleNode) -> Step<()> {
        let ty = node.ty;
        let Some(refiner) = self.refiner_mut(ty) else {
            warn!(target: "tideway", "unexpected refine on non-refined item type");
            return Ok(());
        };
        if let Err(e) = refiner.process_refinement_command(kind, &node) {
            return fail(format!("{:?}", e));
        }
        self.drain_refiner(ty);
        Ok(())
    }

    fn process_done(&mut self, ty: ObjectType, n_items: u64) -> Step<()> {
        let Some(refiner) = self.refiner_mut(ty) else {
            warn!(target: "tideway", "unexpected done on non-refined item type");
            return Ok(());
        };
        refiner.process_done_command(n_items);
        let now_done = refiner.done;
        self.drain_refiner(ty);

        if now_done {
            match ty {
                // Epochs and keys stream as soon as their own
                // refinement settles; revisions and certs go through
                // the enumerator.
                ObjectType::Epoch => {
                    self.send_all_data(ObjectType::Epoch);
                    self.maybe_open_valve()?;
                }
                ObjectType::Key => self.send_all_data(ObjectType::Key),
                _ => {}
            }
            if self.done_all_refinements() && self.role.can_send() && self.enumerator.is_none() {
                let e = RevEnumerator::new(
                    &self.db,
                    &self.sync_revs,
                    self.rev_refiner.items_to_send.clone(),
                    self.cert_refiner.items_to_send.clone(),
                )
                .map_err(|e| Fail(format!("failed to build enumerator: {:?}", e)))?;
                self.enumerator = Some(e);
            }
        }
        Ok(())
    }

    fn maybe_step_enumerator(&mut self) -> bool {
        let mut progress = false;
        loop {
            if self.encountered_error || self.outbuf_size > OUTBUF_THROTTLE {
                break;
            }
            let Some(enumerator) = self.enumerator.as_mut() else {
                break;
            };
            if enumerator.finished() {
                break;
            }
            let mut items = Vec::new();
            if let Err(e) = enumerator.step(&self.db, &mut items) {
                self.unwind(format!("enumeration failed: {:?}", e));
                return true;
            }
            progress = true;
            for item in items {
                self.emit_enum_item(item);
            }
        }
        progress
    }

    fn emit_enum_item(&mut self, item: EnumItem) {
        match item {
            EnumItem::FileData(f) => match self.db.get(ObjectType::File, &f) {
                Some(bytes) => self.queue_data_cmd(ObjectType::File, f, bytes),
                None => warn!(target: "tideway", file = %f, "file vanished before sending"),
            },
            EnumItem::FileDelta { base, target } => {
                match self.db.get_file_delta(&base, &target) {
                    Some(delta) => self.queue_delta_cmd(base, target, delta),
                    // Fall back to the whole file.
                    None => match self.db.get(ObjectType::File, &target) {
                        Some(bytes) => self.queue_data_cmd(ObjectType::File, target, bytes),
                        None => {
                            warn!(target: "tideway", file = %target, "file vanished before sending")
                        }
                    },
                }
            }
            EnumItem::RevData(r) => match self.db.get(ObjectType::Revision, &r) {
                Some(bytes) => self.queue_data_cmd(ObjectType::Revision, r, bytes),
                None => warn!(target: "tideway", rev = %r, "revision vanished before sending"),
            },
            EnumItem::CertData(c) => match self.db.get(ObjectType::Cert, &c) {
                Some(bytes) => self.queue_data_cmd(ObjectType::Cert, c, bytes),
                None => warn!(target: "tideway", cert = %c, "cert vanished before sending"),
            },
        }
    }

    fn process_send_data(&mut self, ty: ObjectType, item: Id) -> Step<()> {
        match self.db.get(ty, &item) {
            Some(bytes) => self.queue_data_cmd(ty, item, bytes),
            None => self.write_netcmd(&Netcmd::Nonexistent { ty, item }),
        }
        Ok(())
    }

    fn process_send_delta(&mut self, base: Id, target: Id) -> Step<()> {
        if let Some(delta) = self.db.get_file_delta(&base, &target) {
            self.queue_delta_cmd(base, target, delta);
        } else if let Some(bytes) = self.db.get(ObjectType::File, &target) {
            self.queue_data_cmd(ObjectType::File, target, bytes);
        } else {
            self.write_netcmd(&Netcmd::Nonexistent {
                ty: ObjectType::File,
                item: target,
            });
        }
        Ok(())
    }

    fn process_data(&mut self, ty: ObjectType, item: Id, payload: Vec<u8>) -> Step<()> {
        // It is fine to receive something we did not ask for; it may
        // be a spontaneous transmission from refinement.
        self.note_item_arrived(ty, &item);

        if ty == ObjectType::Epoch {
            return self.process_epoch_data(item, payload);
        }

        if self.db.exists(ty, &item) {
            debug!(target: "tideway", ty = %ty, %item, "already have this object");
            return Ok(());
        }

        // Every payload must hash to the id it claims.
        let ok = match ty {
            ObjectType::Key => match PubKey::decode(&payload) {
                Ok(k) => k.id() == item,
                Err(_) => return fail("malformed key payload"),
            },
            ObjectType::Cert => match Cert::decode(&payload) {
                Ok(_) => cert_id(&payload) == item,
                Err(_) => return fail("malformed cert payload"),
            },
            ObjectType::File | ObjectType::Revision => Id::of(&payload) == item,
            ObjectType::Epoch => unreachable!("handled above"),
        };
        if !ok {
            return fail(format!(
                "hash check failed for {} '{}'",
                ty, item
            ));
        }
        self.valve_write(PendingWrite::Data {
            ty,
            item,
            bytes: payload,
        })
    }

    fn process_epoch_data(&mut self, item: Id, payload: Vec<u8>) -> Step<()> {
        let (branch, epoch) = match decode_epoch(&payload) {
            Ok(x) => x,
            Err(bd) => return fail(bd.to_string()),
        };
        if epoch_id(&branch, &epoch) != item {
            return fail(format!("hash check failed for epoch '{}'", item));
        }
        if self.db.exists(ObjectType::Epoch, &item) {
            debug!(target: "tideway", branch = branch.as_str(), "epoch already recorded");
            return self.maybe_open_valve();
        }
        match self.db.epoch_of(&branch) {
            None => {
                debug!(target: "tideway", branch = branch.as_str(),
                       epoch = %hex::encode(epoch), "branch has no epoch; adopting peer's");
                self.db
                    .set_epoch(&branch, epoch)
                    .map_err(|e| Fail(format!("database write failed: {:?}", e)))?;
                self.maybe_open_valve()
            }
            Some(ours) => {
                // Same epoch would have matched the item id above, so
                // this is a genuine disagreement. Nothing has been
                // committed yet; the valve is still shut.
                let (server_epoch, client_epoch) = match self.voice {
                    Voice::Server => (ours, epoch),
                    Voice::Client => (epoch, ours),
                };
                fail(format!(
                    "mismatched epoch on branch '{}': server has '{}', client has '{}'",
                    branch,
                    hex::encode(server_epoch),
                    hex::encode(client_epoch)
                ))
            }
        }
    }

    fn process_delta(&mut self, ty: ObjectType, base: Id, target: Id, delta: Vec<u8>) -> Step<()> {
        if ty != ObjectType::File {
            debug!(target: "tideway", ty = %ty, "ignoring delta for non-file type");
            return Ok(());
        }
        self.note_item_arrived(ty, &target);
        if self.db.exists(ty, &target) {
            debug!(target: "tideway", %target, "already have this file version");
            return Ok(());
        }
        self.valve_write(PendingWrite::Delta {
            base,
            target,
            bytes: delta,
        })
    }
}
