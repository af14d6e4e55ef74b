// Whole-session scenarios: two sans-io sessions pumped against each
// other through in-memory byte queues, with a frame sniffer watching
// the traffic in each direction. The sniffer parses frame headers
// only, so it needs no keys.

use std::collections::BTreeMap;
use std::time::Duration;
use test_log::test;
use tideway_base::{Id, ObjectType, Role};
use tideway_net::{call_server, serve_on, ServeConfig, Session, SessionConfig};
use tideway_store::{
    Cert, Epoch, FileEntry, KeyStore, MemStore, Revision, SealedKeys, SharedStore,
    StandardPolicy, BRANCH_CERT,
};

const TEST_EPOCH: Epoch = [7; 20];

type Sess = Session<SharedStore, SealedKeys, StandardPolicy>;

// ---------------------------------------------------------------------
// Store building.

fn grow(
    s: &mut MemStore,
    branch: &str,
    mut parent: Option<(Id, Id)>,
    texts: &[Vec<u8>],
) -> Vec<(Id, Id)> {
    let mut out = Vec::new();
    for text in texts {
        let f = s.add_file(text);
        let rev = Revision {
            parents: parent.iter().map(|(r, _)| *r).collect(),
            files: vec![FileEntry {
                file: f,
                base: parent.map(|(_, b)| b),
            }],
        };
        let rid = s.add_revision(&rev).unwrap();
        s.add_cert(&Cert {
            rev: rid,
            name: BRANCH_CERT.into(),
            value: branch.into(),
            key_id: Id::of(b"test key"),
            sig: vec![],
        })
        .unwrap();
        parent = Some((rid, f));
        out.push((rid, f));
    }
    out
}

fn texts(items: &[&str]) -> Vec<Vec<u8>> {
    items.iter().map(|t| t.as_bytes().to_vec()).collect()
}

fn build_chain(branch: &str, items: &[&str]) -> (MemStore, Vec<(Id, Id)>) {
    let mut s = MemStore::new();
    use tideway_store::EpochStore as _;
    s.set_epoch(branch, TEST_EPOCH).unwrap();
    let revs = grow(&mut s, branch, None, &texts(items));
    (s, revs)
}

fn server_keys() -> SealedKeys {
    SealedKeys::from_seed("server@test", [1; 32])
}

fn client_keys() -> SealedKeys {
    SealedKeys::from_seed("client@test", [2; 32])
}

// ---------------------------------------------------------------------
// Frame sniffing and pumping.

#[derive(Default)]
struct Sniffer {
    buf: Vec<u8>,
    counts: BTreeMap<u8, usize>,
}

impl Sniffer {
    fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        loop {
            // version, cmd, uleb length, payload, 20-byte mac.
            if self.buf.len() < 3 {
                return;
            }
            let cmd = self.buf[1];
            let mut len: usize = 0;
            let mut shift = 0;
            let mut pos = 2;
            loop {
                if pos >= self.buf.len() {
                    return;
                }
                let b = self.buf[pos];
                pos += 1;
                len |= ((b & 0x7f) as usize) << shift;
                shift += 7;
                if b & 0x80 == 0 {
                    break;
                }
            }
            let total = pos + len + 20;
            if self.buf.len() < total {
                return;
            }
            *self.counts.entry(cmd).or_default() += 1;
            self.buf.drain(..total);
        }
    }

    fn count(&self, cmd: u8) -> usize {
        self.counts.get(&cmd).copied().unwrap_or(0)
    }
}

const REFINE: u8 = 6;
const DONE: u8 = 7;
const DATA: u8 = 10;
const DELTA: u8 = 11;
const CONFIRM: u8 = 5;
const BYE: u8 = 1;

struct Pump {
    client_sent: Sniffer,
    server_sent: Sniffer,
    corrupt_first_server_chunk: bool,
}

impl Pump {
    fn new() -> Pump {
        Pump {
            client_sent: Sniffer::default(),
            server_sent: Sniffer::default(),
            corrupt_first_server_chunk: false,
        }
    }

    fn run(&mut self, client: &mut Sess, server: &mut Sess) {
        for _ in 0..200_000 {
            let mut progress = false;
            progress |= client.step();
            while let Some(chunk) = client.peek_out().map(|c| c.to_vec()) {
                client.consumed(chunk.len());
                self.client_sent.feed(&chunk);
                server.receive_bytes(&chunk);
                progress = true;
            }
            progress |= server.step();
            while let Some(chunk) = server.peek_out().map(|c| c.to_vec()) {
                server.consumed(chunk.len());
                let mut chunk = chunk;
                if self.corrupt_first_server_chunk {
                    self.corrupt_first_server_chunk = false;
                    let n = chunk.len().min(11) - 1;
                    chunk[n] ^= 0x20;
                }
                self.server_sent.feed(&chunk);
                client.receive_bytes(&chunk);
                progress = true;
            }
            let client_done = client.finished_ok() || client.finished_failed();
            let server_done = server.finished_ok() || server.finished_failed();
            if client_done && server_done && !progress {
                return;
            }
        }
        panic!(
            "sessions did not converge: client ok={} failed={}, server ok={} failed={}",
            client.finished_ok(),
            client.finished_failed(),
            server.finished_ok(),
            server.finished_failed()
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn make_pair(
    client_store: MemStore,
    server_store: MemStore,
    client_role: Role,
    server_role: Role,
    client_keys: SealedKeys,
    server_policy: StandardPolicy,
    preload_client_key: bool,
) -> (Sess, Sess, SharedStore, SharedStore) {
    let mut server_store = server_store;
    if preload_client_key {
        if let Some(pk) = client_keys.local_pub() {
            server_store.add_key(&pk).unwrap();
        }
    }
    let cdb = SharedStore::new(client_store);
    let sdb = SharedStore::new(server_store);
    let client = Session::new_client(
        SessionConfig {
            role: client_role,
            include: "*".into(),
            exclude: String::new(),
        },
        cdb.clone(),
        client_keys,
        StandardPolicy::new(),
        "server:4691".into(),
    )
    .unwrap();
    let mut server = Session::new_server(
        SessionConfig {
            role: server_role,
            include: "*".into(),
            exclude: String::new(),
        },
        sdb.clone(),
        server_keys(),
        server_policy,
        "client:9999".into(),
    )
    .unwrap();
    server.begin_service().unwrap();
    (client, server, cdb, sdb)
}

fn count_objects(db: &SharedStore, ty: ObjectType) -> usize {
    db.with(|s| s.object_count(ty))
}

// ---------------------------------------------------------------------
// Scenarios.

#[test]
fn test_empty_vs_empty() {
    let (mut client, mut server, cdb, sdb) = make_pair(
        MemStore::new(),
        MemStore::new(),
        Role::SourceAndSink,
        Role::SourceAndSink,
        client_keys(),
        StandardPolicy::new(),
        true,
    );
    let mut pump = Pump::new();
    pump.run(&mut client, &mut server);

    assert!(client.finished_ok());
    assert!(server.finished_ok());

    // Four tries, each: one root query and one root response per
    // direction, one done per direction; then goodbyes.
    for sent in [&pump.client_sent, &pump.server_sent] {
        assert_eq!(sent.count(REFINE), 8);
        assert_eq!(sent.count(DONE), 4);
        assert_eq!(sent.count(DATA), 0);
        assert_eq!(sent.count(DELTA), 0);
        assert_eq!(sent.count(BYE), 1);
    }
    assert_eq!(count_objects(&cdb, ObjectType::Revision), 0);
    assert_eq!(count_objects(&sdb, ObjectType::Revision), 0);
}

#[test]
fn test_one_sided_pull_anonymous() {
    // Server has three revisions, anonymous sink client has the first
    // two; afterwards the client has all three and the server is
    // untouched.
    let (server_store, _) = build_chain("main", &["one", "two", "three"]);
    let (client_store, _) = build_chain("main", &["one", "two"]);

    let (mut client, mut server, cdb, sdb) = make_pair(
        client_store,
        server_store,
        Role::Sink,
        Role::SourceAndSink,
        SealedKeys::anonymous(),
        StandardPolicy::new(),
        false,
    );
    let mut pump = Pump::new();
    pump.run(&mut client, &mut server);

    assert!(client.finished_ok(), "client: {:?}", client.remote_error());
    assert!(server.finished_ok());

    assert_eq!(count_objects(&cdb, ObjectType::Revision), 3);
    assert_eq!(count_objects(&cdb, ObjectType::Cert), 3);
    assert_eq!(count_objects(&cdb, ObjectType::File), 3);
    assert_eq!(count_objects(&sdb, ObjectType::Revision), 3);

    // Exactly one new revision and one new cert travel as data; the
    // third file rides as a delta against the second.
    assert_eq!(pump.server_sent.count(DATA), 2);
    assert_eq!(pump.server_sent.count(DELTA), 1);
    assert_eq!(pump.client_sent.count(DATA), 0);
    assert_eq!(pump.client_sent.count(DELTA), 0);
}

#[test]
fn test_symmetric_difference_push_pull() {
    // One shared root; each side has its own child revision. Both end
    // up with all three.
    let (base, revs) = build_chain("main", &["base"]);
    let mut server_store = base.clone();
    let mut client_store = base;
    grow(&mut server_store, "main", Some(revs[0]), &texts(&["server side"]));
    grow(&mut client_store, "main", Some(revs[0]), &texts(&["client side"]));

    let (mut client, mut server, cdb, sdb) = make_pair(
        client_store,
        server_store,
        Role::SourceAndSink,
        Role::SourceAndSink,
        client_keys(),
        StandardPolicy::new(),
        true,
    );
    let mut pump = Pump::new();
    pump.run(&mut client, &mut server);

    assert!(client.finished_ok(), "client: {:?}", client.remote_error());
    assert!(server.finished_ok(), "server: {:?}", server.remote_error());

    for db in [&cdb, &sdb] {
        assert_eq!(count_objects(db, ObjectType::Revision), 3);
        assert_eq!(count_objects(db, ObjectType::Cert), 3);
        assert_eq!(count_objects(db, ObjectType::File), 3);
    }
    // Revision + cert as data in each direction (files travel as
    // deltas against the shared base).
    assert_eq!(pump.server_sent.count(DATA), 2);
    assert_eq!(pump.client_sent.count(DATA), 2);
    assert_eq!(pump.server_sent.count(DELTA), 1);
    assert_eq!(pump.client_sent.count(DELTA), 1);
}

#[test]
fn test_large_shared_core_stays_sublinear() {
    // A thousand shared revisions and one unique head on each side.
    // Refinement must descend only along the unshared paths.
    let shared: Vec<String> = (0..1000).map(|i| format!("text {}", i)).collect();
    let shared_refs: Vec<&str> = shared.iter().map(|s| s.as_str()).collect();
    let (base, revs) = build_chain("main", &shared_refs);
    let head = revs[revs.len() - 1];
    let mut server_store = base.clone();
    let mut client_store = base;
    grow(&mut server_store, "main", Some(head), &texts(&["server extra"]));
    grow(&mut client_store, "main", Some(head), &texts(&["client extra"]));

    let (mut client, mut server, cdb, sdb) = make_pair(
        client_store,
        server_store,
        Role::SourceAndSink,
        Role::SourceAndSink,
        client_keys(),
        StandardPolicy::new(),
        true,
    );
    let mut pump = Pump::new();
    pump.run(&mut client, &mut server);

    assert!(client.finished_ok(), "client: {:?}", client.remote_error());
    assert!(server.finished_ok());
    assert_eq!(count_objects(&cdb, ObjectType::Revision), 1002);
    assert_eq!(count_objects(&sdb, ObjectType::Revision), 1002);

    let refines = pump.client_sent.count(REFINE) + pump.server_sent.count(REFINE);
    assert!(
        refines < 200,
        "refinement took {} messages for a 2-item difference",
        refines
    );
}

#[test]
fn test_access_denied_names_the_branch() {
    let (server_store, _) = build_chain("main", &["one"]);
    let mut server_store = server_store;
    use tideway_store::EpochStore as _;
    server_store.set_epoch("restricted", TEST_EPOCH).unwrap();
    grow(&mut server_store, "restricted", None, &texts(&["secret"]));

    let policy = StandardPolicy::new()
        .deny_read(&["restricted".into()])
        .unwrap();
    let (mut client, mut server, cdb, _sdb) = make_pair(
        MemStore::new(),
        server_store,
        Role::Sink,
        Role::SourceAndSink,
        client_keys(),
        policy,
        true,
    );
    let mut pump = Pump::new();
    pump.run(&mut client, &mut server);

    assert!(client.finished_failed());
    assert_eq!(
        client.remote_error(),
        Some("access to branch 'restricted' denied by server")
    );
    // No confirm was ever sent, and nothing was transferred.
    assert_eq!(pump.server_sent.count(CONFIRM), 0);
    assert_eq!(pump.server_sent.count(DATA), 0);
    assert_eq!(count_objects(&cdb, ObjectType::Revision), 0);
}

#[test]
fn test_epoch_mismatch_aborts_before_any_write() {
    let (server_store, _) = build_chain("main", &["one", "two"]);
    let (mut client_store, _) = build_chain("main", &["one"]);
    use tideway_store::EpochStore as _;
    client_store.set_epoch("main", [9; 20]).unwrap();

    let (mut client, mut server, cdb, _sdb) = make_pair(
        client_store,
        server_store,
        Role::SourceAndSink,
        Role::SourceAndSink,
        client_keys(),
        StandardPolicy::new(),
        true,
    );
    let mut pump = Pump::new();
    pump.run(&mut client, &mut server);

    // Whichever side saw the foreign epoch first aborted; the error
    // names the branch and both epochs.
    let msg = client
        .remote_error()
        .or_else(|| server.remote_error())
        .expect("one side reports the mismatch");
    assert!(msg.contains("mismatched epoch on branch 'main'"), "{}", msg);
    assert!(msg.contains(&hex::encode(TEST_EPOCH)), "{}", msg);
    assert!(msg.contains(&hex::encode([9u8; 20])), "{}", msg);

    // The second revision never reached the client.
    assert_eq!(count_objects(&cdb, ObjectType::Revision), 1);
    assert_eq!(count_objects(&cdb, ObjectType::Epoch), 1);
    assert_eq!(cdb.with(|s| s.epoch_of("main")), Some([9; 20]));
}

#[test]
fn test_tampered_byte_kills_the_stream() {
    let (server_store, _) = build_chain("main", &["one"]);
    let (mut client, mut server, _cdb, _sdb) = make_pair(
        MemStore::new(),
        server_store,
        Role::Sink,
        Role::SourceAndSink,
        client_keys(),
        StandardPolicy::new(),
        true,
    );
    let mut pump = Pump::new();
    pump.corrupt_first_server_chunk = true;
    pump.run(&mut client, &mut server);

    // The client rejected the very first damaged frame and the server
    // heard about it.
    assert!(client.finished_failed());
    assert!(server.finished_failed());
    let msg = server.remote_error().expect("server sees the decode error");
    assert!(msg.contains("mac check failed"), "{}", msg);
}

#[test]
fn test_second_sync_is_quiet() {
    let (server_store, _) = build_chain("main", &["one", "two", "three"]);
    let (client_store, _) = build_chain("main", &["one"]);

    let (mut client, mut server, cdb, sdb) = make_pair(
        client_store,
        server_store,
        Role::SourceAndSink,
        Role::SourceAndSink,
        client_keys(),
        StandardPolicy::new(),
        true,
    );
    Pump::new().run(&mut client, &mut server);
    assert!(client.finished_ok() && server.finished_ok());
    assert_eq!(count_objects(&cdb, ObjectType::Revision), 3);

    // Run a fresh session between the now-identical stores: only root
    // exchanges and dones, no data at all.
    let client_store = cdb.with(|s| s.clone());
    let server_store = sdb.with(|s| s.clone());
    let (mut client2, mut server2, _cdb2, _sdb2) = make_pair(
        client_store,
        server_store,
        Role::SourceAndSink,
        Role::SourceAndSink,
        client_keys(),
        StandardPolicy::new(),
        true,
    );
    let mut pump = Pump::new();
    pump.run(&mut client2, &mut server2);
    assert!(client2.finished_ok() && server2.finished_ok());
    for sent in [&pump.client_sent, &pump.server_sent] {
        assert_eq!(sent.count(DATA), 0);
        assert_eq!(sent.count(DELTA), 0);
        assert_eq!(sent.count(REFINE), 8);
    }
}

#[test]
fn test_changed_server_key_is_fatal() {
    // First contact records the key; a different server key on the
    // next session must abort the client.
    let policy = StandardPolicy::new();
    let cdb = SharedStore::new(MemStore::new());

    let mut client = Session::new_client(
        SessionConfig {
            role: Role::Sink,
            include: "*".into(),
            exclude: String::new(),
        },
        cdb.clone(),
        SealedKeys::anonymous(),
        policy.clone(),
        "server:4691".into(),
    )
    .unwrap();
    let sdb = SharedStore::new(MemStore::new());
    let mut server = Session::new_server(
        SessionConfig {
            role: Role::SourceAndSink,
            include: "*".into(),
            exclude: String::new(),
        },
        sdb.clone(),
        server_keys(),
        StandardPolicy::new(),
        "client:9999".into(),
    )
    .unwrap();
    server.begin_service().unwrap();

    // Capture the policy state after the first exchange by reusing the
    // same policy object for the second client. PolicyHooks are owned
    // by the session, so thread the record through manually.
    let mut pump = Pump::new();
    pump.run(&mut client, &mut server);
    assert!(client.finished_ok());

    // Second session: same peer address, different server identity.
    let mut recorded = StandardPolicy::new();
    use tideway_store::PolicyHooks as _;
    let first_fp = server_keys().local_pub().unwrap().id();
    recorded.remember_server_key("server:4691", &first_fp).unwrap();

    let mut client2 = Session::new_client(
        SessionConfig {
            role: Role::Sink,
            include: "*".into(),
            exclude: String::new(),
        },
        cdb.clone(),
        SealedKeys::anonymous(),
        recorded,
        "server:4691".into(),
    )
    .unwrap();
    let mut server2 = Session::new_server(
        SessionConfig {
            role: Role::SourceAndSink,
            include: "*".into(),
            exclude: String::new(),
        },
        sdb,
        SealedKeys::from_seed("server@test", [3; 32]),
        StandardPolicy::new(),
        "client:9999".into(),
    )
    .unwrap();
    server2.begin_service().unwrap();
    let mut pump2 = Pump::new();
    pump2.run(&mut client2, &mut server2);

    assert!(client2.finished_failed());
    assert_eq!(pump2.server_sent.count(CONFIRM), 0);
    let msg = server2.remote_error().expect("server hears the refusal");
    assert!(msg.contains("server key changed"), "{}", msg);
}

// ---------------------------------------------------------------------
// Real sockets.

#[test(tokio::test)]
async fn test_sync_over_tcp() {
    let (server_store, _) = build_chain("main", &["one", "two"]);
    let (client_store, _) = build_chain("main", &["one"]);
    let sdb = SharedStore::new(server_store);
    let cdb = SharedStore::new(client_store);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cfg = ServeConfig {
        listen: addr.clone(),
        role: Role::SourceAndSink,
        include: "*".into(),
        exclude: String::new(),
        idle_timeout: Duration::from_secs(30),
        session_limit: 4,
        disabled: false,
    };
    let server = tokio::spawn(serve_on(
        listener,
        cfg,
        sdb.clone(),
        server_keys(),
        StandardPolicy::new(),
    ));

    call_server(
        &addr,
        SessionConfig {
            role: Role::Sink,
            include: "*".into(),
            exclude: String::new(),
        },
        cdb.clone(),
        SealedKeys::anonymous(),
        StandardPolicy::new(),
        Duration::from_secs(30),
    )
    .await
    .unwrap();

    assert_eq!(cdb.with(|s| s.object_count(ObjectType::Revision)), 2);
    server.abort();
}

#[test(tokio::test)]
async fn test_disabled_server_turns_clients_away() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cfg = ServeConfig {
        listen: addr.clone(),
        role: Role::SourceAndSink,
        include: "*".into(),
        exclude: String::new(),
        idle_timeout: Duration::from_secs(30),
        session_limit: 4,
        disabled: true,
    };
    let server = tokio::spawn(serve_on(
        listener,
        cfg,
        SharedStore::new(MemStore::new()),
        server_keys(),
        StandardPolicy::new(),
    ));

    let err = call_server(
        &addr,
        SessionConfig {
            role: Role::Sink,
            include: "*".into(),
            exclude: String::new(),
        },
        SharedStore::new(MemStore::new()),
        SealedKeys::anonymous(),
        StandardPolicy::new(),
        Duration::from_secs(30),
    )
    .await
    .unwrap_err();
    assert!(format!("{:?}", err).contains("service temporarily disabled"));
    server.abort();
}
