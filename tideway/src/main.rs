// Top level client-or-server executable. All the interesting machinery
// lives in the library crates; this just wires a database directory, a
// keystore and a policy onto the session drivers.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tideway_base::{err, ObjectType, Result, Role};
use tideway_net::{call_server, serve, ServeConfig, SessionConfig};
use tideway_store::{
    AncestryProvider as _, Cert, EpochStore as _, FileEntry, KeyStore as _, MemStore,
    ObjectStore as _, Revision, SealedKeys, SharedStore, StandardPolicy, BRANCH_CERT,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "tideway", about = "merkle-trie peer-to-peer synchronization", version)]
struct Cli {
    /// Database directory.
    #[arg(long, global = true, default_value = ".tideway")]
    db: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliRole {
    Source,
    Sink,
    Both,
}

impl From<CliRole> for Role {
    fn from(r: CliRole) -> Role {
        match r {
            CliRole::Source => Role::Source,
            CliRole::Sink => Role::Sink,
            CliRole::Both => Role::SourceAndSink,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a fresh database directory and signing identity.
    Init {
        /// Name for the new signing key.
        #[arg(long, default_value = "tideway")]
        key_name: String,
    },
    /// Record files as a new revision on a branch.
    Add {
        #[arg(long)]
        branch: String,
        files: Vec<PathBuf>,
    },
    /// Show what the database holds.
    Info,
    /// Serve the database to the network.
    Serve {
        #[arg(long, default_value_t = format!("0.0.0.0:{}", tideway_net::DEFAULT_PORT))]
        listen: String,
        #[arg(long, value_enum, default_value_t = CliRole::Both)]
        role: CliRole,
        #[arg(long, default_value = "*")]
        include: String,
        #[arg(long, default_value = "")]
        exclude: String,
        /// Branch patterns to refuse read access to.
        #[arg(long)]
        deny_read: Vec<String>,
        #[arg(long, default_value_t = tideway_net::DEFAULT_IDLE_TIMEOUT_SECS)]
        timeout: u64,
        #[arg(long, default_value_t = tideway_net::DEFAULT_SESSION_LIMIT)]
        session_limit: usize,
        /// Turn every connection away with a polite error.
        #[arg(long)]
        disabled: bool,
    },
    /// Exchange objects with a server.
    Sync {
        addr: String,
        #[arg(long, value_enum, default_value_t = CliRole::Both)]
        role: CliRole,
        #[arg(long, default_value = "*")]
        include: String,
        #[arg(long, default_value = "")]
        exclude: String,
        #[arg(long, default_value_t = tideway_net::DEFAULT_IDLE_TIMEOUT_SECS)]
        timeout: u64,
    },
}

fn store_path(db: &Path) -> PathBuf {
    db.join("store.tw")
}

fn identity_path(db: &Path) -> PathBuf {
    db.join("identity.twk")
}

fn known_servers_path(db: &Path) -> PathBuf {
    db.join("known_servers.tw")
}

fn load_store(db: &Path) -> Result<MemStore> {
    let path = store_path(db);
    if !path.exists() {
        return Err(err(format!(
            "no database at {}; run 'tideway init' first",
            path.display()
        )));
    }
    MemStore::load(&path)
}

fn load_keys(db: &Path) -> Result<SealedKeys> {
    let path = identity_path(db);
    if path.exists() {
        SealedKeys::load(&path)
    } else {
        Ok(SealedKeys::anonymous())
    }
}

fn load_policy(db: &Path, deny_read: &[String]) -> Result<StandardPolicy> {
    let mut policy = StandardPolicy::new().with_known_servers_file(known_servers_path(db))?;
    if !deny_read.is_empty() {
        policy = policy.deny_read(deny_read)?;
    }
    Ok(policy)
}

fn cmd_init(db: &Path, key_name: &str) -> Result<()> {
    std::fs::create_dir_all(db)?;
    let store = store_path(db);
    if store.exists() {
        return Err(err(format!("{} already exists", store.display())));
    }
    MemStore::new().save(&store)?;
    let keys = SealedKeys::generate(key_name);
    keys.save(&identity_path(db))?;
    println!("initialized {} with key '{}'", db.display(), key_name);
    Ok(())
}

fn cmd_add(db: &Path, branch: &str, files: &[PathBuf]) -> Result<()> {
    if files.is_empty() {
        return Err(err("nothing to add"));
    }
    let mut store = load_store(db)?;
    let keys = SealedKeys::load(&identity_path(db))?;
    let local = keys.local_pub().ok_or_else(|| err("identity has no key"))?;
    store.add_key(&local)?;

    let parent = store.head_of(branch);
    let parent_rev = match &parent {
        Some(p) => {
            let bytes = store
                .get(ObjectType::Revision, p)
                .ok_or_else(|| err("branch head is missing"))?;
            Some(Revision::decode(&bytes)?)
        }
        None => None,
    };

    let mut entries = Vec::new();
    for (i, path) in files.iter().enumerate() {
        let bytes = std::fs::read(path)?;
        let file = store.add_file(&bytes);
        let base = parent_rev
            .as_ref()
            .and_then(|r| r.files.get(i))
            .map(|e| e.file);
        entries.push(FileEntry { file, base });
    }

    let rev = Revision {
        parents: parent.into_iter().collect(),
        files: entries,
    };
    let rid = store.add_revision(&rev)?;
    let mut cert = Cert {
        rev: rid,
        name: BRANCH_CERT.into(),
        value: branch.into(),
        key_id: local.id(),
        sig: Vec::new(),
    };
    cert.sig = keys.sign(&cert.encode()?)?;
    store.add_cert(&cert)?;
    store.save(&store_path(db))?;
    println!("committed {} to branch '{}'", rid, branch);
    Ok(())
}

fn cmd_info(db: &Path) -> Result<()> {
    let store = load_store(db)?;
    for ty in ObjectType::ALL {
        println!("{:>9}: {}", ty.as_str(), store.object_count(ty));
    }
    for branch in store.branches() {
        let head = store
            .head_of(&branch)
            .map(|h| h.to_string())
            .unwrap_or_else(|| "(no head)".into());
        let epoch = store
            .epoch_of(&branch)
            .map(hex::encode)
            .unwrap_or_else(|| "(none)".into());
        println!("branch '{}': head {}, epoch {}", branch, head, epoch);
    }
    Ok(())
}

async fn cmd_serve(db: &Path, cfg: ServeConfig, deny_read: &[String]) -> Result<()> {
    let store = SharedStore::new(load_store(db)?);
    let keys = SealedKeys::load(&identity_path(db))
        .map_err(|_| err("serving requires an identity; run 'tideway init' first"))?;
    let policy = load_policy(db, deny_read)?;

    let save_store = store.clone();
    let save_path = store_path(db);
    let res = tokio::select! {
        r = serve(cfg, store, keys, policy) => r,
        _ = tokio::signal::ctrl_c() => {
            info!(target: "tideway", "interrupted; saving database");
            Ok(())
        }
    };
    save_store.with(|s| s.save(&save_path))?;
    res
}

async fn cmd_sync(
    db: &Path,
    addr: &str,
    cfg: SessionConfig,
    timeout: u64,
) -> Result<()> {
    let store = SharedStore::new(load_store(db)?);
    let keys = load_keys(db)?;
    let policy = load_policy(db, &[])?;

    let res = call_server(
        addr,
        cfg,
        store.clone(),
        keys,
        policy,
        Duration::from_secs(timeout),
    )
    .await;
    store.with(|s| s.save(&store_path(db)))?;
    res
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Init { key_name } => cmd_init(&cli.db, &key_name),
        Cmd::Add { branch, files } => cmd_add(&cli.db, &branch, &files),
        Cmd::Info => cmd_info(&cli.db),
        Cmd::Serve {
            listen,
            role,
            include,
            exclude,
            deny_read,
            timeout,
            session_limit,
            disabled,
        } => {
            let cfg = ServeConfig {
                listen,
                role: role.into(),
                include,
                exclude,
                idle_timeout: Duration::from_secs(timeout),
                session_limit,
                disabled,
            };
            cmd_serve(&cli.db, cfg, &deny_read).await
        }
        Cmd::Sync {
            addr,
            role,
            include,
            exclude,
            timeout,
        } => {
            let cfg = SessionConfig {
                role: role.into(),
                include,
                exclude,
            };
            cmd_sync(&cli.db, &addr, cfg, timeout).await
        }
    }
}
