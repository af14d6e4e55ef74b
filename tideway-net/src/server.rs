use crate::driver::drive;
use crate::session::{Session, SessionConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tideway_base::{Result, Role};
use tideway_store::{Database, KeyStore, PolicyHooks};
use tideway_wire::{ChainedHmac, Netcmd};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub listen: String,
    pub role: Role,
    pub include: String,
    pub exclude: String,
    pub idle_timeout: Duration,
    pub session_limit: usize,
    /// Accept connections but turn every one away with a polite error
    /// frame. Lets an operator drain a server without hard resets.
    pub disabled: bool,
}

/// Accept connections forever, one independent session per client.
/// Sessions over the limit (or while disabled) get a single error
/// frame and a close rather than a silent hangup.
pub async fn serve<D, K, P>(cfg: ServeConfig, db: D, keys: K, policy: P) -> Result<()>
where
    D: Database + Clone + Send + 'static,
    K: KeyStore + Clone + Send + 'static,
    P: PolicyHooks + Clone + Send + 'static,
{
    let listener = TcpListener::bind(&cfg.listen).await?;
    serve_on(listener, cfg, db, keys, policy).await
}

/// As `serve`, on an already-bound listener.
pub async fn serve_on<D, K, P>(
    listener: TcpListener,
    cfg: ServeConfig,
    db: D,
    keys: K,
    policy: P,
) -> Result<()>
where
    D: Database + Clone + Send + 'static,
    K: KeyStore + Clone + Send + 'static,
    P: PolicyHooks + Clone + Send + 'static,
{
    info!(target: "tideway", addr = cfg.listen.as_str(), role = %cfg.role,
          "beginning service");
    let live = Arc::new(AtomicUsize::new(0));

    loop {
        let (stream, addr) = listener.accept().await?;
        let peer = addr.to_string();

        if cfg.disabled {
            refuse(stream, &peer, "service temporarily disabled").await;
            continue;
        }
        if live.load(Ordering::SeqCst) >= cfg.session_limit {
            warn!(target: "tideway", limit = cfg.session_limit,
                  "session limit reached, refusing new connection");
            refuse(stream, &peer, "too many connections").await;
            continue;
        }

        info!(target: "tideway", peer = peer.as_str(), "accepted new client connection");
        let session_cfg = SessionConfig {
            role: cfg.role,
            include: cfg.include.clone(),
            exclude: cfg.exclude.clone(),
        };
        let (db, keys, policy) = (db.clone(), keys.clone(), policy.clone());
        let idle = cfg.idle_timeout;
        let live = live.clone();
        live.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let res = async {
                let mut sess = Session::new_server(session_cfg, db, keys, policy, peer.clone())?;
                sess.begin_service()?;
                drive(&mut sess, stream, idle).await
            }
            .await;
            if let Err(e) = res {
                warn!(target: "tideway", peer = peer.as_str(), "session ended: {:?}", e);
            }
            live.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// One error frame under the initial (all-zero) HMAC key, then close.
async fn refuse(mut stream: TcpStream, peer: &str, msg: &str) {
    let mut hmac = ChainedHmac::new();
    let mut buf = Vec::new();
    Netcmd::Error {
        msg: msg.to_string(),
    }
    .write(&mut buf, &mut hmac);
    if let Err(e) = stream.write_all(&buf).await {
        warn!(target: "tideway", peer, "failed to send refusal: {}", e);
    }
    let _ = stream.shutdown().await;
}
