use crate::driver::drive;
use crate::session::{Session, SessionConfig};
use std::time::Duration;
use tideway_base::Result;
use tideway_store::{Database, KeyStore, PolicyHooks};
use tokio::net::TcpStream;
use tracing::info;

/// Dial a server, run one full exchange, and return once both sides
/// have said goodbye, or with the error the exchange died on. The
/// text of a remote `error` frame is reported verbatim.
pub async fn call_server<D, K, P>(
    addr: &str,
    cfg: SessionConfig,
    db: D,
    keys: K,
    policy: P,
    idle_timeout: Duration,
) -> Result<()>
where
    D: Database,
    K: KeyStore,
    P: PolicyHooks,
{
    info!(target: "tideway", addr, "connecting");
    let stream = TcpStream::connect(addr).await?;
    let mut sess = Session::new_client(cfg, db, keys, policy, addr.to_string())?;
    drive(&mut sess, stream, idle_timeout).await
}
