use crate::session::Session;
use crate::IO_BUF_LEN;
use std::time::Duration;
use tideway_base::{err, Result};
use tideway_store::{Database, KeyStore, PolicyHooks};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

// Writes are copied out of the session in bounded chunks so a huge
// data frame cannot monopolize the loop.
const WRITE_CHUNK: usize = IO_BUF_LEN * 16;

/// Move bytes between one socket and one session until the session
/// finishes, the peer hangs up, or the idle deadline passes. Reading
/// and writing stay concurrent; the idle clock is monotonic, and wall
/// time plays no part in session lifetime.
pub(crate) async fn drive<D, K, P>(
    sess: &mut Session<D, K, P>,
    stream: TcpStream,
    idle_timeout: Duration,
) -> Result<()>
where
    D: Database,
    K: KeyStore,
    P: PolicyHooks,
{
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = vec![0u8; IO_BUF_LEN];
    let mut last_io = Instant::now();

    loop {
        while sess.step() {}

        if sess.finished_ok() {
            let (bytes_in, bytes_out) = sess.byte_counts();
            info!(target: "tideway", peer = %sess.peer_id(),
                  bytes_in, bytes_out, "successful exchange");
            let _ = wr.shutdown().await;
            return Ok(());
        }
        if sess.finished_failed() {
            return Err(session_failure(sess));
        }

        let pending: Option<Vec<u8>> = sess
            .peek_out()
            .map(|b| b[..b.len().min(WRITE_CHUNK)].to_vec());
        let deadline = last_io + idle_timeout;

        tokio::select! {
            n = rd.read(&mut buf), if sess.wants_read() => {
                let n = n?;
                if n == 0 {
                    return handle_eof(sess);
                }
                last_io = Instant::now();
                sess.receive_bytes(&buf[..n]);
            }
            r = write_pending(&mut wr, &pending), if pending.is_some() => {
                let n = r?;
                last_io = Instant::now();
                sess.consumed(n);
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(err(format!(
                    "timed out waiting for I/O with peer {}, disconnecting",
                    sess.peer_id()
                )));
            }
        }
    }
}

async fn write_pending(
    wr: &mut tokio::net::tcp::OwnedWriteHalf,
    pending: &Option<Vec<u8>>,
) -> std::io::Result<usize> {
    let chunk = pending.as_deref().expect("branch guarded on pending");
    wr.write(chunk).await
}

fn handle_eof<D, K, P>(sess: &mut Session<D, K, P>) -> Result<()>
where
    D: Database,
    K: KeyStore,
    P: PolicyHooks,
{
    if sess.sent_goodbye() && !sess.encountered_error() {
        // Losing the connection after goodbye counts as success.
        debug!(target: "tideway", peer = %sess.peer_id(), "peer closed after goodbye");
        return Ok(());
    }
    if sess.encountered_error() {
        return Err(session_failure(sess));
    }
    Err(err(format!(
        "connection to {} closed before goodbye",
        sess.peer_id()
    )))
}

fn session_failure<D, K, P>(sess: &Session<D, K, P>) -> tideway_base::Error
where
    D: Database,
    K: KeyStore,
    P: PolicyHooks,
{
    match sess.remote_error() {
        Some(msg) => err(format!("network error: {}", msg)),
        None => err(format!("exchange with {} failed", sess.peer_id())),
    }
}
