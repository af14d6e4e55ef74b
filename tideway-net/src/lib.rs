// The top of the stack: sessions and the transports that drive them.
//
// A session is sans-io. Bytes go in through one queue and come out
// through another, and everything between (handshake, refinement,
// transmission, shutdown, error unwind) is synchronous state-machine
// code, so two sessions can be run against each other entirely in
// memory. The tokio drivers in server.rs and client.rs own the actual
// sockets and do nothing but move bytes and watch the idle clock.

mod client;
mod driver;
mod server;
mod session;

pub use client::call_server;
pub use server::{serve, serve_on, ServeConfig};
pub use session::{BranchMatcher, Session, SessionConfig};

pub const DEFAULT_PORT: u16 = 4691;

/// Read chunk size; also the unit the backpressure threshold is
/// denominated in.
pub const IO_BUF_LEN: usize = 4096;

/// When more than this is queued outbound, the session stops
/// dispatching and stops stepping the enumerator until the peer
/// drains some of it.
pub const OUTBUF_THROTTLE: usize = IO_BUF_LEN * 10;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 12 * 60 * 60;
pub const DEFAULT_SESSION_LIMIT: usize = 1024;
