// One error type for the whole workspace, with one discipline: wrap
// at the point of failure, so that
//
// 1. every error picks up a backtrace where it first appears,
// 2. there is a single choke point to set a breakpoint on when
//    hunting any failure in the system, and
// 3. the error event hits the tracing stream exactly once, no matter
//    how many layers it propagates through afterwards.
//
// Protocol rules, policy refusals and the like have no underlying
// source error; they enter the same funnel as text via err().

use backtrace_error::DynBacktraceError;
use std::borrow::Cow;
use tracing::error;

#[cfg(test)]
use test_log::test;

#[derive(Debug)]
#[allow(dead_code)]
pub struct Error(DynBacktraceError);
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
        error!(target: "tideway", "{:?}", err);
        Error(DynBacktraceError::from(err))
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(err)
    }
}

/// A failure that is nothing but words: a refused request, a violated
/// protocol rule, a missing prerequisite.
struct Message(Cow<'static, str>);

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Message {
    #[allow(deprecated)]
    fn description(&self) -> &str {
        &self.0
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(Message(msg.into()))
}

#[test]
fn test_err_from_text() {
    let _err = err("refused for testing purposes");
    let _err = err(format!("{} items missing", 3));
}

#[test]
fn test_error_from_source() {
    fn io_fails() -> Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "socket fell over"))?;
        Ok(())
    }
    assert!(io_fails().is_err());
}
