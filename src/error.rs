//! Error types for the IDE protocol client.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the protocol client.
///
/// These map to the failure modes of talking to a compiler subprocess:
/// malformed wire data, missed deadlines, and a dead or unstartable process.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unexpected token in a packet.
    ///
    /// Localized to the current decode; the connection remains usable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No response arrived within the deadline.
    ///
    /// Recoverable; the caller may retry. A late response is delivered to a
    /// discarded handler and ignored.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The compiler subprocess failed to start or died.
    ///
    /// The next call lazily respawns it, discarding all tracked parse trees.
    #[error("compiler process error: {0}")]
    Process(String),

    /// A compile was requested while another is still in flight.
    ///
    /// Deliberate backpressure: the request is rejected immediately, never
    /// queued. Callers should check in-flight state before retrying.
    #[error("a compile is already in progress")]
    CompileInProgress,

    /// A node query was issued for a file with no successful compile on record.
    #[error("no parse tree recorded for {}", .0.display())]
    NoParseTree(PathBuf),
}

impl Error {
    /// Shorthand for a protocol error with a formatted message.
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
