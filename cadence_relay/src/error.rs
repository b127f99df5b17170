// Transport and session errors.
//
// These cover everything that can go wrong between a client and the
// server outside the lockstep rules themselves (those are
// `cadence_lockstep::LockstepError`, codes 1-99). Sync errors carry
// codes from 100 so the two spaces never collide when surfaced through
// the same `ClientEvent::Error`.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("transport closed")]
    TransportClosed,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("timed out waiting for server handshake")]
    HandshakeTimeout,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Stable numeric code, reported alongside the message in error
    /// events so game code can branch without string matching.
    pub fn code(&self) -> u32 {
        match self {
            Self::Connect { .. } => 100,
            Self::Io(_) => 101,
            Self::TransportClosed => 102,
            Self::Serialize(_) => 103,
            Self::Rejected(_) => 104,
            Self::HandshakeTimeout => 105,
            Self::Protocol(_) => 106,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(SyncError::TransportClosed.code(), 102);
        assert_eq!(SyncError::Rejected("full".into()).code(), 104);
        assert_eq!(SyncError::Protocol("bad roster".into()).code(), 106);
    }

    #[test]
    fn io_errors_convert() {
        let err: SyncError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err.code(), 101);
    }
}
