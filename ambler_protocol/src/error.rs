// Error taxonomy for the protocol engine.
//
// Every fallible operation in the workspace that touches the wire returns
// `ProtocolError`. The variants fall in two groups:
// - Session-ending faults: `MalformedValue`, `ProtocolViolation`,
//   `ConnectionLost`. Never retried; the caller disconnects.
// - Expected refusals: `NegotiationFailed`, `SessionDenied`. The peer is
//   healthy and declined; `is_refusal()` lets callers tell the two apart.
// `PeerTerminated` reports a graceful Terminate from the other side.

use std::io;

use crate::types::{VariantFlags, VersionSet};

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Bytes that cannot be decoded, or a value that does not fit its wire type.
    #[error("malformed value: {0}")]
    MalformedValue(String),

    /// Well-formed bytes that break the protocol's rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Version/variant negotiation did not produce a common protocol.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(#[from] NegotiationFailure),

    /// The server declined the requested simulation.
    #[error("session denied by server")]
    SessionDenied,

    /// The peer sent Terminate.
    #[error("peer terminated the session")]
    PeerTerminated,

    /// Transport failure, including timeouts and unexpected end of stream.
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] io::Error),
}

impl ProtocolError {
    /// True when the peer declined rather than misbehaved.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            ProtocolError::NegotiationFailed(_) | ProtocolError::SessionDenied
        )
    }

    /// True for errors caused by bytes the peer put on the wire.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedValue(_) | ProtocolError::ProtocolViolation(_)
        )
    }
}

/// Why a handshake failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationFailure {
    #[error("bad magic {found:?}, expected {expected:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("no common protocol version (local {local}, peer {peer})")]
    NoCommonVersion { local: VersionSet, peer: VersionSet },

    #[error("server requires {flag} which the client does not support")]
    MissingVariant { flag: VariantFlags },

    #[error("peer chose version set {peer}, expected version {expected}")]
    VersionMismatch { expected: u8, peer: VersionSet },

    #[error("peer rejected the handshake")]
    PeerRejected,

    #[error("server rejected the state list")]
    StateListRejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_are_distinguished_from_faults() {
        assert!(ProtocolError::SessionDenied.is_refusal());
        assert!(ProtocolError::NegotiationFailed(NegotiationFailure::PeerRejected).is_refusal());
        assert!(!ProtocolError::ProtocolViolation("x".into()).is_refusal());
        assert!(ProtocolError::MalformedValue("x".into()).is_peer_fault());
        assert!(!ProtocolError::SessionDenied.is_peer_fault());
    }

    #[test]
    fn io_errors_become_connection_lost() {
        let err: ProtocolError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, ProtocolError::ConnectionLost(_)));
    }

    #[test]
    fn messages_are_readable() {
        let err = ProtocolError::NegotiationFailed(NegotiationFailure::MissingVariant {
            flag: VariantFlags::ADD_REMOVE,
        });
        assert_eq!(
            err.to_string(),
            "negotiation failed: server requires ADD_REMOVE which the client does not support"
        );
    }
}
