//! Client-facing error type: wraps every `protocol` error kind the dispatch/IDKX layer
//! can surface, plus the handful of client-only failure modes (duplicate tags, a dead
//! keepalive, a welcome that fails the version/property checks).

use protocol::errors::{BlobCipherError, IdentityError, RatchetError, SessionError, TagStackError};
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum ClientError {
    Session(SessionError),
    Ratchet(RatchetError),
    Identity(IdentityError),
    BlobCipher(BlobCipherError),
    TagStack(TagStackError),
    Io(std::io::Error),
    /// The peer replied with a tag that was already outstanding.
    DuplicateTag,
    /// A request's tag never got a reply before the connection closed.
    NoReply,
    /// Two consecutive keepalive pings went unanswered.
    Timeout,
    /// The server's `Welcome` named a protocol version this client doesn't speak.
    VersionMismatch { expected: u32, got: u32 },
    /// No rendezvous blob key this client still holds opened the pushed IdentityKX.
    NoMatchingRendezvousKey,
    /// The peer's claimed identity in an IDKX step was our own.
    SelfBootstrap,
    /// A ratchet for this peer already exists where none was expected, or vice versa.
    RatchetStateMismatch,
    /// No ratchet on file for this peer.
    UnknownPeer,
    Protocol(String),
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Session(e) => write!(f, "session error: {}", e),
            ClientError::Ratchet(e) => write!(f, "ratchet error: {}", e),
            ClientError::Identity(e) => write!(f, "identity error: {}", e),
            ClientError::BlobCipher(e) => write!(f, "blob cipher error: {}", e),
            ClientError::TagStack(e) => write!(f, "tag pool error: {}", e),
            ClientError::Io(e) => write!(f, "io error: {}", e),
            ClientError::DuplicateTag => write!(f, "duplicate inbound tag"),
            ClientError::NoReply => write!(f, "no reply for outstanding tag"),
            ClientError::Timeout => write!(f, "keepalive timed out"),
            ClientError::VersionMismatch { expected, got } => {
                write!(f, "protocol version mismatch: expected {}, server said {}", expected, got)
            }
            ClientError::NoMatchingRendezvousKey => write!(f, "no pending rendezvous key opened this push"),
            ClientError::SelfBootstrap => write!(f, "peer identity in bootstrap was our own"),
            ClientError::RatchetStateMismatch => write!(f, "unexpected ratchet state for this peer"),
            ClientError::UnknownPeer => write!(f, "no ratchet on file for this peer"),
            ClientError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<SessionError> for ClientError {
    fn from(value: SessionError) -> Self {
        ClientError::Session(value)
    }
}

impl From<RatchetError> for ClientError {
    fn from(value: RatchetError) -> Self {
        ClientError::Ratchet(value)
    }
}

impl From<IdentityError> for ClientError {
    fn from(value: IdentityError) -> Self {
        ClientError::Identity(value)
    }
}

impl From<BlobCipherError> for ClientError {
    fn from(value: BlobCipherError) -> Self {
        ClientError::BlobCipher(value)
    }
}

impl From<TagStackError> for ClientError {
    fn from(value: TagStackError) -> Self {
        ClientError::TagStack(value)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        ClientError::Io(value)
    }
}
