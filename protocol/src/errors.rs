//! Error kinds produced by the cryptographic core: key exchange, transport framing,
//! the double ratchet, the tag pool and the password-derived blob cipher.

use std::fmt::{Display, Formatter};

/// Errors raised by [`crate::blob_cipher::BlobCipher`].
#[derive(Debug)]
pub enum BlobCipherError {
    /// Authenticated open failed: tampering, wrong key, or truncation. Never distinguishes
    /// which.
    DecryptFailure,
    /// `unpack_salt_nonce`/`unpack_nonce` received fewer bytes than the fixed prefix requires.
    Truncated,
}

impl Display for BlobCipherError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobCipherError::DecryptFailure => write!(f, "decrypt failure"),
            BlobCipherError::Truncated => write!(f, "truncated blob"),
        }
    }
}

impl std::error::Error for BlobCipherError {}

/// Errors raised by [`crate::identity`] marshal/verify operations.
#[derive(Debug)]
pub enum IdentityError {
    /// Signature did not verify over the recomputed digest.
    InvalidSignature,
    /// Deserialized structure had the wrong field lengths.
    MarshalError,
}

impl Display for IdentityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::InvalidSignature => write!(f, "invalid signature"),
            IdentityError::MarshalError => write!(f, "marshal error"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Errors raised during the client↔server key exchange and framed transport.
#[derive(Debug)]
pub enum SessionError {
    /// A handshake proof or small-subgroup point check failed; partial success is never
    /// allowed, so the connection must close.
    InvalidKx,
    /// `Read`/`Write` rejected a frame because it exceeded the configured payload cap.
    MessageTooLarge,
    /// A frame failed authenticated decryption.
    DecryptFailure,
    /// The 8-byte sequence counter wrapped; this is a fatal protocol error, not a retry.
    SequenceOverflow,
    /// Underlying I/O failure on the socket.
    Io(std::io::Error),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidKx => write!(f, "invalid key exchange"),
            SessionError::MessageTooLarge => write!(f, "message too large"),
            SessionError::DecryptFailure => write!(f, "decrypt failure"),
            SessionError::SequenceOverflow => write!(f, "sequence counter overflow"),
            SessionError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(value: std::io::Error) -> Self {
        SessionError::Io(value)
    }
}

/// Errors raised by [`crate::ratchet::Ratchet`].
#[derive(Debug)]
pub enum RatchetError {
    /// Decrypt exhausted saved keys, the current receive header key, and the next one.
    /// The caller must consider the ratchet wedged.
    RatchetError,
    /// The peer's DH public was zero, one, or all-ones.
    InvalidKx,
    /// The announced message number is further ahead than `MAX_SKIPS` permits.
    MaxSkipsExceeded,
    /// Snapshot (de)serialization failed.
    MarshalError,
    UnmarshalError,
    /// Wraps an HKDF expand failure, which can only happen on a malformed requested
    /// output length.
    KeyDerivation,
}

impl Display for RatchetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RatchetError::RatchetError => write!(f, "ratchet error"),
            RatchetError::InvalidKx => write!(f, "invalid key exchange"),
            RatchetError::MaxSkipsExceeded => write!(f, "max skips exceeded"),
            RatchetError::MarshalError => write!(f, "marshal error"),
            RatchetError::UnmarshalError => write!(f, "unmarshal error"),
            RatchetError::KeyDerivation => write!(f, "key derivation error"),
        }
    }
}

impl std::error::Error for RatchetError {}

impl From<hkdf::InvalidLength> for RatchetError {
    fn from(_: hkdf::InvalidLength) -> Self {
        RatchetError::KeyDerivation
    }
}

/// Errors raised by [`crate::tag_stack::TagStack`].
#[derive(Debug)]
pub enum TagStackError {
    Overflow,
    Underflow,
}

impl Display for TagStackError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TagStackError::Overflow => write!(f, "overflow"),
            TagStackError::Underflow => write!(f, "underflow"),
        }
    }
}

impl std::error::Error for TagStackError {}
