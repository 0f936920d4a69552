use crate::relay_spool::SpoolError;
use protocol::errors::{IdentityError, RatchetError, SessionError};
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum ServerError {
    Session(SessionError),
    Ratchet(RatchetError),
    Identity(IdentityError),
    Io(std::io::Error),
    AccountNotFound,
    AccountAlreadyExists,
    AccountDisabled,
    InvalidRequest,
    AlreadyOnline,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Session(e) => write!(f, "session error: {}", e),
            ServerError::Ratchet(e) => write!(f, "ratchet error: {}", e),
            ServerError::Identity(e) => write!(f, "identity error: {}", e),
            ServerError::Io(e) => write!(f, "io error: {}", e),
            ServerError::AccountNotFound => write!(f, "account not found"),
            ServerError::AccountAlreadyExists => write!(f, "account already exists"),
            ServerError::AccountDisabled => write!(f, "account disabled"),
            ServerError::InvalidRequest => write!(f, "invalid request"),
            ServerError::AlreadyOnline => write!(f, "account already online"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<SessionError> for ServerError {
    fn from(value: SessionError) -> Self {
        ServerError::Session(value)
    }
}

impl From<RatchetError> for ServerError {
    fn from(value: RatchetError) -> Self {
        ServerError::Ratchet(value)
    }
}

impl From<IdentityError> for ServerError {
    fn from(value: IdentityError) -> Self {
        ServerError::Identity(value)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        ServerError::Io(value)
    }
}

impl From<SpoolError> for ServerError {
    fn from(value: SpoolError) -> Self {
        match value {
            SpoolError::Io(e) => ServerError::Io(e),
            SpoolError::AlreadyOnline => ServerError::AlreadyOnline,
        }
    }
}
