//! Ambient errors: configuration I/O and (de)serialization.

use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum CommonError {
    Io(std::io::Error),
    TomlDecode(toml::de::Error),
    TomlEncode(toml::ser::Error),
}

impl Display for CommonError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CommonError::Io(e) => write!(f, "io error: {}", e),
            CommonError::TomlDecode(e) => write!(f, "config decode error: {}", e),
            CommonError::TomlEncode(e) => write!(f, "config encode error: {}", e),
        }
    }
}

impl std::error::Error for CommonError {}

impl From<std::io::Error> for CommonError {
    fn from(value: std::io::Error) -> Self {
        CommonError::Io(value)
    }
}

impl From<toml::de::Error> for CommonError {
    fn from(value: toml::de::Error) -> Self {
        CommonError::TomlDecode(value)
    }
}

impl From<toml::ser::Error> for CommonError {
    fn from(value: toml::ser::Error) -> Self {
        CommonError::TomlEncode(value)
    }
}
