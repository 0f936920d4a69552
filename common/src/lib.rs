//! Ambient concerns shared by the server and client binaries: configuration loading
//! and process-wide logging initialization. The cryptographic core lives entirely in
//! `protocol`; this crate carries no wire-format or key-handling code.

pub mod config;
pub mod errors;
pub mod logging;
