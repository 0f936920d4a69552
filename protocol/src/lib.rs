//! Cryptographic core shared by the server and client binaries: long-lived identities,
//! the password-derived blob cipher used for out-of-band exchange, the double ratchet,
//! key exchange (SIGMA/X25519 and post-quantum ML-KEM variants), framed transport
//! sessions, and the tag pool that keeps outstanding requests addressable.

pub mod blob_cipher;
pub mod constants;
pub mod errors;
pub mod handshake;
pub mod identity;
pub mod kx;
pub mod presession;
pub mod ratchet;
pub mod session;
pub mod tag_stack;
pub mod wire;
