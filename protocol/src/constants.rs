// byte size of a Curve25519 private key
pub(crate) const CURVE25519_SECRET_LENGTH: usize = 32;
// byte size of a Curve25519 public key
pub(crate) const CURVE25519_PUBLIC_LENGTH: usize = CURVE25519_SECRET_LENGTH;

pub(crate) const SIGNATURE_LENGTH: usize = 64;
// byte size of a sha256 hash
pub(crate) const SHA256_HASH_LENGTH: usize = 32;
// byte size of an aes256 key
pub(crate) const AES256_SECRET_LENGTH: usize = 32;
// byte size of aes256-gcm nonce used for ratchet message bodies
pub(crate) const AES256_NONCE_LENGTH: usize = 12;

/// Scrypt salt length (see `BlobCipher` parameters).
pub const SCRYPT_SALT_LENGTH: usize = 32;
/// secretbox nonce length.
pub const SECRETBOX_NONCE_LENGTH: usize = 24;
/// secretbox key length.
pub const SECRETBOX_KEY_LENGTH: usize = 32;

/// Default scrypt work factor, (log2(N), r, p).
pub const SCRYPT_DEFAULT: (u8, u32, u32) = (14, 8, 1); // N = 2^14 = 16384
/// Hardened scrypt work factor used for rendezvous blobs.
pub const SCRYPT_HARDENED: (u8, u32, u32) = (15, 16, 2); // N = 2^15 = 32768

/// Out-of-order ratchet skip window, per chain.
pub const MAX_SKIPS: u64 = 2000;

/// Default saved-key lifetime before TTL expiry on marshal.
pub const SAVED_KEY_LIFETIME_SECS: u64 = 31 * 24 * 60 * 60;

/// Tag pool depth.
pub const TAG_DEPTH_DEFAULT: u32 = 10;
pub const TAG_DEPTH_CAP: u32 = 32;

/// Default transport parameters.
pub const MAX_ATTACHMENT_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;
pub const MAX_MESSAGE_SIZE: usize = MAX_CHUNK_SIZE + 1024;

/// Rendezvous PIN lifetime ceiling, in hours.
pub const RENDEZVOUS_MAX_TTL_HOURS: u64 = 168;

/// Ephemeral KEM keypair rotation interval, in seconds.
pub const EPHEMERAL_ROTATION_SECS: u64 = 60;

/// Current protocol version announced in `welcome`.
pub const PROTOCOL_VERSION: u32 = 8;

/// Keepalive ping interval on write idleness, in seconds.
pub const KEEPALIVE_PING_SECS: u64 = 5;

/// Byte length of the per-frame sequence counter prefixed to every transport frame.
pub const SEQUENCE_LENGTH: usize = 24;

/// Byte length of the length prefix on a sealed transport frame.
pub const FRAME_LENGTH_PREFIX: usize = 4;
