//! Password → key derivation and authenticated symmetric sealing used to exchange
//! long-lived identities out of band (rendezvous blobs) and to persist local secrets.
//!
//! Every `decrypt` is constant-time on the tag check and cheap on the negative path
//! except for the scrypt cost, which is paid once per key — the three-step identity
//! exchange trial-decrypts against every live key it holds (see `client::idkx`).

use crate::constants::{SCRYPT_DEFAULT, SCRYPT_HARDENED, SCRYPT_SALT_LENGTH, SECRETBOX_KEY_LENGTH, SECRETBOX_NONCE_LENGTH};
use crate::errors::BlobCipherError;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key as SecretboxKey, Nonce as SecretboxNonce, XSalsa20Poly1305};
use rand::rngs::OsRng;
use rand::RngCore;
use scrypt::Params;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A derived 32-byte symmetric key. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BlobKey(pub(crate) [u8; SECRETBOX_KEY_LENGTH]);

impl AsRef<[u8; SECRETBOX_KEY_LENGTH]> for BlobKey {
    fn as_ref(&self) -> &[u8; SECRETBOX_KEY_LENGTH] {
        &self.0
    }
}

/// Which scrypt work factor to use when deriving a key.
#[derive(Clone, Copy, Debug)]
pub enum Cost {
    Default,
    Hardened,
}

impl Cost {
    fn params(self) -> Params {
        let (log_n, r, p) = match self {
            Cost::Default => SCRYPT_DEFAULT,
            Cost::Hardened => SCRYPT_HARDENED,
        };
        Params::new(log_n, r, p, SECRETBOX_KEY_LENGTH).expect("static scrypt parameters are always valid")
    }
}

fn scrypt_derive(password: &[u8], salt: &[u8], cost: Cost) -> BlobKey {
    let mut out = [0u8; SECRETBOX_KEY_LENGTH];
    scrypt::scrypt(password, salt, &cost.params(), &mut out).expect("scrypt output length is fixed and valid");
    BlobKey(out)
}

/// Generates a random salt and derives a key from `password` under it.
pub fn new_key(password: &[u8], cost: Cost) -> (BlobKey, [u8; SCRYPT_SALT_LENGTH]) {
    let mut salt = [0u8; SCRYPT_SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    let key = scrypt_derive(password, &salt, cost);
    (key, salt)
}

/// Deterministically re-derives a key from `password` and a known `salt`.
pub fn derive_key(password: &[u8], salt: &[u8; SCRYPT_SALT_LENGTH], cost: Cost) -> BlobKey {
    scrypt_derive(password, salt, cost)
}

/// Seals `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &BlobKey) -> (Vec<u8>, [u8; SECRETBOX_NONCE_LENGTH]) {
    let mut nonce_bytes = [0u8; SECRETBOX_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(&key.0));
    let nonce = SecretboxNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext).expect("secretbox seal cannot fail except on RNG failure");
    (ciphertext, nonce_bytes)
}

/// Opens a sealed blob. Any tampering, wrong key, or truncation returns
/// [`BlobCipherError::DecryptFailure`] without distinguishing the cause.
pub fn decrypt(key: &BlobKey, nonce: &[u8; SECRETBOX_NONCE_LENGTH], ciphertext: &[u8]) -> Result<Vec<u8>, BlobCipherError> {
    let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(&key.0));
    let nonce = SecretboxNonce::from_slice(nonce);
    cipher.decrypt(nonce, ciphertext).map_err(|_| BlobCipherError::DecryptFailure)
}

/// `salt || nonce || sealed_bytes`.
pub fn pack_salt_nonce(salt: &[u8; SCRYPT_SALT_LENGTH], nonce: &[u8; SECRETBOX_NONCE_LENGTH], sealed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SCRYPT_SALT_LENGTH + SECRETBOX_NONCE_LENGTH + sealed.len());
    out.extend_from_slice(salt);
    out.extend_from_slice(nonce);
    out.extend_from_slice(sealed);
    out
}

/// Inverse of [`pack_salt_nonce`]. Requires at least `SCRYPT_SALT_LENGTH + SECRETBOX_NONCE_LENGTH` bytes.
pub fn unpack_salt_nonce(
    packed: &[u8],
) -> Result<([u8; SCRYPT_SALT_LENGTH], [u8; SECRETBOX_NONCE_LENGTH], &[u8]), BlobCipherError> {
    if packed.len() < SCRYPT_SALT_LENGTH + SECRETBOX_NONCE_LENGTH {
        return Err(BlobCipherError::Truncated);
    }
    let mut salt = [0u8; SCRYPT_SALT_LENGTH];
    salt.copy_from_slice(&packed[..SCRYPT_SALT_LENGTH]);
    let mut nonce = [0u8; SECRETBOX_NONCE_LENGTH];
    nonce.copy_from_slice(&packed[SCRYPT_SALT_LENGTH..SCRYPT_SALT_LENGTH + SECRETBOX_NONCE_LENGTH]);
    Ok((salt, nonce, &packed[SCRYPT_SALT_LENGTH + SECRETBOX_NONCE_LENGTH..]))
}

/// `nonce || sealed_bytes`, for blobs that transmit the salt separately (or not at all).
pub fn pack_nonce(nonce: &[u8; SECRETBOX_NONCE_LENGTH], sealed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SECRETBOX_NONCE_LENGTH + sealed.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(sealed);
    out
}

/// Inverse of [`pack_nonce`]. Requires at least `SECRETBOX_NONCE_LENGTH` bytes.
pub fn unpack_nonce(packed: &[u8]) -> Result<([u8; SECRETBOX_NONCE_LENGTH], &[u8]), BlobCipherError> {
    if packed.len() < SECRETBOX_NONCE_LENGTH {
        return Err(BlobCipherError::Truncated);
    }
    let mut nonce = [0u8; SECRETBOX_NONCE_LENGTH];
    nonce.copy_from_slice(&packed[..SECRETBOX_NONCE_LENGTH]);
    Ok((nonce, &packed[SECRETBOX_NONCE_LENGTH..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_matching_password() {
        let (key, salt) = new_key(b"mysekritpassword", Cost::Default);
        let (ciphertext, nonce) = encrypt(b"hello", &key);
        let same_key = derive_key(b"mysekritpassword", &salt, Cost::Default);
        assert_eq!(decrypt(&same_key, &nonce, &ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn wrong_password_fails() {
        let (key, salt) = new_key(b"mysekritpassword", Cost::Default);
        let (ciphertext, nonce) = encrypt(b"hello", &key);
        let _ = key;
        let wrong_key = derive_key(b"wrong", &salt, Cost::Default);
        assert!(decrypt(&wrong_key, &nonce, &ciphertext).is_err());
    }

    #[test]
    fn pack_unpack_salt_nonce_roundtrip() {
        let salt = [0u8; SCRYPT_SALT_LENGTH];
        let nonce = [0u8; SECRETBOX_NONCE_LENGTH];
        let data = [0xFFu8, 0xFF];
        let packed = pack_salt_nonce(&salt, &nonce, &data);
        let (s, n, d) = unpack_salt_nonce(&packed).unwrap();
        assert_eq!(s, salt);
        assert_eq!(n, nonce);
        assert_eq!(d, &data);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (key, _salt) = new_key(b"pw", Cost::Default);
        let (mut ciphertext, nonce) = encrypt(b"hello", &key);
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(decrypt(&key, &nonce, &ciphertext).is_err());
    }
}
