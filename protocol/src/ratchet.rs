//! The double ratchet: per-conversation forward-secret symmetric ratcheting layered on
//! a Diffie-Hellman ratchet step, with out-of-order delivery handled by a bounded,
//! TTL-pruned cache of skipped message keys.
//!
//! Grounded on the chain-key/root-key HKDF split any Double Ratchet implementation
//! uses, generalized here to carry header keys and a TTL on cached keys rather than
//! keeping them forever.

use crate::constants::{AES256_NONCE_LENGTH, AES256_SECRET_LENGTH, MAX_SKIPS, SAVED_KEY_LIFETIME_SECS};
use crate::errors::RatchetError;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

/// `dhs || pn || ns`, prepended to every message's AAD so tampering with the header is
/// caught by the AEAD tag rather than trusted separately.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub struct Header {
    pub dhs: [u8; 32],
    pub pn: u64,
    pub ns: u64,
}

impl Header {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 16);
        out.extend_from_slice(&self.dhs);
        out.extend_from_slice(&self.pn.to_le_bytes());
        out.extend_from_slice(&self.ns.to_le_bytes());
        out
    }
}

/// The three identity points a DH public must never be, per the small-subgroup check
/// the key exchange modules also enforce.
fn is_degenerate(point: &[u8; 32]) -> bool {
    point.iter().all(|&b| b == 0) || (point[0] == 1 && point[1..].iter().all(|&b| b == 0)) || point.iter().all(|&b| b == 0xFF)
}

struct SavedKey {
    message_key: [u8; 32],
    created_at: u64,
}

/// The full Double Ratchet state for one conversation with one peer.
pub struct Ratchet {
    dh_self_private: StaticSecret,
    dh_self_public: PublicKey,
    dh_remote: Option<PublicKey>,
    root_key: [u8; 32],
    send_chain_key: Option<[u8; 32]>,
    recv_chain_key: Option<[u8; 32]>,
    n_send: u64,
    n_recv: u64,
    pn: u64,
    /// Keyed by (the receive-side DH public active when the key was skipped, message
    /// number). Corrects a common slip of indexing this cache by the send counter.
    saved_keys: HashMap<([u8; 32], u64), SavedKey>,
    /// Set once a decrypt has exhausted every available key; the caller must treat the
    /// session as wedged and re-run key exchange rather than keep retrying.
    wedged: bool,
}

impl Ratchet {
    /// Initializes the side that sent the first key-exchange message (the one who
    /// already knows the peer's initial ratchet public key).
    pub fn init_alice(shared_secret: [u8; 32], remote_public: [u8; 32]) -> Result<Self, RatchetError> {
        if is_degenerate(&remote_public) {
            return Err(RatchetError::InvalidKx);
        }
        let dh_self_private = StaticSecret::random_from_rng(OsRng);
        let dh_self_public = PublicKey::from(&dh_self_private);
        let remote = PublicKey::from(remote_public);
        let dh_output = dh_self_private.diffie_hellman(&remote);
        let (root_key, send_chain_key) = hkdf_rk(&shared_secret, dh_output.as_bytes())?;
        Ok(Self {
            dh_self_private,
            dh_self_public,
            dh_remote: Some(remote),
            root_key,
            send_chain_key: Some(send_chain_key),
            recv_chain_key: None,
            n_send: 0,
            n_recv: 0,
            pn: 0,
            saved_keys: HashMap::new(),
            wedged: false,
        })
    }

    /// Initializes the responding side. It has no sending chain key until it receives
    /// the first message and performs its first DH ratchet step.
    pub fn init_bob(shared_secret: [u8; 32], dh_self_private: StaticSecret) -> Self {
        let dh_self_public = PublicKey::from(&dh_self_private);
        Self {
            dh_self_private,
            dh_self_public,
            dh_remote: None,
            root_key: shared_secret,
            send_chain_key: None,
            recv_chain_key: None,
            n_send: 0,
            n_recv: 0,
            pn: 0,
            saved_keys: HashMap::new(),
            wedged: false,
        }
    }

    pub fn is_wedged(&self) -> bool {
        self.wedged
    }

    /// The DH public key this side is currently announcing in its message headers.
    /// Needed by the identity key-exchange bootstrap, which has to hand the responder's
    /// freshly generated ratchet public to the initiator out of band from the ratchet
    /// itself (the initiator has no message to read it off until one exists).
    pub fn dh_public(&self) -> [u8; 32] {
        self.dh_self_public.to_bytes()
    }

    /// Encrypts `plaintext`, deriving a fresh message key off the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let chain_key = self.send_chain_key.ok_or(RatchetError::RatchetError)?;
        let (next_chain, message_key) = hkdf_ck(&chain_key)?;
        self.send_chain_key = Some(next_chain);
        let header = Header {
            dhs: self.dh_self_public.to_bytes(),
            pn: self.pn,
            ns: self.n_send,
        };
        self.n_send += 1;

        let mut full_aad = header.to_bytes();
        full_aad.extend_from_slice(aad);
        let (nonce, sealed) = seal(&message_key, plaintext, &full_aad)?;

        let mut framed = header.to_bytes();
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&sealed);
        Ok(framed)
    }

    /// Decrypts a framed `header || nonce || ciphertext` message, performing a DH
    /// ratchet step first if the header announces a new remote public key.
    pub fn decrypt(&mut self, framed: &[u8], aad: &[u8]) -> Result<Vec<u8>, RatchetError> {
        if framed.len() < 48 + AES256_NONCE_LENGTH {
            return Err(RatchetError::UnmarshalError);
        }
        let mut dhs = [0u8; 32];
        dhs.copy_from_slice(&framed[0..32]);
        let pn = u64::from_le_bytes(framed[32..40].try_into().unwrap());
        let ns = u64::from_le_bytes(framed[40..48].try_into().unwrap());
        let header = Header { dhs, pn, ns };
        let nonce: [u8; AES256_NONCE_LENGTH] = framed[48..48 + AES256_NONCE_LENGTH].try_into().unwrap();
        let ciphertext = &framed[48 + AES256_NONCE_LENGTH..];

        let mut full_aad = header.to_bytes();
        full_aad.extend_from_slice(aad);

        if let Some(plaintext) = self.try_saved_key(&header, &nonce, ciphertext, &full_aad)? {
            return Ok(plaintext);
        }

        let header_is_new = self.dh_remote.map(|r| r.to_bytes()) != Some(header.dhs);
        if header_is_new {
            if is_degenerate(&header.dhs) {
                return Err(RatchetError::InvalidKx);
            }
            self.skip_receive_keys(header.pn)?;
            self.dh_ratchet(&header)?;
        }
        self.skip_receive_keys(header.ns)?;

        let chain_key = match self.recv_chain_key {
            Some(ck) => ck,
            None => {
                self.wedged = true;
                return Err(RatchetError::RatchetError);
            }
        };
        let (next_chain, message_key) = hkdf_ck(&chain_key)?;
        self.recv_chain_key = Some(next_chain);
        self.n_recv += 1;
        open(&message_key, &nonce, ciphertext, &full_aad).map_err(|_| {
            self.wedged = true;
            RatchetError::RatchetError
        })
    }

    fn try_saved_key(
        &mut self,
        header: &Header,
        nonce: &[u8; AES256_NONCE_LENGTH],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Option<Vec<u8>>, RatchetError> {
        let key = (header.dhs, header.ns);
        if let Some(saved) = self.saved_keys.remove(&key) {
            let plaintext = open(&saved.message_key, nonce, ciphertext, aad).map_err(|_| RatchetError::RatchetError)?;
            return Ok(Some(plaintext));
        }
        Ok(None)
    }

    /// Advances the receiving chain up to (but not including) `until`, stashing every
    /// key skipped along the way under the *current* receiving DH public — the key the
    /// header that eventually arrives late will carry.
    fn skip_receive_keys(&mut self, until: u64) -> Result<(), RatchetError> {
        if self.n_recv + MAX_SKIPS < until {
            return Err(RatchetError::MaxSkipsExceeded);
        }
        let dh_remote = match self.dh_remote {
            Some(r) => r.to_bytes(),
            None => return Ok(()),
        };
        while self.n_recv < until {
            let chain_key = match self.recv_chain_key {
                Some(ck) => ck,
                None => break,
            };
            let (next_chain, message_key) = hkdf_ck(&chain_key)?;
            self.recv_chain_key = Some(next_chain);
            self.saved_keys.insert(
                (dh_remote, self.n_recv),
                SavedKey {
                    message_key,
                    created_at: now_secs(),
                },
            );
            self.n_recv += 1;
        }
        Ok(())
    }

    fn dh_ratchet(&mut self, header: &Header) -> Result<(), RatchetError> {
        self.pn = self.n_send;
        self.n_send = 0;
        self.n_recv = 0;
        let remote = PublicKey::from(header.dhs);
        self.dh_remote = Some(remote);

        let dh_output = self.dh_self_private.diffie_hellman(&remote);
        let (root_key, recv_chain_key) = hkdf_rk(&self.root_key, dh_output.as_bytes())?;
        self.root_key = root_key;
        self.recv_chain_key = Some(recv_chain_key);

        let new_private = StaticSecret::random_from_rng(OsRng);
        self.dh_self_public = PublicKey::from(&new_private);
        self.dh_self_private = new_private;

        let dh_output = self.dh_self_private.diffie_hellman(&remote);
        let (root_key, send_chain_key) = hkdf_rk(&self.root_key, dh_output.as_bytes())?;
        self.root_key = root_key;
        self.send_chain_key = Some(send_chain_key);
        Ok(())
    }

    /// Serializes state for persistence, pruning any saved key older than `lifetime`.
    pub fn marshal(&self, lifetime_secs: u64) -> RatchetSnapshot {
        let now = now_secs();
        let saved = self
            .saved_keys
            .iter()
            .filter(|(_, v)| now.saturating_sub(v.created_at) < lifetime_secs)
            .map(|(k, v)| SavedKeyEntry {
                dh: k.0,
                n: k.1,
                message_key: v.message_key,
                created_at: v.created_at,
            })
            .collect();
        RatchetSnapshot {
            dh_self_private: self.dh_self_private.to_bytes(),
            dh_self_public: self.dh_self_public.to_bytes(),
            dh_remote: self.dh_remote.map(|p| p.to_bytes()),
            root_key: self.root_key,
            send_chain_key: self.send_chain_key,
            recv_chain_key: self.recv_chain_key,
            n_send: self.n_send,
            n_recv: self.n_recv,
            pn: self.pn,
            saved_keys: saved,
        }
    }

    pub fn unmarshal(snapshot: RatchetSnapshot) -> Self {
        let mut saved_keys = HashMap::new();
        for entry in snapshot.saved_keys {
            saved_keys.insert(
                (entry.dh, entry.n),
                SavedKey {
                    message_key: entry.message_key,
                    created_at: entry.created_at,
                },
            );
        }
        Self {
            dh_self_private: StaticSecret::from(snapshot.dh_self_private),
            dh_self_public: PublicKey::from(snapshot.dh_self_public),
            dh_remote: snapshot.dh_remote.map(PublicKey::from),
            root_key: snapshot.root_key,
            send_chain_key: snapshot.send_chain_key,
            recv_chain_key: snapshot.recv_chain_key,
            n_send: snapshot.n_send,
            n_recv: snapshot.n_recv,
            pn: snapshot.pn,
            saved_keys,
            wedged: false,
        }
    }
}

impl Drop for Ratchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(ref mut ck) = self.send_chain_key {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.recv_chain_key {
            ck.zeroize();
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct SavedKeyEntry {
    dh: [u8; 32],
    n: u64,
    message_key: [u8; 32],
    created_at: u64,
}

/// The on-disk/over-the-wire representation of a [`Ratchet`], produced by
/// [`Ratchet::marshal`] and consumed by [`Ratchet::unmarshal`].
#[derive(Serialize, Deserialize)]
pub struct RatchetSnapshot {
    dh_self_private: [u8; 32],
    dh_self_public: [u8; 32],
    dh_remote: Option<[u8; 32]>,
    root_key: [u8; 32],
    send_chain_key: Option<[u8; 32]>,
    recv_chain_key: Option<[u8; 32]>,
    n_send: u64,
    n_recv: u64,
    pn: u64,
    saved_keys: Vec<SavedKeyEntry>,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<([u8; AES256_NONCE_LENGTH], Vec<u8>), RatchetError> {
    let mut nonce_bytes = [0u8; AES256_NONCE_LENGTH];
    rand::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad })
        .map_err(|_| RatchetError::RatchetError)?;
    Ok((nonce_bytes, sealed))
}

fn open(key: &[u8; 32], nonce: &[u8; AES256_NONCE_LENGTH], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher.decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
}

/// `HKDF(root_key, dh_output)`, domain-separated with a 32-byte `0xFF` prefix per the
/// XEdDSA convention for curves sharing their key space with a signature scheme.
fn hkdf_rk(root_key: &[u8; 32], dh_output: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), RatchetError> {
    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(root_key);
    ikm.extend_from_slice(dh_output);
    let hk = Hkdf::<Sha256>::new(Some(root_key), &ikm);
    let mut okm = [0u8; 2 * AES256_SECRET_LENGTH];
    hk.expand(b"RatchetInfo", &mut okm)?;
    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    Ok((new_root, chain))
}

/// `HKDF(chain_key)` with no salt, producing the next chain key and a message key.
fn hkdf_ck(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), RatchetError> {
    let hk = Hkdf::<Sha256>::new(None, chain_key);
    let mut next_chain = [0u8; 32];
    let mut message_key = [0u8; 32];
    hk.expand(b"ChainKey", &mut next_chain)?;
    hk.expand(b"MessageKey", &mut message_key)?;
    Ok((next_chain, message_key))
}
