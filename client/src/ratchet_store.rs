//! On-disk persistence for the state a node accumulates across IDKX bootstraps: one
//! `Ratchet` per peer, the peer's last-known `PublicIdentity`, and the short-lived
//! pending rendezvous blob keys a bootstrap-in-progress needs to trial-decrypt a push
//! against (see `crate::idkx`).
//!
//! Pending blob keys are kept in memory only, never written to disk: `BlobKey`'s
//! bytes are crate-private to `protocol` (only `AsRef`-readable, not constructible from
//! raw bytes outside it), and the bootstrap's own TTL is short enough that losing a
//! pending key across a restart just means redoing step 1, not a correctness problem.

use crate::errors::ClientError;
use protocol::blob_cipher::{self, BlobKey};
use protocol::constants::SAVED_KEY_LIFETIME_SECS;
use protocol::identity::PublicIdentity;
use protocol::ratchet::Ratchet;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct Pending {
    key: BlobKey,
    created_at: u64,
    ttl_secs: u64,
}

/// Everything a client node keeps about its peers, guarded by a mutex per table so
/// ratchet use and peer-directory lookups never block each other.
pub struct Store {
    ratchets_dir: PathBuf,
    peers_dir: PathBuf,
    ratchets: Mutex<HashMap<String, Ratchet>>,
    peers: Mutex<HashMap<String, PublicIdentity>>,
    pending: Mutex<HashMap<Vec<u8>, Pending>>,
}

impl Store {
    /// Creates `base_dir/ratchets` and `base_dir/peers` if needed, and loads every
    /// snapshot and peer record already on disk into memory.
    pub fn open(base_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let base_dir = base_dir.as_ref();
        let ratchets_dir = base_dir.join("ratchets");
        let peers_dir = base_dir.join("peers");
        std::fs::create_dir_all(&ratchets_dir)?;
        std::fs::create_dir_all(&peers_dir)?;

        let mut ratchets = HashMap::new();
        for entry in std::fs::read_dir(&ratchets_dir)? {
            let entry = entry?;
            let Some(fingerprint) = entry.file_name().to_str().and_then(|n| n.strip_suffix(".json")).map(String::from) else {
                continue;
            };
            let bytes = std::fs::read(entry.path())?;
            let snapshot = serde_json::from_slice(&bytes).map_err(std::io::Error::other)?;
            ratchets.insert(fingerprint, Ratchet::unmarshal(snapshot));
        }

        let mut peers = HashMap::new();
        for entry in std::fs::read_dir(&peers_dir)? {
            let entry = entry?;
            let Some(fingerprint) = entry.file_name().to_str().and_then(|n| n.strip_suffix(".json")).map(String::from) else {
                continue;
            };
            let bytes = std::fs::read(entry.path())?;
            let identity: PublicIdentity = serde_json::from_slice(&bytes).map_err(std::io::Error::other)?;
            peers.insert(fingerprint, identity);
        }

        Ok(Self {
            ratchets_dir,
            peers_dir,
            ratchets: Mutex::new(ratchets),
            peers: Mutex::new(peers),
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn ratchet_path(&self, fingerprint: &str) -> PathBuf {
        self.ratchets_dir.join(format!("{fingerprint}.json"))
    }

    fn peer_path(&self, fingerprint: &str) -> PathBuf {
        self.peers_dir.join(format!("{fingerprint}.json"))
    }

    pub fn has_ratchet(&self, fingerprint: &str) -> bool {
        self.ratchets.lock().unwrap().contains_key(fingerprint)
    }

    /// Inserts a freshly bootstrapped ratchet (half or full — the snapshot format
    /// tolerates both) and persists it immediately.
    pub fn insert_ratchet(&self, fingerprint: &str, ratchet: Ratchet) -> std::io::Result<()> {
        let snapshot = ratchet.marshal(SAVED_KEY_LIFETIME_SECS);
        let bytes = serde_json::to_vec(&snapshot).map_err(std::io::Error::other)?;
        std::fs::write(self.ratchet_path(fingerprint), bytes)?;
        self.ratchets.lock().unwrap().insert(fingerprint.to_string(), ratchet);
        Ok(())
    }

    /// Runs `f` against the live ratchet for `fingerprint`, then re-persists its
    /// snapshot so the encrypt/decrypt side effects (counters, saved keys, ratchet
    /// steps) survive a restart. Returns [`ClientError::UnknownPeer`] if there is none.
    pub fn use_ratchet<R>(
        &self,
        fingerprint: &str,
        f: impl FnOnce(&mut Ratchet) -> Result<R, protocol::errors::RatchetError>,
    ) -> Result<R, ClientError> {
        let mut ratchets = self.ratchets.lock().unwrap();
        let ratchet = ratchets.get_mut(fingerprint).ok_or(ClientError::UnknownPeer)?;
        let result = f(ratchet)?;
        let snapshot = ratchet.marshal(SAVED_KEY_LIFETIME_SECS);
        let bytes = serde_json::to_vec(&snapshot).map_err(|_| ClientError::Protocol("ratchet snapshot encode failed".into()))?;
        std::fs::write(self.ratchet_path(fingerprint), bytes)?;
        Ok(result)
    }

    /// Deletes both the in-memory and on-disk ratchet for `fingerprint`. Used by
    /// `IDKXOrchestrator::reset`, on both the side that initiates it and the side that
    /// reciprocates on receiving the cleartext proxy command.
    pub fn delete_ratchet(&self, fingerprint: &str) -> std::io::Result<()> {
        self.ratchets.lock().unwrap().remove(fingerprint);
        match std::fs::remove_file(self.ratchet_path(fingerprint)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn save_peer(&self, identity: &PublicIdentity) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(identity).map_err(std::io::Error::other)?;
        std::fs::write(self.peer_path(&identity.fingerprint_hex()), bytes)?;
        self.peers.lock().unwrap().insert(identity.fingerprint_hex(), identity.clone());
        Ok(())
    }

    pub fn peer(&self, fingerprint: &str) -> Option<PublicIdentity> {
        self.peers.lock().unwrap().get(fingerprint).cloned()
    }

    /// Registers a blob key derived during IDKX step 1, to be tried against every
    /// subsequent `Push` until it either matches or expires.
    pub fn add_pending(&self, pin_hash: Vec<u8>, key: BlobKey, ttl_secs: u64) {
        self.pending.lock().unwrap().insert(pin_hash, Pending { key, created_at: now_secs(), ttl_secs });
    }

    /// Tries every live pending key against a `nonce || ciphertext` blob, pruning
    /// expired keys as it goes. Returns the opened plaintext and the matching key's raw
    /// bytes (needed to re-derive the ratchet's shared secret) on the first hit.
    pub fn try_open_pending(&self, sealed: &[u8]) -> Result<Option<([u8; 32], Vec<u8>)>, ClientError> {
        let (nonce, ciphertext) = blob_cipher::unpack_nonce(sealed)?;
        let mut pending = self.pending.lock().unwrap();
        let now = now_secs();
        pending.retain(|_, p| now.saturating_sub(p.created_at) < p.ttl_secs);
        let mut matched_pin = None;
        let mut opened = None;
        for (pin_hash, candidate) in pending.iter() {
            if let Ok(plaintext) = blob_cipher::decrypt(&candidate.key, &nonce, ciphertext) {
                matched_pin = Some(pin_hash.clone());
                opened = Some((*candidate.key.as_ref(), plaintext));
                break;
            }
        }
        if let Some(pin_hash) = matched_pin {
            pending.remove(&pin_hash);
        }
        Ok(opened)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::identity::FullIdentity;
    use x25519_dalek::StaticSecret;

    fn tempdir(label: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("ratchet-store-test-{label}-{}", uuid::Uuid::new_v4()));
        dir
    }

    #[test]
    fn ratchet_round_trips_through_disk() {
        let dir = tempdir("ratchet");
        let store = Store::open(&dir).unwrap();
        let remote_private = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let remote_public = x25519_dalek::PublicKey::from(&remote_private).to_bytes();
        let ratchet = Ratchet::init_alice([0x22u8; 32], remote_public).unwrap();
        store.insert_ratchet("peer-a", ratchet).unwrap();
        assert!(store.has_ratchet("peer-a"));

        let reopened = Store::open(&dir).unwrap();
        assert!(reopened.has_ratchet("peer-a"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn deleting_a_ratchet_removes_it_from_disk_too() {
        let dir = tempdir("delete");
        let store = Store::open(&dir).unwrap();
        let remote_private = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let remote_public = x25519_dalek::PublicKey::from(&remote_private).to_bytes();
        let ratchet = Ratchet::init_alice([0x33u8; 32], remote_public).unwrap();
        store.insert_ratchet("peer-b", ratchet).unwrap();
        store.delete_ratchet("peer-b").unwrap();
        assert!(!store.has_ratchet("peer-b"));

        let reopened = Store::open(&dir).unwrap();
        assert!(!reopened.has_ratchet("peer-b"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn peer_identity_round_trips() {
        let dir = tempdir("peer");
        let store = Store::open(&dir).unwrap();
        let identity = FullIdentity::generate("carol", "c");
        store.save_peer(identity.public()).unwrap();
        assert_eq!(store.peer(&identity.public().fingerprint_hex()).unwrap().name, "carol");
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn pending_key_opens_its_own_blob_and_is_consumed_once() {
        let dir = tempdir("pending");
        let store = Store::open(&dir).unwrap();
        let (key, _salt) = blob_cipher::new_key(b"hunter2", blob_cipher::Cost::Default);
        let key_bytes = *key.as_ref();
        let (ciphertext, nonce) = blob_cipher::encrypt(b"payload", &key);
        store.add_pending(vec![1, 2, 3], key, 3600);

        let sealed = blob_cipher::pack_nonce(&nonce, &ciphertext);
        let (opened_bytes, plaintext) = store.try_open_pending(&sealed).unwrap().unwrap();
        assert_eq!(opened_bytes, key_bytes);
        assert_eq!(plaintext, b"payload");

        assert!(store.try_open_pending(&sealed).unwrap().is_none());
        std::fs::remove_dir_all(dir).ok();
    }
}
