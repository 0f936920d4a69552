//! Account directory: the server's map from identity fingerprint to the signed
//! `PublicIdentity` it last saw. Accounts authenticate by proving possession of the
//! identity's signing key during the key exchange, not by password, so this directory
//! holds no secrets.

use crate::errors::ServerError;
use protocol::identity::PublicIdentity;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

pub struct Accounts {
    by_fingerprint: RwLock<HashMap<String, PublicIdentity>>,
    /// Fingerprints opted into the public directory via `Publish`, searchable by `find_by_nick`.
    published: RwLock<HashSet<String>>,
    /// Fingerprints an operator has administratively locked out; `lookup`/`contains` still
    /// see them, but `run_session` consults `is_disabled` before keying a session.
    disabled: RwLock<HashSet<String>>,
}

impl Accounts {
    pub fn new() -> Self {
        Self {
            by_fingerprint: RwLock::new(HashMap::new()),
            published: RwLock::new(HashSet::new()),
            disabled: RwLock::new(HashSet::new()),
        }
    }

    /// Registers a new identity. Rejects both an unverifiable signature and a fingerprint
    /// collision with an existing, different identity.
    pub fn register(&self, identity: PublicIdentity) -> Result<(), ServerError> {
        identity.verify().map_err(ServerError::Identity)?;
        let fingerprint = identity.fingerprint_hex();
        let mut accounts = self.by_fingerprint.write().unwrap();
        if accounts.contains_key(&fingerprint) {
            return Err(ServerError::AccountAlreadyExists);
        }
        accounts.insert(fingerprint, identity);
        Ok(())
    }

    pub fn lookup(&self, fingerprint: &str) -> Result<PublicIdentity, ServerError> {
        self.by_fingerprint.read().unwrap().get(fingerprint).cloned().ok_or(ServerError::AccountNotFound)
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.by_fingerprint.read().unwrap().contains_key(fingerprint)
    }

    /// Opts `fingerprint` into the public directory. No-op if already published, a
    /// silent success rather than an error so a reconnecting client can call it freely.
    pub fn publish(&self, fingerprint: &str) -> Result<(), ServerError> {
        if !self.contains(fingerprint) {
            return Err(ServerError::AccountNotFound);
        }
        self.published.write().unwrap().insert(fingerprint.to_string());
        Ok(())
    }

    /// Opts `fingerprint` back out of the public directory.
    pub fn unpublish(&self, fingerprint: &str) {
        self.published.write().unwrap().remove(fingerprint);
    }

    /// Linear scan of every published identity for one whose nickname matches exactly.
    pub fn find_by_nick(&self, nick: &str) -> Option<PublicIdentity> {
        let published = self.published.read().unwrap();
        let accounts = self.by_fingerprint.read().unwrap();
        published
            .iter()
            .filter_map(|fingerprint| accounts.get(fingerprint))
            .find(|identity| identity.nick == nick)
            .cloned()
    }

    /// Administratively locks `fingerprint` out of future logins. Existing sessions are
    /// unaffected; the check only runs at handshake time.
    pub fn disable(&self, fingerprint: &str) {
        self.disabled.write().unwrap().insert(fingerprint.to_string());
    }

    pub fn enable(&self, fingerprint: &str) {
        self.disabled.write().unwrap().remove(fingerprint);
    }

    pub fn is_disabled(&self, fingerprint: &str) -> bool {
        self.disabled.read().unwrap().contains(fingerprint)
    }
}

/// Hashes a rendezvous PIN so the server's lookup table never holds it in the clear.
pub fn hash_pin(pin: &str) -> Vec<u8> {
    Sha256::digest(pin.as_bytes()).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::identity::FullIdentity;

    #[test]
    fn registering_twice_is_rejected() {
        let accounts = Accounts::new();
        let identity = FullIdentity::generate("alice", "al");
        accounts.register(identity.public().clone()).unwrap();
        assert!(matches!(accounts.register(identity.public().clone()), Err(ServerError::AccountAlreadyExists)));
    }

    #[test]
    fn lookup_returns_what_was_registered() {
        let accounts = Accounts::new();
        let identity = FullIdentity::generate("bob", "b");
        accounts.register(identity.public().clone()).unwrap();
        let fetched = accounts.lookup(&identity.public().fingerprint_hex()).unwrap();
        assert_eq!(fetched.name, "bob");
    }

    #[test]
    fn pin_hash_is_deterministic() {
        assert_eq!(hash_pin("123456"), hash_pin("123456"));
        assert_ne!(hash_pin("123456"), hash_pin("654321"));
    }

    #[test]
    fn find_by_nick_only_sees_published_accounts() {
        let accounts = Accounts::new();
        let identity = FullIdentity::generate("carol", "carol99");
        let fingerprint = identity.public().fingerprint_hex();
        accounts.register(identity.public().clone()).unwrap();
        assert!(accounts.find_by_nick("carol99").is_none());

        accounts.publish(&fingerprint).unwrap();
        let found = accounts.find_by_nick("carol99").unwrap();
        assert_eq!(found.fingerprint_hex(), fingerprint);

        accounts.unpublish(&fingerprint);
        assert!(accounts.find_by_nick("carol99").is_none());
    }

    #[test]
    fn disabling_an_account_is_reversible() {
        let accounts = Accounts::new();
        let identity = FullIdentity::generate("dave", "d");
        let fingerprint = identity.public().fingerprint_hex();
        accounts.register(identity.public().clone()).unwrap();
        assert!(!accounts.is_disabled(&fingerprint));

        accounts.disable(&fingerprint);
        assert!(accounts.is_disabled(&fingerprint));

        accounts.enable(&fingerprint);
        assert!(!accounts.is_disabled(&fingerprint));
    }
}
