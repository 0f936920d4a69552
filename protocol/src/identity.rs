//! Long-lived node identities: signing + key-encapsulation keypairs, the signed
//! `PublicIdentity` that is exchanged with peers, and the `FullIdentity` a node
//! persists for itself.

use crate::errors::IdentityError;
use crate::kx::sigma::SigmaIdentity;
use ed25519_dalek::{Signer, SigningKey as DalekSigningKey, Verifier, VerifyingKey as DalekVerifyingKey};
use fips203::ml_kem_768::{DecapsKey, EncapsKey, KG};
use fips203::traits::{KeyGen, SerDes};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Byte length of the KEM public key published in a `PublicIdentity` (ML-KEM-768 `ek`).
pub const KEM_PUBLIC_LENGTH: usize = fips203::ml_kem_768::EK_LEN;
/// Byte length of the KEM private key a `FullIdentity` holds (ML-KEM-768 `dk`).
pub const KEM_PRIVATE_LENGTH: usize = fips203::ml_kem_768::DK_LEN;

/// A peer's long-lived, self-signed identity. Owned by the addressbook and referenced
/// immutably by ratchets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub name: String,
    pub nick: String,
    /// Ed25519 verifying key.
    #[serde(with = "serde_bytes")]
    pub sig_key: Vec<u8>,
    /// ML-KEM-768 encapsulation key.
    #[serde(with = "serde_bytes")]
    pub kem_key: Vec<u8>,
    /// X25519 static public key pinned for the SIGMA handshake variant. Unused by, and
    /// orthogonal to, the post-quantum variant's own key exchange.
    #[serde(with = "serde_bytes")]
    pub sigma_pub: Vec<u8>,
    /// `SHA256(kem_key)`.
    #[serde(with = "serde_bytes")]
    pub identity: Vec<u8>,
    /// `SHA256` digest over every other field, in declaration order.
    #[serde(with = "serde_bytes")]
    pub digest: Vec<u8>,
    /// Ed25519 signature over `digest` under `sig_key`'s private half.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl PublicIdentity {
    fn compute_digest(
        name: &str,
        nick: &str,
        sig_key: &[u8],
        kem_key: &[u8],
        sigma_pub: &[u8],
        identity: &[u8],
    ) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(nick.as_bytes());
        hasher.update(sig_key);
        hasher.update(kem_key);
        hasher.update(sigma_pub);
        hasher.update(identity);
        hasher.finalize().to_vec()
    }

    /// Recomputes the digest and checks the signature. Every deserialization must call
    /// this before the identity is trusted for anything.
    pub fn verify(&self) -> Result<(), IdentityError> {
        let expected =
            Self::compute_digest(&self.name, &self.nick, &self.sig_key, &self.kem_key, &self.sigma_pub, &self.identity);
        if expected != self.digest {
            return Err(IdentityError::MarshalError);
        }
        let verifying_key = DalekVerifyingKey::from_bytes(
            self.sig_key.as_slice().try_into().map_err(|_| IdentityError::MarshalError)?,
        )
        .map_err(|_| IdentityError::MarshalError)?;
        let signature = ed25519_dalek::Signature::from_bytes(
            self.signature.as_slice().try_into().map_err(|_| IdentityError::MarshalError)?,
        );
        verifying_key
            .verify(&self.digest, &signature)
            .map_err(|_| IdentityError::InvalidSignature)
    }

    /// The identity fingerprint, hex-encoded. Used as the spool directory name.
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(&self.identity)
    }
}

/// A node's own identity: the signed public half plus both private keys. Created once,
/// persisted, and never mutated except via a nickname edit followed by re-signing.
pub struct FullIdentity {
    signing_key: DalekSigningKey,
    kem_private: DecapsKey,
    sigma_identity: SigmaIdentity,
    public: PublicIdentity,
}

impl FullIdentity {
    /// Generates a fresh identity and self-signs it.
    pub fn generate(name: impl Into<String>, nick: impl Into<String>) -> Self {
        let signing_key = DalekSigningKey::generate(&mut OsRng);
        let (kem_public, kem_private) = KG::try_keygen_with_rng(&mut OsRng).expect("ML-KEM keygen failure is fatal");
        let sigma_identity = SigmaIdentity::generate();
        let public = Self::sign_identity(name.into(), nick.into(), &signing_key, &kem_public, &sigma_identity);
        Self {
            signing_key,
            kem_private,
            sigma_identity,
            public,
        }
    }

    fn sign_identity(
        name: String,
        nick: String,
        signing_key: &DalekSigningKey,
        kem_public: &EncapsKey,
        sigma_identity: &SigmaIdentity,
    ) -> PublicIdentity {
        let sig_key = signing_key.verifying_key().to_bytes().to_vec();
        let kem_key = kem_public.clone().into_bytes().to_vec();
        let sigma_pub = sigma_identity.public.to_vec();
        let identity = Sha256::digest(&kem_key).to_vec();
        let digest = PublicIdentity::compute_digest(&name, &nick, &sig_key, &kem_key, &sigma_pub, &identity);
        let signature = signing_key.sign(&digest).to_bytes().to_vec();
        PublicIdentity {
            name,
            nick,
            sig_key,
            kem_key,
            sigma_pub,
            identity,
            digest,
            signature,
        }
    }

    /// Renames the identity and re-signs the digest. This is the only mutation a
    /// `FullIdentity` permits after creation.
    pub fn set_nick(&mut self, nick: impl Into<String>) {
        let kem_public = EncapsKey::try_from_bytes(
            self.public.kem_key.as_slice().try_into().expect("stored kem key has the wrong length"),
        )
        .expect("stored kem key failed validation");
        self.public =
            Self::sign_identity(self.public.name.clone(), nick.into(), &self.signing_key, &kem_public, &self.sigma_identity);
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    pub fn signing_key(&self) -> &DalekSigningKey {
        &self.signing_key
    }

    pub fn kem_private(&self) -> &DecapsKey {
        &self.kem_private
    }

    pub fn sigma_identity(&self) -> &SigmaIdentity {
        &self.sigma_identity
    }
}

impl Drop for FullIdentity {
    fn drop(&mut self) {
        self.signing_key.zeroize();
    }
}

/// On-disk form of a [`FullIdentity`], for the `config` CLI to write and `server`/
/// `client` to load at startup. Holds both private keys in the clear; callers are
/// responsible for the file's permissions.
#[derive(Serialize, Deserialize)]
pub struct IdentitySnapshot {
    #[serde(with = "serde_bytes")]
    signing_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    kem_private: Vec<u8>,
    #[serde(with = "serde_bytes")]
    sigma_secret: Vec<u8>,
    public: PublicIdentity,
}

impl FullIdentity {
    /// Captures the private keys and signed public identity into a serializable form.
    pub fn marshal(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            signing_key: self.signing_key.to_bytes().to_vec(),
            kem_private: self.kem_private.clone().into_bytes().to_vec(),
            sigma_secret: self.sigma_identity.to_bytes().to_vec(),
            public: self.public.clone(),
        }
    }

    /// Restores a `FullIdentity` from a snapshot, verifying the embedded public
    /// identity's signature before trusting any of it.
    pub fn unmarshal(snapshot: IdentitySnapshot) -> Result<Self, IdentityError> {
        snapshot.public.verify()?;
        let signing_key = DalekSigningKey::from_bytes(
            snapshot.signing_key.as_slice().try_into().map_err(|_| IdentityError::MarshalError)?,
        );
        let kem_private = DecapsKey::try_from_bytes(
            snapshot.kem_private.as_slice().try_into().map_err(|_| IdentityError::MarshalError)?,
        )
        .map_err(|_| IdentityError::MarshalError)?;
        let sigma_seed: [u8; 32] = snapshot.sigma_secret.as_slice().try_into().map_err(|_| IdentityError::MarshalError)?;
        let sigma_identity = SigmaIdentity::from_bytes(sigma_seed);
        if sigma_identity.public.as_slice() != snapshot.public.sigma_pub.as_slice() {
            return Err(IdentityError::MarshalError);
        }
        Ok(Self {
            signing_key,
            kem_private,
            sigma_identity,
            public: snapshot.public,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_verifies() {
        let id = FullIdentity::generate("alice", "al");
        assert!(id.public().verify().is_ok());
    }

    #[test]
    fn tampered_identity_fails_verification() {
        let id = FullIdentity::generate("alice", "al");
        let mut tampered = id.public().clone();
        tampered.nick = "mallory".to_string();
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn rename_reseals_digest_and_signature() {
        let mut id = FullIdentity::generate("alice", "al");
        id.set_nick("ali");
        assert_eq!(id.public().nick, "ali");
        assert!(id.public().verify().is_ok());
    }

    #[test]
    fn fingerprint_matches_sha256_of_kem_key() {
        let id = FullIdentity::generate("alice", "al");
        let expected = Sha256::digest(&id.public().kem_key).to_vec();
        assert_eq!(id.public().identity, expected);
    }

    #[test]
    fn marshal_unmarshal_round_trips() {
        let id = FullIdentity::generate("alice", "al");
        let fingerprint = id.public().fingerprint_hex();
        let restored = FullIdentity::unmarshal(id.marshal()).unwrap();
        assert_eq!(restored.public().fingerprint_hex(), fingerprint);
        assert_eq!(restored.signing_key().verifying_key().to_bytes(), id.signing_key().verifying_key().to_bytes());
    }

    #[test]
    fn unmarshal_rejects_a_tampered_snapshot() {
        let id = FullIdentity::generate("alice", "al");
        let mut snapshot = id.marshal();
        snapshot.public.nick = "mallory".to_string();
        assert!(FullIdentity::unmarshal(snapshot).is_err());
    }
}
