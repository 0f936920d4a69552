//! Variant A: a SIGMA-style, three-step station-to-station handshake over X25519.
//! Retained for back-compat; a running process picks either this or [`super::pq`], never
//! both (see `session::Variant`).

use crate::errors::SessionError;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as XPublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

const SERVER_KEYS_MAGIC: &[u8] = b"server keys\x00";
const CLIENT_KEYS_MAGIC: &[u8] = b"client keys\x00";
const SERVER_PROOF_MAGIC: &[u8] = b"server proof\x00";
const CLIENT_PROOF_MAGIC: &[u8] = b"client proof\x00";

/// The two directional transport keys a completed handshake produces.
pub struct DirectionalKeys {
    pub read_key: [u8; 32],
    pub write_key: [u8; 32],
}

/// A running transcript hash over the public material exchanged so far.
#[derive(Clone)]
pub struct Transcript(Sha256);

impl Transcript {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn current(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0.clone().finalize());
        out
    }
}

pub(crate) fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// A node's long-lived X25519 keypair for the SIGMA session handshake. Distinct from
/// the ed25519 signing key in [`crate::identity`]: this key authenticates a *session
/// endpoint* (pinned out of band, the way a server's fingerprint is pinned in a
/// client's config), not a conversational identity.
pub struct SigmaIdentity {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl SigmaIdentity {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = XPublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn from_bytes(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = XPublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        self.secret.diffie_hellman(&XPublicKey::from(*their_public)).to_bytes()
    }
}

/// An ephemeral X25519 keypair generated fresh per handshake.
pub struct Ephemeral {
    secret: EphemeralSecret,
    pub public: [u8; 32],
}

impl Ephemeral {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = XPublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn diffie_hellman(self, their_public: &[u8; 32]) -> [u8; 32] {
        self.secret.diffie_hellman(&XPublicKey::from(*their_public)).to_bytes()
    }
}

/// Reject the known small-subgroup / identity points: `0`, `1`, `2^256-1`.
pub fn reject_small_order(point: &[u8; 32]) -> Result<(), SessionError> {
    let all_zero = point.iter().all(|&b| b == 0);
    let all_one_low = point[0] == 1 && point[1..].iter().all(|&b| b == 0);
    let all_ones = point.iter().all(|&b| b == 0xFF);
    if all_zero || all_one_low || all_ones {
        Err(SessionError::InvalidKx)
    } else {
        Ok(())
    }
}

/// Step 2: once both ephemeral publics are known, derive the role-tagged directional
/// keys and fold both publics into the transcript in initiator-then-responder order.
pub fn derive_transport_keys(
    shared_point: &[u8; 32],
    initiator_ephemeral_pub: &[u8; 32],
    responder_ephemeral_pub: &[u8; 32],
) -> (Transcript, [u8; 32], [u8; 32]) {
    let mut transcript = Transcript::new();
    transcript.update(initiator_ephemeral_pub);
    transcript.update(responder_ephemeral_pub);
    let server_key = hmac(shared_point, SERVER_KEYS_MAGIC);
    let client_key = hmac(shared_point, CLIENT_KEYS_MAGIC);
    (transcript, server_key, client_key)
}

/// Step 3, responder side: compute the server proof over the transcript hash so far.
pub fn server_proof(static_ephemeral_mix: &[u8; 32], transcript_hash: &[u8; 32]) -> [u8; 32] {
    let mut data = Vec::with_capacity(SERVER_PROOF_MAGIC.len() + transcript_hash.len());
    data.extend_from_slice(SERVER_PROOF_MAGIC);
    data.extend_from_slice(transcript_hash);
    hmac(static_ephemeral_mix, &data)
}

/// Step 3, initiator side: compute the client proof over the updated transcript hash
/// (which by now also binds the server's proof message).
pub fn client_proof(static_shared: &[u8; 32], updated_transcript_hash: &[u8; 32]) -> [u8; 32] {
    let mut data = Vec::with_capacity(CLIENT_PROOF_MAGIC.len() + updated_transcript_hash.len());
    data.extend_from_slice(CLIENT_PROOF_MAGIC);
    data.extend_from_slice(updated_transcript_hash);
    hmac(static_shared, &data)
}

/// Computes the static-ephemeral mix used for both directions of the proof: one side's
/// static private times the other's ephemeral public.
pub fn static_ephemeral_mix(static_private: &StaticSecret, ephemeral_public: &[u8; 32]) -> [u8; 32] {
    static_private.diffie_hellman(&XPublicKey::from(*ephemeral_public)).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_produces_matching_directional_keys_on_both_sides() {
        let initiator_static = StaticSecret::random_from_rng(OsRng);
        let responder_static = StaticSecret::random_from_rng(OsRng);
        let initiator_static_pub = XPublicKey::from(&initiator_static).to_bytes();
        let responder_static_pub = XPublicKey::from(&responder_static).to_bytes();

        let e_i = Ephemeral::generate();
        let e_r = Ephemeral::generate();
        let (e_i_pub, e_r_pub) = (e_i.public, e_r.public);

        let shared_i = e_i.diffie_hellman(&e_r_pub);
        let shared_r = e_r.diffie_hellman(&e_i_pub);
        assert_eq!(shared_i, shared_r);

        let (mut transcript_i, server_key_i, client_key_i) = derive_transport_keys(&shared_i, &e_i_pub, &e_r_pub);
        let (mut transcript_r, server_key_r, client_key_r) = derive_transport_keys(&shared_r, &e_i_pub, &e_r_pub);
        assert_eq!(server_key_i, server_key_r);
        assert_eq!(client_key_i, client_key_r);

        let mix_r = static_ephemeral_mix(&responder_static, &e_i_pub);
        let mix_i = static_ephemeral_mix(&initiator_static, &e_r_pub);
        assert_eq!(mix_r, mix_i);

        let h1 = transcript_i.current();
        let proof = server_proof(&mix_r, &h1);
        transcript_i.update(&proof);
        transcript_r.update(&proof);
        let h2 = transcript_i.current();
        assert_eq!(h2, transcript_r.current());

        let static_shared_client = static_ephemeral_mix(&initiator_static, &responder_static_pub);
        let static_shared_server = responder_static.diffie_hellman(&XPublicKey::from(initiator_static_pub)).to_bytes();
        assert_eq!(static_shared_client, static_shared_server);

        let proof2 = client_proof(&static_shared_client, &h2);
        let expected = client_proof(&static_shared_server, &h2);
        assert_eq!(proof2, expected);
    }

    #[test]
    fn small_order_points_are_rejected() {
        assert!(reject_small_order(&[0u8; 32]).is_err());
        let mut one = [0u8; 32];
        one[0] = 1;
        assert!(reject_small_order(&one).is_err());
        assert!(reject_small_order(&[0xFFu8; 32]).is_err());
        assert!(reject_small_order(&[0x42u8; 32]).is_ok());
    }
}
