//! Out-of-band identity bootstrap: two peers who share a PIN (read aloud, typed into
//! both apps, whatever channel is out of scope here) end up with a verified copy of
//! each other's signed identity and a freshly keyed [`Ratchet`] between them, without
//! either side ever having to be online at the same moment as the other.
//!
//! The PIN only ever buys a rendezvous: the symmetric key it derives seals the
//! initiator's identity at the relay and, later, the responder's reply. The ratchet
//! itself is keyed from something the PIN never touches — a single ML-KEM-768
//! encapsulation the responder makes to the initiator's long-term KEM public key —
//! folded together as `SHA256(blob_key || kem_secret)`. A server or an eavesdropper who
//! only ever sees relayed ciphertext and guesses the PIN still can't derive the ratchet
//! seed without also breaking ML-KEM.
//!
//! Three steps, two round trips:
//! 1. [`create_rendezvous`] — the initiator seals her own identity under a PIN-derived
//!    key and stores it at the relay.
//! 2. [`accept_rendezvous`] — the responder fetches it, verifies it, derives the ratchet
//!    seed, and delivers his own identity plus the KEM ciphertext and his ratchet's DH
//!    public key back, sealed under the same key.
//! 3. [`try_complete`] — the initiator, on receiving that reply (a `Push`/`Pull` entry,
//!    tried against every pending key she's holding), finishes deriving the same seed
//!    and keys her own ratchet.
//!
//! [`reset`] and [`handle_cleartext`] implement the one-sided teardown: either party can
//! unilaterally drop a wedged or suspect ratchet and tell the peer to drop theirs too,
//! via the one payload ever allowed to cross the relay unsealed.

use crate::dispatch::Dispatch;
use crate::errors::ClientError;
use crate::ratchet_store::Store;
use fips203::ml_kem_768::{CipherText, EncapsKey};
use fips203::traits::{Decaps, Encaps, SerDes};
use protocol::blob_cipher::{self, Cost};
use protocol::identity::{FullIdentity, PublicIdentity};
use protocol::ratchet::Ratchet;
use protocol::wire::{ProxyCommand, RendezvousEntry, WireMessage};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

/// The sealed payload a responder delivers back to the initiator in step 2: her
/// now-verifiable identity, the KEM ciphertext the initiator needs to recover the
/// ratchet seed, and the DH public key her fresh ratchet is announcing.
#[derive(Clone, Serialize, Deserialize)]
struct IdentityKX {
    identity: PublicIdentity,
    #[serde(with = "serde_bytes")]
    kem_ciphertext: Vec<u8>,
    ratchet_dh_pub: [u8; 32],
}

fn hash_pin(pin: &str) -> Vec<u8> {
    Sha256::digest(pin.as_bytes()).to_vec()
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Step 1. Seals `my_identity`'s public half under a key derived from `pin` (hardened
/// scrypt cost, since this is the one key an offline attacker gets to grind against) and
/// stores it at the relay. Registers the derived key as pending so a later
/// [`try_complete`] call can recognize the responder's reply.
pub async fn create_rendezvous<S>(
    dispatch: &mut Dispatch<S>,
    store: &Store,
    my_identity: &FullIdentity,
    pin: &str,
    ttl_secs: u64,
) -> Result<(), ClientError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let (key, salt) = blob_cipher::new_key(pin.as_bytes(), Cost::Hardened);
    let payload = serde_json::to_vec(my_identity.public()).map_err(|_| ClientError::Protocol("identity encode failed".into()))?;
    let (ciphertext, nonce) = blob_cipher::encrypt(&payload, &key);
    let blob = blob_cipher::pack_salt_nonce(&salt, &nonce, &ciphertext);
    let pin_hash = hash_pin(pin);

    let entry = RendezvousEntry { pin_hash: pin_hash.clone(), blob, created_at: now_secs(), ttl_secs };
    let reply = dispatch.request(|tag| WireMessage::StoreRendezvous { tag, entry: entry.clone() }).await?;
    match reply {
        WireMessage::Ack { .. } => {}
        WireMessage::Error { code, .. } => return Err(ClientError::Protocol(code)),
        _ => return Err(ClientError::Protocol("unexpected reply to a rendezvous store".into())),
    }

    store.add_pending(pin_hash, key, ttl_secs);
    Ok(())
}

/// Step 2. Fetches the blob stored under `pin`, verifies and recovers the initiator's
/// identity, keys a responder-side ratchet for her, and delivers the reply. Returns the
/// initiator's fingerprint on success.
pub async fn accept_rendezvous<S>(
    dispatch: &mut Dispatch<S>,
    store: &Store,
    my_identity: &FullIdentity,
    pin: &str,
) -> Result<String, ClientError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let pin_hash = hash_pin(pin);
    let reply = dispatch.request(|tag| WireMessage::FetchRendezvous { tag, pin_hash: pin_hash.clone() }).await?;
    let sealed = match reply {
        WireMessage::Deliver { sealed, .. } => sealed,
        WireMessage::Error { code, .. } => return Err(ClientError::Protocol(code)),
        _ => return Err(ClientError::Protocol("unexpected reply to a rendezvous fetch".into())),
    };

    let (salt, nonce, ciphertext) = blob_cipher::unpack_salt_nonce(&sealed)?;
    let key = blob_cipher::derive_key(pin.as_bytes(), &salt, Cost::Hardened);
    let plaintext = blob_cipher::decrypt(&key, &nonce, ciphertext)?;
    let their_identity: PublicIdentity =
        serde_json::from_slice(&plaintext).map_err(|_| ClientError::Protocol("malformed rendezvous payload".into()))?;
    their_identity.verify()?;

    let fingerprint = their_identity.fingerprint_hex();
    if fingerprint == my_identity.public().fingerprint_hex() {
        return Err(ClientError::SelfBootstrap);
    }
    if store.has_ratchet(&fingerprint) {
        return Err(ClientError::RatchetStateMismatch);
    }

    let their_kem_pub = EncapsKey::try_from_bytes(
        their_identity.kem_key.as_slice().try_into().map_err(|_| ClientError::Protocol("bad kem key length".into()))?,
    )
    .map_err(|_| ClientError::Protocol("invalid kem key".into()))?;
    let (mut secret, kem_ciphertext) =
        their_kem_pub.try_encaps_with_rng(&mut OsRng).map_err(|_| ClientError::Protocol("kem encapsulation failed".into()))?;
    let secret_bytes = secret.clone().into_bytes();
    secret.zeroize();

    let mut hasher = Sha256::new();
    hasher.update(key.as_ref());
    hasher.update(secret_bytes);
    let shared_secret: [u8; 32] = hasher.finalize().into();

    let dh_self_private = StaticSecret::random_from_rng(OsRng);
    let ratchet = Ratchet::init_bob(shared_secret, dh_self_private);
    let ratchet_dh_pub = ratchet.dh_public();
    store.insert_ratchet(&fingerprint, ratchet)?;
    store.save_peer(&their_identity)?;

    let response = IdentityKX {
        identity: my_identity.public().clone(),
        kem_ciphertext: kem_ciphertext.into_bytes().to_vec(),
        ratchet_dh_pub,
    };
    let response_bytes =
        serde_json::to_vec(&response).map_err(|_| ClientError::Protocol("identity exchange reply encode failed".into()))?;
    let (sealed_ciphertext, sealed_nonce) = blob_cipher::encrypt(&response_bytes, &key);
    let sealed_reply = blob_cipher::pack_nonce(&sealed_nonce, &sealed_ciphertext);

    let reply = dispatch
        .request(|tag| WireMessage::Deliver { tag, to: fingerprint.clone(), sealed: sealed_reply.clone(), cleartext: false })
        .await?;
    match reply {
        WireMessage::Ack { .. } => Ok(fingerprint),
        WireMessage::Error { code, .. } => Err(ClientError::Protocol(code)),
        _ => Err(ClientError::Protocol("unexpected reply to the identity exchange delivery".into())),
    }
}

/// Step 3. Tries every pending rendezvous key this node still holds against a sealed
/// payload pulled off the wire (a `Push` or a `Pull` backlog entry). Returns `None`
/// without error if no pending key opens it — the caller should then treat `sealed` as
/// an ordinary ratchet-sealed message instead. Returns the responder's fingerprint on a
/// completed bootstrap.
pub fn try_complete(store: &Store, my_identity: &FullIdentity, sealed: &[u8]) -> Result<Option<String>, ClientError> {
    let Some((blob_key_bytes, plaintext)) = store.try_open_pending(sealed)? else {
        return Ok(None);
    };
    let response: IdentityKX =
        serde_json::from_slice(&plaintext).map_err(|_| ClientError::Protocol("malformed identity exchange reply".into()))?;
    response.identity.verify()?;

    let fingerprint = response.identity.fingerprint_hex();
    if fingerprint == my_identity.public().fingerprint_hex() {
        return Err(ClientError::SelfBootstrap);
    }
    if store.has_ratchet(&fingerprint) {
        return Err(ClientError::RatchetStateMismatch);
    }

    let kem_ciphertext = CipherText::try_from_bytes(
        response.kem_ciphertext.as_slice().try_into().map_err(|_| ClientError::Protocol("bad kem ciphertext length".into()))?,
    )
    .map_err(|_| ClientError::Protocol("invalid kem ciphertext".into()))?;
    let mut secret = my_identity
        .kem_private()
        .try_decaps(&kem_ciphertext)
        .map_err(|_| ClientError::Protocol("kem decapsulation failed".into()))?;
    let secret_bytes = secret.clone().into_bytes();
    secret.zeroize();

    let mut hasher = Sha256::new();
    hasher.update(blob_key_bytes);
    hasher.update(secret_bytes);
    let shared_secret: [u8; 32] = hasher.finalize().into();

    let ratchet = Ratchet::init_alice(shared_secret, response.ratchet_dh_pub)?;
    store.insert_ratchet(&fingerprint, ratchet)?;
    store.save_peer(&response.identity)?;
    Ok(Some(fingerprint))
}

/// Drops the ratchet held for `peer_fingerprint` and asks the peer to do the same, via
/// the one payload ever allowed across the relay unsealed — there is no shared secret
/// left to seal it under once the ratchet that would carry it is gone.
pub async fn reset<S>(dispatch: &mut Dispatch<S>, store: &Store, peer_fingerprint: &str) -> Result<(), ClientError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    store.delete_ratchet(peer_fingerprint)?;
    let payload =
        serde_json::to_vec(&ProxyCommand::ResetRatchet).map_err(|_| ClientError::Protocol("reset command encode failed".into()))?;
    let reply = dispatch
        .request(|tag| WireMessage::Deliver { tag, to: peer_fingerprint.to_string(), sealed: payload.clone(), cleartext: true })
        .await?;
    match reply {
        WireMessage::Ack { .. } => Ok(()),
        WireMessage::Error { code, .. } => Err(ClientError::Protocol(code)),
        _ => Err(ClientError::Protocol("unexpected reply to a reset delivery".into())),
    }
}

/// Handles an inbound cleartext payload (`cleartext = true` on a `Push` or a `Deliver`
/// reply). The only command today is `ResetRatchet`: drop whatever ratchet is on file
/// for `from`, so the next bootstrap attempt starts clean on both sides.
pub fn handle_cleartext(store: &Store, from: &str, sealed: &[u8]) -> Result<(), ClientError> {
    let command: ProxyCommand =
        serde_json::from_slice(sealed).map_err(|_| ClientError::Protocol("malformed proxy command".into()))?;
    match command {
        ProxyCommand::ResetRatchet => store.delete_ratchet(from).map_err(ClientError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatch;
    use protocol::kx::Variant;
    use protocol::session::Session;
    use std::path::PathBuf;

    fn tempdir(label: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("idkx-test-{label}-{}", uuid::Uuid::new_v4()));
        dir
    }

    /// Drives both sides of a bootstrap against an in-process fake relay: one task plays
    /// the server's `StoreRendezvous`/`FetchRendezvous`/`Deliver` handling directly so
    /// the test stays independent of the `server` crate.
    #[tokio::test]
    async fn full_bootstrap_yields_matching_ratchets() {
        let alice_identity = FullIdentity::generate("alice", "al");
        let bob_identity = FullIdentity::generate("bob", "b");
        let alice_store = Store::open(tempdir("alice")).unwrap();
        let bob_store = Store::open(tempdir("bob")).unwrap();

        let key = [0x55u8; 32];
        let (alice_stream, mut relay_to_alice) = tokio::io::duplex(1 << 16).into_split();
        let mut alice_dispatch = Dispatch::new(Session::new(Variant::PostQuantum, key, key), alice_stream, 4);

        let (bob_stream, mut relay_to_bob) = tokio::io::duplex(1 << 16).into_split();
        let mut bob_dispatch = Dispatch::new(Session::new(Variant::PostQuantum, key, key), bob_stream, 4);

        let rendezvous: std::sync::Arc<std::sync::Mutex<Option<protocol::wire::RendezvousEntry>>> =
            std::sync::Arc::new(std::sync::Mutex::new(None));
        let spooled_for_alice: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>> = std::sync::Arc::new(std::sync::Mutex::new(vec![]));

        let alice_fp = alice_identity.public().fingerprint_hex();

        let relay_rendezvous = rendezvous.clone();
        let relay_task_alice = tokio::spawn(async move {
            let mut relay_session = Session::new(Variant::PostQuantum, key, key);
            let frame = relay_session.read_frame(&mut relay_to_alice).await.unwrap();
            let message: WireMessage = serde_json::from_slice(&frame).unwrap();
            let tag = match &message {
                WireMessage::StoreRendezvous { tag, .. } => *tag,
                _ => panic!("expected a rendezvous store"),
            };
            if let WireMessage::StoreRendezvous { entry, .. } = message {
                *relay_rendezvous.lock().unwrap() = Some(entry);
            }
            let reply = WireMessage::Ack { tag };
            let bytes = serde_json::to_vec(&reply).unwrap();
            relay_session.write_frame(&mut relay_to_alice, &bytes).await.unwrap();
        });

        create_rendezvous(&mut alice_dispatch, &alice_store, &alice_identity, "424242", 3600).await.unwrap();
        relay_task_alice.await.unwrap();

        let relay_rendezvous = rendezvous.clone();
        let relay_spooled = spooled_for_alice.clone();
        let relay_task_bob = tokio::spawn(async move {
            let mut relay_session = Session::new(Variant::PostQuantum, key, key);

            let frame = relay_session.read_frame(&mut relay_to_bob).await.unwrap();
            let message: WireMessage = serde_json::from_slice(&frame).unwrap();
            let tag = match &message {
                WireMessage::FetchRendezvous { tag, .. } => *tag,
                _ => panic!("expected a rendezvous fetch"),
            };
            let entry = relay_rendezvous.lock().unwrap().take().unwrap();
            let reply = WireMessage::Deliver { tag, to: "bob".to_string(), sealed: entry.blob, cleartext: false };
            let bytes = serde_json::to_vec(&reply).unwrap();
            relay_session.write_frame(&mut relay_to_bob, &bytes).await.unwrap();

            let frame = relay_session.read_frame(&mut relay_to_bob).await.unwrap();
            let message: WireMessage = serde_json::from_slice(&frame).unwrap();
            let tag = match &message {
                WireMessage::Deliver { tag, .. } => *tag,
                _ => panic!("expected a delivery"),
            };
            if let WireMessage::Deliver { sealed, .. } = message {
                relay_spooled.lock().unwrap().push(sealed);
            }
            let reply = WireMessage::Ack { tag };
            let bytes = serde_json::to_vec(&reply).unwrap();
            relay_session.write_frame(&mut relay_to_bob, &bytes).await.unwrap();
        });

        let bob_saw = accept_rendezvous(&mut bob_dispatch, &bob_store, &bob_identity, "424242").await.unwrap();
        relay_task_bob.await.unwrap();
        assert_eq!(bob_saw, alice_fp);
        assert!(bob_store.has_ratchet(&alice_fp));

        let sealed_for_alice = spooled_for_alice.lock().unwrap().pop().unwrap();
        let alice_saw = try_complete(&alice_store, &alice_identity, &sealed_for_alice).unwrap().unwrap();
        assert_eq!(alice_saw, bob_identity.public().fingerprint_hex());
        assert!(alice_store.has_ratchet(&bob_identity.public().fingerprint_hex()));

        alice_store.use_ratchet(&bob_identity.public().fingerprint_hex(), |ratchet| {
            let framed = ratchet.encrypt(b"hello bob", b"")?;
            bob_store.use_ratchet(&alice_fp, |bob_ratchet| {
                assert_eq!(bob_ratchet.decrypt(&framed, b"")?, b"hello bob");
                Ok(())
            })
            .unwrap();
            Ok(())
        }).unwrap();
    }

    #[test]
    fn an_unrelated_blob_does_not_match_a_pending_key() {
        let store = Store::open(tempdir("nomatch")).unwrap();
        let (key, _salt) = blob_cipher::new_key(b"424242", Cost::Hardened);
        store.add_pending(hash_pin("424242"), key, 3600);

        let (other_key, _salt) = blob_cipher::new_key(b"someone else's secret", Cost::Default);
        let (ciphertext, nonce) = blob_cipher::encrypt(b"not for you", &other_key);
        let sealed = blob_cipher::pack_nonce(&nonce, &ciphertext);
        assert!(store.try_open_pending(&sealed).unwrap().is_none());
    }

    #[test]
    fn handle_cleartext_drops_the_named_peers_ratchet() {
        let store = Store::open(tempdir("reset")).unwrap();
        let remote_private = StaticSecret::random_from_rng(OsRng);
        let remote_public = x25519_dalek::PublicKey::from(&remote_private).to_bytes();
        let ratchet = Ratchet::init_alice([0x09u8; 32], remote_public).unwrap();
        store.insert_ratchet("peer-fp", ratchet).unwrap();

        let payload = serde_json::to_vec(&ProxyCommand::ResetRatchet).unwrap();
        handle_cleartext(&store, "peer-fp", &payload).unwrap();
        assert!(!store.has_ratchet("peer-fp"));
    }
}
