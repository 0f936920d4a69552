//! Drives the wire-level steps of both [`crate::kx`] variants over a raw, as-yet
//! unkeyed socket and hands back a keyed [`crate::session::Session`]. The crypto
//! primitives live in `kx::sigma`/`kx::pq`; this module is only the read/write
//! choreography that gets both sides to the point of calling them.

use crate::errors::SessionError;
use crate::identity::FullIdentity;
use crate::kx::pq::{self, Ciphertexts2};
use crate::kx::sigma::{self, SigmaIdentity};
use crate::kx::Variant;
use crate::session::{EphemeralKemPool, Session};
use fips203::ml_kem_768::{EncapsKey, KG};
use fips203::traits::{KeyGen, SerDes};
use rand::rngs::OsRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

const HANDSHAKE_FRAME_CAP: usize = 1 << 20;

async fn send_frame<W: AsyncWriteExt + Unpin>(w: &mut W, data: &[u8]) -> Result<(), SessionError> {
    let len = u32::try_from(data.len()).map_err(|_| SessionError::MessageTooLarge)?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(data).await?;
    w.flush().await?;
    Ok(())
}

async fn recv_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Vec<u8>, SessionError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > HANDSHAKE_FRAME_CAP {
        return Err(SessionError::MessageTooLarge);
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

fn pack_ciphertexts(cts: &Ciphertexts2) -> Vec<u8> {
    let mut out = Vec::with_capacity(cts.to_static.len() + cts.to_ephemeral.len() + 4);
    out.extend_from_slice(&(cts.to_static.len() as u32).to_be_bytes());
    out.extend_from_slice(&cts.to_static);
    out.extend_from_slice(&cts.to_ephemeral);
    out
}

fn unpack_ciphertexts(frame: &[u8]) -> Result<Ciphertexts2, SessionError> {
    if frame.len() < 4 {
        return Err(SessionError::InvalidKx);
    }
    let (len_bytes, rest) = frame.split_at(4);
    let static_len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    if rest.len() < static_len {
        return Err(SessionError::InvalidKx);
    }
    let (to_static, to_ephemeral) = rest.split_at(static_len);
    Ok(Ciphertexts2 {
        to_static: to_static.to_vec(),
        to_ephemeral: to_ephemeral.to_vec(),
    })
}

// ---------------------------------------------------------------------------------
// Variant A: SIGMA / X25519
// ---------------------------------------------------------------------------------

/// Runs the initiator side of the three-step SIGMA handshake. `peer_static_pub` is the
/// responder's long-lived session key, pinned out of band (the analogue of a server
/// fingerprint baked into a client's config).
pub async fn initiate_sigma<S: AsyncReadExt + AsyncWriteExt + Unpin>(
    stream: &mut S,
    my_static: &SigmaIdentity,
    peer_static_pub: &[u8; 32],
) -> Result<Session, SessionError> {
    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let my_ephemeral_pub = XPublicKey::from(&ephemeral_secret).to_bytes();
    send_frame(stream, &my_ephemeral_pub).await?;

    let their_ephemeral_pub: [u8; 32] =
        recv_frame(stream).await?.try_into().map_err(|_| SessionError::InvalidKx)?;
    sigma::reject_small_order(&their_ephemeral_pub)?;

    let shared = ephemeral_secret.diffie_hellman(&XPublicKey::from(their_ephemeral_pub)).to_bytes();
    let (mut transcript, server_key, client_key) =
        sigma::derive_transport_keys(&shared, &my_ephemeral_pub, &their_ephemeral_pub);

    // The mix the responder's proof is keyed on: its static private times our ephemeral
    // public, which by commutativity equals our ephemeral private times its static
    // public (the pinned key we were given out of band).
    let mix = ephemeral_secret.diffie_hellman(&XPublicKey::from(*peer_static_pub)).to_bytes();
    let h1 = transcript.current();
    let expected_proof = sigma::server_proof(&mix, &h1);
    let sealed_proof = recv_frame(stream).await?;
    let proof: [u8; 32] = sealed_proof.as_slice().try_into().map_err(|_| SessionError::InvalidKx)?;
    if proof != expected_proof {
        return Err(SessionError::InvalidKx);
    }
    transcript.update(&proof);

    let static_shared = my_static.diffie_hellman(peer_static_pub);
    let h2 = transcript.current();
    let my_proof = sigma::client_proof(&static_shared, &h2);
    let mut payload = my_static.public.to_vec();
    payload.extend_from_slice(&my_proof);
    send_frame(stream, &payload).await?;

    Ok(Session::new(Variant::Sigma, server_key, client_key))
}

/// Runs the responder side of the three-step SIGMA handshake. Returns the session and
/// the initiator's now-verified static public key, for the caller to bind to whatever
/// account record it just authenticated.
pub async fn respond_sigma<S: AsyncReadExt + AsyncWriteExt + Unpin>(
    stream: &mut S,
    my_static: &SigmaIdentity,
) -> Result<(Session, [u8; 32]), SessionError> {
    let their_ephemeral_pub: [u8; 32] =
        recv_frame(stream).await?.try_into().map_err(|_| SessionError::InvalidKx)?;
    sigma::reject_small_order(&their_ephemeral_pub)?;

    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let my_ephemeral_pub = XPublicKey::from(&ephemeral_secret).to_bytes();
    send_frame(stream, &my_ephemeral_pub).await?;

    let shared = ephemeral_secret.diffie_hellman(&XPublicKey::from(their_ephemeral_pub)).to_bytes();
    let (mut transcript, server_key, client_key) =
        sigma::derive_transport_keys(&shared, &their_ephemeral_pub, &my_ephemeral_pub);

    let mix = my_static.diffie_hellman(&their_ephemeral_pub);
    let h1 = transcript.current();
    let proof = sigma::server_proof(&mix, &h1);
    send_frame(stream, &proof).await?;
    transcript.update(&proof);

    let payload = recv_frame(stream).await?;
    if payload.len() != 32 + 32 {
        return Err(SessionError::InvalidKx);
    }
    let (their_static_pub_bytes, proof_bytes) = payload.split_at(32);
    let their_static_pub: [u8; 32] = their_static_pub_bytes.try_into().unwrap();
    sigma::reject_small_order(&their_static_pub)?;

    let static_shared = my_static.diffie_hellman(&their_static_pub);
    let h2 = transcript.current();
    let expected = sigma::client_proof(&static_shared, &h2);
    if proof_bytes != expected {
        return Err(SessionError::InvalidKx);
    }

    Ok((Session::new(Variant::Sigma, client_key, server_key), their_static_pub))
}

// ---------------------------------------------------------------------------------
// Variant B: post-quantum (ML-KEM-768 stand-in for Streamlined NTRU Prime)
// ---------------------------------------------------------------------------------

/// Runs the initiator side of the four-encapsulation PQ handshake. `peer_static_pub` is
/// the responder's long-term KEM public key (its [`FullIdentity`]'s `kem_key`), pinned
/// or looked up the same way a SIGMA static key is pinned.
pub async fn initiate_pq<S: AsyncReadExt + AsyncWriteExt + Unpin>(
    stream: &mut S,
    my_identity: &FullIdentity,
    peer_static_pub: &EncapsKey,
) -> Result<Session, SessionError> {
    let (eph_ek, eph_dk) = KG::try_keygen_with_rng(&mut OsRng).map_err(|_| SessionError::InvalidKx)?;
    send_frame(stream, &eph_ek.clone().into_bytes()).await?;

    let their_eph_bytes = recv_frame(stream).await?;
    let their_eph_ek = EncapsKey::try_from_bytes(their_eph_bytes.as_slice().try_into().map_err(|_| SessionError::InvalidKx)?)
        .map_err(|_| SessionError::InvalidKx)?;

    let (cts_out, initiator_pair) = pq::encapsulate_two(peer_static_pub, &their_eph_ek)?;
    send_frame(stream, &pack_ciphertexts(&cts_out)).await?;

    let cts_in_frame = recv_frame(stream).await?;
    let cts_in = unpack_ciphertexts(&cts_in_frame)?;
    let responder_pair = pq::decapsulate_two(my_identity.kem_private(), &eph_dk, &cts_in)?;

    let seed = pq::combine(&initiator_pair, &responder_pair);
    let (read_key, write_key) = pq::split_directional(&seed, true);
    Ok(Session::new(Variant::PostQuantum, read_key, write_key))
}

/// Runs the responder side of the four-encapsulation PQ handshake. `peer_static_pub` is
/// the initiator's long-term KEM public key, already known from the account record (or
/// `Announce`) this connection authenticates against. The responder's ephemeral half
/// comes from `ephemeral_pool` rather than a fresh per-connection keypair, so the
/// 60-second rotation window is shared across every concurrent handshake.
pub async fn respond_pq<S: AsyncReadExt + AsyncWriteExt + Unpin>(
    stream: &mut S,
    my_identity: &FullIdentity,
    peer_static_pub: &EncapsKey,
    ephemeral_pool: &EphemeralKemPool,
) -> Result<Session, SessionError> {
    let their_eph_bytes = recv_frame(stream).await?;
    let their_eph_ek = EncapsKey::try_from_bytes(their_eph_bytes.as_slice().try_into().map_err(|_| SessionError::InvalidKx)?)
        .map_err(|_| SessionError::InvalidKx)?;

    let (eph_ek, eph_dk) = ephemeral_pool.snapshot();
    send_frame(stream, &eph_ek.clone().into_bytes()).await?;

    let cts_in_frame = recv_frame(stream).await?;
    let cts_in = unpack_ciphertexts(&cts_in_frame)?;
    let initiator_pair = pq::decapsulate_two(my_identity.kem_private(), &eph_dk, &cts_in)?;

    let (cts_out, responder_pair) = pq::encapsulate_two(peer_static_pub, &their_eph_ek)?;
    send_frame(stream, &pack_ciphertexts(&cts_out)).await?;

    let seed = pq::combine(&initiator_pair, &responder_pair);
    let (read_key, write_key) = pq::split_directional(&seed, false);
    Ok(Session::new(Variant::PostQuantum, read_key, write_key))
}
