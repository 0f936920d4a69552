//! Variant B: a post-quantum handshake built from four independent ML-KEM-768
//! encapsulations — each side encapsulating twice, to the other's static identity key
//! and its current ephemeral key — combined with SHA-512. This is the default wire
//! protocol version; Variant A ([`super::sigma`]) is retained but must be explicitly
//! selected, never negotiated (see `session::Variant`).

use crate::errors::SessionError;
use fips203::ml_kem_768::{CipherText, DecapsKey, EncapsKey};
use fips203::traits::{Decaps, Encaps, SerDes};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

/// The two ciphertexts one side sends after encapsulating to the peer's static and
/// ephemeral public keys.
pub struct Ciphertexts2 {
    pub to_static: Vec<u8>,
    pub to_ephemeral: Vec<u8>,
}

/// Encapsulates to `ek_static` and `ek_ephemeral`, returning the ciphertexts to send and
/// the two raw shared secrets recovered locally.
pub fn encapsulate_two(ek_static: &EncapsKey, ek_ephemeral: &EncapsKey) -> Result<(Ciphertexts2, [[u8; 32]; 2]), SessionError> {
    let (mut k_a, ct_a) = ek_static.clone().try_encaps_with_rng(&mut OsRng).map_err(|_| SessionError::InvalidKx)?;
    let (mut k_b, ct_b) = ek_ephemeral.clone().try_encaps_with_rng(&mut OsRng).map_err(|_| SessionError::InvalidKx)?;
    let secrets = [bytes_of(&k_a), bytes_of(&k_b)];
    k_a.zeroize();
    k_b.zeroize();
    Ok((
        Ciphertexts2 {
            to_static: ct_a.into_bytes().to_vec(),
            to_ephemeral: ct_b.into_bytes().to_vec(),
        },
        secrets,
    ))
}

/// Decapsulates ciphertexts addressed to `dk_static` and `dk_ephemeral`.
pub fn decapsulate_two(dk_static: &DecapsKey, dk_ephemeral: &DecapsKey, cts: &Ciphertexts2) -> Result<[[u8; 32]; 2], SessionError> {
    let ct_a = CipherText::try_from_bytes(cts.to_static.as_slice().try_into().map_err(|_| SessionError::InvalidKx)?)
        .map_err(|_| SessionError::InvalidKx)?;
    let ct_b = CipherText::try_from_bytes(cts.to_ephemeral.as_slice().try_into().map_err(|_| SessionError::InvalidKx)?)
        .map_err(|_| SessionError::InvalidKx)?;
    let mut k_a = dk_static.try_decaps(&ct_a).map_err(|_| SessionError::InvalidKx)?;
    let mut k_b = dk_ephemeral.try_decaps(&ct_b).map_err(|_| SessionError::InvalidKx)?;
    let secrets = [bytes_of(&k_a), bytes_of(&k_b)];
    k_a.zeroize();
    k_b.zeroize();
    Ok(secrets)
}

fn bytes_of(key: &fips203::ml_kem_768::SharedSecretKey) -> [u8; 32] {
    key.clone().into_bytes()
}

/// Folds the four shared secrets from both directions into one 64-byte transport seed.
/// `initiator_pair` is the secrets the initiator recovered by encapsulating to the
/// responder; `responder_pair` is what the responder recovered encapsulating back. The
/// order is fixed so both sides compute the identical seed.
pub fn combine(initiator_pair: &[[u8; 32]; 2], responder_pair: &[[u8; 32]; 2]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(initiator_pair[0]);
    hasher.update(initiator_pair[1]);
    hasher.update(responder_pair[0]);
    hasher.update(responder_pair[1]);
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Splits the 64-byte combined seed into a read/write key pair, one half per direction.
pub fn split_directional(seed: &[u8; 64], initiator: bool) -> ([u8; 32], [u8; 32]) {
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&seed[..32]);
    b.copy_from_slice(&seed[32..]);
    if initiator {
        (b, a)
    } else {
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fips203::ml_kem_768::KG;
    use fips203::traits::KeyGen;

    #[test]
    fn both_sides_compute_the_same_seed() {
        let (initiator_static_ek, initiator_static_dk) = KG::try_keygen_with_rng(&mut OsRng).unwrap();
        let (initiator_eph_ek, initiator_eph_dk) = KG::try_keygen_with_rng(&mut OsRng).unwrap();
        let (responder_static_ek, responder_static_dk) = KG::try_keygen_with_rng(&mut OsRng).unwrap();
        let (responder_eph_ek, responder_eph_dk) = KG::try_keygen_with_rng(&mut OsRng).unwrap();

        // Initiator encapsulates to the responder's keys.
        let (cts_to_responder, initiator_pair) = encapsulate_two(&responder_static_ek, &responder_eph_ek).unwrap();
        let responder_recovered = decapsulate_two(&responder_static_dk, &responder_eph_dk, &cts_to_responder).unwrap();
        assert_eq!(initiator_pair, responder_recovered);

        // Responder encapsulates back to the initiator's keys.
        let (cts_to_initiator, responder_pair) = encapsulate_two(&initiator_static_ek, &initiator_eph_ek).unwrap();
        let initiator_recovered = decapsulate_two(&initiator_static_dk, &initiator_eph_dk, &cts_to_initiator).unwrap();
        assert_eq!(responder_pair, initiator_recovered);

        let seed_initiator = combine(&initiator_pair, &initiator_recovered);
        let seed_responder = combine(&responder_recovered, &responder_pair);
        assert_eq!(seed_initiator, seed_responder);
    }

    #[test]
    fn directional_split_is_symmetric_across_roles() {
        let seed = [0x11u8; 64];
        let (initiator_read, initiator_write) = split_directional(&seed, true);
        let (responder_read, responder_write) = split_directional(&seed, false);
        assert_eq!(initiator_read, responder_write);
        assert_eq!(initiator_write, responder_read);
    }

    #[test]
    fn decapsulating_with_the_wrong_key_yields_a_different_pair() {
        // ML-KEM's implicit rejection means a mismatched key decapsulates to *some*
        // shared secret rather than an error.
        let (ek_static, _dk_static) = KG::try_keygen_with_rng(&mut OsRng).unwrap();
        let (ek_eph, dk_eph) = KG::try_keygen_with_rng(&mut OsRng).unwrap();
        let (_other_ek, other_dk) = KG::try_keygen_with_rng(&mut OsRng).unwrap();

        let (cts, sent) = encapsulate_two(&ek_static, &ek_eph).unwrap();
        let recovered = decapsulate_two(&other_dk, &dk_eph, &cts).unwrap();
        assert_ne!(sent, recovered);
    }
}
