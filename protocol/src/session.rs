//! The transport session: directional AES-256-GCM frame keys negotiated by one of the
//! [`crate::kx`] variants, a monotonic sequence counter per direction, and the
//! process-wide ephemeral KEM keypair a PQ-variant responder rotates every
//! [`crate::constants::EPHEMERAL_ROTATION_SECS`] seconds (see
//! [`handshake::respond_pq`](crate::handshake::respond_pq), which draws its ephemeral
//! from this pool rather than generating one per connection).

use crate::constants::{AES256_NONCE_LENGTH, EPHEMERAL_ROTATION_SECS, FRAME_LENGTH_PREFIX, MAX_MESSAGE_SIZE, SEQUENCE_LENGTH};
use crate::errors::SessionError;
use crate::kx::Variant;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use fips203::ml_kem_768::{DecapsKey, EncapsKey, KG};
use fips203::traits::{KeyGen, SerDes};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A counter incremented once per frame sent in a given direction: an 8-byte
/// little-endian integer in the low bytes of a [`SEQUENCE_LENGTH`]-byte buffer, the
/// rest left zero. Wrapping past the 8th byte is a fatal protocol error: the session
/// closes unconditionally rather than rekeying around it.
#[derive(Clone)]
pub struct SequenceCounter([u8; SEQUENCE_LENGTH]);

impl SequenceCounter {
    pub fn new() -> Self {
        Self([0u8; SEQUENCE_LENGTH])
    }

    /// Increments the low 8 bytes, little-endian, carrying as needed. Returns
    /// [`SessionError::SequenceOverflow`] once those 8 bytes were already all `0xFF`;
    /// byte 8 onward is never written.
    pub fn advance(&mut self) -> Result<(), SessionError> {
        for byte in self.0[..8].iter_mut() {
            if *byte == 0xFF {
                *byte = 0;
                continue;
            }
            *byte += 1;
            return Ok(());
        }
        Err(SessionError::SequenceOverflow)
    }

    fn nonce(&self) -> [u8; AES256_NONCE_LENGTH] {
        let mut out = [0u8; AES256_NONCE_LENGTH];
        let digest = Sha256::digest(&self.0);
        out.copy_from_slice(&digest[..AES256_NONCE_LENGTH]);
        out
    }

    pub fn bytes(&self) -> &[u8; SEQUENCE_LENGTH] {
        &self.0
    }
}

/// One direction of a session's sealed transport: a fixed key plus its own advancing
/// sequence counter.
pub struct DirectionalCipher {
    cipher: Aes256Gcm,
    sequence: SequenceCounter,
}

impl DirectionalCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            sequence: SequenceCounter::new(),
        }
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.sequence.advance()?;
        let nonce = self.sequence.nonce();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SessionError::DecryptFailure)?;
        let mut framed = Vec::with_capacity(SEQUENCE_LENGTH + ciphertext.len());
        framed.extend_from_slice(self.sequence.bytes());
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    fn open(&mut self, framed: &[u8]) -> Result<Vec<u8>, SessionError> {
        if framed.len() < SEQUENCE_LENGTH {
            return Err(SessionError::DecryptFailure);
        }
        let (sequence_bytes, ciphertext) = framed.split_at(SEQUENCE_LENGTH);
        let mut expected = self.sequence.clone();
        expected.advance()?;
        if expected.bytes().as_slice() != sequence_bytes {
            return Err(SessionError::InvalidKx);
        }
        self.sequence = expected;
        let nonce = self.sequence.nonce();
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| SessionError::DecryptFailure)
    }
}

/// A live, keyed transport session: a read half and a write half, each with its own
/// sequence counter, plus the variant that produced the keys.
pub struct Session {
    variant: Variant,
    read: DirectionalCipher,
    write: DirectionalCipher,
    max_payload: usize,
}

impl Session {
    pub fn new(variant: Variant, read_key: [u8; 32], write_key: [u8; 32]) -> Self {
        Self {
            variant,
            read: DirectionalCipher::new(read_key),
            write: DirectionalCipher::new(write_key),
            max_payload: MAX_MESSAGE_SIZE,
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Seals `plaintext` into `sequence || ciphertext`, length-prefixed, and writes it.
    /// Rejects payloads over the configured cap before touching the cipher.
    pub async fn write_frame<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, plaintext: &[u8]) -> Result<(), SessionError> {
        if plaintext.len() > self.max_payload {
            return Err(SessionError::MessageTooLarge);
        }
        let framed = self.write.seal(plaintext)?;
        let len = u32::try_from(framed.len()).map_err(|_| SessionError::MessageTooLarge)?;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&framed).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one length-prefixed frame and opens it. The length prefix is checked
    /// against `max_payload` before any read of the body, so an oversized claim fails
    /// without ever allocating or decrypting.
    pub async fn read_frame<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Vec<u8>, SessionError> {
        let mut len_buf = [0u8; FRAME_LENGTH_PREFIX];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_payload + SEQUENCE_LENGTH + 64 {
            return Err(SessionError::MessageTooLarge);
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        self.read.open(&body)
    }
}

/// The process-wide ephemeral ML-KEM-768 keypair a PQ-variant responder publishes and
/// rotates every [`EPHEMERAL_ROTATION_SECS`] seconds, under a mutex. A rotation failure
/// (RNG exhaustion) is unconditionally fatal; there is no degraded mode to fall back
/// to. `respond_pq` takes its ephemeral from [`EphemeralKemPool::snapshot`] rather than
/// generating one per connection, so the 60-second window is shared across every
/// concurrent handshake in the process, matching a long-lived relay's actual exposure.
pub struct EphemeralKemPool {
    current: Mutex<(EncapsKey, DecapsKey, Instant)>,
}

impl Default for EphemeralKemPool {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeralKemPool {
    pub fn new() -> Self {
        let (ek, dk) = KG::try_keygen_with_rng(&mut OsRng).expect("ephemeral KEM keygen failure is fatal");
        Self {
            current: Mutex::new((ek, dk, Instant::now())),
        }
    }

    fn rotate_locked(guard: &mut (EncapsKey, DecapsKey, Instant)) {
        let (ek, dk) = KG::try_keygen_with_rng(&mut OsRng).expect("ephemeral KEM keygen failure is fatal");
        guard.0 = ek;
        guard.1 = dk;
        guard.2 = Instant::now();
    }

    /// Forces a rotation regardless of elapsed time. Used by the background timer task
    /// spawned via [`EphemeralKemPool::spawn_rotation_task`].
    pub fn rotate(&self) {
        let mut guard = self.current.lock().unwrap();
        Self::rotate_locked(&mut guard);
    }

    /// Returns the currently published public half, rotating first if the last keypair
    /// is older than [`EPHEMERAL_ROTATION_SECS`].
    pub fn current_public(&self) -> EncapsKey {
        let mut guard = self.current.lock().unwrap();
        if guard.2.elapsed() >= Duration::from_secs(EPHEMERAL_ROTATION_SECS) {
            Self::rotate_locked(&mut guard);
        }
        guard.0.clone()
    }

    /// Returns a consistent `(public, private)` pair for one handshake to use start to
    /// finish, rotating first if stale. Taking both halves under the same lock
    /// acquisition avoids the pool rotating out from under a handshake between
    /// publishing its public half and later decapsulating with the private one.
    pub fn snapshot(&self) -> (EncapsKey, DecapsKey) {
        let mut guard = self.current.lock().unwrap();
        if guard.2.elapsed() >= Duration::from_secs(EPHEMERAL_ROTATION_SECS) {
            Self::rotate_locked(&mut guard);
        }
        let public = guard.0.clone();
        let private = DecapsKey::try_from_bytes(guard.1.clone().into_bytes()).expect("round-tripping a held key cannot fail");
        (public, private)
    }

    /// Spawns the timer task that forces a rotation every [`EPHEMERAL_ROTATION_SECS`]
    /// seconds for as long as the returned handle (or `pool` itself) is alive.
    pub fn spawn_rotation_task(pool: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(EPHEMERAL_ROTATION_SECS)).await;
                pool.rotate();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_counter_overflows_after_the_low_eight_bytes() {
        let mut bytes = [0u8; SEQUENCE_LENGTH];
        bytes[..8].fill(0xFF);
        let mut counter = SequenceCounter(bytes);
        assert!(matches!(counter.advance(), Err(SessionError::SequenceOverflow)));
        assert_eq!(counter.bytes()[8], 0);
        assert!(counter.bytes()[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn sequence_counter_carries_within_the_low_eight_bytes() {
        let mut bytes = [0u8; SEQUENCE_LENGTH];
        bytes[..7].fill(0xFF);
        let mut counter = SequenceCounter(bytes);
        counter.advance().unwrap();
        assert_eq!(counter.bytes()[7], 1);
        assert!(counter.bytes()[..7].iter().all(|&b| b == 0));
        assert!(counter.bytes()[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn sequence_counter_overflow_is_fatal() {
        let mut counter = SequenceCounter([0xFFu8; SEQUENCE_LENGTH]);
        assert!(matches!(counter.advance(), Err(SessionError::SequenceOverflow)));
    }

    #[tokio::test]
    async fn frame_roundtrips_through_a_duplex_pipe() {
        let (mut a_read, mut a_write) = tokio::io::duplex(4096).into_split();
        let key = [0x42u8; 32];
        let mut sender = Session::new(Variant::PostQuantum, key, key);
        let mut receiver = Session::new(Variant::PostQuantum, key, key);

        sender.write_frame(&mut a_write, b"hello").await.unwrap();
        let got = receiver.read_frame(&mut a_read).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_sealing() {
        let (_a_read, mut a_write) = tokio::io::duplex(4096).into_split();
        let key = [0x11u8; 32];
        let mut sender = Session::new(Variant::Sigma, key, key);
        let huge = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(sender.write_frame(&mut a_write, &huge).await, Err(SessionError::MessageTooLarge)));
    }

    #[test]
    fn ephemeral_pool_yields_a_consistent_keypair_within_the_rotation_window() {
        let pool = EphemeralKemPool::new();
        let pub_a = pool.current_public();
        let pub_b = pool.current_public();
        assert_eq!(pub_a.clone().into_bytes(), pub_b.into_bytes());
    }

    #[test]
    fn snapshot_public_and_private_halves_match_current_public() {
        let pool = EphemeralKemPool::new();
        let (snapshot_pub, _snapshot_priv) = pool.snapshot();
        assert_eq!(snapshot_pub.into_bytes(), pool.current_public().into_bytes());
    }

    #[test]
    fn rotate_changes_the_published_public_key() {
        let pool = EphemeralKemPool::new();
        let before = pool.current_public();
        pool.rotate();
        let after = pool.current_public();
        assert_ne!(before.into_bytes(), after.into_bytes());
    }
}
