//! A single node's view of the protocol: connects to a relay, carries it through
//! presession and the keyed handshake, and exposes the operations an application
//! builds on — identity bootstrap, sending and receiving ratchet-sealed messages, and
//! tearing down a suspect ratchet.
//!
//! Mirrors `server`'s connection setup (`server::main::handle_connection`/
//! `run_session`) from the other end of the wire: the same presession commands, the
//! same handshake choreography keyed by `settings.kx_variant`, the same `Welcome` frame
//! immediately after.

pub mod dispatch;
pub mod errors;
pub mod idkx;
pub mod ratchet_store;
pub mod tls;

use common::config::Settings;
use dispatch::Dispatch;
use errors::ClientError;
use fips203::ml_kem_768::EncapsKey;
use fips203::traits::SerDes;
use log::info;
use protocol::constants::PROTOCOL_VERSION;
use protocol::identity::{FullIdentity, PublicIdentity};
use protocol::kx::Variant;
use protocol::session::Session;
use protocol::wire::{PreSessionCommand, PreSessionReply, SpoolEntry, WireMessage};
use protocol::{handshake, presession};
use ratchet_store::Store;
use std::path::Path;
use tokio::net::TcpStream;

/// One fully processed item off the relay: a decrypted message, a completed bootstrap,
/// or a peer's request that this side drop its ratchet for them.
pub enum Incoming {
    Message { from: String, plaintext: Vec<u8> },
    BootstrapCompleted { fingerprint: String },
    Reset { from: String },
}

pub struct Client<S = TcpStream> {
    dispatch: Dispatch<S>,
    store: Store,
    identity: FullIdentity,
}

impl Client<TcpStream> {
    /// Connects to `settings.server_ip:server_port` over plain TCP and runs the
    /// presession + handshake sequence. See [`Client::connect_over`] for the shared
    /// logic; this is the untunneled entry point used when no TLS cert is configured.
    pub async fn connect(
        settings: &Settings,
        identity: FullIdentity,
        store_dir: impl AsRef<Path>,
        register: bool,
        creation_token: Option<String>,
    ) -> Result<Self, ClientError> {
        let addr = format!("{}:{}", settings.server_ip, settings.server_port);
        let stream = TcpStream::connect(&addr).await?;
        Self::connect_over(stream, settings, identity, store_dir, register, creation_token).await
    }
}

impl Client<tokio_rustls::client::TlsStream<TcpStream>> {
    /// Dials `settings.server_ip:server_port` over TLS first (see [`tls::connect`]),
    /// then runs the same presession + handshake sequence as [`Client::connect`].
    /// Returns the server's TLS leaf certificate fingerprint alongside the client so
    /// the caller can print it for out-of-band cross-checking; the real trust anchor
    /// is still the signed `Identify` reply, not this transport's certificate.
    pub async fn connect_tls(
        settings: &Settings,
        tls_server_name: &str,
        identity: FullIdentity,
        store_dir: impl AsRef<Path>,
        register: bool,
        creation_token: Option<String>,
    ) -> Result<(Self, String), ClientError> {
        let addr = format!("{}:{}", settings.server_ip, settings.server_port);
        let conn = tls::connect(&addr, tls_server_name).await?;
        let client = Self::connect_over(conn.stream, settings, identity, store_dir, register, creation_token).await?;
        Ok((client, conn.server_fingerprint_hex))
    }
}

impl<S> Client<S>
where
    S: tokio::io::AsyncReadExt + tokio::io::AsyncWriteExt + Unpin,
{
    /// Runs presession (identify, optional account creation, session) plus the
    /// handshake named by `settings.kx_variant` over an already-established `stream`,
    /// TLS-wrapped or not — the framed, authenticated `Session` on top makes no
    /// distinction once the handshake completes.
    pub async fn connect_over(
        mut stream: S,
        settings: &Settings,
        identity: FullIdentity,
        store_dir: impl AsRef<Path>,
        register: bool,
        creation_token: Option<String>,
    ) -> Result<Self, ClientError> {
        let server_identity = identify(&mut stream).await?;
        info!("server identifies as {}", server_identity.fingerprint_hex());

        if register {
            create_account(&mut stream, identity.public().clone(), creation_token).await?;
        }

        presession::send_command(&mut stream, &PreSessionCommand::Session { fingerprint: identity.public().fingerprint_hex() })
            .await?;
        match presession::recv_reply(&mut stream).await? {
            PreSessionReply::ProceedToHandshake => {}
            _ => return Err(ClientError::Protocol("expected to proceed to the handshake".into())),
        }

        let mut session = run_handshake(&mut stream, settings.kx_variant, &identity, &server_identity).await?;
        await_welcome(&mut session, &mut stream).await?;

        let dispatch = Dispatch::new(session, stream, settings.tag_depth);
        let store = Store::open(store_dir)?;
        Ok(Self { dispatch, store, identity })
    }
}

impl<S> Client<S>
where
    S: tokio::io::AsyncReadExt + tokio::io::AsyncWriteExt + Unpin,
{
    pub fn fingerprint(&self) -> String {
        self.identity.public().fingerprint_hex()
    }

    /// Step 1 of identity bootstrap: seal this node's identity under `pin` and stash it
    /// at the relay for the peer to fetch.
    pub async fn start_bootstrap(&mut self, pin: &str, ttl_secs: u64) -> Result<(), ClientError> {
        idkx::create_rendezvous(&mut self.dispatch, &self.store, &self.identity, pin, ttl_secs).await
    }

    /// Step 2: fetch the identity a peer stashed under `pin`, key a ratchet for them,
    /// and deliver the reply. Returns the peer's fingerprint.
    pub async fn accept_bootstrap(&mut self, pin: &str) -> Result<String, ClientError> {
        idkx::accept_rendezvous(&mut self.dispatch, &self.store, &self.identity, pin).await
    }

    /// Drops the ratchet held for `peer_fingerprint` and asks them to drop theirs too.
    pub async fn reset(&mut self, peer_fingerprint: &str) -> Result<(), ClientError> {
        idkx::reset(&mut self.dispatch, &self.store, peer_fingerprint).await
    }

    /// Looks a fingerprint up on the relay's account directory and, if found and the
    /// signature checks out, caches it in the local peer directory.
    pub async fn lookup(&mut self, fingerprint: &str) -> Result<Option<PublicIdentity>, ClientError> {
        let reply = self.dispatch.request(|tag| WireMessage::Lookup { tag, fingerprint: fingerprint.to_string() }).await?;
        match reply {
            WireMessage::Identity { identity, .. } => {
                if let Some(ref found) = identity {
                    found.verify()?;
                    self.store.save_peer(found)?;
                }
                Ok(identity)
            }
            WireMessage::Error { code, .. } => Err(ClientError::Protocol(code)),
            _ => Err(ClientError::Protocol("unexpected reply to a lookup".into())),
        }
    }

    /// Opts this account into the relay's public directory, so a peer who only knows
    /// its nickname can find it via `find_by_nick` without an out-of-band fingerprint
    /// exchange first.
    pub async fn publish(&mut self) -> Result<(), ClientError> {
        let reply = self.dispatch.request(|tag| WireMessage::Publish { tag }).await?;
        match reply {
            WireMessage::Ack { .. } => Ok(()),
            WireMessage::Error { code, .. } => Err(ClientError::Protocol(code)),
            _ => Err(ClientError::Protocol("unexpected reply to a publish".into())),
        }
    }

    /// Opts back out of the public directory.
    pub async fn unpublish(&mut self) -> Result<(), ClientError> {
        let reply = self.dispatch.request(|tag| WireMessage::Unpublish { tag }).await?;
        match reply {
            WireMessage::Ack { .. } => Ok(()),
            WireMessage::Error { code, .. } => Err(ClientError::Protocol(code)),
            _ => Err(ClientError::Protocol("unexpected reply to an unpublish".into())),
        }
    }

    /// Looks up a peer by nickname among accounts that opted into the public directory.
    /// Caches the result in the local peer directory on success, same as `lookup`.
    pub async fn find_by_nick(&mut self, nick: &str) -> Result<Option<PublicIdentity>, ClientError> {
        let reply = self.dispatch.request(|tag| WireMessage::FindNick { tag, nick: nick.to_string() }).await?;
        match reply {
            WireMessage::Identity { identity, .. } => {
                if let Some(ref found) = identity {
                    found.verify()?;
                    self.store.save_peer(found)?;
                }
                Ok(identity)
            }
            WireMessage::Error { code, .. } => Err(ClientError::Protocol(code)),
            _ => Err(ClientError::Protocol("unexpected reply to a nickname lookup".into())),
        }
    }

    /// Replays every spooled message with sequence greater than `since_sequence`, for
    /// use right after reconnecting.
    pub async fn pull_backlog(&mut self, since_sequence: u64) -> Result<Vec<SpoolEntry>, ClientError> {
        let reply = self.dispatch.request(|tag| WireMessage::Pull { tag, since_sequence }).await?;
        match reply {
            WireMessage::Backlog { entries, .. } => Ok(entries),
            WireMessage::Error { code, .. } => Err(ClientError::Protocol(code)),
            _ => Err(ClientError::Protocol("unexpected reply to a backlog pull".into())),
        }
    }

    /// Ratchet-seals `plaintext` for `peer_fingerprint` and delivers it.
    pub async fn send_message(&mut self, peer_fingerprint: &str, plaintext: &[u8]) -> Result<(), ClientError> {
        let framed = self.store.use_ratchet(peer_fingerprint, |ratchet| ratchet.encrypt(plaintext, b""))?;
        let reply = self
            .dispatch
            .request(|tag| WireMessage::Deliver { tag, to: peer_fingerprint.to_string(), sealed: framed.clone(), cleartext: false })
            .await?;
        match reply {
            WireMessage::Ack { .. } => Ok(()),
            WireMessage::Error { code, .. } => Err(ClientError::Protocol(code)),
            _ => Err(ClientError::Protocol("unexpected reply to a message delivery".into())),
        }
    }

    /// Blocks for the next pushed entry and routes it: a cleartext proxy command resets
    /// a ratchet, a sealed blob that opens under a pending bootstrap key completes that
    /// bootstrap, and anything else is decrypted against the sender's ratchet. Every
    /// branch acks the push's sequence number before returning.
    pub async fn poll_incoming(&mut self) -> Result<Incoming, ClientError> {
        loop {
            let push = self.dispatch.recv_push().await?;
            let (sequence, from, sealed, cleartext) = match push {
                WireMessage::Push { sequence, from, sealed, cleartext } => (sequence, from, sealed, cleartext),
                _ => continue,
            };

            if cleartext {
                idkx::handle_cleartext(&self.store, &from, &sealed)?;
                self.dispatch.ack(sequence as u32).await?;
                return Ok(Incoming::Reset { from });
            }

            if let Some(fingerprint) = idkx::try_complete(&self.store, &self.identity, &sealed)? {
                self.dispatch.ack(sequence as u32).await?;
                return Ok(Incoming::BootstrapCompleted { fingerprint });
            }

            let plaintext = self.store.use_ratchet(&from, |ratchet| ratchet.decrypt(&sealed, b""))?;
            self.dispatch.ack(sequence as u32).await?;
            return Ok(Incoming::Message { from, plaintext });
        }
    }
}

async fn identify<S: tokio::io::AsyncReadExt + tokio::io::AsyncWriteExt + Unpin>(
    stream: &mut S,
) -> Result<PublicIdentity, ClientError> {
    presession::send_command(stream, &PreSessionCommand::Identify).await?;
    match presession::recv_reply(stream).await? {
        PreSessionReply::Identify { identity } => {
            identity.verify()?;
            Ok(identity)
        }
        _ => Err(ClientError::Protocol("expected an identify reply".into())),
    }
}

async fn create_account<S: tokio::io::AsyncReadExt + tokio::io::AsyncWriteExt + Unpin>(
    stream: &mut S,
    identity: PublicIdentity,
    token: Option<String>,
) -> Result<(), ClientError> {
    presession::send_command(stream, &PreSessionCommand::CreateAccount { token, identity }).await?;
    match presession::recv_reply(stream).await? {
        PreSessionReply::CreateAccount { error: None } => Ok(()),
        PreSessionReply::CreateAccount { error: Some(message) } => Err(ClientError::Protocol(message)),
        _ => Err(ClientError::Protocol("expected a create-account reply".into())),
    }
}

async fn run_handshake<S: tokio::io::AsyncReadExt + tokio::io::AsyncWriteExt + Unpin>(
    stream: &mut S,
    variant: Variant,
    identity: &FullIdentity,
    server_identity: &PublicIdentity,
) -> Result<Session, ClientError> {
    match variant {
        Variant::Sigma => {
            let server_pub: [u8; 32] =
                server_identity.sigma_pub.as_slice().try_into().map_err(|_| ClientError::Protocol("bad server sigma key".into()))?;
            Ok(handshake::initiate_sigma(stream, identity.sigma_identity(), &server_pub).await?)
        }
        Variant::PostQuantum => {
            let server_pub = EncapsKey::try_from_bytes(
                server_identity.kem_key.as_slice().try_into().map_err(|_| ClientError::Protocol("bad server kem key".into()))?,
            )
            .map_err(|_| ClientError::Protocol("invalid server kem key".into()))?;
            Ok(handshake::initiate_pq(stream, identity, &server_pub).await?)
        }
    }
}

async fn await_welcome<S: tokio::io::AsyncReadExt + tokio::io::AsyncWriteExt + Unpin>(
    session: &mut Session,
    stream: &mut S,
) -> Result<(), ClientError> {
    let frame = session.read_frame(stream).await?;
    // `Welcome`'s non-optional fields mean a frame missing any of them fails to
    // deserialize at all and falls into the catch-all below; `motd` is the only
    // property this client doesn't have to be sent.
    match serde_json::from_slice(&frame) {
        Ok(WireMessage::Welcome { protocol_version, .. }) if protocol_version != PROTOCOL_VERSION => {
            Err(ClientError::VersionMismatch { expected: PROTOCOL_VERSION, got: protocol_version })
        }
        Ok(WireMessage::Welcome { max_msg_size, max_chunk_size, .. }) if max_msg_size < max_chunk_size => {
            Err(ClientError::Protocol(format!("max_msg_size {} is smaller than max_chunk_size {}", max_msg_size, max_chunk_size)))
        }
        Ok(WireMessage::Welcome { .. }) => Ok(()),
        _ => Err(ClientError::Protocol("expected a welcome frame".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Exercises `Client::connect`'s full presession + PQ handshake + welcome sequence
    /// against a minimal fake relay, independent of the `server` crate.
    #[tokio::test]
    async fn connect_completes_the_handshake_and_reads_the_welcome() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_identity = FullIdentity::generate("relay", "relay");
        let server_public_for_reply = server_identity.public().clone();
        let client_identity = FullIdentity::generate("alice", "al");
        let client_kem_pub =
            EncapsKey::try_from_bytes(client_identity.public().kem_key.as_slice().try_into().unwrap()).unwrap();

        let relay = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            match presession::recv_command(&mut stream).await.unwrap() {
                PreSessionCommand::Identify => {}
                _ => panic!("expected identify"),
            }
            presession::send_reply(&mut stream, &PreSessionReply::Identify { identity: server_public_for_reply }).await.unwrap();

            match presession::recv_command(&mut stream).await.unwrap() {
                PreSessionCommand::Session { .. } => {}
                _ => panic!("expected session"),
            }
            presession::send_reply(&mut stream, &PreSessionReply::ProceedToHandshake).await.unwrap();

            let ephemeral_pool = protocol::session::EphemeralKemPool::new();
            let mut session =
                handshake::respond_pq(&mut stream, &server_identity, &client_kem_pub, &ephemeral_pool).await.unwrap();
            let welcome = WireMessage::Welcome {
                protocol_version: PROTOCOL_VERSION,
                tag_depth: protocol::constants::TAG_DEPTH_DEFAULT,
                max_attachment_size: protocol::constants::MAX_ATTACHMENT_SIZE as u64,
                max_chunk_size: protocol::constants::MAX_CHUNK_SIZE as u64,
                max_msg_size: protocol::constants::MAX_MESSAGE_SIZE as u64,
                server_time: 0,
                directory: true,
                motd: None,
            };
            let bytes = serde_json::to_vec(&welcome).unwrap();
            session.write_frame(&mut stream, &bytes).await.unwrap();
        });

        let settings = Settings { server_ip: addr.ip().to_string(), server_port: addr.port(), ..Settings::default() };
        let store_dir = {
            let mut dir = std::env::temp_dir();
            dir.push(format!("client-connect-test-{}", uuid::Uuid::new_v4()));
            dir
        };

        let client = Client::connect(&settings, client_identity, store_dir, false, None).await.unwrap();
        assert!(!client.fingerprint().is_empty());
        relay.await.unwrap();
    }
}
