//! Server-side `ProtocolDispatch`: reads framed [`WireMessage`]s off a keyed
//! [`Session`], answers rendezvous/spool requests, and keeps the connection alive with
//! a keepalive ping on write idleness. Also drives the opportunistic push side of
//! at-least-once delivery: whenever this connection's account gets a new spool entry,
//! the next loop iteration pushes it without waiting for the peer to ask.

use crate::accounts::Accounts;
use crate::errors::ServerError;
use crate::relay_spool::RelaySpool;
use crate::rendezvous::Rendezvous;
use protocol::constants::{
    KEEPALIVE_PING_SECS, MAX_ATTACHMENT_SIZE, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE, PROTOCOL_VERSION, RENDEZVOUS_MAX_TTL_HOURS,
};
use protocol::session::Session;
use protocol::wire::WireMessage;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};

pub struct Dispatch {
    accounts: Arc<Accounts>,
    rendezvous: Arc<Rendezvous>,
    spool: Arc<RelaySpool>,
    tag_depth: u32,
    motd: Option<String>,
}

impl Dispatch {
    pub fn new(accounts: Arc<Accounts>, rendezvous: Arc<Rendezvous>, spool: Arc<RelaySpool>, tag_depth: u32, motd: Option<String>) -> Self {
        Self { accounts, rendezvous, spool, tag_depth, motd }
    }

    fn welcome(&self) -> WireMessage {
        WireMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            tag_depth: self.tag_depth,
            max_attachment_size: MAX_ATTACHMENT_SIZE as u64,
            max_chunk_size: MAX_CHUNK_SIZE as u64,
            max_msg_size: MAX_MESSAGE_SIZE as u64,
            server_time: now_secs(),
            directory: true,
            motd: self.motd.clone(),
        }
    }

    /// Drives one authenticated connection end to end: sends the welcome, flushes any
    /// backlog already waiting for `fingerprint`, then loops reading messages until the
    /// peer disconnects or a keepalive round trip times out.
    pub async fn run<S>(&self, fingerprint: &str, session: &mut Session, stream: &mut S) -> Result<(), ServerError>
    where
        S: AsyncReadExt + AsyncWriteExt + Unpin,
    {
        let welcome = self.welcome();
        self.send(session, stream, &welcome).await?;
        let mut online_rx = self.spool.online(fingerprint).await?;
        self.push_oldest(fingerprint, session, stream).await?;

        loop {
            let read = timeout(Duration::from_secs(KEEPALIVE_PING_SECS * 2), session.read_frame(stream));
            match read.await {
                Ok(Ok(frame)) => {
                    let message: WireMessage = serde_json::from_slice(&frame).map_err(|_| ServerError::InvalidRequest)?;
                    if let Some(reply) = self.handle(fingerprint, message).await? {
                        self.send(session, stream, &reply).await?;
                    }
                }
                Ok(Err(_)) => {
                    self.spool.offline(fingerprint).await?;
                    return Ok(());
                }
                Err(_) => self.send(session, stream, &WireMessage::Ping).await?,
            }
            if online_rx.has_changed().unwrap_or(false) {
                online_rx.mark_unchanged();
                self.push_oldest(fingerprint, session, stream).await?;
            }
        }
    }

    /// Pushes the single oldest spooled entry, if any. At most one push is ever
    /// in flight per account: the next one only goes out once the peer's `Ack`
    /// deletes this one, either on the next notify wakeup or the next keepalive tick.
    async fn push_oldest<S>(&self, fingerprint: &str, session: &mut Session, stream: &mut S) -> Result<(), ServerError>
    where
        S: AsyncWriteExt + Unpin,
    {
        if let Some(entry) = self.spool.pull(fingerprint).await? {
            let push = WireMessage::Push {
                sequence: entry.sequence,
                from: entry.from,
                sealed: entry.sealed_blob,
                cleartext: entry.cleartext,
            };
            self.send(session, stream, &push).await?;
        }
        Ok(())
    }

    async fn send<S>(&self, session: &mut Session, stream: &mut S, message: &WireMessage) -> Result<(), ServerError>
    where
        S: AsyncWriteExt + Unpin,
    {
        let bytes = serde_json::to_vec(message).map_err(|_| ServerError::InvalidRequest)?;
        session.write_frame(stream, &bytes).await?;
        Ok(())
    }

    async fn handle(&self, fingerprint: &str, message: WireMessage) -> Result<Option<WireMessage>, ServerError> {
        match message {
            WireMessage::Ping => Ok(Some(WireMessage::Pong)),
            WireMessage::Pong => Ok(None),
            WireMessage::Announce { tag, identity } => match self.accounts.register(identity) {
                Ok(()) | Err(ServerError::AccountAlreadyExists) => Ok(Some(WireMessage::Ack { tag })),
                Err(e) => Ok(Some(WireMessage::Error { tag, code: sanitize(&e) })),
            },
            WireMessage::Lookup { tag, fingerprint } => match self.accounts.lookup(&fingerprint) {
                Ok(identity) => Ok(Some(WireMessage::Identity { tag, identity: Some(identity) })),
                Err(ServerError::AccountNotFound) => Ok(Some(WireMessage::Identity { tag, identity: None })),
                Err(e) => Ok(Some(WireMessage::Error { tag, code: sanitize(&e) })),
            },
            WireMessage::StoreRendezvous { tag, entry } => match self.rendezvous.store(entry, RENDEZVOUS_MAX_TTL_HOURS) {
                Ok(()) => Ok(Some(WireMessage::Ack { tag })),
                Err(reason) => Ok(Some(WireMessage::Error { tag, code: reason.to_string() })),
            },
            WireMessage::FetchRendezvous { tag, pin_hash } => match self.rendezvous.take(&pin_hash) {
                Some(entry) => {
                    Ok(Some(WireMessage::Deliver { tag, to: fingerprint.to_string(), sealed: entry.blob, cleartext: false }))
                }
                None => Ok(Some(WireMessage::Error { tag, code: "not found".to_string() })),
            },
            WireMessage::Deliver { tag, to, sealed, cleartext } => {
                if !self.accounts.contains(&to) {
                    return Ok(Some(WireMessage::Error { tag, code: sanitize(&ServerError::AccountNotFound) }));
                }
                self.spool.deliver(&to, fingerprint.to_string(), sealed, cleartext).await?;
                Ok(Some(WireMessage::Ack { tag }))
            }
            WireMessage::Pull { tag, since_sequence } => {
                let entries = self.spool.find(fingerprint, since_sequence).await?;
                Ok(Some(WireMessage::Backlog { tag, entries }))
            }
            // A pushed message's sequence number doubles as its ack tag; deleting a
            // sequence that was never pushed (e.g. this is really acking a `Deliver`
            // reply) is a harmless no-op.
            WireMessage::Ack { tag } => {
                self.spool.delete(fingerprint, tag as u64).await?;
                Ok(None)
            }
            WireMessage::Publish { tag } => match self.accounts.publish(fingerprint) {
                Ok(()) => Ok(Some(WireMessage::Ack { tag })),
                Err(e) => Ok(Some(WireMessage::Error { tag, code: sanitize(&e) })),
            },
            WireMessage::Unpublish { tag } => {
                self.accounts.unpublish(fingerprint);
                Ok(Some(WireMessage::Ack { tag }))
            }
            WireMessage::FindNick { tag, nick } => {
                Ok(Some(WireMessage::Identity { tag, identity: self.accounts.find_by_nick(&nick) }))
            }
            WireMessage::Identity { .. }
            | WireMessage::Backlog { .. }
            | WireMessage::Push { .. }
            | WireMessage::Error { .. }
            | WireMessage::Welcome { .. } => Ok(None),
        }
    }
}

/// Maps an internal error to the sanitized string a peer is allowed to see, per the
/// rule that server-side detail never crosses the wire.
fn sanitize(error: &ServerError) -> String {
    match error {
        ServerError::AccountNotFound => "account not found".to_string(),
        ServerError::AccountAlreadyExists => "account already exists".to_string(),
        ServerError::AccountDisabled => "account disabled".to_string(),
        ServerError::InvalidRequest => "invalid request".to_string(),
        ServerError::AlreadyOnline => "account already online".to_string(),
        _ => "internal error".to_string(),
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::kx::Variant;

    #[tokio::test]
    async fn welcome_is_the_first_frame() {
        let accounts = Arc::new(Accounts::new());
        let rendezvous = Arc::new(Rendezvous::new());
        let spool = Arc::new(RelaySpool::new(std::env::temp_dir().join("dispatch-test-welcome")));
        let dispatch = Arc::new(Dispatch::new(accounts, rendezvous, spool, protocol::constants::TAG_DEPTH_DEFAULT, None));

        let (mut client_stream, mut server_stream) = tokio::io::duplex(8192).into_split();
        let key = [0x09u8; 32];
        let mut server_session = Session::new(Variant::PostQuantum, key, key);
        let mut client_session = Session::new(Variant::PostQuantum, key, key);

        let handle = tokio::spawn(async move {
            let _ = dispatch.run("alice-fp", &mut server_session, &mut server_stream).await;
        });

        let frame = client_session.read_frame(&mut client_stream).await.unwrap();
        let message: WireMessage = serde_json::from_slice(&frame).unwrap();
        assert!(matches!(message, WireMessage::Welcome { protocol_version, .. } if protocol_version == PROTOCOL_VERSION));
        handle.abort();
    }

    #[tokio::test]
    async fn deliver_to_an_unknown_account_is_rejected() {
        let accounts = Arc::new(Accounts::new());
        let rendezvous = Arc::new(Rendezvous::new());
        let spool = Arc::new(RelaySpool::new(std::env::temp_dir().join("dispatch-test-deliver")));
        let dispatch = Dispatch::new(accounts, rendezvous, spool, protocol::constants::TAG_DEPTH_DEFAULT, None);

        let reply = dispatch
            .handle("alice-fp", WireMessage::Deliver { tag: 1, to: "ghost".to_string(), sealed: vec![1, 2, 3], cleartext: false })
            .await
            .unwrap();
        assert!(matches!(reply, Some(WireMessage::Error { tag: 1, .. })));
    }

    #[tokio::test]
    async fn deliver_to_a_known_account_spools_and_acks() {
        use protocol::identity::FullIdentity;

        let accounts = Arc::new(Accounts::new());
        let rendezvous = Arc::new(Rendezvous::new());
        let spool = Arc::new(RelaySpool::new(std::env::temp_dir().join("dispatch-test-deliver-ok")));
        let bob = FullIdentity::generate("bob", "b");
        accounts.register(bob.public().clone()).unwrap();
        let dispatch = Dispatch::new(accounts, rendezvous, spool.clone(), protocol::constants::TAG_DEPTH_DEFAULT, None);

        let reply = dispatch
            .handle(
                "alice-fp",
                WireMessage::Deliver { tag: 7, to: bob.public().fingerprint_hex(), sealed: vec![9, 9, 9], cleartext: false },
            )
            .await
            .unwrap();
        assert!(matches!(reply, Some(WireMessage::Ack { tag: 7 })));
        let pulled = spool.pull(&bob.public().fingerprint_hex()).await.unwrap().unwrap();
        assert_eq!(pulled.sealed_blob, vec![9, 9, 9]);
    }

    #[tokio::test]
    async fn find_nick_only_returns_published_identities() {
        use protocol::identity::FullIdentity;

        let accounts = Arc::new(Accounts::new());
        let rendezvous = Arc::new(Rendezvous::new());
        let spool = Arc::new(RelaySpool::new(std::env::temp_dir().join("dispatch-test-findnick")));
        let carol = FullIdentity::generate("carol", "carol99");
        accounts.register(carol.public().clone()).unwrap();
        let dispatch = Dispatch::new(accounts, rendezvous, spool, protocol::constants::TAG_DEPTH_DEFAULT, None);

        let miss = dispatch.handle(&carol.public().fingerprint_hex(), WireMessage::FindNick { tag: 1, nick: "carol99".into() }).await.unwrap();
        assert!(matches!(miss, Some(WireMessage::Identity { tag: 1, identity: None })));

        let published = dispatch
            .handle(&carol.public().fingerprint_hex(), WireMessage::Publish { tag: 2 })
            .await
            .unwrap();
        assert!(matches!(published, Some(WireMessage::Ack { tag: 2 })));

        let hit = dispatch.handle("someone-else-fp", WireMessage::FindNick { tag: 3, nick: "carol99".into() }).await.unwrap();
        assert!(matches!(hit, Some(WireMessage::Identity { tag: 3, identity: Some(ref id) }) if id.nick == "carol99"));
    }
}
