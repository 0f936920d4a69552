//! Client-side half of `ProtocolDispatch`: sends tagged requests over a keyed
//! [`Session`] and blocks until the matching reply arrives, transparently answering
//! keepalive pings and stashing unsolicited `Push` frames for `recv_push`/`poll_inbox`
//! to drain later.
//!
//! `Session::read_frame`/`write_frame` both take `&mut self` on the same struct, so
//! unlike the server (which owns one task per connection and can freely interleave
//! reads and the occasional push write) this dispatch assumes its caller drives it
//! sequentially: one outstanding request at a time. That is the shape every orchestrator
//! in this crate (`idkx`, `Client`) actually needs — nothing here pipelines requests.

use crate::errors::ClientError;
use protocol::session::Session;
use protocol::wire::{Tag, WireMessage};
use protocol::tag_stack::ArrayTagStack;
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct Dispatch<S> {
    session: Session,
    stream: S,
    tags: ArrayTagStack,
    inbox: VecDeque<WireMessage>,
}

impl<S> Dispatch<S>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    pub fn new(session: Session, stream: S, tag_depth: u32) -> Self {
        Self {
            session,
            stream,
            tags: ArrayTagStack::new(tag_depth),
            inbox: VecDeque::new(),
        }
    }

    async fn send(&mut self, message: &WireMessage) -> Result<(), ClientError> {
        let bytes = serde_json::to_vec(message).map_err(|_| ClientError::Protocol("message encode failed".into()))?;
        self.session.write_frame(&mut self.stream, &bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<WireMessage, ClientError> {
        let frame = self.session.read_frame(&mut self.stream).await?;
        serde_json::from_slice(&frame).map_err(|_| ClientError::Protocol("malformed frame".into()))
    }

    /// Sends `build(tag)` under a freshly popped tag and blocks until the reply carrying
    /// that same tag comes back. `Ping`s are answered inline; `Push`es and any
    /// out-of-sequence reply are stashed in the inbox rather than dropped.
    pub async fn request(&mut self, build: impl FnOnce(Tag) -> WireMessage) -> Result<WireMessage, ClientError> {
        let tag = self.tags.pop()?;
        let message = build(tag);
        self.send(&message).await?;
        loop {
            let reply = self.recv().await?;
            match reply {
                WireMessage::Ping => self.send(&WireMessage::Pong).await?,
                WireMessage::Pong => {}
                WireMessage::Push { .. } => self.inbox.push_back(reply),
                other => {
                    if reply_tag(&other) == Some(tag) {
                        self.tags.push(tag)?;
                        return Ok(other);
                    }
                    self.inbox.push_back(other);
                }
            }
        }
    }

    /// Returns an already-buffered push without touching the socket, if one is waiting.
    pub fn poll_inbox(&mut self) -> Option<WireMessage> {
        self.inbox.pop_front()
    }

    /// Drains a buffered push first; otherwise blocks on the socket until one arrives,
    /// answering keepalive pings and re-stashing anything else along the way.
    pub async fn recv_push(&mut self) -> Result<WireMessage, ClientError> {
        if let Some(message) = self.inbox.pop_front() {
            return Ok(message);
        }
        loop {
            let reply = self.recv().await?;
            match reply {
                WireMessage::Ping => self.send(&WireMessage::Pong).await?,
                WireMessage::Pong => {}
                WireMessage::Push { .. } => return Ok(reply),
                other => self.inbox.push_back(other),
            }
        }
    }

    pub async fn ack(&mut self, tag: Tag) -> Result<(), ClientError> {
        self.send(&WireMessage::Ack { tag }).await
    }
}

/// The tag a reply answers, for matching a `request()` call's outstanding tag.
/// `Push` carries a spool sequence rather than a tag and is handled separately.
fn reply_tag(message: &WireMessage) -> Option<Tag> {
    match message {
        WireMessage::Ack { tag } => Some(*tag),
        WireMessage::Identity { tag, .. } => Some(*tag),
        WireMessage::Backlog { tag, .. } => Some(*tag),
        WireMessage::Error { tag, .. } => Some(*tag),
        WireMessage::Deliver { tag, .. } => Some(*tag),
        _ => None,
    }
}
