//! Wire-level envelope types shared by the server and client dispatch loops: the
//! rendezvous and spool record shapes, and the tagged request/response frames that
//! `ProtocolDispatch` reads and writes over a [`crate::session::Session`].
//!
//! These are carried as `serde`-derived structures rather than a byte-for-byte XDR
//! encoding: human-readable framing is easier to extend and debug, and nothing here is
//! on a hot enough path for the encoding overhead to matter.

use crate::identity::PublicIdentity;
use serde::{Deserialize, Serialize};

/// A single outstanding request's tag, as assigned by a [`crate::tag_stack`] pool.
pub type Tag = u32;

/// A PIN-addressed blob left at the rendezvous service during identity bootstrap.
/// Entries expire `RENDEZVOUS_MAX_TTL_HOURS` after `created_at` and are deleted on
/// first successful fetch.
#[derive(Clone, Serialize, Deserialize)]
pub struct RendezvousEntry {
    #[serde(with = "serde_bytes")]
    pub pin_hash: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub blob: Vec<u8>,
    pub created_at: u64,
    pub ttl_secs: u64,
}

/// One message sitting in a recipient's relay spool, awaiting delivery.
#[derive(Clone, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub sequence: u64,
    pub from: String,
    #[serde(with = "serde_bytes")]
    pub sealed_blob: Vec<u8>,
    pub created_at: u64,
    pub cleartext: bool,
}

/// Priority a dispatch message is scheduled under. High-priority frames (control
/// traffic: pings, acks, key-exchange steps) always drain before low-priority ones
/// (bulk message delivery).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Low,
}

/// The framed request/response protocol `ProtocolDispatch` speaks once a session is
/// established. Every variant but `Welcome`/`Ping`/`Pong` carries the tag of the
/// request it answers (or, for a request, the tag the reply should carry).
#[derive(Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// First message a server sends after a session is keyed. Carries the protocol
    /// version plus every property a client must have before it can safely proceed:
    /// the tag pool depth, the three size ceilings, the server's own clock, and whether
    /// its public directory is enabled. `motd` is the only optional property. A client
    /// must refuse to proceed if the version mismatches or `max_msg_size <
    /// max_chunk_size` — see `handshake/await_welcome` in the `client` crate.
    Welcome {
        protocol_version: u32,
        tag_depth: u32,
        max_attachment_size: u64,
        max_chunk_size: u64,
        max_msg_size: u64,
        server_time: u64,
        directory: bool,
        motd: Option<String>,
    },
    /// Keepalive sent on write idleness; the peer must answer with `Pong` within the
    /// same interval or the connection is considered dead.
    Ping,
    Pong,
    /// Deliver one sealed blob to `to`'s spool, tagged for the sender's own `Ack`
    /// bookkeeping. `cleartext` is true only for the reset protocol's proxy command
    /// (`ProxyCommand::ResetRatchet`); every other payload must be ratchet- or
    /// blob-cipher-sealed, and a server or recipient seeing `cleartext = true` on
    /// anything else must treat it as a protocol violation.
    Deliver { tag: Tag, to: String, sealed: Vec<u8>, cleartext: bool },
    /// Server-initiated push of one already-spooled message to a recipient with a live,
    /// online session. Carries the spool sequence number rather than a request tag, so
    /// the client's `Ack` can name exactly which spool entry to drop. `from` is the
    /// fingerprint of the account whose session delivered the entry, taken from that
    /// connection's own authenticated identity rather than anything the sender claimed
    /// — a recipient's IDKX/ratchet routing depends on this never being spoofable.
    Push { sequence: u64, from: String, sealed: Vec<u8>, cleartext: bool },
    /// Acknowledge a `Deliver` or a `Push`, permitting the spool to drop the
    /// at-least-once copy. `tag` is the request's tag for a `Deliver` ack, or the
    /// pushed message's spool sequence number for a `Push` ack.
    Ack { tag: Tag },
    /// Fetch the rendezvous blob stored under a PIN.
    FetchRendezvous { tag: Tag, pin_hash: Vec<u8> },
    /// Store a rendezvous blob under a PIN for a bounded TTL.
    StoreRendezvous { tag: Tag, entry: RendezvousEntry },
    /// Publish (or refresh) this connection's identity and online status.
    Announce { tag: Tag, identity: PublicIdentity },
    /// Look up a peer's announced identity by fingerprint, to seed a key exchange or
    /// verify a rendezvous blob's signer.
    Lookup { tag: Tag, fingerprint: String },
    /// Reply to `Lookup`; `identity` is `None` if no account has announced that
    /// fingerprint.
    Identity { tag: Tag, identity: Option<PublicIdentity> },
    /// Replay every spooled message with sequence greater than `since_sequence`, for a
    /// client reconnecting after time offline.
    Pull { tag: Tag, since_sequence: u64 },
    /// Reply to `Pull`, oldest first.
    Backlog { tag: Tag, entries: Vec<SpoolEntry> },
    /// Opt this connection's account into the server's public directory, so peers who
    /// only know its nickname (not yet its fingerprint) can find it via `FindNick`.
    Publish { tag: Tag },
    /// Opt back out; a server must stop surfacing the account from `FindNick` scans
    /// immediately, though any ratchets peers already hold are unaffected.
    Unpublish { tag: Tag },
    /// Linear scan of every published identity for one whose nickname matches exactly.
    /// Answered with an `Identity` reply, `None` if nothing published matches.
    FindNick { tag: Tag, nick: String },
    /// A request failed; `code` is one of the sanitized, user-visible error strings.
    Error { tag: Tag, code: String },
}

/// The one command ever permitted to travel as a cleartext `Deliver`/`Push` payload:
/// the IDKX reset protocol's request that a peer drop its ratchet and reciprocate.
/// Carried as plain `serde_json` bytes, with no ratchet or blob-cipher sealing at all —
/// there is no shared secret left to seal it under once a ratchet is being torn down.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum ProxyCommand {
    ResetRatchet,
}

/// Account-creation policy a server enforces for `CreateAccount`: open to anyone,
/// closed entirely, or gated behind a shared creation token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountPolicy {
    Open,
    Closed,
    Token,
}

/// Plaintext commands exchanged before a `Session` exists, each on its own
/// length-prefixed frame with no sequence counter or AEAD. Only three things may ever
/// be said in the clear: which variant to key-exchange under, a request to self-serve
/// create an account ahead of that exchange, and the server's own identity for
/// out-of-band fingerprint verification.
#[derive(Clone, Serialize, Deserialize)]
pub enum PreSessionCommand {
    /// Ask the server to identify itself before any key material is exchanged, so an
    /// operator can cross-check the printed fingerprint out of band.
    Identify,
    /// Register `identity`, gated by the server's configured `AccountPolicy`.
    CreateAccount { token: Option<String>, identity: PublicIdentity },
    /// Proceed into the keyed `Session` handshake as the already-registered account
    /// named by `fingerprint`. Which variant runs is a pinned, out-of-band process
    /// configuration on both ends, never a field here — see `crate::kx::Variant`. The
    /// post-quantum variant needs the claimed fingerprint up front to know which
    /// account's static KEM key to encapsulate its final response to; the SIGMA variant
    /// ignores it until the handshake's own proof step reveals the static key directly.
    Session { fingerprint: String },
}

#[derive(Clone, Serialize, Deserialize)]
pub enum PreSessionReply {
    Identify { identity: PublicIdentity },
    CreateAccount { error: Option<String> },
    /// Acknowledges the `Session` command; the raw handshake frames for the chosen
    /// variant follow immediately and are not `WireMessage`s at all.
    ProceedToHandshake,
}

impl WireMessage {
    /// Bulk file-transfer chunk data is the only traffic meant to run at low priority,
    /// and this core carries no such message: control traffic, PMs, and small RPCs are
    /// all high-priority. Every `WireMessage` defined here is one of those, so
    /// `priority` is always `High` today; the two-queue split is kept regardless, since
    /// an application layer that adds bulk chunk carriers on top is exactly what the
    /// low queue exists for.
    pub fn priority(&self) -> Priority {
        Priority::High
    }
}
