//! Per-recipient, on-disk FIFO queue of sealed blobs with at-least-once delivery.
//! Every account has a spool directory holding sequence-numbered entries; `deliver`
//! appends, `pull` reads the oldest undelivered entry without removing it, and `delete`
//! is the caller's separate acknowledgment that a pulled entry landed.
//!
//! Online/offline notification is deliberately decoupled from the account mutex: a
//! `deliver` call takes the mutex just long enough to append the entry and read the
//! notifier, then releases it before sending the wakeup. `notify` never reacquires the
//! mutex. A holder blocked waiting on the notify channel can't also be the holder
//! blocking a concurrent `deliver` from completing.

use protocol::wire::SpoolEntry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

/// Errors `RelaySpool` raises that an `io::Error` can't express.
#[derive(Debug)]
pub enum SpoolError {
    Io(std::io::Error),
    /// `online` was called for an account that is already `Presence::Online`.
    AlreadyOnline,
}

impl std::fmt::Display for SpoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpoolError::Io(e) => write!(f, "io error: {}", e),
            SpoolError::AlreadyOnline => write!(f, "already online"),
        }
    }
}

impl std::error::Error for SpoolError {}

impl From<std::io::Error> for SpoolError {
    fn from(value: std::io::Error) -> Self {
        SpoolError::Io(value)
    }
}

struct AccountState {
    next_sequence: u64,
    presence: Presence,
}

/// One account's spool: its directory, its next sequence number, and the watch channel
/// subscribers use to learn "something new landed" without polling.
struct Account {
    dir: PathBuf,
    state: Mutex<AccountState>,
    notify: watch::Sender<u64>,
}

pub struct RelaySpool {
    root: PathBuf,
    accounts: Mutex<HashMap<String, Arc<Account>>>,
}

impl RelaySpool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    async fn account(&self, fingerprint: &str) -> std::io::Result<Arc<Account>> {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.get(fingerprint) {
            return Ok(account.clone());
        }
        let dir = self.root.join(fingerprint);
        std::fs::create_dir_all(&dir)?;
        let next_sequence = existing_sequences(&dir)?.into_iter().max().map(|s| s + 1).unwrap_or(0);
        let (tx, _rx) = watch::channel(next_sequence);
        let account = Arc::new(Account {
            dir,
            state: Mutex::new(AccountState {
                next_sequence,
                presence: Presence::Offline,
            }),
            notify: tx,
        });
        accounts.insert(fingerprint.to_string(), account.clone());
        Ok(account)
    }

    /// Appends a sealed blob to `fingerprint`'s spool and wakes any listener, at
    /// most-once per call: the notify send happens after the account mutex is
    /// released. `from` is the authenticated sender's own fingerprint, never anything
    /// the wire request claimed, so a recipient can trust it for IDKX/ratchet routing.
    pub async fn deliver(&self, fingerprint: &str, from: String, sealed_blob: Vec<u8>, cleartext: bool) -> std::io::Result<u64> {
        let account = self.account(fingerprint).await?;
        let sequence = {
            let mut state = account.state.lock().await;
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            sequence
        };
        let entry = SpoolEntry {
            sequence,
            from,
            sealed_blob,
            created_at: now_secs(),
            cleartext,
        };
        write_entry(&account.dir, &entry)?;
        // Mutex released above; notify afterward so a slow subscriber never blocks a
        // concurrent deliver.
        let _ = account.notify.send(sequence);
        Ok(sequence)
    }

    /// Subscribes to delivery notifications for `fingerprint`. Fails with
    /// `SpoolError::AlreadyOnline` if the account is already online; a second session
    /// for the same account must not silently steal or duplicate the first one's
    /// subscription.
    pub async fn online(&self, fingerprint: &str) -> Result<watch::Receiver<u64>, SpoolError> {
        let account = self.account(fingerprint).await?;
        let mut state = account.state.lock().await;
        if state.presence == Presence::Online {
            return Err(SpoolError::AlreadyOnline);
        }
        state.presence = Presence::Online;
        Ok(account.notify.subscribe())
    }

    pub async fn offline(&self, fingerprint: &str) -> std::io::Result<()> {
        let account = self.account(fingerprint).await?;
        account.state.lock().await.presence = Presence::Offline;
        Ok(())
    }

    pub async fn presence(&self, fingerprint: &str) -> std::io::Result<Presence> {
        let account = self.account(fingerprint).await?;
        Ok(account.state.lock().await.presence)
    }

    /// Returns the oldest entry still on disk, if any, without removing it.
    pub async fn pull(&self, fingerprint: &str) -> std::io::Result<Option<SpoolEntry>> {
        let account = self.account(fingerprint).await?;
        let mut sequences = existing_sequences(&account.dir)?;
        sequences.sort_unstable();
        match sequences.first() {
            Some(&sequence) => Ok(Some(read_entry(&account.dir, sequence)?)),
            None => Ok(None),
        }
    }

    /// Removes an acknowledged entry. Idempotent: deleting twice, or deleting an entry
    /// that was never there, is not an error.
    pub async fn delete(&self, fingerprint: &str, sequence: u64) -> std::io::Result<()> {
        let account = self.account(fingerprint).await?;
        let path = entry_path(&account.dir, sequence);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Finds every entry at or after `from_sequence`, oldest first. Used to replay a
    /// backlog to a client that reconnects with a known watermark.
    pub async fn find(&self, fingerprint: &str, from_sequence: u64) -> std::io::Result<Vec<SpoolEntry>> {
        let account = self.account(fingerprint).await?;
        let mut sequences: Vec<u64> = existing_sequences(&account.dir)?.into_iter().filter(|&s| s >= from_sequence).collect();
        sequences.sort_unstable();
        sequences.into_iter().map(|s| read_entry(&account.dir, s)).collect()
    }
}

fn entry_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("{sequence:020}.msg"))
}

/// Writes the entry to a temp file in the same directory, then renames it into place.
/// `rename` is atomic on the same filesystem, so a reader never observes a
/// partially-written entry even if the process crashes mid-write. The temp name is
/// keyed by the entry's own sequence number, which `deliver` only ever hands out once
/// (allocated under the account's state mutex), so concurrent deliveries never collide
/// on the same temp path.
fn write_entry(dir: &Path, entry: &SpoolEntry) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
    let final_path = entry_path(dir, entry.sequence);
    let tmp_path = dir.join(format!("{:020}.msg.tmp", entry.sequence));
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, &final_path)
}

fn read_entry(dir: &Path, sequence: u64) -> std::io::Result<SpoolEntry> {
    let bytes = std::fs::read(entry_path(dir, sequence))?;
    serde_json::from_slice(&bytes).map_err(std::io::Error::other)
}

fn existing_sequences(dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(stem) = name.strip_suffix(".msg") {
                if let Ok(sequence) = stem.parse::<u64>() {
                    out.push(sequence);
                }
            }
        }
    }
    Ok(out)
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_pull_delete_round_trips() {
        let dir = tempdir();
        let spool = RelaySpool::new(dir.clone());
        let sequence = spool.deliver("alice", "bob".to_string(), b"hello".to_vec(), false).await.unwrap();
        let entry = spool.pull("alice").await.unwrap().unwrap();
        assert_eq!(entry.sequence, sequence);
        assert_eq!(entry.sealed_blob, b"hello");
        spool.delete("alice", sequence).await.unwrap();
        assert!(spool.pull("alice").await.unwrap().is_none());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn deliver_wakes_an_online_subscriber() {
        let dir = tempdir();
        let spool = RelaySpool::new(dir.clone());
        let mut rx = spool.online("bob").await.unwrap();
        spool.deliver("bob", "alice".to_string(), b"hi".to_vec(), false).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn online_rejects_a_second_subscriber_while_still_online() {
        let dir = tempdir();
        let spool = RelaySpool::new(dir.clone());
        let _rx = spool.online("eve").await.unwrap();
        assert!(matches!(spool.online("eve").await, Err(SpoolError::AlreadyOnline)));
        spool.offline("eve").await.unwrap();
        assert!(spool.online("eve").await.is_ok());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn find_replays_from_a_watermark() {
        let dir = tempdir();
        let spool = RelaySpool::new(dir.clone());
        for i in 0..3 {
            spool.deliver("carol", "dave".to_string(), vec![i], false).await.unwrap();
        }
        let backlog = spool.find("carol", 1).await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].sequence, 1);
        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("relay-spool-test-{}", std::process::id()));
        dir.push(uuid::Uuid::new_v4().to_string());
        dir
    }
}
