//! In-memory PIN → blob table used during identity bootstrap. A PIN is never stored in
//! the clear: callers hash it (see `server::accounts::hash_pin`) before it reaches this
//! table, so a server compromise doesn't hand an attacker a dictionary to grind.

use protocol::wire::RendezvousEntry;
use std::collections::HashMap;
use std::sync::Mutex;

pub struct Rendezvous {
    entries: Mutex<HashMap<Vec<u8>, RendezvousEntry>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores `entry` under its own `pin_hash`, overwriting whatever was there before.
    /// Rejects a TTL over the configured ceiling rather than silently clamping it.
    pub fn store(&self, entry: RendezvousEntry, max_ttl_hours: u64) -> Result<(), &'static str> {
        if entry.ttl_secs > max_ttl_hours * 3600 {
            return Err("ttl exceeds configured ceiling");
        }
        self.entries.lock().unwrap().insert(entry.pin_hash.clone(), entry);
        Ok(())
    }

    /// Fetches and deletes the entry under `pin_hash` if present and not expired.
    /// One-shot: a second fetch with the same PIN always misses, whether or not the
    /// first one succeeded.
    pub fn take(&self, pin_hash: &[u8]) -> Option<RendezvousEntry> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.remove(pin_hash)?;
        if now_secs().saturating_sub(entry.created_at) >= entry.ttl_secs {
            None
        } else {
            Some(entry)
        }
    }

    /// Sweeps every expired entry. Intended to run on an interval; never called from
    /// the hot path of `store`/`take`.
    pub fn sweep_expired(&self) {
        let now = now_secs();
        self.entries.lock().unwrap().retain(|_, entry| now.saturating_sub(entry.created_at) < entry.ttl_secs);
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
