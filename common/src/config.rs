//! TOML-backed settings shared by the server and client binaries. Loaded once into a
//! process-wide [`std::sync::OnceLock`] and re-read only if a caller explicitly asks.

use protocol::kx::Variant;
use protocol::wire::AccountPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

fn default_server_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    3333
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_spool_dir() -> String {
    "./spool".to_string()
}
fn default_rendezvous_ttl_hours() -> u64 {
    24
}
fn default_identity_path() -> String {
    "./identity.toml".to_string()
}
fn default_account_policy() -> AccountPolicy {
    AccountPolicy::Open
}
fn default_kx_variant() -> Variant {
    Variant::PostQuantum
}
fn default_scrypt_hardened() -> bool {
    false
}
fn default_tag_depth() -> u32 {
    protocol::constants::TAG_DEPTH_DEFAULT
}
fn default_tls_cert_path() -> Option<String> {
    None
}
fn default_tls_key_path() -> Option<String> {
    None
}
fn default_motd() -> Option<String> {
    None
}

/// Everything a node needs to find and talk to the relay, plus local storage paths. The
/// on-disk file format itself is out of scope; this just has to round-trip a
/// `toml::Value` faithfully.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_server_ip")]
    pub server_ip: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,
    #[serde(default = "default_rendezvous_ttl_hours")]
    pub rendezvous_ttl_hours: u64,
    /// Where this node's own `FullIdentity` is persisted, written by the `config` CLI
    /// and loaded by `server`/`client` at startup.
    #[serde(default = "default_identity_path")]
    pub identity_path: String,
    /// Server-side account-creation gate for `PreSessionCommand::CreateAccount`.
    #[serde(default = "default_account_policy")]
    pub account_policy: AccountPolicy,
    /// Which `Session` handshake this process speaks. Both ends of a connection must
    /// agree out of band; there is no wire negotiation.
    #[serde(default = "default_kx_variant")]
    pub kx_variant: Variant,
    /// Selects the hardened scrypt cost tier for blob sealing (rendezvous uploads)
    /// instead of the default tier.
    #[serde(default = "default_scrypt_hardened")]
    pub scrypt_hardened: bool,
    #[serde(default = "default_tag_depth")]
    pub tag_depth: u32,
    /// PEM certificate chain for the server's outer TLS listener. TLS here is an
    /// untrusted carrier only — the peer's actual identity is established by the
    /// signed `Identify` reply inside it, not by this certificate's CA chain — so a
    /// self-signed cert is fine; `None` on either path runs the listener over plain
    /// TCP (the transport this workspace is tested against).
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: Option<String>,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: Option<String>,
    /// Optional message of the day announced in every `Welcome` frame.
    #[serde(default = "default_motd")]
    pub motd: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_ip: default_server_ip(),
            server_port: default_server_port(),
            log_level: default_log_level(),
            spool_dir: default_spool_dir(),
            rendezvous_ttl_hours: default_rendezvous_ttl_hours(),
            identity_path: default_identity_path(),
            account_policy: default_account_policy(),
            kx_variant: default_kx_variant(),
            scrypt_hardened: default_scrypt_hardened(),
            tag_depth: default_tag_depth(),
            tls_cert_path: default_tls_cert_path(),
            tls_key_path: default_tls_key_path(),
            motd: default_motd(),
        }
    }
}

impl Settings {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, crate::errors::CommonError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), crate::errors::CommonError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Loads `path` into the process-wide settings cell on first call; later calls with a
/// different path are ignored, matching `OnceLock`'s semantics (a running process
/// reads its configuration once, at startup).
pub fn init(path: impl AsRef<Path>) -> &'static Settings {
    SETTINGS.get_or_init(|| Settings::load_from(&path).unwrap_or_default())
}

/// Returns the cached settings, or process defaults if [`init`] was never called.
pub fn current() -> &'static Settings {
    SETTINGS.get_or_init(Settings::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.server_port, 3333);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.tag_depth, protocol::constants::TAG_DEPTH_DEFAULT);
    }

    #[test]
    fn round_trips_through_toml() {
        let settings = Settings::default();
        let serialized = toml::to_string(&settings).unwrap();
        let parsed: Settings = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.server_ip, settings.server_ip);
        assert_eq!(parsed.rendezvous_ttl_hours, settings.rendezvous_ttl_hours);
    }
}
