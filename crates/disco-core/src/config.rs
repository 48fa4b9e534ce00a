//! Configuration system for Disco.
//!
//! A `DiscoConfig` is resolved exactly once per instance and never mutated
//! afterwards. Resolution layers partial overrides onto defaults:
//!
//!   defaults → config file → environment → caller overrides
//!
//! Config file location:
//!   1. $DISCO_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/disco/config.toml
//!   3. ~/.config/disco/config.toml

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// Lowest port handed out when no port is configured (RFC 6335 dynamic range).
pub const PORT_RANGE_MIN: u16 = 49152;

/// Highest port handed out when no port is configured.
/// 65535 stays free for an optional administrative listener.
pub const PORT_RANGE_MAX: u16 = 65534;

/// Random bytes in a generated instance identifier (rendered as hex).
pub const ID_BYTES: usize = 8;

/// Default BLAKE3 key-derivation context for announcement encryption.
pub const DEFAULT_KEY_CONTEXT: &str = "disco 2024-03-01 announcement encryption";

/// Fully resolved instance configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoConfig {
    /// Address the transport socket binds to.
    pub address: Ipv4Addr,
    /// Port shared by every member of the group.
    pub port: u16,
    /// Interval for custom broadcasts registered without one.
    pub default_interval_ms: u64,
    /// Interval of the discovery probe.
    pub discovery_interval_ms: u64,
    /// Multicast group joined by the transport.
    pub multicast_membership: Ipv4Addr,
    /// Local interface address used for the group. None = let the OS pick.
    pub multicast_interface: Option<Ipv4Addr>,
    /// Must be enabled for several instances on one host to see each other.
    pub multicast_loopback: bool,
    pub multicast_ttl: u32,
    /// Symmetric payload encryption. None = plaintext.
    pub encrypt: Option<EncryptionConfig>,
    /// Instance identifier. Empty until resolved.
    pub id: String,
    pub liveness: LivenessConfig,
}

/// Shared-key descriptor. Every member of a group must use the same values.
/// Never serialized, and `Debug` redacts the key.
#[derive(Clone, PartialEq)]
pub struct EncryptionConfig {
    pub key: String,
    pub context: String,
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("key", &"<redacted>")
            .field("context", &self.context)
            .finish()
    }
}

/// Tuning for the phi-accrual suspicion detector attached to every peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Heartbeat intervals kept for the running mean / deviation.
    pub window_size: usize,
    /// Floor for the standard deviation, so perfectly regular
    /// heartbeats do not make the score explode on the first jitter.
    pub min_std_dev_ms: u64,
    /// Extra silence tolerated before the score starts to rise.
    pub acceptable_pause_ms: u64,
    /// Interval assumed before a second heartbeat has been seen.
    pub first_heartbeat_estimate_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DiscoConfig {
    /// Defaults before resolution: port 0 and an empty id mean "unset".
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: 0,
            default_interval_ms: 1000,
            discovery_interval_ms: 1000,
            multicast_membership: Ipv4Addr::new(239, 255, 255, 250),
            multicast_interface: None,
            multicast_loopback: true,
            multicast_ttl: 3,
            encrypt: None,
            id: String::new(),
            liveness: LivenessConfig::default(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            min_std_dev_ms: 50,
            acceptable_pause_ms: 0,
            first_heartbeat_estimate_ms: 1000,
        }
    }
}

// ── Overrides ─────────────────────────────────────────────────────────────────

/// A partial configuration. Every `None` falls through to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub address: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub default_interval_ms: Option<u64>,
    pub discovery_interval_ms: Option<u64>,
    pub multicast_membership: Option<Ipv4Addr>,
    pub multicast_interface: Option<Ipv4Addr>,
    pub multicast_loopback: Option<bool>,
    pub multicast_ttl: Option<u32>,
    pub encrypt: Option<EncryptOverride>,
    pub id: Option<String>,
    pub liveness: Option<LivenessOverrides>,
}

/// Either a plain on/off switch (`encrypt = false`) or a settings table.
///
/// Settings merge key-by-key onto existing settings; a switch replaces
/// them wholesale.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EncryptOverride {
    Enabled(bool),
    Settings(EncryptionOverrides),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EncryptionOverrides {
    pub key: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LivenessOverrides {
    pub window_size: Option<usize>,
    pub min_std_dev_ms: Option<u64>,
    pub acceptable_pause_ms: Option<u64>,
    pub first_heartbeat_estimate_ms: Option<u64>,
}

/// A bare port number is shorthand for `{ port }`.
impl From<u16> for ConfigOverrides {
    fn from(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }
}

impl From<Option<ConfigOverrides>> for ConfigOverrides {
    fn from(overrides: Option<ConfigOverrides>) -> Self {
        overrides.unwrap_or_default()
    }
}

impl ConfigOverrides {
    /// Stack `top` over `self`. Values set in `top` win; nested tables
    /// (encryption settings, liveness tuning) merge field by field.
    pub fn layered(self, top: ConfigOverrides) -> ConfigOverrides {
        let encrypt = match (self.encrypt, top.encrypt) {
            (Some(EncryptOverride::Settings(below)), Some(EncryptOverride::Settings(above))) => {
                Some(EncryptOverride::Settings(EncryptionOverrides {
                    key: above.key.or(below.key),
                    context: above.context.or(below.context),
                }))
            }
            (below, above) => above.or(below),
        };
        let liveness = match (self.liveness, top.liveness) {
            (Some(below), Some(above)) => Some(LivenessOverrides {
                window_size: above.window_size.or(below.window_size),
                min_std_dev_ms: above.min_std_dev_ms.or(below.min_std_dev_ms),
                acceptable_pause_ms: above.acceptable_pause_ms.or(below.acceptable_pause_ms),
                first_heartbeat_estimate_ms: above
                    .first_heartbeat_estimate_ms
                    .or(below.first_heartbeat_estimate_ms),
            }),
            (below, above) => above.or(below),
        };

        ConfigOverrides {
            address: top.address.or(self.address),
            port: top.port.or(self.port),
            default_interval_ms: top.default_interval_ms.or(self.default_interval_ms),
            discovery_interval_ms: top.discovery_interval_ms.or(self.discovery_interval_ms),
            multicast_membership: top.multicast_membership.or(self.multicast_membership),
            multicast_interface: top.multicast_interface.or(self.multicast_interface),
            multicast_loopback: top.multicast_loopback.or(self.multicast_loopback),
            multicast_ttl: top.multicast_ttl.or(self.multicast_ttl),
            encrypt,
            id: top.id.or(self.id),
            liveness,
        }
    }

    fn apply_to(self, config: &mut DiscoConfig) {
        if let Some(v) = self.address {
            config.address = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.default_interval_ms {
            config.default_interval_ms = v;
        }
        if let Some(v) = self.discovery_interval_ms {
            config.discovery_interval_ms = v;
        }
        if let Some(v) = self.multicast_membership {
            config.multicast_membership = v;
        }
        if let Some(v) = self.multicast_interface {
            config.multicast_interface = Some(v);
        }
        if let Some(v) = self.multicast_loopback {
            config.multicast_loopback = v;
        }
        if let Some(v) = self.multicast_ttl {
            config.multicast_ttl = v;
        }
        if let Some(v) = self.id {
            config.id = v;
        }

        match self.encrypt {
            None | Some(EncryptOverride::Enabled(true)) => {}
            Some(EncryptOverride::Enabled(false)) => config.encrypt = None,
            Some(EncryptOverride::Settings(settings)) => match config.encrypt.as_mut() {
                Some(existing) => {
                    if let Some(key) = settings.key {
                        existing.key = key;
                    }
                    if let Some(context) = settings.context {
                        existing.context = context;
                    }
                }
                None => {
                    // A settings table without a key cannot turn encryption on.
                    if let Some(key) = settings.key {
                        config.encrypt = Some(EncryptionConfig {
                            key,
                            context: settings
                                .context
                                .unwrap_or_else(|| DEFAULT_KEY_CONTEXT.to_string()),
                        });
                    }
                }
            },
        }

        if let Some(l) = self.liveness {
            let target = &mut config.liveness;
            if let Some(v) = l.window_size {
                target.window_size = v;
            }
            if let Some(v) = l.min_std_dev_ms {
                target.min_std_dev_ms = v;
            }
            if let Some(v) = l.acceptable_pause_ms {
                target.acceptable_pause_ms = v;
            }
            if let Some(v) = l.first_heartbeat_estimate_ms {
                target.first_heartbeat_estimate_ms = v;
            }
        }
    }
}

// ── Resolution ────────────────────────────────────────────────────────────────

impl DiscoConfig {
    /// Resolve overrides into a complete configuration.
    ///
    /// Never fails. An unset (or zero) port is drawn from the dynamic
    /// range and an unset (or empty) id is generated. Values are not
    /// validated here; a bad address surfaces when the transport binds.
    pub fn resolve(overrides: impl Into<ConfigOverrides>) -> Self {
        let mut config = DiscoConfig::default();
        overrides.into().apply_to(&mut config);
        config.resolved()
    }

    /// Fill in an unset port and id, leaving everything else alone.
    pub fn resolved(mut self) -> Self {
        if self.port == 0 {
            self.port = random_port();
        }
        if self.id.is_empty() {
            self.id = generate_id();
        }
        self
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}

/// Pick a port in `PORT_RANGE_MIN..=PORT_RANGE_MAX`.
pub fn random_port() -> u16 {
    rand::thread_rng().gen_range(PORT_RANGE_MIN..=PORT_RANGE_MAX)
}

/// Generate an instance identifier: `ID_BYTES` random bytes as lowercase hex.
pub fn generate_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("disco")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ConfigOverrides {
    /// Load overrides: config file (if present), then DISCO_* env vars on top.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut overrides = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ConfigOverrides::default()
        };
        overrides.apply_env(|name| std::env::var(name).ok());
        Ok(overrides)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DISCO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply DISCO_* overrides read through `lookup`. Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DISCO_ADDRESS").and_then(|v| v.parse().ok()) {
            self.address = Some(v);
        }
        if let Some(v) = lookup("DISCO_PORT").and_then(|v| v.parse().ok()) {
            self.port = Some(v);
        }
        if let Some(v) = lookup("DISCO_DEFAULT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.default_interval_ms = Some(v);
        }
        if let Some(v) = lookup("DISCO_DISCOVERY_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.discovery_interval_ms = Some(v);
        }
        if let Some(v) = lookup("DISCO_MULTICAST__MEMBERSHIP").and_then(|v| v.parse().ok()) {
            self.multicast_membership = Some(v);
        }
        if let Some(v) = lookup("DISCO_MULTICAST__INTERFACE").and_then(|v| v.parse().ok()) {
            self.multicast_interface = Some(v);
        }
        if let Some(v) = lookup("DISCO_MULTICAST__LOOPBACK") {
            self.multicast_loopback = Some(v == "true" || v == "1");
        }
        if let Some(v) = lookup("DISCO_MULTICAST__TTL").and_then(|v| v.parse().ok()) {
            self.multicast_ttl = Some(v);
        }
        if let Some(key) = lookup("DISCO_ENCRYPT__KEY") {
            let env = ConfigOverrides {
                encrypt: Some(EncryptOverride::Settings(EncryptionOverrides {
                    key: Some(key),
                    context: None,
                })),
                ..ConfigOverrides::default()
            };
            *self = std::mem::take(self).layered(env);
        }
        if let Some(v) = lookup("DISCO_ID") {
            self.id = Some(v);
        }
    }
}
