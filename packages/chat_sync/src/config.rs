use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::connection::machine::ReconnectPolicy;
use crate::dedup::DedupCache;
use crate::dispatch::InboundDispatcher;
use crate::error::SyncError;
use crate::transport::websocket_url;

// =============================================================================
// File config (figment-deserialized from defaults / profile / toml / env vars)
// =============================================================================
//
//   chat-sync.toml:  [connection]
//                    max_reconnect_attempts = 7
//
//   env var:         CHAT_SYNC_CONNECTION__MAX_RECONNECT_ATTEMPTS=7
//                    (double underscore = nesting)

pub const CONFIG_FILE: &str = "chat-sync.toml";
pub const ENV_PREFIX: &str = "CHAT_SYNC_";

/// Named configuration presets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// 5 attempts, 1s base, 30s cap, 30s heartbeat
    Production,
    /// 3 attempts, 2s base, 10s cap, 60s heartbeat
    Development,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub dedup: DedupFileConfig,
}

/// Backend location (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    /// HTTP(S) or WS(S) base URL; http(s) is mapped to ws(s).
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            path: default_path(),
        }
    }
}

/// Reconnect and heartbeat tunables (lives under `[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_interval_ms")]
    pub max_reconnect_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_interval_ms: default_max_reconnect_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            auto_reconnect: true,
            jitter: true,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Deduplication cache tunables (lives under `[dedup]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupFileConfig {
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Fingerprint id-less messages by content (5s window).
    #[serde(default)]
    pub content_dedup: bool,
}

impl Default for DedupFileConfig {
    fn default() -> Self {
        Self {
            max_age_ms: default_max_age_ms(),
            max_entries: default_max_entries(),
            content_dedup: false,
        }
    }
}

fn default_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_path() -> String {
    "/ws".to_string()
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_interval_ms() -> u64 {
    1000
}
fn default_max_reconnect_interval_ms() -> u64 {
    30_000
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_max_age_ms() -> u64 {
    300_000
}
fn default_max_entries() -> usize {
    1000
}
fn default_true() -> bool {
    true
}

/// Build a figment that layers: defaults → profile defaults → chat-sync.toml → CHAT_SYNC_* env vars.
///
/// The CLI profile takes priority over a profile named in the file or env.
pub fn load_config(config_dir: &Path, cli_profile: Option<&Profile>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let config_file = config_dir.join(CONFIG_FILE);

    // Pass 1: peek at the profile
    let base = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(&config_file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let profile: Option<Profile> = cli_profile
        .cloned()
        .or_else(|| base.extract_inner("profile").ok());

    // Pass 2: profile defaults sit between struct defaults and the file
    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Serialized::defaults(profile_to_file_config(profile.as_ref())))
        .merge(Toml::file(&config_file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

fn profile_to_file_config(profile: Option<&Profile>) -> FileConfig {
    match profile {
        Some(Profile::Production) => FileConfig {
            profile: Some(Profile::Production),
            ..Default::default()
        },
        Some(Profile::Development) => FileConfig {
            profile: Some(Profile::Development),
            connection: ConnectionFileConfig {
                max_reconnect_attempts: 3,
                reconnect_interval_ms: 2000,
                max_reconnect_interval_ms: 10_000,
                heartbeat_interval_ms: 60_000,
                ..Default::default()
            },
            ..Default::default()
        },
        None => FileConfig::default(),
    }
}

// =============================================================================
// Runtime config (resolved from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    pub dedup: DedupConfig,
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, SyncError> {
        Ok(Self {
            connection: ConnectionConfig::from_file(&fc.server, &fc.connection)?,
            dedup: DedupConfig::from_file(&fc.dedup),
        })
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Realtime endpoint without credentials; the token is added per attempt.
    pub url: Url,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn from_file(
        server: &ServerFileConfig,
        fc: &ConnectionFileConfig,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            url: websocket_url(&server.url, &server.path)?,
            reconnect: reconnect_policy(fc),
            // A zero period would make tokio's interval panic
            heartbeat_interval: Duration::from_millis(fc.heartbeat_interval_ms.max(1)),
            connect_timeout: Duration::from_millis(fc.connect_timeout_ms),
        })
    }
}

fn reconnect_policy(fc: &ConnectionFileConfig) -> ReconnectPolicy {
    ReconnectPolicy {
        auto_reconnect: fc.auto_reconnect,
        max_attempts: fc.max_reconnect_attempts,
        base_delay: Duration::from_millis(fc.reconnect_interval_ms),
        max_delay: Duration::from_millis(fc.max_reconnect_interval_ms),
        jitter: fc.jitter,
    }
}

#[derive(Clone, Debug)]
pub struct DedupConfig {
    pub max_age: Duration,
    pub max_entries: usize,
    pub content_dedup: bool,
}

impl DedupConfig {
    pub fn from_file(fc: &DedupFileConfig) -> Self {
        Self {
            max_age: Duration::from_millis(fc.max_age_ms),
            max_entries: fc.max_entries,
            content_dedup: fc.content_dedup,
        }
    }

    /// A fresh dispatcher owning a cache sized by this config.
    pub fn dispatcher(&self) -> InboundDispatcher {
        InboundDispatcher::new(DedupCache::with_limits(self.max_entries, self.max_age))
            .with_content_dedup(self.content_dedup)
    }
}
