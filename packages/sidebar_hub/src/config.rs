use anyhow::{Context, Result};
use page_channel::{BackoffConfig, ChannelOptions, HeartbeatConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Tunable config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [channel]
//                    request_timeout_ms = 2000
//
//   env var:         SIDEBAR_HUB_CHANNEL__REQUEST_TIMEOUT_MS=2000
//                    (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub channel: ChannelFileConfig,
    #[serde(default)]
    pub preferences: PreferencesFileConfig,
}

/// Listener settings (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Peer channel tuning (`[channel]` and `[channel.backoff]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelFileConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// 0 disables heartbeats.
    #[serde(default)]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_max_missed")]
    pub heartbeat_max_missed: u32,
    #[serde(default)]
    pub backoff: BackoffFileConfig,
}

impl Default for ChannelFileConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            heartbeat_interval_ms: 0,
            heartbeat_max_missed: default_heartbeat_max_missed(),
            backoff: BackoffFileConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffFileConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
    #[serde(default = "default_backoff_steps")]
    pub steps: u32,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffFileConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            factor: default_backoff_factor(),
            steps: default_backoff_steps(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

/// Preference storage (`[preferences]`). Relative paths resolve against the
/// data directory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PreferencesFileConfig {
    #[serde(default)]
    pub file: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7878
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_heartbeat_max_missed() -> u32 {
    3
}
fn default_backoff_initial_ms() -> u64 {
    50
}
fn default_backoff_factor() -> f64 {
    1.5
}
fn default_backoff_steps() -> u32 {
    20
}
fn default_backoff_max_ms() -> u64 {
    500
}

/// Layer defaults → config.toml → `SIDEBAR_HUB_*` env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("SIDEBAR_HUB_").split("__"))
}

// =============================================================================
// Runtime views
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig, port_override: Option<u16>) -> Self {
        Self {
            bind_addr: format!("{}:{}", fc.host, port_override.unwrap_or(fc.port)),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.bind_addr))
    }
}

#[derive(Clone, Debug)]
pub struct ChannelTuning {
    pub request_timeout: Duration,
    pub heartbeat: Option<HeartbeatConfig>,
    pub backoff: BackoffConfig,
}

impl ChannelTuning {
    pub fn from_file(fc: &ChannelFileConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(fc.request_timeout_ms),
            heartbeat: if fc.heartbeat_interval_ms == 0 {
                None
            } else {
                Some(HeartbeatConfig {
                    interval: Duration::from_millis(fc.heartbeat_interval_ms),
                    max_missed: fc.heartbeat_max_missed,
                })
            },
            backoff: BackoffConfig {
                initial: Duration::from_millis(fc.backoff.initial_ms),
                factor: fc.backoff.factor,
                steps: fc.backoff.steps,
                max: Duration::from_millis(fc.backoff.max_ms),
                fallback: None,
            },
        }
    }

    /// Channel options carrying these settings; hooks are left to the caller.
    pub fn channel_options(&self) -> ChannelOptions {
        let options = ChannelOptions::default()
            .request_timeout(self.request_timeout)
            .backoff(self.backoff);
        match self.heartbeat {
            Some(heartbeat) => options.heartbeat(heartbeat),
            None => options,
        }
    }
}

// =============================================================================
// Directory layout (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub data_dir: PathBuf,
}

impl HubConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".sidebar-hub"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Where preferences persist: the configured file, else
    /// `preferences.json` in the data directory.
    pub fn preferences_path(&self, fc: &PreferencesFileConfig) -> PathBuf {
        match &fc.file {
            Some(file) => self.data_dir.join(file),
            None => self.data_dir.join("preferences.json"),
        }
    }
}
