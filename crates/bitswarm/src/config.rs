use std::{path::PathBuf, time::Duration};

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::Error,
    tcp_wire::{BLOCK_LEN, MAX_REQUEST_LEN},
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub download_dir: PathBuf,
    /// Port of the TCP listener, 0 lets the OS pick one.
    pub listen_port: u16,
    /// Bytes per second we serve.
    pub max_upload_rate: u64,
    /// Bytes per second we request.
    pub max_download_rate: u64,
    /// Peers we unchoke at the same time.
    pub max_leechers: usize,
    /// Peers we download from at the same time.
    pub max_seeders: usize,
    pub peer_timeout_secs: u64,
    pub tracker_interval_secs: u64,
    pub pass_interval_ms: u64,
    pub block_len: u32,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            download_dir,
            listen_port: 6881,
            max_upload_rate: 16384,
            max_download_rate: 16384,
            max_leechers: 5,
            max_seeders: 5,
            peer_timeout_secs: 30,
            tracker_interval_secs: 10,
            pass_interval_ms: 1000,
            block_len: BLOCK_LEN,
        }
    }
}

impl Config {
    /// Window over which the rates are enforced.
    pub const RATE_WINDOW: Duration = Duration::from_secs(1);

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn tracker_interval(&self) -> Duration {
        Duration::from_secs(self.tracker_interval_secs)
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }

    /// Path of the configuration file in the user's config folder.
    pub fn config_path() -> Result<PathBuf, Error> {
        let dotfile =
            ProjectDirs::from("", "", "bitswarm").ok_or(Error::HomeInvalid)?;
        Ok(dotfile.config_dir().join("config.toml"))
    }

    /// Load the configuration file, writing one with the defaults if it
    /// doesn't exist yet. `BITSWARM_*` environment variables override the
    /// values of the file.
    pub fn load() -> Result<Self, Error> {
        let path = Self::config_path()?;

        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let default = toml::to_string(&Config::default())?;
            std::fs::write(&path, default)?;
            info!("wrote default configuration to {path:?}");
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, Error> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("BITSWARM").try_parsing(true),
            )
            .build()?
            .try_deserialize::<Config>()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.block_len == 0 || self.block_len > MAX_REQUEST_LEN {
            return Err(Error::ConfigInvalid(
                "block_len must be between 1 and 131072",
            ));
        }
        if self.pass_interval_ms == 0 {
            return Err(Error::ConfigInvalid("pass_interval_ms must not be 0"));
        }
        if self.tracker_interval_secs == 0 {
            return Err(Error::ConfigInvalid(
                "tracker_interval_secs must not be 0",
            ));
        }
        Ok(())
    }
}
