//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calling::media::MediaConstraints;
use crate::calling::peer::{IceServer, RtcConfiguration};
use crate::channel::ChannelOptions;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Our identity on the signal channel
    pub participant_id: String,
    /// Base websocket URL of the signaling server
    pub signaling_url: String,
    pub ice_servers: Vec<IceServer>,
    pub media: MediaConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
    /// Simulate the user refusing camera/microphone access
    pub deny: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub max_backoff_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            participant_id: "me".to_string(),
            signaling_url: "ws://127.0.0.1:8080/signal".to_string(),
            ice_servers: vec![IceServer {
                urls: "stun:stun.l.google.com:19302".to_string(),
            }],
            media: MediaConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            deny: false,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_backoff_secs: 64,
        }
    }
}

impl Config {
    /// Get config file path
    pub fn default_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "p2p-call", "p2p-call")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from `path`, or the default location. A missing
    /// file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}; using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn rtc_configuration(&self) -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: self.ice_servers.clone(),
        }
    }

    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.media.audio,
            video: self.media.video,
        }
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            max_backoff: Duration::from_secs(self.channel.max_backoff_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("p2p-call-test-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from(&temp_path("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_path("config.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"
participant_id = "alice"

[[ice_servers]]
urls = "stun:stun.example.org:3478"

[[ice_servers]]
urls = "turn:turn.example.org"

[media]
video = false
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.participant_id, "alice");
        assert_eq!(config.signaling_url, Config::default().signaling_url);
        assert_eq!(config.rtc_configuration().ice_servers.len(), 2);
        assert_eq!(
            config.media_constraints(),
            MediaConstraints {
                audio: true,
                video: false
            }
        );
        assert!(!config.media.deny);
        assert_eq!(config.channel_options().max_backoff, Duration::from_secs(64));
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("nested/config.toml");
        let mut config = Config::default();
        config.participant_id = "bob".into();
        config.media.deny = true;
        config.channel.max_backoff_secs = 8;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let path = temp_path("bad.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "participant_id = [").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
