use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the tubedex service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote platform settings
    pub youtube: YoutubeConfig,

    /// Storage settings
    pub database: DatabaseConfig,

    /// Local speech-to-text settings
    pub whisper: WhisperConfig,

    /// External tool binaries
    pub tools: ToolsConfig,

    /// HTTP server and scheduler settings
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoutubeConfig {
    /// Data API key
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperConfig {
    /// Path to the whisper.cpp binary
    pub binary: PathBuf,

    /// Path to the ggml model file
    pub model: PathBuf,

    /// Threads per whisper processor
    pub threads: u32,

    /// Parallel whisper processors
    pub processors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Audio downloader binary
    pub ytdlp: PathBuf,

    /// Transcoder binary
    pub ffmpeg: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the HTTP server listens on
    pub port: u16,

    /// Channel id served by the search endpoint
    pub serve_channel: String,

    /// Seconds between catch-up indexing passes
    pub check_interval_secs: u64,
}

impl Config {
    /// Load configuration from file, falling back to environment variables.
    pub fn load() -> Result<Self> {
        let config_paths = ["tubedex.toml", "config/tubedex.toml"];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str::<Config>(&config_str) {
                    Ok(mut config) => {
                        tracing::info!("📄 Loaded configuration from: {}", path);
                        config.apply_env();
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Override settings from environment variables.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("TUBEDEX_API_KEY") {
            self.youtube.api_key = key;
        }

        if let Ok(path) = std::env::var("TUBEDEX_DB") {
            self.database.path = PathBuf::from(path);
        }

        if let Ok(bin) = std::env::var("TUBEDEX_WHISPER_BIN") {
            self.whisper.binary = PathBuf::from(bin);
        }

        if let Ok(model) = std::env::var("TUBEDEX_WHISPER_MODEL") {
            self.whisper.model = PathBuf::from(model);
        }

        if let Ok(channel) = std::env::var("TUBEDEX_SERVE_CHANNEL") {
            self.server.serve_channel = channel;
        }

        if let Ok(port) = std::env::var("TUBEDEX_PORT") {
            self.server.port = port.parse().unwrap_or(self.server.port);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.youtube.api_key.is_empty() {
            return Err(anyhow!("youtube.api_key must be set (TUBEDEX_API_KEY)"));
        }

        if self.whisper.threads == 0 {
            return Err(anyhow!("whisper.threads must be greater than 0"));
        }

        if self.whisper.processors == 0 {
            return Err(anyhow!("whisper.processors must be greater than 0"));
        }

        if self.server.check_interval_secs == 0 {
            return Err(anyhow!("server.check_interval_secs must be greater than 0"));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        // Leave one processor for the rest of the pipeline.
        let processors = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1) as u32;

        Self {
            youtube: YoutubeConfig {
                api_key: String::new(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("tubedex.sqlite"),
            },
            whisper: WhisperConfig {
                binary: PathBuf::from("whisper-cpp"),
                model: PathBuf::from("models/ggml-base.en.bin"),
                threads: 1,
                processors,
            },
            tools: ToolsConfig {
                ytdlp: PathBuf::from("yt-dlp"),
                ffmpeg: PathBuf::from("ffmpeg"),
            },
            server: ServerConfig {
                port: 8080,
                serve_channel: String::new(),
                check_interval_secs: 3600,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_sane_tools() {
        let config = Config::default();
        assert_eq!(config.tools.ytdlp, PathBuf::from("yt-dlp"));
        assert_eq!(config.tools.ffmpeg, PathBuf::from("ffmpeg"));
        assert!(config.whisper.processors >= 1);
    }

    #[test]
    fn test_validation_requires_api_key() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.database.path, config.database.path);
    }
}
