//! Configuration management for Mosaic Server

use std::env;
use std::path::PathBuf;

use serde::Deserialize;

use crate::upload::{AssemblyConfig, DEFAULT_MAX_FRAGMENT_SIZE, DEFAULT_MERGE_PARALLELISM};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Root holding `fragments/` and `artifacts/`
    pub upload_dir: PathBuf,
    pub max_fragment_size: usize,
    pub merge_parallelism: usize,
    pub verify_fingerprint: bool,
}

impl UploadConfig {
    pub fn assembly(&self) -> AssemblyConfig {
        AssemblyConfig {
            merge_parallelism: self.merge_parallelism,
            verify_fingerprint: self.verify_fingerprint,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 7001,
            },
            upload: UploadConfig {
                upload_dir: PathBuf::from("./uploads"),
                max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
                merge_parallelism: DEFAULT_MERGE_PARALLELISM,
                verify_fingerprint: false,
            },
        }
    }
}

impl Config {
    /// Read configuration from the environment, falling back to defaults
    /// for unset variables. Malformed values are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            upload: UploadConfig {
                upload_dir: env::var("UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.upload_dir),
                max_fragment_size: parse_var("MAX_FRAGMENT_SIZE", defaults.upload.max_fragment_size)?,
                merge_parallelism: parse_var("MERGE_PARALLELISM", defaults.upload.merge_parallelism)?,
                verify_fingerprint: parse_var("VERIFY_FINGERPRINT", defaults.upload.verify_fingerprint)?,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}
