//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://dmarc.db";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default root directory for the raw artifact store.
pub const DEFAULT_STORAGE_ROOT: &str = "./data/raw";

/// Default number of entries claimed per processing batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Raw artifact store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
}

/// Processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub batch_size: usize,
}

impl PipelineConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = PipelineConfig {
            database: DatabaseConfig {
                url: std::env::var("DMARC_DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: std::env::var("DMARC_DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            },
            storage: StorageConfig {
                root: std::env::var("DMARC_STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORAGE_ROOT)),
            },
            processing: ProcessingConfig {
                batch_size: std::env::var("DMARC_BATCH_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BATCH_SIZE),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.storage.root.as_os_str().is_empty() {
            anyhow::bail!("Storage root cannot be empty");
        }

        if self.processing.batch_size == 0 {
            anyhow::bail!("Processing batch_size must be greater than 0");
        }

        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            },
            storage: StorageConfig {
                root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            },
            processing: ProcessingConfig {
                batch_size: DEFAULT_BATCH_SIZE,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = PipelineConfig::default();
        config.processing.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
