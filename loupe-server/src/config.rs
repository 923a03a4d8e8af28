//! Server configuration, read from `~/.projectloupe/server.toml` by default

use anyhow::{Context, Result};
use preview_cache::PreviewConfig;
use render_pipeline::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Persistent push connections
    pub push_addr: String,
    /// One-shot pull requests
    pub pull_addr: String,
    /// Defaults to ~/.projectloupe/catalog.db
    pub catalog_path: Option<PathBuf>,
    /// Overridden by RUST_LOG
    pub log_level: String,
    /// Keep previews in memory only, nothing written to disk
    pub memory_only: bool,
    pub preview: PreviewConfig,
    pub pipeline: PipelineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            push_addr: "127.0.0.1:7420".to_string(),
            pull_addr: "127.0.0.1:7421".to_string(),
            catalog_path: None,
            log_level: "info".to_string(),
            memory_only: false,
            preview: PreviewConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".projectloupe").join("server.toml"))
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config: {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() -> Result<()> {
        let dir = tempdir()?;
        let config = ServerConfig::load(&dir.path().join("absent.toml"))?;
        assert_eq!(config.push_addr, "127.0.0.1:7420");
        assert_eq!(config.preview.tier_sizes, vec![300, 1024]);
        assert!(!config.memory_only);
        Ok(())
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
pull_addr = "0.0.0.0:9000"
memory_only = true

[preview]
tier_quality = 70

[pipeline]
workers = 3
"#,
        )?;

        let config = ServerConfig::load(&path)?;
        assert_eq!(config.pull_addr, "0.0.0.0:9000");
        assert_eq!(config.push_addr, "127.0.0.1:7420");
        assert!(config.memory_only);
        assert_eq!(config.preview.tier_quality, 70);
        assert_eq!(config.preview.original_quality, 90);
        assert_eq!(config.pipeline.workers, Some(3));
        Ok(())
    }

    #[test]
    fn test_written_config_loads_back() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("server.toml");
        let mut config = ServerConfig::default();
        config.log_level = "debug".to_string();
        std::fs::write(&path, config.to_toml()?)?;

        let loaded = ServerConfig::load(&path)?;
        assert_eq!(loaded.log_level, "debug");
        assert_eq!(loaded.pipeline.memory_high_water, config.pipeline.memory_high_water);
        Ok(())
    }

    #[test]
    fn test_invalid_file_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "push_addr = [")?;
        assert!(ServerConfig::load(&path).is_err());
        Ok(())
    }
}
