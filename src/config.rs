//! Configuration loading and schema definitions for stagehand.
//!
//! This module provides types and functions for loading stagehand
//! configuration from TOML files or strings. The schema covers harness
//! timeouts, the engine process, and reporting.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Name of the configuration file `stagehand init` writes.
pub const DEFAULT_CONFIG_FILE: &str = "stagehand.toml";

/// Loads stagehand configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use stagehand::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("stagehand.toml"))?;
/// println!("Stage timeout: {}s", config.harness.stage_timeout_secs);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads stagehand configuration from a TOML string.
///
/// # Example
///
/// ```
/// use stagehand::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [harness]
///     stage_timeout_secs = 10
///
///     [engine]
///     args = ["--headless"]
/// "#)?;
///
/// assert_eq!(config.harness.stage_timeout_secs, 10);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// The configuration `stagehand init` writes, with every default spelled out.
pub fn default_config_toml() -> Result<String> {
    toml::to_string_pretty(&Config::default()).context("Failed to render default config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips() {
        let rendered = default_config_toml().unwrap();
        let config = load_config_str(&rendered).unwrap();
        assert_eq!(config.harness.channel, "stagehand");
        assert!(rendered.contains("[harness]"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[report]\njunit = false\n").unwrap();

        let config = load_config(&path).unwrap();
        assert!(!config.report.junit);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/stagehand.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(load_config_str("[harness\n").is_err());
    }
}
