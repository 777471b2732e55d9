//! Writes a configuration file populated with the defaults.

use std::{fs, path::PathBuf};

use anyhow::{Context, bail};
use shared::config::server::Config;

/// Writes the default configuration as `yaml` or `json` and returns the path.
pub fn generate_config(format: &str, output: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let config = Config::with_defaults();
    let (serialized, default_name) = match format {
        "yaml" | "yml" => (serde_yml::to_string(&config)?, "config.yaml"),
        "json" => (serde_json::to_string_pretty(&config)?, "config.json"),
        other => bail!("unsupported format '{other}', use 'yaml' or 'json'"),
    };

    let path = output.unwrap_or_else(|| PathBuf::from(default_name));
    fs::write(&path, serialized).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
