use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use em_core::EngineConfig;

/// Environment variable naming a TOML config file when `--config` is absent.
pub const CONFIG_ENV: &str = "EM_CONFIG";

/// Resolve the config path: explicit flag first, then `EM_CONFIG`.
pub fn config_path(flag: Option<&Path>) -> Option<PathBuf> {
    flag.map(Path::to_path_buf).or_else(|| {
        std::env::var_os(CONFIG_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
}

/// Load and validate the engine config. No path means defaults; a named
/// file that cannot be read or parsed is an error.
pub fn load(flag: Option<&Path>) -> Result<EngineConfig> {
    let config = match config_path(flag) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let config: EngineConfig = toml::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?;
            tracing::info!("loaded config from {}", path.display());
            config
        }
        None => EngineConfig::default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}
