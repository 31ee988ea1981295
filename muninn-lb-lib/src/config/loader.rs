use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{ProxyError, Result};

/// Load a configuration file. `.json` paths decode as JSON, everything else
/// as TOML.
pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let path = p.as_ref();
    let txt = fs::read_to_string(path)
        .map_err(|e| ProxyError::Config(format!("Failed to read config file: {e}")))?;

    let cfg: Config = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&txt)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {e}")))?
    } else {
        toml::from_str(&txt)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {e}")))?
    };

    Ok(cfg)
}
