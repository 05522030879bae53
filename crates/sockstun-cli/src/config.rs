//! Configuration file, `$HOME/.sockstun/config.toml` by default.
//!
//! ```toml
//! socks_uri = "socks5://127.0.0.1:1080"
//! rw_timeout = "30s"
//!
//! [rules.web]
//! local_sock = "127.0.0.1:8080"
//! remote_sock = "10.0.0.5:80"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "$HOME/.sockstun/config.toml";

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Proxy every rule is dialed through.
    pub socks_uri: String,

    /// Absolute per-connection read/write deadline. Zero or absent disables it.
    #[serde(default, deserialize_with = "crate::duration::deserialize")]
    pub rw_timeout: Duration,

    /// Rules keyed by name. A `BTreeMap` keeps registration order stable.
    #[serde(default)]
    pub rules: BTreeMap<String, RuleConfig>,
}

/// One `[rules.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub local_sock: String,
    pub remote_sock: String,
}

impl Config {
    /// Read and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        debug!(path = %path.display(), rules = config.rules.len(), "loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.socks_uri.trim().is_empty() {
            bail!("socks_uri must not be empty");
        }
        if self.rules.is_empty() {
            bail!("no forwarding rules configured");
        }
        for (name, rule) in &self.rules {
            if rule.local_sock.trim().is_empty() {
                bail!("rule '{name}': local_sock must not be empty");
            }
            if rule.remote_sock.trim().is_empty() {
                bail!("rule '{name}': remote_sock must not be empty");
            }
        }
        Ok(())
    }
}

/// Replace `$HOME` anywhere in `path`, and a leading `~/`, with the user's
/// home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    if !path.contains("$HOME") && !path.starts_with("~/") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().context("failed to determine home directory")?;
    let home = home.to_string_lossy();
    let expanded = path.replace("$HOME", &home);
    let expanded = match expanded.strip_prefix("~/") {
        Some(rest) => format!("{home}/{rest}"),
        None => expanded,
    };
    Ok(PathBuf::from(expanded))
}
