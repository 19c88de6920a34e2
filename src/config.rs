//! Client configuration loaded from `wsferry.toml`

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::protocol::DEFAULT_BLOCK_SIZE;
use crate::url::{parse_base_url, BaseUrl};

/// Environment variable that overrides `base_url` (read by the CLI).
pub const BASE_URL_ENV: &str = "WSFERRY_BASE_URL";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// ws:// address the control and upload endpoints hang off
    pub base_url: String,
    /// Bytes per upload data frame
    pub block_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8080".to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("wsferry");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("wsferry");
    }
    PathBuf::from(".wsferry")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("wsferry.toml")
}

impl ClientConfig {
    /// Load from `path`, or from the default location when `path` is `None`.
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let p = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        let cfg = match std::fs::read_to_string(&p) {
            Ok(data) => Self::from_toml(&data).with_context(|| format!("parse {}", p.display()))?,
            Err(e) if path.is_none() && e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e).with_context(|| format!("read {}", p.display())),
        };
        Ok(cfg)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let cfg: ClientConfig = toml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            bail!("block_size must be positive");
        }
        self.base()?;
        Ok(())
    }

    pub fn base(&self) -> Result<BaseUrl> {
        parse_base_url(&self.base_url)
            .ok_or_else(|| anyhow!("invalid base url {:?} (expected ws://host[:port][/prefix])", self.base_url))
    }
}
