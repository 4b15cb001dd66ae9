//! Configuration loader for the `sca` binary.
//!
//! Layering: built-in defaults, then `~/.sca/config.toml` (or `--config`), then
//! environment variables.

use sca_llm::LlmConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl AppConfig {
    /// An explicit path must exist; the default path is optional.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (default_config_path(), false),
        };

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(v) => v,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        let cfg: AppConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(cfg)
    }

    /// Resolves the client settings, applying `lookup` as the environment.
    pub fn llm_config(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<LlmConfig> {
        let mut cfg = LlmConfig::default();
        if let Some(v) = self.llm.model.as_ref().filter(|v| !v.trim().is_empty()) {
            cfg.model = v.clone();
        }
        if let Some(v) = self.llm.base_url.as_ref().filter(|v| !v.trim().is_empty()) {
            cfg.base_url = v.clone();
        }
        if let Some(secs) = self.llm.timeout_secs {
            cfg.timeout = Duration::from_secs(secs);
        }
        cfg.apply_overrides(lookup);
        validate(&cfg)?;
        Ok(cfg)
    }
}

fn validate(cfg: &LlmConfig) -> anyhow::Result<()> {
    if cfg.model.trim().is_empty() {
        return Err(anyhow::anyhow!("llm.model is required"));
    }
    let base = cfg.base_url.to_ascii_lowercase();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(anyhow::anyhow!(
            "llm.base_url must be an http(s) url, got {:?}",
            cfg.base_url
        ));
    }
    if cfg.timeout.is_zero() {
        return Err(anyhow::anyhow!("llm.timeout_secs must be > 0"));
    }
    Ok(())
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".sca").join("config.toml")
}
