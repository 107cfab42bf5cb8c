use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "wikimigrate.toml";
pub const DEFAULT_EXPORT_DIR: &str = "wikijs-complete-export";

const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10_000_000;
const DEFAULT_DOCUMENT_THROTTLE_MS: u64 = 50;
const DEFAULT_PAGE_THROTTLE_MS: u64 = 200;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrateConfig {
    #[serde(default)]
    pub wikijs: EndpointSection,
    #[serde(default)]
    pub outline: EndpointSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct EndpointSection {
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LimitsSection {
    pub max_upload_bytes: Option<u64>,
    pub document_throttle_ms: Option<u64>,
    pub page_throttle_ms: Option<u64>,
}

/// Concrete limits after applying defaults; throttles exist only to respect
/// the destination's rate limiting, not for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub max_upload_bytes: u64,
    pub document_throttle: Duration,
    pub page_throttle: Duration,
}

impl MigrateConfig {
    /// Resolve the Wiki.js base URL: CLI flag > WIKIJS_URL > config file.
    pub fn wikijs_url(&self, cli: Option<String>) -> Result<String> {
        match resolve(cli, "WIKIJS_URL", self.wikijs.url.as_deref()) {
            Some(url) => Ok(url.trim_end_matches('/').to_string()),
            None => bail!(
                "no Wiki.js URL configured; pass --wiki-url, set WIKIJS_URL, or add [wikijs] url"
            ),
        }
    }

    pub fn wikijs_token(&self, cli: Option<String>) -> Result<String> {
        resolve(cli, "WIKIJS_TOKEN", self.wikijs.token.as_deref()).ok_or_else(|| {
            anyhow::anyhow!(
                "no Wiki.js API token configured; pass --token, set WIKIJS_TOKEN, or add [wikijs] token"
            )
        })
    }

    /// Resolve the Outline base URL: CLI flag > OUTLINE_URL > config file.
    pub fn outline_url(&self, cli: Option<String>) -> Result<String> {
        match resolve(cli, "OUTLINE_URL", self.outline.url.as_deref()) {
            Some(url) => Ok(url.trim_end_matches('/').to_string()),
            None => bail!(
                "no Outline URL configured; pass --outline-url, set OUTLINE_URL, or add [outline] url"
            ),
        }
    }

    pub fn outline_token(&self, cli: Option<String>) -> Result<String> {
        resolve(cli, "OUTLINE_TOKEN", self.outline.token.as_deref()).ok_or_else(|| {
            anyhow::anyhow!(
                "no Outline API token configured; pass --token, set OUTLINE_TOKEN, or add [outline] token"
            )
        })
    }

    pub fn limits(&self) -> ResolvedLimits {
        ResolvedLimits {
            max_upload_bytes: self
                .limits
                .max_upload_bytes
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            document_throttle: Duration::from_millis(
                self.limits
                    .document_throttle_ms
                    .unwrap_or(DEFAULT_DOCUMENT_THROTTLE_MS),
            ),
            page_throttle: Duration::from_millis(
                self.limits
                    .page_throttle_ms
                    .unwrap_or(DEFAULT_PAGE_THROTTLE_MS),
            ),
        }
    }
}

fn resolve(cli: Option<String>, env_key: &str, config_value: Option<&str>) -> Option<String> {
    if let Some(value) = cli {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return Some(trimmed);
        }
    }
    if let Ok(value) = env::var(env_key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return Some(trimmed);
        }
    }
    config_value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Load and parse a MigrateConfig from a TOML file. Returns default if the
/// file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrateConfig> {
    if !config_path.exists() {
        return Ok(MigrateConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrateConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
