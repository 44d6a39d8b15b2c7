use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub cache: CacheConfig,
    pub ingest: IngestConfig,
    pub limits: LimitsConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file = BufReader::new(
            File::open(path)
                .with_context(|| format!("Failed to open config file {}", path.display()))?,
        );
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub github: Option<GitHubConfig>,
    pub gitlab: Option<GitLabConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// Override for GitHub Enterprise Server, e.g. `https://ghe.example.com/api/v3`.
    pub api_url: String,
    pub organizations: Vec<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self { api_url: "https://api.github.com".to_string(), organizations: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitLabConfig {
    pub base_url: String,
    /// Top-level groups to enumerate, including subgroups.
    pub organizations: Vec<String>,
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self { base_url: "https://gitlab.com".to_string(), organizations: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// All working copies live under this directory.
    pub root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self { Self { root: PathBuf::from("repos") } }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestConfig {
    pub url: Option<Url>,
    /// Units coalesced into one outbound call. 1 disables batching.
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self { Self { url: None, batch_size: 10, timeout_secs: 30 } }
}

impl IngestConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Global ceiling on concurrent sync/submit tasks.
    pub max_concurrency: usize,
    /// Ceiling on concurrent tasks against a single upstream host.
    pub per_host: usize,
    pub retry: RetryConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self { Self { max_concurrency: 16, per_host: 8, retry: RetryConfig::default() } }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self { Self { max_attempts: 3, base_delay_ms: 500, max_delay_ms: 30_000 } }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.limits.max_concurrency, 16);
        assert_eq!(config.limits.per_host, 8);
        assert_eq!(config.limits.retry.max_attempts, 3);
        assert_eq!(config.ingest.batch_size, 10);
        assert_eq!(config.cache.root, PathBuf::from("repos"));
        assert!(config.providers.github.is_none());
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
providers:
  github:
    organizations: [openrewrite, moderneinc]
  gitlab:
    base_url: https://gitlab.example.com
    organizations: [platform]
cache:
  root: /var/cache/mod-connect
ingest:
  url: https://ingest.example.com/v1/units
  batch_size: 25
limits:
  max_concurrency: 4
  retry:
    max_attempts: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let github = config.providers.github.unwrap();
        assert_eq!(github.api_url, "https://api.github.com");
        assert_eq!(github.organizations, ["openrewrite", "moderneinc"]);
        let gitlab = config.providers.gitlab.unwrap();
        assert_eq!(gitlab.base_url, "https://gitlab.example.com");
        assert_eq!(config.ingest.batch_size, 25);
        assert_eq!(config.ingest.timeout_secs, 30);
        assert_eq!(config.limits.max_concurrency, 4);
        assert_eq!(config.limits.per_host, 8);
        assert_eq!(config.limits.retry.policy().max_attempts, 5);
    }
}
