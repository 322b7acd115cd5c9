use anyhow::Context;
use crawler::HttpSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One configured crawl origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSeed {
    pub url: String,
    pub name: String,
}

/// Startup configuration, loaded once from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub sites: Vec<SiteSeed>,
    #[serde(default)]
    pub http: HttpSettings,
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        if config.sites.is_empty() {
            anyhow::bail!("no sites configured in {}", path.display());
        }
        Ok(config)
    }
}
