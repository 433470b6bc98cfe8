use std::fs;
use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::MigrateError;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_API_PATH: &str = "/api/3/action";

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    #[serde(default)]
    pub source_ckan_url: Option<String>,
    #[serde(default)]
    pub source_api_key: Option<String>,
    #[serde(default)]
    pub source_ckan_api: Option<String>,
    #[serde(default)]
    pub target_ckan_url: Option<String>,
    #[serde(default)]
    pub target_api_key: Option<String>,
    #[serde(default)]
    pub staging_ckan_url: Option<String>,
    #[serde(default)]
    pub staging_api_key: Option<String>,
    #[serde(default)]
    pub verify_tls: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CatalogRole {
    Source,
    Target,
    Staging,
}

impl CatalogRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogRole::Source => "source",
            CatalogRole::Target => "target",
            CatalogRole::Staging => "staging",
        }
    }
}

/// Connection details for one catalog instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEndpoint {
    pub base_url: String,
    pub api_path: String,
    pub api_key: Option<String>,
    pub verify_tls: bool,
}

impl CatalogEndpoint {
    pub fn action_url(&self, action: &str) -> String {
        format!("{}{}/{}", self.base_url, self.api_path, action)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub source: CatalogEndpoint,
    pub target: CatalogEndpoint,
    pub staging: Option<CatalogEndpoint>,
}

impl ResolvedConfig {
    pub fn endpoint(&self, role: CatalogRole) -> Result<&CatalogEndpoint, MigrateError> {
        match role {
            CatalogRole::Source => Ok(&self.source),
            CatalogRole::Target => Ok(&self.target),
            CatalogRole::Staging => self
                .staging
                .as_ref()
                .ok_or_else(|| MigrateError::MissingCatalog(role.as_str().to_string())),
        }
    }

    pub fn disable_tls_verification(&mut self) {
        self.source.verify_tls = false;
        self.target.verify_tls = false;
        if let Some(staging) = self.staging.as_mut() {
            staging.verify_tls = false;
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, MigrateError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(MigrateError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| MigrateError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| MigrateError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, MigrateError> {
        let required = [
            ("SOURCE_CKAN_URL", &config.source_ckan_url),
            ("TARGET_CKAN_URL", &config.target_ckan_url),
            ("TARGET_API_KEY", &config.target_api_key),
        ];
        let missing = required
            .iter()
            .filter(|(_, value)| non_blank(value).is_none())
            .map(|(key, _)| key.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(MigrateError::MissingConfigKeys(missing));
        }

        let verify_tls = config.verify_tls.unwrap_or(true);
        let source_api = non_blank(&config.source_ckan_api)
            .map(normalize_api_path)
            .unwrap_or_else(|| DEFAULT_API_PATH.to_string());

        let source = CatalogEndpoint {
            base_url: normalize_url(non_blank(&config.source_ckan_url).unwrap_or_default()),
            api_path: source_api,
            api_key: non_blank(&config.source_api_key).map(str::to_string),
            verify_tls,
        };
        let target = CatalogEndpoint {
            base_url: normalize_url(non_blank(&config.target_ckan_url).unwrap_or_default()),
            api_path: DEFAULT_API_PATH.to_string(),
            api_key: non_blank(&config.target_api_key).map(str::to_string),
            verify_tls,
        };
        let staging = non_blank(&config.staging_ckan_url).map(|url| CatalogEndpoint {
            base_url: normalize_url(url),
            api_path: DEFAULT_API_PATH.to_string(),
            api_key: non_blank(&config.staging_api_key).map(str::to_string),
            verify_tls,
        });

        Ok(ResolvedConfig {
            source,
            target,
            staging,
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn normalize_api_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}
