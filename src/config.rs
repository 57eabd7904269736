use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::upsert::{IdentityResolution, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL, DEFAULT_MAX_CONFLICT_RETRIES};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub templates: TemplatesConfig,
    pub fhir: FhirConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Template documents loaded at start-up.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TemplatesConfig {
    pub device_content_path: Option<PathBuf>,
    pub fhir_mapping_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FhirConfig {
    pub identity_resolution: IdentityResolution,
    pub device_identifier_system: Option<String>,
    pub observation_cache_ttl_secs: u64,
    pub observation_cache_capacity: u64,
    pub max_conflict_retries: u32,
}

impl FhirConfig {
    pub fn observation_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.observation_cache_ttl_secs)
    }
}

impl Default for FhirConfig {
    fn default() -> Self {
        FhirConfig {
            identity_resolution: IdentityResolution::default(),
            device_identifier_system: None,
            observation_cache_ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
            observation_cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String, // tracing EnvFilter directive
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Config::from_yaml(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::from_yaml(
            r#"
api:
  port: 8080
fhir:
  identity_resolution: create
  max_conflict_retries: 5
"#,
        )
        .unwrap();

        assert_eq!(config.api.host, "127.0.0.1");
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.fhir.identity_resolution, IdentityResolution::Create);
        assert_eq!(config.fhir.max_conflict_retries, 5);
        assert_eq!(config.fhir.observation_cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.fhir.observation_cache_capacity, 10_000);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.templates, TemplatesConfig::default());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(
            Config::from_yaml("fhir:\n  identity_resolution: guess\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("does/not/exist.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
