use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

/// Environment variables use `__` as the separator of nested keys,
/// e.g. `SIFT__RESULTS__SUBSCRIBER_QUEUE_SIZE`.
const ENV_PREFIX: &str = "SIFT__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub namespace: NamespaceConfig,
    pub results: ResultsConfig,
    pub jobs: JobsConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        extract(Self::figment())
    }

    /// The built-in configuration, without any environment overrides.
    pub fn defaults() -> CommonResult<Self> {
        extract(Figment::from(Toml::string(DEFAULT_CONFIG)))
    }

    /// The configuration sources in increasing order of precedence.
    /// Callers may merge additional providers before extracting.
    pub fn figment() -> Figment {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .admerge(Env::prefixed(ENV_PREFIX).map(|p| p.as_str().replace("__", ".").into()))
    }
}

fn extract(figment: Figment) -> CommonResult<AppConfig> {
    figment
        .extract()
        .map_err(|e| CommonError::invalid(e.to_string()))
}

/// The user and app context that REST paths are resolved in.
/// Both must be set for the namespace to take effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(deserialize_with = "deserialize_non_empty_string")]
    pub owner: Option<String>,
    #[serde(deserialize_with = "deserialize_non_empty_string")]
    pub app: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    /// The number of batches each subscriber can have queued
    /// before the stream stops reading from its source.
    pub subscriber_queue_size: usize,
    /// The maximum number of records requested per result retrieval.
    /// Zero requests all available records.
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub console_traces: bool,
}

fn deserialize_non_empty_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|x| !x.is_empty()))
}
