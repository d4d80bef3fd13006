// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Settings are read from a JSON file (`RELAY_CONFIG`, default `config.json`), overridden
//! by `RELAY_*` environment variables, then validated. List settings accept either a JSON
//! array or a comma-separated string.

use std::env;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::decoder::{DataFormat, Decoder, TopLevel, DEFAULT_CSV_DELIMITER};
use crate::delivery::{DeliveryMode, PayloadEncoding, ProjectType};
use crate::errors::ConfigError;
use crate::timestamp::{parse_timezone, DEFAULT_FORMATS};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_COLLECTOR_URL: &str = "https://app.insightfinder.com";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub collector: CollectorConfig,
    pub parsing: ParsingConfig,
    pub join: JoinConfig,
    pub runtime: RuntimeConfig,
}

/// Where and how batches are delivered.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub url: String,
    pub user_name: String,
    pub license_key: String,
    pub project_name: String,
    pub project_type: ProjectType,
    /// `"10s"` is ten seconds, a bare number is minutes.
    pub sampling_interval: String,
    pub chunk_size_kb: usize,
    pub chunk_lines: usize,
    pub delivery_mode: DeliveryMode,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    pub request_timeout_secs: u64,
    pub https_proxy: Option<String>,
    pub payload_encoding: PayloadEncoding,
    /// Build and log envelopes without sending them.
    pub dry_run: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_COLLECTOR_URL.to_string(),
            user_name: String::new(),
            license_key: String::new(),
            project_name: String::new(),
            project_type: ProjectType::Metric,
            sampling_interval: String::new(),
            chunk_size_kb: 2048,
            chunk_lines: 40_000,
            delivery_mode: DeliveryMode::Retry,
            max_attempts: 3,
            retry_backoff_secs: 30,
            request_timeout_secs: 30,
            https_proxy: None,
            payload_encoding: PayloadEncoding::Form,
            dry_run: false,
        }
    }
}

impl CollectorConfig {
    /// Sampling interval in seconds.
    pub fn sampling_interval_secs(&self) -> Result<u64, ConfigError> {
        let raw = self.sampling_interval.trim();
        if raw.is_empty() {
            return Err(ConfigError::Missing {
                setting: "sampling_interval",
            });
        }
        let invalid = || {
            ConfigError::invalid(
                "sampling_interval",
                format!("'{raw}' is neither '<n>s' nor a number of minutes"),
            )
        };
        let secs = match raw.strip_suffix('s') {
            Some(secs) => secs.trim().parse::<u64>().map_err(|_| invalid())?,
            None => raw
                .parse::<u64>()
                .map_err(|_| invalid())?
                .checked_mul(60)
                .ok_or_else(invalid)?,
        };
        if secs == 0 {
            return Err(invalid());
        }
        Ok(secs)
    }

    #[must_use]
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_kb.saturating_mul(1024)
    }
}

/// How messages are decoded and which fields are extracted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParsingConfig {
    pub data_format: DataFormat,
    #[serde(deserialize_with = "string_list")]
    pub csv_field_names: Vec<String>,
    pub csv_field_delimiter: String,
    pub raw_regex: String,
    pub json_top_level: String,
    #[serde(deserialize_with = "string_list")]
    pub timestamp_format: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub timestamp_field: Vec<String>,
    pub timezone: String,
    #[serde(deserialize_with = "string_list")]
    pub instance_field: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub device_field: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub data_fields: Vec<String>,
    /// `|`-separated `field:value1,value2` specs.
    pub filters_include: String,
    pub filters_exclude: String,
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            data_format: DataFormat::Json,
            csv_field_names: Vec::new(),
            csv_field_delimiter: DEFAULT_CSV_DELIMITER.to_string(),
            raw_regex: String::new(),
            json_top_level: String::new(),
            timestamp_format: split_list(DEFAULT_FORMATS),
            timestamp_field: vec!["timestamp".to_string()],
            timezone: "UTC".to_string(),
            instance_field: Vec::new(),
            device_field: Vec::new(),
            data_fields: Vec::new(),
            filters_include: String::new(),
            filters_exclude: String::new(),
        }
    }
}

impl ParsingConfig {
    /// Builds the decoder for the configured data format.
    pub fn decoder(&self) -> Result<Decoder, ConfigError> {
        match self.data_format {
            DataFormat::Json => Ok(Decoder::json(TopLevel::from(self.json_top_level.as_str()))),
            DataFormat::Csv => {
                if self.csv_field_names.is_empty() {
                    return Err(ConfigError::Missing {
                        setting: "csv_field_names",
                    });
                }
                let delimiter = if self.csv_field_delimiter.is_empty() {
                    DEFAULT_CSV_DELIMITER
                } else {
                    self.csv_field_delimiter.as_str()
                };
                let delimiter = Regex::new(delimiter)
                    .map_err(|e| ConfigError::invalid("csv_field_delimiter", e.to_string()))?;
                Ok(Decoder::csv(self.csv_field_names.clone(), delimiter))
            }
            DataFormat::Raw => {
                if self.raw_regex.trim().is_empty() {
                    return Err(ConfigError::Missing {
                        setting: "raw_regex",
                    });
                }
                let pattern = Regex::new(&self.raw_regex)
                    .map_err(|e| ConfigError::invalid("raw_regex", e.to_string()))?;
                if pattern.capture_names().flatten().next().is_none() {
                    return Err(ConfigError::invalid(
                        "raw_regex",
                        "pattern has no named capture groups",
                    ));
                }
                Ok(Decoder::raw(pattern))
            }
        }
    }
}

/// Windowed join settings. An empty `required_fields` disables joining.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    #[serde(deserialize_with = "string_list")]
    pub required_fields: Vec<String>,
    pub bucket_ms: i64,
    pub wait_secs: u64,
    pub sweep_interval_secs: u64,
    pub expiry_secs: u64,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            required_fields: Vec::new(),
            bucket_ms: 0,
            wait_secs: 60,
            sweep_interval_secs: 30,
            expiry_secs: 600,
        }
    }
}

impl JoinConfig {
    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.required_fields.is_empty()
    }

    #[must_use]
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn expiry_ms(&self) -> i64 {
        (self.expiry_secs.saturating_mul(1000)).min(i64::MAX as u64) as i64
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub workers: usize,
    pub read_timeout_secs: u64,
    pub channel_capacity: usize,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            read_timeout_secs: 60,
            channel_capacity: 1024,
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Config {
    /// Loads `RELAY_CONFIG` (or `config.json`), applies environment overrides and validates.
    ///
    /// A missing default file is not an error; settings may come from the environment alone.
    pub fn from_env() -> Result<Self, ConfigError> {
        let explicit = env::var("RELAY_CONFIG").ok();
        let path = explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
        let mut config = if explicit.is_some() || Path::new(path).exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Applies `RELAY_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let collector = &mut self.collector;
        if let Some(v) = lookup("RELAY_URL") {
            collector.url = v;
        }
        if let Some(v) = lookup("RELAY_USER_NAME") {
            collector.user_name = v;
        }
        if let Some(v) = lookup("RELAY_LICENSE_KEY") {
            collector.license_key = v;
        }
        if let Some(v) = lookup("RELAY_PROJECT_NAME") {
            collector.project_name = v;
        }
        if let Some(v) = lookup("RELAY_PROJECT_TYPE") {
            collector.project_type = match v.to_uppercase().as_str() {
                "METRIC" => ProjectType::Metric,
                "METRICREPLAY" => ProjectType::MetricReplay,
                _ => {
                    return Err(ConfigError::invalid(
                        "project_type",
                        format!("'{v}' must be METRIC or METRICREPLAY"),
                    ))
                }
            };
        }
        if let Some(v) = lookup("RELAY_SAMPLING_INTERVAL") {
            collector.sampling_interval = v;
        }
        if let Some(v) = lookup("RELAY_PROXY_HTTPS").or_else(|| lookup("HTTPS_PROXY")) {
            collector.https_proxy = Some(v);
        }
        if let Some(v) = lookup("RELAY_DRY_RUN") {
            collector.dry_run = v.to_lowercase() != "false";
        }
        if let Some(v) = lookup("RELAY_WORKERS") {
            self.runtime.workers = v
                .parse()
                .map_err(|_| ConfigError::invalid("workers", format!("'{v}' is not a number")))?;
        }
        if let Some(v) = lookup("RELAY_LOG_LEVEL") {
            self.runtime.log_level = v.to_lowercase();
        }
        Ok(())
    }

    /// Rejects missing or malformed settings, naming the offending one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let collector = &self.collector;
        for (setting, value) in [
            ("user_name", &collector.user_name),
            ("license_key", &collector.license_key),
            ("project_name", &collector.project_name),
            ("url", &collector.url),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing { setting });
            }
        }
        collector.sampling_interval_secs()?;
        for (setting, value) in [
            ("chunk_size_kb", collector.chunk_size_kb),
            ("chunk_lines", collector.chunk_lines),
            ("workers", self.runtime.workers),
            ("channel_capacity", self.runtime.channel_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(setting, "must be greater than 0"));
            }
        }
        if collector.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be greater than 0"));
        }
        if self.runtime.read_timeout_secs == 0 {
            return Err(ConfigError::invalid("read_timeout_secs", "must be greater than 0"));
        }
        if self.join.enabled() && self.join.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "sweep_interval_secs",
                "must be greater than 0",
            ));
        }
        if self.join.bucket_ms < 0 {
            return Err(ConfigError::invalid("bucket_ms", "must not be negative"));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.runtime.log_level.as_str()) {
            return Err(ConfigError::invalid(
                "log_level",
                format!(
                    "'{}' must be one of: trace, debug, info, warn, error",
                    self.runtime.log_level
                ),
            ));
        }

        parse_timezone(&self.parsing.timezone)?;
        self.parsing.decoder()?;
        crate::filter::parse_filter_list("filters_include", &self.parsing.filters_include)?;
        crate::filter::parse_filter_list("filters_exclude", &self.parsing.filters_exclude)?;
        if self.parsing.timestamp_field.iter().all(|f| f.trim().is_empty()) {
            return Err(ConfigError::Missing {
                setting: "timestamp_field",
            });
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListSetting {
    Joined(String),
    Items(Vec<String>),
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ListSetting::deserialize(deserializer)? {
        ListSetting::Joined(raw) => split_list(&raw),
        ListSetting::Items(items) => items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> Config {
        Config::from_json(
            r#"{
                "collector": {
                    "user_name": "alice",
                    "license_key": "abc123",
                    "project_name": "web",
                    "sampling_interval": "10s"
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = valid();
        assert!(config.validate().is_ok());
        assert_eq!(config.collector.url, DEFAULT_COLLECTOR_URL);
        assert_eq!(config.collector.chunk_size_bytes(), 2048 * 1024);
        assert_eq!(config.collector.max_attempts, 3);
        assert_eq!(config.parsing.timestamp_field, vec!["timestamp"]);
        assert_eq!(config.parsing.timestamp_format.len(), 4);
        assert_eq!(config.join.wait_secs, 60);
        assert_eq!(config.join.expiry_ms(), 600_000);
        assert!(!config.join.enabled());
        assert_eq!(config.runtime.workers, 1);
    }

    #[test]
    fn test_missing_required_setting_is_named() {
        let mut config = valid();
        config.collector.license_key = String::new();
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Agent not correctly configured (license_key). Check config file."
        );
    }

    #[test]
    fn test_sampling_interval_units() {
        let mut collector = CollectorConfig {
            sampling_interval: "10s".to_string(),
            ..Default::default()
        };
        assert_eq!(collector.sampling_interval_secs().unwrap(), 10);
        collector.sampling_interval = "5".to_string();
        assert_eq!(collector.sampling_interval_secs().unwrap(), 300);
        collector.sampling_interval = "often".to_string();
        assert!(collector.sampling_interval_secs().is_err());
        collector.sampling_interval = "0s".to_string();
        assert!(collector.sampling_interval_secs().is_err());
    }

    #[test]
    fn test_list_settings_accept_strings_and_arrays() {
        let config = Config::from_json(
            r#"{"parsing": {"data_fields": "cpu, mem,,", "instance_field": ["tags.host", "host"]}}"#,
        )
        .unwrap();
        assert_eq!(config.parsing.data_fields, vec!["cpu", "mem"]);
        assert_eq!(config.parsing.instance_field, vec!["tags.host", "host"]);
    }

    #[test]
    fn test_enum_settings() {
        let config = Config::from_json(
            r#"{"collector": {"project_type": "METRICREPLAY", "delivery_mode": "split", "payload_encoding": "json"},
                "parsing": {"data_format": "CSV"}}"#,
        )
        .unwrap();
        assert_eq!(config.collector.project_type, ProjectType::MetricReplay);
        assert_eq!(config.collector.delivery_mode, DeliveryMode::Split);
        assert_eq!(config.collector.payload_encoding, PayloadEncoding::Json);
        assert_eq!(config.parsing.data_format, DataFormat::Csv);
    }

    #[test]
    fn test_invalid_regexes_and_timezone() {
        let mut config = valid();
        config.parsing.data_format = DataFormat::Raw;
        config.parsing.raw_regex = "(unclosed".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                setting: "raw_regex",
                ..
            })
        ));

        let mut config = valid();
        config.parsing.data_format = DataFormat::Csv;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing {
                setting: "csv_field_names"
            })
        ));

        let mut config = valid();
        config.parsing.timezone = "Mars/Olympus".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                setting: "timezone",
                ..
            })
        ));

        let mut config = valid();
        config.parsing.timezone = "America/New_York".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filter_without_colon_is_rejected() {
        let mut config = valid();
        config.parsing.filters_include = "env".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                setting: "filters_include",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let mut config = valid();
        config.runtime.workers = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.collector.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RELAY_LICENSE_KEY", "from-env"),
            ("RELAY_PROJECT_TYPE", "metricreplay"),
            ("HTTPS_PROXY", "http://proxy:3128"),
            ("RELAY_DRY_RUN", "true"),
            ("RELAY_WORKERS", "4"),
            ("RELAY_LOG_LEVEL", "DEBUG"),
        ]);
        let mut config = valid();
        config
            .apply_overrides(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.collector.license_key, "from-env");
        assert_eq!(config.collector.project_type, ProjectType::MetricReplay);
        assert_eq!(
            config.collector.https_proxy.as_deref(),
            Some("http://proxy:3128")
        );
        assert!(config.collector.dry_run);
        assert_eq!(config.runtime.workers, 4);
        assert_eq!(config.runtime.log_level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_override_names_setting() {
        let mut config = valid();
        let err = config
            .apply_overrides(|k| (k == "RELAY_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                setting: "workers",
                ..
            }
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/relay.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
