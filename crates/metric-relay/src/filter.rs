// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;
use tracing::debug;

use crate::errors::ConfigError;
use crate::path::{self, FieldPath};

const SPEC_DELIMITER: char = '|';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Pass,
    NotIncluded,
    Excluded,
}

impl FilterVerdict {
    #[must_use]
    pub fn passed(self) -> bool {
        self == FilterVerdict::Pass
    }
}

/// One `field:value1,value2` rule. Candidates are stored upper-cased.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    path: FieldPath,
    candidates: Vec<String>,
}

impl FilterSpec {
    pub fn parse(setting: &'static str, spec: &str) -> Result<Self, ConfigError> {
        let Some((field, values)) = spec.split_once(':') else {
            return Err(ConfigError::invalid(
                setting,
                format!("filter '{spec}' must be of the form field:value1,value2"),
            ));
        };
        let path = FieldPath::parse(field);
        if path.is_empty() {
            return Err(ConfigError::invalid(
                setting,
                format!("filter '{spec}' has no field"),
            ));
        }
        let candidates: Vec<String> = values
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_uppercase)
            .collect();
        if candidates.is_empty() {
            return Err(ConfigError::invalid(
                setting,
                format!("filter '{spec}' has no values"),
            ));
        }
        Ok(FilterSpec { path, candidates })
    }

    /// Case-insensitive substring match of any candidate against the field's value.
    fn matches(&self, msg: &Value) -> Option<&str> {
        let text = match path::resolve(msg, &self.path, true) {
            Ok(resolved) => resolved.to_text().to_uppercase(),
            Err(_) => return None,
        };
        self.candidates
            .iter()
            .find(|candidate| text.contains(candidate.as_str()))
            .map(String::as_str)
    }
}

/// Parses a `|`-separated list of filter specs.
pub fn parse_filter_list(setting: &'static str, raw: &str) -> Result<Vec<FilterSpec>, ConfigError> {
    raw.split(SPEC_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| FilterSpec::parse(setting, s))
        .collect()
}

/// Inclusion and exclusion rules applied before extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFilter {
    include: Vec<FilterSpec>,
    exclude: Vec<FilterSpec>,
}

impl MessageFilter {
    #[must_use]
    pub fn new(include: Vec<FilterSpec>, exclude: Vec<FilterSpec>) -> Self {
        MessageFilter { include, exclude }
    }

    pub fn check(&self, msg: &Value) -> FilterVerdict {
        if !self.include.is_empty() {
            let hit = self
                .include
                .iter()
                .find_map(|spec| spec.matches(msg).map(|c| (spec, c)));
            match hit {
                Some((spec, candidate)) => {
                    debug!("passed filter (inclusion): {} matched {}", spec.path, candidate);
                }
                None => {
                    debug!("filtered message (inclusion): no include filter matched");
                    return FilterVerdict::NotIncluded;
                }
            }
        }

        for spec in &self.exclude {
            if let Some(candidate) = spec.matches(msg) {
                debug!(
                    "filtered message (exclusion): {} matched {}",
                    spec.path, candidate
                );
                return FilterVerdict::Excluded;
            }
        }
        FilterVerdict::Pass
    }
}
