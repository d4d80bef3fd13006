// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-message extraction: filter, identify, timestamp, then gather data fields.

use std::borrow::Cow;
use std::collections::BTreeMap;

use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::ParsingConfig;
use crate::errors::{ConfigError, ExtractError, ResolveError};
use crate::filter::{parse_filter_list, MessageFilter};
use crate::formatter::{FieldSpec, Selector, ValueFormatter};
use crate::path::{FieldPath, Resolved};
use crate::timestamp::TimestampParser;

/// One flat observation for one instance at one timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRecord {
    pub timestamp_ms: i64,
    pub instance: String,
    pub device: Option<String>,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RecordExtractor {
    formatter: ValueFormatter,
    filter: MessageFilter,
    timestamps: TimestampParser,
    instance: Selector,
    device: Selector,
    timestamp: Selector,
    timestamp_setting: String,
    data_fields: Vec<FieldSpec>,
    default_instance: String,
}

impl RecordExtractor {
    /// Compiles the parsing section of the configuration.
    pub fn from_config(
        parsing: &ParsingConfig,
        default_instance: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let formatter = ValueFormatter::new();
        let filter = MessageFilter::new(
            parse_filter_list("filters_include", &parsing.filters_include)?,
            parse_filter_list("filters_exclude", &parsing.filters_exclude)?,
        );
        let timestamps = TimestampParser::from_config(
            &parsing.timestamp_format.join(","),
            &parsing.timezone,
        )?;
        let timestamp = formatter.selector(&parsing.timestamp_field);
        if timestamp == Selector::Unset {
            return Err(ConfigError::Missing {
                setting: "timestamp_field",
            });
        }
        Ok(RecordExtractor {
            instance: formatter.selector(&parsing.instance_field),
            device: formatter.selector(&parsing.device_field),
            timestamp,
            timestamp_setting: parsing.timestamp_field.join(","),
            data_fields: parsing
                .data_fields
                .iter()
                .filter(|f| !f.trim().is_empty())
                .map(|f| formatter.field_spec(f))
                .collect(),
            formatter,
            filter,
            timestamps,
            default_instance: default_instance.into(),
        })
    }

    /// Extracts zero or more records from one message.
    ///
    /// A filtered message yields an empty vector. A message for which no timestamp can be
    /// found or parsed is an error; the caller drops it.
    pub fn extract(&self, mut msg: Value) -> Result<Vec<ExtractedRecord>, ExtractError> {
        let verdict = self.filter.check(&msg);
        if !verdict.passed() {
            debug!("message rejected by filter: {:?}", verdict);
            return Ok(Vec::new());
        }

        let instance = self
            .formatter
            .resolve_single(&mut msg, &self.instance, &self.default_instance, false, true)?
            .to_text();
        let device = self
            .formatter
            .resolve_single(&mut msg, &self.device, "", false, true)?
            .to_text();
        let device = (!device.is_empty()).then_some(device);

        let raw_timestamps = self.resolve_timestamps(&mut msg)?;
        if raw_timestamps.is_empty() {
            return Err(ExtractError::Timestamp {
                field: self.timestamp_setting.clone(),
            });
        }

        // identical timestamp strings share one slot
        let mut slots: Vec<(String, BTreeMap<String, String>)> = Vec::new();
        let mut index: HashMap<String, usize, FnvBuildHasher> =
            HashMap::with_capacity_and_hasher(raw_timestamps.len(), FnvBuildHasher::default());
        let mut slot_of = Vec::with_capacity(raw_timestamps.len());
        for raw in raw_timestamps {
            let slot = *index.entry(raw).or_insert_with_key(|raw| {
                slots.push((raw.clone(), BTreeMap::new()));
                slots.len() - 1
            });
            slot_of.push(slot);
        }

        let specs = self.data_specs(&msg);
        for spec in specs.iter().rev() {
            let (name, value) = self.formatter.resolve_field_spec(&mut msg, spec)?;
            if name.is_empty() {
                continue;
            }
            match value {
                Resolved::Empty => {}
                Resolved::Scalar(v) => insert_value(&mut slots[slot_of[0]].1, name, v),
                Resolved::List(values) => {
                    for (slot, v) in slot_of.iter().zip(values) {
                        insert_value(&mut slots[*slot].1, name.clone(), v);
                    }
                }
                Resolved::Map(map) => flatten_into(&mut slots[slot_of[0]].1, &name, &map),
            }
        }

        let mut records = Vec::with_capacity(slots.len());
        let mut parsed_any = false;
        for (raw, fields) in slots {
            let Some(timestamp_ms) = self.timestamps.parse(&raw) else {
                debug!("skipping unparseable timestamp '{}'", raw);
                continue;
            };
            parsed_any = true;
            if fields.is_empty() {
                debug!("no data fields for {} at {}", instance, timestamp_ms);
                continue;
            }
            records.push(ExtractedRecord {
                timestamp_ms,
                instance: instance.clone(),
                device: device.clone(),
                fields,
            });
        }

        if !parsed_any {
            return Err(ExtractError::Timestamp {
                field: self.timestamp_setting.clone(),
            });
        }
        Ok(records)
    }

    fn resolve_timestamps(&self, msg: &mut Value) -> Result<Vec<String>, ExtractError> {
        let resolved = match self
            .formatter
            .resolve_single(msg, &self.timestamp, "", false, true)
        {
            Ok(resolved) => resolved,
            Err(ResolveError::AmbiguousCollection { path }) => {
                debug!("timestamp list found at '{}', fanning out", path);
                self.formatter
                    .resolve_single(msg, &self.timestamp, "", true, true)?
            }
        };
        Ok(match resolved {
            Resolved::Empty => Vec::new(),
            Resolved::Scalar(s) => vec![s],
            Resolved::List(list) => list,
            Resolved::Map(map) => vec![Value::Object(map).to_string()],
        })
    }

    /// Configured data fields, or every remaining top-level key.
    fn data_specs<'a>(&'a self, msg: &Value) -> Cow<'a, [FieldSpec]> {
        if !self.data_fields.is_empty() {
            return Cow::Borrowed(&self.data_fields);
        }
        match msg {
            Value::Object(map) => Cow::Owned(
                map.keys()
                    .map(|k| FieldSpec::Path(FieldPath::key(k)))
                    .collect(),
            ),
            _ => Cow::Owned(Vec::new()),
        }
    }
}

fn is_null_text(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("null")
}

fn insert_value(fields: &mut BTreeMap<String, String>, name: String, value: String) {
    if !is_null_text(&value) {
        fields.insert(name, value);
    }
}

fn flatten_into(fields: &mut BTreeMap<String, String>, prefix: &str, map: &Map<String, Value>) {
    for (key, value) in map {
        let name = format!("{prefix}.{key}");
        match value {
            Value::Object(child) => flatten_into(fields, &name, child),
            Value::Null => {}
            Value::String(s) => insert_value(fields, name, s.clone()),
            other => insert_value(fields, name, other.to_string()),
        }
    }
}
