// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rows and chunked batches.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::extractor::ExtractedRecord;
use crate::join_buffer::Released;
use crate::util::{make_safe_instance_string, make_safe_metric_key};

pub const TIMESTAMP_KEY: &str = "timestamp";

/// One released record in collector format:
/// `{"timestamp": "<ms>", "<field>[<instance>]": "<value>", ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRow {
    pub timestamp_ms: i64,
    pub values: Map<String, Value>,
}

impl OutgoingRow {
    fn build<'a, I>(timestamp_ms: i64, instance: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut values = Map::new();
        values.insert(
            TIMESTAMP_KEY.to_string(),
            Value::String(timestamp_ms.to_string()),
        );
        for (name, value) in fields {
            values.insert(
                format!("{}[{}]", make_safe_metric_key(name), instance),
                Value::String(value.clone()),
            );
        }
        OutgoingRow {
            timestamp_ms,
            values,
        }
    }

    #[must_use]
    pub fn from_record(record: &ExtractedRecord) -> Self {
        let instance = make_safe_instance_string(&record.instance, record.device.as_deref());
        Self::build(record.timestamp_ms, &instance, &record.fields)
    }

    /// The key's instance is already safe and carries the device prefix.
    #[must_use]
    pub fn from_released(released: &Released) -> Self {
        Self::build(released.key.bucket, &released.key.instance, &released.fields)
    }

    /// Serialized size in bytes, used for chunking.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.values).map_or(0, |v| v.len())
    }
}

/// Rows delivered in one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingBatch {
    pub rows: Vec<OutgoingRow>,
    pub min_timestamp: Option<i64>,
    pub max_timestamp: Option<i64>,
}

impl OutgoingBatch {
    #[must_use]
    pub fn new(rows: Vec<OutgoingRow>) -> Self {
        let min_timestamp = rows.iter().map(|r| r.timestamp_ms).min();
        let max_timestamp = rows.iter().map(|r| r.timestamp_ms).max();
        OutgoingBatch {
            rows,
            min_timestamp,
            max_timestamp,
        }
    }

    pub fn push(&mut self, row: OutgoingRow) {
        let ts = row.timestamp_ms;
        self.min_timestamp = Some(self.min_timestamp.map_or(ts, |m| m.min(ts)));
        self.max_timestamp = Some(self.max_timestamp.map_or(ts, |m| m.max(ts)));
        self.rows.push(row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The JSON array sent as `metricData`.
    #[must_use]
    pub fn metric_data(&self) -> Value {
        Value::Array(
            self.rows
                .iter()
                .map(|r| Value::Object(r.values.clone()))
                .collect(),
        )
    }

    /// Splits into two halves; `None` when there is nothing to split.
    #[must_use]
    pub fn split(&self) -> Option<(OutgoingBatch, OutgoingBatch)> {
        if self.rows.len() < 2 {
            return None;
        }
        let mid = self.rows.len() / 2;
        Some((
            OutgoingBatch::new(self.rows[..mid].to_vec()),
            OutgoingBatch::new(self.rows[mid..].to_vec()),
        ))
    }
}

/// Row limit per chunk, shared between the batcher and the delivery client so a
/// reduction made after a rejected request applies to every later chunk.
#[derive(Debug, Clone)]
pub struct ChunkLimit(Arc<AtomicUsize>);

impl ChunkLimit {
    #[must_use]
    pub fn new(lines: usize) -> Self {
        ChunkLimit(Arc::new(AtomicUsize::new(lines.max(1))))
    }

    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    /// Halves the limit, never below one. Returns the new limit.
    pub fn halve(&self) -> usize {
        let previous = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some((n / 2).max(1)))
            .unwrap_or_else(|n| n);
        (previous / 2).max(1)
    }
}

/// Accumulates rows until a chunk fills by line count or bytes.
#[derive(Debug)]
pub struct Batcher {
    lines: ChunkLimit,
    max_bytes: usize,
    current: OutgoingBatch,
    current_bytes: usize,
}

impl Batcher {
    #[must_use]
    pub fn new(lines: ChunkLimit, max_bytes: usize) -> Self {
        Batcher {
            lines,
            max_bytes,
            current: OutgoingBatch::default(),
            current_bytes: 0,
        }
    }

    /// Adds a row. Returns the finished chunk when this row filled it, or when the row
    /// would push the current chunk past the byte limit (the row then starts a new chunk).
    pub fn push(&mut self, row: OutgoingRow) -> Option<OutgoingBatch> {
        let size = row.size_bytes();
        let mut finished = None;
        if !self.current.is_empty() && self.current_bytes + size > self.max_bytes {
            finished = self.take();
        }
        self.current_bytes += size;
        self.current.push(row);
        if finished.is_none() && self.current.len() >= self.lines.get() {
            finished = self.take();
        }
        finished
    }

    /// Returns whatever is buffered.
    pub fn flush(&mut self) -> Option<OutgoingBatch> {
        self.take()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    fn take(&mut self) -> Option<OutgoingBatch> {
        if self.current.is_empty() {
            return None;
        }
        self.current_bytes = 0;
        Some(std::mem::take(&mut self.current))
    }
}
