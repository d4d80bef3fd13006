// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Windowed join of partial records.
//!
//! Producers observe different fields of the same (instance, timestamp) at different
//! times. The buffer merges those observations into one entry per [`JoinKey`] and
//! releases the entry exactly once:
//!
//! - **complete**: as soon as every required field has been seen, from inside
//!   [`JoinBuffer::insert`];
//! - **stale**: when no update arrived for `wait`, on the next [`JoinBuffer::sweep`];
//! - **expired**: when its bucket falls more than `expiry` behind the newest timestamp
//!   seen so far, on the next sweep;
//! - **shutdown**: when [`JoinBuffer::drain`] empties the buffer.
//!
//! Staleness is measured on the monotonic clock from the last arrival. Expiry is measured
//! in message time, so a replay of old data expires relative to itself.
//!
//! Entries are indexed three ways so that each eviction costs `O(log n)`:
//! the key map, an arrival-ordered set, and a bucket-ordered set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use derive_more::Display;
use fnv::FnvBuildHasher;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use tracing::debug;

use crate::extractor::ExtractedRecord;
use crate::util::make_safe_instance_string;

pub type SharedJoinBuffer = Arc<Mutex<JoinBuffer>>;

/// Identifies one joined record. The instance already carries the device prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("{instance}@{bucket}")]
pub struct JoinKey {
    pub instance: String,
    pub bucket: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Complete,
    Stale,
    Expired,
    Shutdown,
}

/// An entry that left the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub key: JoinKey,
    pub fields: BTreeMap<String, String>,
    pub reason: ReleaseReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Merged; still waiting for more fields.
    Pending,
    /// The update completed the entry.
    Released(Released),
    /// Older than the expiry horizon; dropped.
    Late,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSettings {
    pub required_fields: BTreeSet<String>,
    /// Timestamps are truncated to this width. `0` keeps the exact millisecond.
    pub bucket_ms: i64,
    pub wait: Duration,
    pub expiry_ms: i64,
}

impl Default for JoinSettings {
    fn default() -> Self {
        Self {
            required_fields: BTreeSet::new(),
            bucket_ms: 0,
            wait: Duration::from_secs(60),
            expiry_ms: 600_000,
        }
    }
}

#[derive(Debug)]
struct PartialEntry {
    fields: BTreeMap<String, String>,
    last_arrival: Instant,
    seq: u64,
}

#[derive(Debug)]
pub struct JoinBuffer {
    settings: JoinSettings,
    entries: HashMap<JoinKey, PartialEntry, FnvBuildHasher>,
    by_arrival: BTreeSet<(Instant, u64, JoinKey)>,
    by_bucket: BTreeSet<(i64, JoinKey)>,
    max_timestamp: Option<i64>,
    next_seq: u64,
}

impl JoinBuffer {
    #[must_use]
    pub fn new(settings: JoinSettings) -> Self {
        JoinBuffer {
            settings,
            entries: HashMap::with_hasher(FnvBuildHasher::default()),
            by_arrival: BTreeSet::new(),
            by_bucket: BTreeSet::new(),
            max_timestamp: None,
            next_seq: 0,
        }
    }

    #[must_use]
    pub fn shared(settings: JoinSettings) -> SharedJoinBuffer {
        Arc::new(Mutex::new(Self::new(settings)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &JoinKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn key_for(&self, record: &ExtractedRecord) -> JoinKey {
        let bucket = if self.settings.bucket_ms > 0 {
            record.timestamp_ms.div_euclid(self.settings.bucket_ms) * self.settings.bucket_ms
        } else {
            record.timestamp_ms
        };
        JoinKey {
            instance: make_safe_instance_string(&record.instance, record.device.as_deref()),
            bucket,
        }
    }

    fn horizon(&self) -> Option<i64> {
        self.max_timestamp
            .map(|max| max.saturating_sub(self.settings.expiry_ms))
    }

    /// Merges `record` into its entry. Later values overwrite earlier ones for the same field.
    pub fn insert(&mut self, record: ExtractedRecord, now: Instant) -> InsertOutcome {
        self.max_timestamp = Some(
            self.max_timestamp
                .map_or(record.timestamp_ms, |max| max.max(record.timestamp_ms)),
        );
        if self.horizon().is_some_and(|h| record.timestamp_ms < h) {
            debug!(
                "dropping late update for {} at {}",
                record.instance, record.timestamp_ms
            );
            return InsertOutcome::Late;
        }

        let key = self.key_for(&record);
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                self.by_arrival
                    .remove(&(entry.last_arrival, entry.seq, key.clone()));
                entry.fields.extend(record.fields);
                entry.last_arrival = now;
                entry.seq = seq;
                entry
            }
            Entry::Vacant(vacant) => {
                self.by_bucket.insert((key.bucket, key.clone()));
                vacant.insert(PartialEntry {
                    fields: record.fields,
                    last_arrival: now,
                    seq,
                })
            }
        };

        let complete = self
            .settings
            .required_fields
            .iter()
            .all(|f| entry.fields.contains_key(f));
        if complete {
            debug!("collected all fields for {}", key);
            self.by_bucket.remove(&(key.bucket, key.clone()));
            if let Some(entry) = self.entries.remove(&key) {
                return InsertOutcome::Released(Released {
                    key,
                    fields: entry.fields,
                    reason: ReleaseReason::Complete,
                });
            }
            return InsertOutcome::Pending;
        }

        self.by_arrival.insert((now, seq, key));
        InsertOutcome::Pending
    }

    /// Releases stale entries, then entries behind the expiry horizon.
    pub fn sweep(&mut self, now: Instant) -> Vec<Released> {
        let mut released = Vec::new();

        while let Some((arrival, _, _)) = self.by_arrival.first() {
            if now.saturating_duration_since(*arrival) < self.settings.wait {
                break;
            }
            let Some((_, _, key)) = self.by_arrival.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.by_bucket.remove(&(key.bucket, key.clone()));
                debug!("releasing stale entry {}", key);
                released.push(Released {
                    key,
                    fields: entry.fields,
                    reason: ReleaseReason::Stale,
                });
            }
        }

        if let Some(horizon) = self.horizon() {
            while let Some((bucket, _)) = self.by_bucket.first() {
                if *bucket >= horizon {
                    break;
                }
                let Some((_, key)) = self.by_bucket.pop_first() else {
                    break;
                };
                if let Some(entry) = self.entries.remove(&key) {
                    self.by_arrival
                        .remove(&(entry.last_arrival, entry.seq, key.clone()));
                    debug!("releasing expired entry {}", key);
                    released.push(Released {
                        key,
                        fields: entry.fields,
                        reason: ReleaseReason::Expired,
                    });
                }
            }
        }

        released
    }

    /// Empties the buffer in arrival order.
    pub fn drain(&mut self) -> Vec<Released> {
        let mut released = Vec::with_capacity(self.entries.len());
        while let Some((_, _, key)) = self.by_arrival.pop_first() {
            if let Some(entry) = self.entries.remove(&key) {
                released.push(Released {
                    key,
                    fields: entry.fields,
                    reason: ReleaseReason::Shutdown,
                });
            }
        }
        self.by_bucket.clear();
        released
    }
}
