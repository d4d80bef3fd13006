// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires a [`Source`] to the collector.
//!
//! One ingest task reads the source, numbers each payload and hands it round-robin to
//! `workers` worker tasks that decode and extract in parallel. A single joiner task puts
//! the extracted records back in ingest order and either joins them in the shared buffer
//! or emits them directly, so merges for one key always follow arrival order. A sweeper
//! releases stale and expired join entries on an interval, and a single sender task owns
//! the batcher and the delivery client.
//!
//! Shutdown cascades: ingest stops on cancellation or source exhaustion, workers drain
//! their queues, the joiner applies what they produced, the sweeper empties the join
//! buffer and the sender delivers what is left. A fatal delivery error cancels ingest
//! and is returned from [`Pipeline::run`].

use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{Batcher, ChunkLimit, OutgoingBatch, OutgoingRow};
use crate::config::Config;
use crate::decoder::Decoder;
use crate::delivery::{DeliveryClient, DeliverySettings, Transport};
use crate::errors::{ConfigError, DeliveryError, PipelineError};
use crate::extractor::{ExtractedRecord, RecordExtractor};
use crate::join_buffer::{InsertOutcome, JoinBuffer, JoinSettings, Released, SharedJoinBuffer};
use crate::source::Source;
use crate::util::{get_hostname, short_hostname};

/// Counters returned once the pipeline has stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub messages: u64,
    pub rows: u64,
    pub batches: u64,
}

pub struct Pipeline {
    decoder: Decoder,
    extractor: RecordExtractor,
    join: Option<JoinSettings>,
    client: DeliveryClient,
    chunk_limit: ChunkLimit,
    max_bytes: usize,
    workers: usize,
    capacity: usize,
    read_timeout: Duration,
    sweep_interval: Duration,
}

impl Pipeline {
    /// Compiles `config` into a runnable pipeline delivering through `transport`.
    ///
    /// The short hostname is both the default instance and the envelope's instance name.
    pub fn from_config(
        config: &Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        let hostname = get_hostname();
        let instance_name = short_hostname(&hostname).to_string();

        let decoder = config.parsing.decoder()?;
        let extractor = RecordExtractor::from_config(&config.parsing, instance_name.clone())?;
        let join = config.join.enabled().then(|| JoinSettings {
            required_fields: config.join.required_fields.iter().cloned().collect(),
            bucket_ms: config.join.bucket_ms,
            wait: config.join.wait(),
            expiry_ms: config.join.expiry_ms(),
        });

        let chunk_limit = ChunkLimit::new(config.collector.chunk_lines);
        let settings = DeliverySettings::from_config(&config.collector, instance_name)?;
        let client = DeliveryClient::new(settings, transport, chunk_limit.clone());

        Ok(Pipeline {
            decoder,
            extractor,
            join,
            client,
            chunk_limit,
            max_bytes: config.collector.chunk_size_bytes(),
            workers: config.runtime.workers.max(1),
            capacity: config.runtime.channel_capacity.max(1),
            read_timeout: config.runtime.read_timeout(),
            sweep_interval: config.join.sweep_interval(),
        })
    }

    /// Runs until `source` is exhausted, `cancel` fires, or delivery fails fatally.
    pub async fn run<S>(
        self,
        source: S,
        cancel: CancellationToken,
    ) -> Result<PipelineStats, PipelineError>
    where
        S: Source + 'static,
    {
        let stop = cancel.child_token();
        let (row_tx, row_rx) = mpsc::channel::<OutgoingRow>(self.capacity);
        let buffer = self.join.map(JoinBuffer::shared);

        let processor = Arc::new(Processor {
            decoder: self.decoder,
            extractor: self.extractor,
        });

        let (extracted_tx, extracted_rx) = mpsc::channel::<Extracted>(self.capacity);
        let mut worker_txs = Vec::with_capacity(self.workers);
        let mut worker_handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let (tx, rx) = mpsc::channel::<(u64, Vec<u8>)>(self.capacity);
            worker_txs.push(tx);
            worker_handles.push(tokio::spawn(run_worker(
                id,
                rx,
                Arc::clone(&processor),
                extracted_tx.clone(),
            )));
        }
        drop(extracted_tx);
        let joiner = tokio::spawn(run_joiner(extracted_rx, buffer.clone(), row_tx.clone()));

        let drain = CancellationToken::new();
        let sweeper = buffer.map(|buffer| {
            tokio::spawn(run_sweeper(
                buffer,
                self.sweep_interval,
                row_tx.clone(),
                drain.clone(),
            ))
        });
        drop(row_tx);

        let batcher = Batcher::new(self.chunk_limit, self.max_bytes);
        let sender = tokio::spawn(run_sender(
            self.client,
            batcher,
            row_rx,
            self.read_timeout,
            stop.clone(),
        ));

        let ingest = tokio::spawn(run_ingest(source, worker_txs, stop));

        let messages = ingest.await?;
        for handle in worker_handles {
            handle.await?;
        }
        joiner.await?;
        drain.cancel();
        if let Some(sweeper) = sweeper {
            sweeper.await?;
        }
        let (rows, batches) = sender.await??;

        info!(
            "Pipeline stopped: {} messages, {} rows, {} batches",
            messages, rows, batches
        );
        Ok(PipelineStats {
            messages,
            rows,
            batches,
        })
    }
}

struct Processor {
    decoder: Decoder,
    extractor: RecordExtractor,
}

impl Processor {
    /// Turns one payload into zero or more records. Per-message failures are logged and
    /// dropped.
    fn extract(&self, payload: &[u8]) -> Vec<ExtractedRecord> {
        let messages = match self.decoder.decode(payload) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Failed to decode message: {}", e);
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for msg in messages {
            match self.extractor.extract(msg) {
                Ok(extracted) => records.extend(extracted),
                Err(e) => warn!("Dropping message: {}", e),
            }
        }
        records
    }
}

/// Records extracted from the payload ingested as number `seq`.
#[derive(Debug)]
struct Extracted {
    seq: u64,
    records: Vec<ExtractedRecord>,
}

#[allow(clippy::expect_used)]
fn lock(buffer: &SharedJoinBuffer) -> MutexGuard<'_, JoinBuffer> {
    buffer.lock().expect("lock poisoned")
}

async fn run_ingest<S>(
    mut source: S,
    workers: Vec<mpsc::Sender<(u64, Vec<u8>)>>,
    stop: CancellationToken,
) -> u64
where
    S: Source,
{
    let mut messages = 0u64;
    let mut next = 0usize;
    loop {
        let payload = tokio::select! {
            () = stop.cancelled() => {
                debug!("Ingest cancelled");
                break;
            }
            payload = source.next_message() => payload,
        };
        let Some(payload) = payload else {
            debug!("Source exhausted");
            break;
        };
        let seq = messages;
        messages += 1;
        let worker = &workers[next % workers.len()];
        next = next.wrapping_add(1);
        if worker.send((seq, payload)).await.is_err() {
            warn!("Worker queue closed, stopping ingest");
            break;
        }
    }
    messages
}

async fn run_worker(
    id: usize,
    mut payloads: mpsc::Receiver<(u64, Vec<u8>)>,
    processor: Arc<Processor>,
    extracted: mpsc::Sender<Extracted>,
) {
    while let Some((seq, payload)) = payloads.recv().await {
        let records = processor.extract(&payload);
        if extracted.send(Extracted { seq, records }).await.is_err() {
            debug!("Worker {} stopping, joiner is gone", id);
            return;
        }
    }
    debug!("Worker {} drained", id);
}

/// Applies extracted records in ingest order, whichever worker finished first.
async fn run_joiner(
    mut extracted: mpsc::Receiver<Extracted>,
    buffer: Option<SharedJoinBuffer>,
    rows: mpsc::Sender<OutgoingRow>,
) {
    let mut pending: BTreeMap<u64, Vec<ExtractedRecord>> = BTreeMap::new();
    let mut next = 0u64;
    while let Some(Extracted { seq, records }) = extracted.recv().await {
        pending.insert(seq, records);
        while let Some(records) = pending.remove(&next) {
            next += 1;
            if !emit(join(records, buffer.as_ref()), &rows).await {
                return;
            }
        }
    }
    // only left over when a worker stopped early
    for records in pending.into_values() {
        if !emit(join(records, buffer.as_ref()), &rows).await {
            return;
        }
    }
    debug!("Joiner drained");
}

fn join(records: Vec<ExtractedRecord>, buffer: Option<&SharedJoinBuffer>) -> Vec<OutgoingRow> {
    let Some(buffer) = buffer else {
        return records.iter().map(OutgoingRow::from_record).collect();
    };
    let now = Instant::now().into_std();
    let mut buffer = lock(buffer);
    records
        .into_iter()
        .filter_map(|record| match buffer.insert(record, now) {
            InsertOutcome::Released(released) => Some(OutgoingRow::from_released(&released)),
            InsertOutcome::Pending | InsertOutcome::Late => None,
        })
        .collect()
}

async fn emit(out: Vec<OutgoingRow>, rows: &mpsc::Sender<OutgoingRow>) -> bool {
    for row in out {
        if rows.send(row).await.is_err() {
            debug!("Joiner stopping, sender is gone");
            return false;
        }
    }
    true
}

async fn run_sweeper(
    buffer: SharedJoinBuffer,
    period: Duration,
    rows: mpsc::Sender<OutgoingRow>,
    drain: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let released = lock(&buffer).sweep(Instant::now().into_std());
                forward(&rows, released).await;
            }
            () = drain.cancelled() => {
                let released = lock(&buffer).drain();
                debug!("Join sweeper shutting down, releasing {} entries", released.len());
                forward(&rows, released).await;
                break;
            }
        }
    }
}

async fn forward(rows: &mpsc::Sender<OutgoingRow>, released: Vec<Released>) {
    for entry in released {
        if rows.send(OutgoingRow::from_released(&entry)).await.is_err() {
            debug!("Dropping released entry {}, sender is gone", entry.key);
        }
    }
}

/// Returns `(rows, batches)` delivered.
async fn run_sender(
    client: DeliveryClient,
    mut batcher: Batcher,
    mut rows: mpsc::Receiver<OutgoingRow>,
    read_timeout: Duration,
    stop: CancellationToken,
) -> Result<(u64, u64), DeliveryError> {
    let mut row_count = 0u64;
    let mut batches = 0u64;
    loop {
        let full = match timeout(read_timeout, rows.recv()).await {
            Ok(Some(row)) => {
                row_count += 1;
                batcher.push(row)
            }
            Ok(None) => {
                if let Some(batch) = batcher.flush() {
                    batches += u64::from(send(&client, &batch, &stop).await?);
                }
                return Ok((row_count, batches));
            }
            Err(_) => {
                if !batcher.is_empty() {
                    debug!("No rows for {:?}, flushing", read_timeout);
                }
                batcher.flush()
            }
        };
        if let Some(batch) = full {
            batches += u64::from(send(&client, &batch, &stop).await?);
        }
    }
}

/// Delivers one batch. A fatal error stops ingest; any other error drops the batch.
async fn send(
    client: &DeliveryClient,
    batch: &OutgoingBatch,
    stop: &CancellationToken,
) -> Result<bool, DeliveryError> {
    match client.deliver(batch).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_fatal() => {
            error!("Stopping pipeline: {}", e);
            stop.cancel();
            Err(e)
        }
        Err(e) => {
            warn!("Dropping batch of {} rows: {}", batch.len(), e);
            Ok(false)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::delivery::tests::RecordingTransport;
    use crate::source::{ChannelSource, LineSource};
    use serde_json::{json, Value};

    fn config(extra: &str) -> Config {
        Config::from_json(&format!(
            r#"{{
                "collector": {{
                    "user_name": "alice",
                    "license_key": "abc123",
                    "project_name": "web",
                    "sampling_interval": "10s"
                }},
                {extra}
            }}"#
        ))
        .unwrap()
    }

    fn join_config() -> Config {
        config(
            r#""parsing": {"instance_field": "host", "data_fields": "a,b"},
               "join": {"required_fields": "a,b"}"#,
        )
    }

    fn delivered_rows(transport: &RecordingTransport) -> Vec<Value> {
        transport
            .received
            .lock()
            .unwrap()
            .iter()
            .flat_map(|e| serde_json::from_str::<Vec<Value>>(&e.metric_data).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_rows_pass_straight_through_without_join() {
        let transport = RecordingTransport::scripted(vec![]);
        let config = config(r#""parsing": {"instance_field": "host"}"#);
        let pipeline = Pipeline::from_config(&config, transport.clone()).unwrap();
        let input: &[u8] = b"{\"host\": \"web_1\", \"timestamp\": 1704067200000, \"cpu\": 3}\n\
            not json\n\
            {\"host\": \"web_2\", \"timestamp\": 1704067200000, \"cpu\": 4}\n";

        let stats = pipeline
            .run(LineSource::new(input), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            stats,
            PipelineStats {
                messages: 3,
                rows: 2,
                batches: 1
            }
        );
        assert_eq!(
            delivered_rows(&transport),
            vec![
                json!({"timestamp": "1704067200000", "cpu[web.1]": "3"}),
                json!({"timestamp": "1704067200000", "cpu[web.2]": "4"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_partial_updates_are_joined() {
        let transport = RecordingTransport::scripted(vec![]);
        let pipeline = Pipeline::from_config(&join_config(), transport.clone()).unwrap();
        let input: &[u8] = b"{\"host\": \"svc1\", \"timestamp\": 1704067200000, \"a\": 5}\n\
            {\"host\": \"svc1\", \"timestamp\": 1704067200000, \"b\": 1.5}\n";

        let stats = pipeline
            .run(LineSource::new(input), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.rows, 1);
        assert_eq!(
            delivered_rows(&transport),
            vec![json!({"timestamp": "1704067200000", "a[svc1]": "5", "b[svc1]": "1.5"})]
        );
    }

    #[tokio::test]
    async fn test_merges_follow_arrival_order_across_workers() {
        let transport = RecordingTransport::scripted(vec![]);
        let mut config = join_config();
        config.runtime.workers = 4;
        let pipeline = Pipeline::from_config(&config, transport.clone()).unwrap();
        let mut input = String::new();
        for a in 0..50 {
            input.push_str(&format!(
                "{{\"host\": \"svc1\", \"timestamp\": 1704067200000, \"a\": {a}}}\n"
            ));
        }
        input.push_str("{\"host\": \"svc1\", \"timestamp\": 1704067200000, \"b\": 1}\n");

        let stats = pipeline
            .run(LineSource::new(std::io::Cursor::new(input.into_bytes())), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.messages, 51);
        assert_eq!(
            delivered_rows(&transport),
            vec![json!({"timestamp": "1704067200000", "a[svc1]": "49", "b[svc1]": "1"})]
        );
    }

    fn extracted(seq: u64, cpu: &str) -> Extracted {
        Extracted {
            seq,
            records: vec![ExtractedRecord {
                timestamp_ms: 1_704_067_200_000,
                instance: "web".to_string(),
                device: None,
                fields: [("cpu".to_string(), cpu.to_string())].into_iter().collect(),
            }],
        }
    }

    #[tokio::test]
    async fn test_joiner_reorders_by_ingest_sequence() {
        let (tx, rx) = mpsc::channel(8);
        let (row_tx, mut row_rx) = mpsc::channel(8);
        tx.send(extracted(2, "3")).await.unwrap();
        tx.send(extracted(0, "1")).await.unwrap();
        tx.send(extracted(1, "2")).await.unwrap();
        drop(tx);

        run_joiner(rx, None, row_tx).await;

        let mut values = Vec::new();
        while let Some(row) = row_rx.recv().await {
            values.push(row.values["cpu[web]"].clone());
        }
        assert_eq!(values, vec![json!("1"), json!("2"), json!("3")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_is_delivered_while_running() {
        let transport = RecordingTransport::scripted(vec![]);
        let pipeline = Pipeline::from_config(&join_config(), transport.clone()).unwrap();
        let (tx, source) = ChannelSource::channel(8);
        let run = tokio::spawn(pipeline.run(source, CancellationToken::new()));

        tx.send(br#"{"host": "svc1", "timestamp": 1704067200000, "a": 5}"#.to_vec())
            .await
            .unwrap();
        while transport.calls() == 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(
            delivered_rows(&transport),
            vec![json!({"timestamp": "1704067200000", "a[svc1]": "5"})]
        );

        drop(tx);
        let stats = run.await.unwrap().unwrap();
        assert_eq!(stats.rows, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_pending_entries() {
        let transport = RecordingTransport::scripted(vec![]);
        let pipeline = Pipeline::from_config(&join_config(), transport.clone()).unwrap();
        let (tx, source) = ChannelSource::channel(8);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(pipeline.run(source, cancel.clone()));

        tx.send(br#"{"host": "svc1", "timestamp": 1704067200000, "b": 2}"#.to_vec())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let stats = run.await.unwrap().unwrap();
        assert_eq!(stats.messages, 1);
        assert_eq!(
            delivered_rows(&transport),
            vec![json!({"timestamp": "1704067200000", "b[svc1]": "2"})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_stop_the_pipeline() {
        let transport = RecordingTransport::scripted(vec![Ok(500), Ok(500), Ok(500)]);
        let mut config = config(r#""parsing": {"instance_field": "host"}"#);
        config.collector.chunk_lines = 1;
        let pipeline = Pipeline::from_config(&config, transport.clone()).unwrap();
        let (tx, source) = ChannelSource::channel(8);

        tx.send(br#"{"host": "web", "timestamp": 1704067200000, "cpu": 1}"#.to_vec())
            .await
            .unwrap();
        let err = pipeline
            .run(source, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Delivery(DeliveryError::RetriesExhausted { attempts: 3 })
        ));
        assert_eq!(transport.calls(), 3);
        drop(tx);
    }
}
