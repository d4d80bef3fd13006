// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message sources feeding the pipeline.

use std::path::Path;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Yields opaque payloads until exhausted.
#[async_trait]
pub trait Source: Send {
    async fn next_message(&mut self) -> Option<Vec<u8>>;
}

/// One payload per non-blank line of a buffered reader.
///
/// Lines are passed on as bytes; invalid text is the decoder's problem.
pub struct LineSource<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R> LineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        LineSource {
            reader,
            buf: Vec::new(),
        }
    }
}

impl LineSource<BufReader<File>> {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self::new(BufReader::new(file)))
    }
}

#[async_trait]
impl<R> Source for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_message(&mut self) -> Option<Vec<u8>> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf).await {
                Ok(0) => {
                    debug!("line source exhausted");
                    return None;
                }
                Ok(_) => {
                    while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
                        self.buf.pop();
                    }
                    if self.buf.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Some(std::mem::take(&mut self.buf));
                }
                Err(e) => {
                    warn!("failed to read from line source: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Payloads pushed by an upstream consumer, e.g. a message-queue client.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelSource {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        ChannelSource { rx }
    }

    /// Returns the sending half together with the source.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl Source for ChannelSource {
    async fn next_message(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}
