//! # Persistence Sink
//!
//! Durable append of telemetry samples, kept off the real-time path.
//!
//! The ingestion path only ever calls [`SinkHandle::submit`], which is a
//! non-blocking `try_send` into a bounded queue. A single [`SinkWorker`]
//! drains the queue, retries failed writes with exponential backoff and
//! drops a sample with an `error` diagnostic once the attempts run out.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use matrixon_common::TelemetrySample;
use metrics::counter;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{RetryConfig, SinkConfig};
use crate::IoTError;

/// Header shared with the delimited-text export
pub const CSV_HEADER: [&str; 4] = ["Timestamp", "Device", "Pin", "Value"];

/// Durable sample store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn append(&self, sample: &TelemetrySample) -> Result<(), IoTError>;
}

// =============================================================================
// CSV file sink
// =============================================================================

/// Append-only `Timestamp,Device,Pin,Value` file
#[derive(Debug)]
pub struct CsvFileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl CsvFileSink {
    /// Open for append, writing the header when the file is new or empty
    #[instrument(level = "debug")]
    pub async fn open(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self, IoTError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;

        if file.metadata().await?.len() == 0 {
            file.write_all(&encode_row(&CSV_HEADER)?).await?;
            file.flush().await?;
            info!("🔧 Created sample log {}", path.display());
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_row(fields: &[&str]) -> Result<Vec<u8>, IoTError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(fields)?;
    writer.into_inner().map_err(|err| IoTError::Persistence {
        message: err.to_string(),
    })
}

#[async_trait]
impl PersistenceSink for CsvFileSink {
    async fn append(&self, sample: &TelemetrySample) -> Result<(), IoTError> {
        let timestamp = sample.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        let device = sample.device_id.to_string();
        let channel = sample.channel.to_string();
        let value = sample.value.to_string();
        let row = encode_row(&[&timestamp, &device, &channel, &value])?;

        let mut file = self.file.lock().await;
        file.write_all(&row).await?;
        file.flush().await?;
        Ok(())
    }
}

// =============================================================================
// In-process sinks
// =============================================================================

/// Keeps every sample in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: parking_lot::Mutex<Vec<TelemetrySample>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<TelemetrySample> {
        self.samples.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn append(&self, sample: &TelemetrySample) -> Result<(), IoTError> {
        self.samples.lock().push(sample.clone());
        Ok(())
    }
}

/// Accepts and forgets every sample
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl PersistenceSink for DiscardSink {
    async fn append(&self, _sample: &TelemetrySample) -> Result<(), IoTError> {
        Ok(())
    }
}

// =============================================================================
// Sink worker
// =============================================================================

/// Producer side of the persistence queue
#[derive(Debug, Clone)]
pub struct SinkHandle {
    sender: mpsc::Sender<TelemetrySample>,
}

impl SinkHandle {
    /// Queue a sample without waiting; returns `false` when it was dropped
    pub fn submit(&self, sample: TelemetrySample) -> bool {
        match self.sender.try_send(sample) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(sample)) => {
                warn!(
                    "⚠️ Persistence queue full, dropping {} sample of device {}",
                    sample.channel, sample.device_id
                );
                counter!("matrixon_persistence_dropped_total", 1, "reason" => "queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(sample)) => {
                error!(
                    "❌ Persistence worker stopped, dropping {} sample of device {}",
                    sample.channel, sample.device_id
                );
                counter!("matrixon_persistence_dropped_total", 1, "reason" => "closed");
                false
            }
        }
    }
}

/// Consumer side of the persistence queue
pub struct SinkWorker {
    receiver: mpsc::Receiver<TelemetrySample>,
    sink: Arc<dyn PersistenceSink>,
    retry: RetryConfig,
}

impl std::fmt::Debug for SinkWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkWorker")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl SinkWorker {
    pub fn new(sink: Arc<dyn PersistenceSink>, config: &SinkConfig) -> (SinkHandle, SinkWorker) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        (
            SinkHandle { sender },
            SinkWorker {
                receiver,
                sink,
                retry: config.retry.clone(),
            },
        )
    }

    /// Run until `shutdown` resolves or every handle is dropped, then drain the queue
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        info!("🚀 Persistence worker started");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                sample = self.receiver.recv() => match sample {
                    Some(sample) => self.persist(sample).await,
                    None => break,
                },
                _ = &mut shutdown => {
                    self.receiver.close();
                    let mut drained = 0usize;
                    while let Some(sample) = self.receiver.recv().await {
                        self.persist(sample).await;
                        drained += 1;
                    }
                    info!("🛑 Persistence worker drained {} queued samples", drained);
                    break;
                }
            }
        }

        info!("✅ Persistence worker stopped");
    }

    pub fn spawn(self, shutdown: impl Future<Output = ()> + Send + 'static) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn persist(&self, sample: TelemetrySample) {
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.sink.append(&sample).await {
                Ok(()) => {
                    debug!("💾 Persisted {} = {} for device {}", sample.channel, sample.value, sample.device_id);
                    counter!("matrixon_samples_persisted_total", 1);
                    return;
                }
                Err(err) if attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "⚠️ Persistence attempt {}/{} failed for device {}: {} (retrying in {:?})",
                        attempt, max_attempts, sample.device_id, err, delay
                    );
                    counter!("matrixon_persistence_retries_total", 1);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        "❌ Dropping {} sample of device {} after {} attempts: {}",
                        sample.channel, sample.device_id, max_attempts, err
                    );
                    counter!("matrixon_persistence_dropped_total", 1, "reason" => "retries_exhausted");
                }
            }
        }
    }
}
