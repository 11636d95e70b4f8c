//! Best-effort secondary sink for result rows.
//!
//! Batches go over an unbounded channel to a background task that posts
//! them to a spreadsheet-style HTTP endpoint. Nothing here can fail the
//! caller: delivery problems are logged and reported on a status channel.

use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::logging;
use crate::retry::{is_retryable_status, retry_async_if, RetryConfig};

type HmacSha256 = Hmac<Sha256>;

/// Destination worksheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Sheet {
    Results,
    Questionnaires,
}

impl Sheet {
    pub fn name(&self) -> &'static str {
        match self {
            Sheet::Results => "Results",
            Sheet::Questionnaires => "Questionnaires",
        }
    }
}

/// Rows for one worksheet. The endpoint writes `header` only into an
/// empty sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowBatch {
    pub sheet: Sheet,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkStatus {
    Delivered { sheet: Sheet, rows: usize },
    Failed { sheet: Sheet, rows: usize, error: String },
    /// Breaker open; batch dropped without an attempt.
    Skipped { sheet: Sheet, rows: usize },
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("endpoint rejected batch with status {0}")]
    Rejected(u16),
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RowTransport: Send + Sync {
    async fn append_rows(&self, batch: &RowBatch) -> Result<()>;
}

/// JSON POST transport, HMAC-SHA256 signed when a secret is set.
pub struct HttpTransport {
    client: Client,
    url: String,
    secret: Option<String>,
}

impl HttpTransport {
    pub fn new(url: String, secret: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url,
            secret,
        }
    }
}

#[async_trait]
impl RowTransport for HttpTransport {
    async fn append_rows(&self, batch: &RowBatch) -> Result<()> {
        let body = serde_json::to_string(batch)?;
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            req = req.header("X-Signature", sign_body(&body, secret)?);
        }
        let resp = req
            .body(body)
            .send()
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if is_retryable_status(status.as_u16()) {
            Err(RemoteError::Unavailable(format!("status {}", status)).into())
        } else {
            Err(RemoteError::Rejected(status.as_u16()).into())
        }
    }
}

/// Hex HMAC-SHA256 of the request body.
pub fn sign_body(body: &str, secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("HMAC error: {}", e))?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn is_transient(err: &anyhow::Error) -> bool {
    !matches!(err.downcast_ref::<RemoteError>(), Some(RemoteError::Rejected(_)))
}

/// Stops attempts after repeated failures; probes again after `cooldown`
/// skipped batches.
#[derive(Debug, Clone)]
pub struct Breaker {
    failures: u32,
    threshold: u32,
    cooldown: u32,
    skipped: u32,
}

impl Breaker {
    pub fn new(threshold: u32, cooldown: u32) -> Self {
        Self {
            failures: 0,
            threshold: threshold.max(1),
            cooldown,
            skipped: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.failures >= self.threshold
    }

    /// Whether the next batch may be attempted. Counts skips while open.
    pub fn allow(&mut self) -> bool {
        if !self.is_open() {
            return true;
        }
        if self.skipped >= self.cooldown {
            self.skipped = 0;
            return true;
        }
        self.skipped += 1;
        false
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.skipped = 0;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub retry: RetryConfig,
    pub breaker_threshold: u32,
    pub breaker_cooldown: u32,
}

/// Fire-and-forget handle onto the delivery task.
#[derive(Debug)]
pub struct RemoteSink {
    tx: mpsc::UnboundedSender<RowBatch>,
}

impl RemoteSink {
    /// Queue a batch. Returns false if the worker is gone.
    pub fn submit(&self, batch: RowBatch) -> bool {
        let (sheet, rows) = (batch.sheet, batch.rows.len());
        match self.tx.send(batch) {
            Ok(()) => true,
            Err(_) => {
                logging::log_remote_failure(sheet.name(), rows, "worker stopped");
                false
            }
        }
    }
}

/// Sink plus its worker, so the owner can drain the queue on shutdown.
#[derive(Debug)]
pub struct RemoteHandle {
    pub sink: RemoteSink,
    worker: JoinHandle<()>,
}

impl RemoteHandle {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn<T>(transport: T, cfg: RemoteConfig) -> (Self, mpsc::UnboundedReceiver<SinkStatus>)
    where
        T: RowTransport + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(transport, cfg, rx, status_tx));
        (
            Self {
                sink: RemoteSink { tx },
                worker,
            },
            status_rx,
        )
    }

    /// Close the queue and wait for queued batches to finish.
    pub async fn shutdown(self) {
        drop(self.sink);
        let _ = self.worker.await;
    }
}

async fn run_worker<T: RowTransport>(
    transport: T,
    cfg: RemoteConfig,
    mut rx: mpsc::UnboundedReceiver<RowBatch>,
    status_tx: mpsc::UnboundedSender<SinkStatus>,
) {
    let mut breaker = Breaker::new(cfg.breaker_threshold, cfg.breaker_cooldown);
    while let Some(batch) = rx.recv().await {
        let (sheet, rows) = (batch.sheet, batch.rows.len());
        let status = if !breaker.allow() {
            logging::log_remote_failure(sheet.name(), rows, "breaker open, batch skipped");
            SinkStatus::Skipped { sheet, rows }
        } else {
            let op_name = format!("remote append {}", sheet.name());
            match retry_async_if(&cfg.retry, &op_name, || transport.append_rows(&batch), is_transient).await {
                Ok(()) => {
                    breaker.record_success();
                    logging::log_remote_delivered(sheet.name(), rows);
                    SinkStatus::Delivered { sheet, rows }
                }
                Err(e) => {
                    breaker.record_failure();
                    let error = e.to_string();
                    logging::log_remote_failure(sheet.name(), rows, &error);
                    SinkStatus::Failed { sheet, rows, error }
                }
            }
        };
        // Nobody listening is fine.
        let _ = status_tx.send(status);
    }
}
