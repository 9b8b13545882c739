use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const PROCESS_LOGIN: &str = "LOGIN";
pub const PROCESS_REFRESH: &str = "REFRESH";
pub const PROCESS_SECURE: &str = "SECURE";
pub const PROCESS_PROXY_REQUEST: &str = "PROXY_REQUEST";
pub const PROCESS_PROXY_RESPONSE: &str = "PROXY_RESPONSE";
pub const PROCESS_GENERATE_SIGNATURE: &str = "GENERATE_SIGNATURE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub process_name: String,
    pub client_id: String,
    pub product_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        process_name: impl Into<String>,
        client_id: impl Into<String>,
        product_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            process_name: process_name.into(),
            client_id: client_id.into(),
            product_id: product_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Destination for audit records, e.g. a tracelog table.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &AuditRecord) -> Result<()>;
}

/// Emits each record as a structured event on the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        info!(
            target: "audit",
            process = %record.process_name,
            client_id = %record.client_id,
            product_id = %record.product_id,
            at = %record.timestamp.to_rfc3339(),
            "{}",
            record.message
        );
        Ok(())
    }
}

/// Append-only JSON-lines file.
#[derive(Debug, Clone)]
pub struct FileAuditSink {
    path: PathBuf,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_vec(record).context("serializing audit record")?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(&line).await.context("appending audit record")?;
        Ok(())
    }
}

/// Writes every record to each inner sink. Fails if any of them failed, so
/// the writer can route the record to its fallback.
#[derive(Clone, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for FanoutAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.write(record).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Request-path handle to the audit queue. Recording never blocks and never fails.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditLogger {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AuditRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Create the queue and spawn its dedicated writer.
    pub fn spawn(
        capacity: usize,
        sink: Arc<dyn AuditSink>,
        fallback: FileAuditSink,
    ) -> (Self, JoinHandle<()>) {
        let (logger, rx) = Self::channel(capacity);
        let handle = tokio::spawn(run_writer(rx, sink, fallback));
        (logger, handle)
    }

    pub fn record(&self, record: AuditRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => log_dropped("audit queue full", &record),
            Err(TrySendError::Closed(record)) => log_dropped("audit writer stopped", &record),
        }
    }

    pub fn auth_success(&self, process: &str, client_id: &str, product_id: &str, message: &str) {
        self.record(AuditRecord::new(process, client_id, product_id, message));
    }

    pub fn auth_failure(&self, process: &str, client_id: Option<&str>, product_id: Option<&str>, reason: &str) {
        self.record(AuditRecord::new(
            process,
            client_id.unwrap_or(""),
            product_id.unwrap_or(""),
            format!("auth failure: {reason}"),
        ));
    }

    pub fn signature_invalid(&self, process: &str, client_id: &str, product_id: &str, cause: &str) {
        self.record(AuditRecord::new(
            process,
            client_id,
            product_id,
            format!("Invalid Signature: {cause}"),
        ));
    }

    pub fn replay_detected(&self, client_id: &str, product_id: &str, external_id: &str) {
        self.record(AuditRecord::new(
            PROCESS_LOGIN,
            client_id,
            product_id,
            format!("Replay attack detected: externalID {external_id} reused"),
        ));
    }

    pub fn internal_error(&self, process: &str, client_id: Option<&str>, product_id: Option<&str>, error_msg: &str) {
        self.record(AuditRecord::new(
            process,
            client_id.unwrap_or(""),
            product_id.unwrap_or(""),
            format!("internal error: {error_msg}"),
        ));
    }
}

fn log_dropped(reason: &str, record: &AuditRecord) {
    warn!(
        target: "audit_fallback",
        reason,
        process = %record.process_name,
        client_id = %record.client_id,
        product_id = %record.product_id,
        "{}",
        record.message
    );
}

/// Drain the queue into `sink`; records the sink rejects go to `fallback`.
pub async fn run_writer(mut rx: mpsc::Receiver<AuditRecord>, sink: Arc<dyn AuditSink>, fallback: FileAuditSink) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = sink.write(&record).await {
            warn!(error = %e, "audit sink write failed, using fallback log");
            if let Err(fe) = fallback.write(&record).await {
                error!(error = %fe, path = %fallback.path().display(), "audit fallback write failed");
                log_dropped("fallback write failed", &record);
            }
        }
    }
}
