//! Bounded envelope history kept for audit and debugging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use uuid::Uuid;

use super::envelope::{Envelope, ENVELOPE_VERSION};
use crate::error::Result;

/// Default number of records retained in memory.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// One dispatched or transmitted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeRecord {
    pub version: u32,
    pub sender: String,
    pub target: String,
    pub session: Uuid,
    pub schema_digest: String,
    pub protocol_digest: Option<String>,
    /// JSON text of the payload
    pub payload: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl EnvelopeRecord {
    pub fn new(
        sender: impl Into<String>,
        target: impl Into<String>,
        session: Uuid,
        schema_digest: impl Into<String>,
        payload: Option<String>,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            sender: sender.into(),
            target: target.into(),
            session,
            schema_digest: schema_digest.into(),
            protocol_digest: None,
            payload,
            recorded_at: Utc::now(),
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            version: envelope.version,
            sender: envelope.sender.clone(),
            target: envelope.target.clone(),
            session: envelope.session,
            schema_digest: envelope.schema_digest.clone(),
            protocol_digest: envelope.protocol_digest.clone(),
            payload: envelope.decode_payload().ok().flatten(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_protocol_digest(mut self, digest: Option<String>) -> Self {
        self.protocol_digest = digest;
        self
    }
}

/// JSONL mirror of the history. Lines are written by a background thread;
/// dropping the guard flushes them.
#[derive(Debug)]
struct HistoryLog {
    path: PathBuf,
    writer: NonBlocking,
    _guard: WorkerGuard,
}

/// Append-only ring of records, optionally mirrored to a JSONL file.
#[derive(Debug)]
pub struct EnvelopeHistory {
    records: VecDeque<EnvelopeRecord>,
    capacity: usize,
    log: Option<HistoryLog>,
    total: u64,
}

impl EnvelopeHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity: capacity.max(1),
            log: None,
            total: 0,
        }
    }

    /// Also append every record to `path` as one JSON line. The file is
    /// opened once; writes never block the caller on disk I/O.
    pub fn with_log_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (writer, guard) = NonBlockingBuilder::default()
            .lossy(false)
            .thread_name("uagents-history")
            .finish(file);
        self.log = Some(HistoryLog {
            path,
            writer,
            _guard: guard,
        });
        Ok(self)
    }

    pub fn push(&mut self, record: EnvelopeRecord) {
        if let Some(log) = &mut self.log {
            let written = serde_json::to_string(&record)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(log.writer, "{}", line));
            if let Err(e) = written {
                tracing::warn!("Failed to append history to {}: {}", log.path.display(), e);
            }
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.total += 1;
    }

    pub fn records(&self) -> Vec<EnvelopeRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn by_session(&self, session: Uuid) -> Vec<EnvelopeRecord> {
        self.records
            .iter()
            .filter(|r| r.session == session)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records pushed since creation, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for EnvelopeHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
