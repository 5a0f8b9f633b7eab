//! Append-only record of what a run did.
//!
//! Each protocol milestone appends an [`AuditRecord`]. Records never carry
//! key material, only labels, paths and sizes. Sinks receive a copy of every
//! record for persistence to a file or elsewhere.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::wrap::WrapPath;

/// Destination for a copy of every audit record of a run.
pub trait AuditSink: Send {
    /// Append a record. Called for every milestone.
    fn append(&mut self, record: AuditRecord);
}

/// The milestone being recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Session opened and user logged in.
    SessionOpened { module: String },
    /// The intermediate key was wrapped under the recipient key.
    IntermediateWrapped { path: WrapPath },
    /// A token-resident user key pair was created.
    KeyPairCreated { label: String },
    /// A wrapped blob was written.
    BlobPersisted { path: PathBuf, bytes: usize },
    /// The intermediate key was destroyed and the module released.
    CleanupCompleted,
}

/// A permanent record of one milestone.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    #[serde(flatten)]
    pub event: AuditEvent,
    /// When the milestone was reached.
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn now(event: AuditEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }
}

/// In-memory milestones of one run, plus any forward sinks.
#[derive(Default)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every record.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Store `record` and hand a copy to every forward sink.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        self.records.push(record);
    }

    /// Shorthand for appending an event stamped with the current time.
    pub fn record(&mut self, event: AuditEvent) {
        self.append(AuditRecord::now(event));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }
}

/// JSON-lines audit file, one record per line.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open `path` for appending, creating it if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(e) = writeln!(self.file, "{line}").and_then(|_| self.file.flush()) {
                    tracing::warn!(error = %e, "failed to write audit record");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialise audit record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serialises_flat() {
        let record = AuditRecord::now(AuditEvent::BlobPersisted {
            path: PathBuf::from("out/private.b64"),
            bytes: 1224,
        });
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "blob_persisted");
        assert_eq!(json["path"], "out/private.b64");
        assert_eq!(json["bytes"], 1224);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut log = AuditLog::new();
        log.add_forward_sink(Box::new(FileAuditSink::new(&path).unwrap()));

        log.record(AuditEvent::SessionOpened {
            module: "SoftHSM".into(),
        });
        log.record(AuditEvent::CleanupCompleted);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("session_opened"));
        assert!(lines[1].contains("cleanup_completed"));
        assert_eq!(log.len(), 2);
    }
}
