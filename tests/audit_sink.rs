//! Tests for the pluggable AuditSink / forward sink functionality.

mod common;

use std::sync::{Arc, Mutex};

use byok_escrow::audit::{AuditEvent, AuditRecord, AuditSink, FileAuditSink};
use byok_escrow::boundary::WrapMechanism;
use byok_escrow::soft::SoftBoundary;
use byok_escrow::wrap::WrapPath;
use byok_escrow::{Escrow, Pin};

use common::*;

/// A test sink that collects records into a shared Vec.
struct SharedVecSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl SharedVecSink {
    fn new(records: Arc<Mutex<Vec<AuditRecord>>>) -> Self {
        Self { records }
    }
}

impl AuditSink for SharedVecSink {
    fn append(&mut self, record: AuditRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[test]
fn test_forward_sink_receives_run_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut soft = SoftBoundary::new(Pin::new(PIN));
    let mut escrow = Escrow::new(config_in(&dir));

    let records = Arc::new(Mutex::new(Vec::new()));
    escrow.add_audit_sink(Box::new(SharedVecSink::new(Arc::clone(&records))));
    let outcome = escrow.run(&mut soft).unwrap();

    // Primary log and forward sink hold the same milestones.
    let collected = records.lock().unwrap();
    assert_eq!(escrow.audit_log().len(), 6);
    assert_eq!(collected.len(), 6);

    let events: Vec<&AuditEvent> = collected.iter().map(|r| &r.event).collect();
    assert_eq!(
        events[0],
        &AuditEvent::SessionOpened {
            module: "soft".into()
        }
    );
    assert_eq!(
        events[1],
        &AuditEvent::IntermediateWrapped {
            path: WrapPath::Boundary
        }
    );
    assert_eq!(
        events[2],
        &AuditEvent::KeyPairCreated {
            label: outcome.key_label.label().to_string()
        }
    );
    assert!(matches!(
        events[3],
        AuditEvent::BlobPersisted { path, .. } if *path == outcome.wrapped_intermediate_path
    ));
    assert!(matches!(
        events[4],
        AuditEvent::BlobPersisted { path, .. } if *path == outcome.wrapped_private_key_path
    ));
    assert_eq!(events[5], &AuditEvent::CleanupCompleted);

    // Timestamps never go backwards.
    assert!(collected
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));
}

#[test]
fn test_failed_run_records_only_what_happened() {
    let dir = tempfile::tempdir().unwrap();
    let mut soft = SoftBoundary::new(Pin::new(PIN)).rejecting(WrapMechanism::RsaOaepSha256);
    let mut escrow = Escrow::new(config_in(&dir));

    assert!(escrow.run(&mut soft).is_err());

    let events: Vec<&AuditEvent> = escrow.audit_log().iter().map(|r| &r.event).collect();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], AuditEvent::SessionOpened { .. }));
    assert_eq!(events[1], &AuditEvent::CleanupCompleted);
}

#[test]
fn test_file_sink_gets_json_lines_without_key_material() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let mut soft = SoftBoundary::new(Pin::new(PIN));
    let mut escrow = Escrow::new(config_in(&dir));
    escrow.add_audit_sink(Box::new(FileAuditSink::new(&audit_path).unwrap()));
    let outcome = escrow.run(&mut soft).unwrap();

    let text = std::fs::read_to_string(&audit_path).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[2]["event"], "key_pair_created");
    assert_eq!(lines[2]["label"], outcome.key_label.label());

    // Neither blob's encoding appears in the audit trail.
    let wrapped = std::fs::read_to_string(&outcome.wrapped_private_key_path).unwrap();
    assert!(!text.contains(&wrapped));
}
