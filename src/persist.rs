//! Base64 encoding and persistence of wrapped blobs.

use std::path::Path;

use base64::prelude::*;
use tracing::info;

use crate::audit::{AuditEvent, AuditLog};
use crate::error::{ByokError, Result};
use crate::wrap::WrappedBlob;

/// Standard-alphabet base64 with padding and no line breaks.
pub fn encode(blob: &WrappedBlob) -> String {
    BASE64_STANDARD.encode(blob.as_bytes())
}

/// Decode a file written by [`encode_and_persist`].
pub fn decode(text: &str) -> Result<WrappedBlob> {
    BASE64_STANDARD
        .decode(text.trim())
        .map(WrappedBlob::new)
        .map_err(|e| ByokError::Parse(format!("base64: {}", e)))
}

/// Write `blob` as base64 to `path`, replacing any existing content, and
/// record the write in `audit`.
pub fn encode_and_persist(path: &Path, blob: &WrappedBlob, audit: &mut AuditLog) -> Result<()> {
    let text = encode(blob);
    std::fs::write(path, &text).map_err(|e| ByokError::io(path, e))?;
    info!(path = %path.display(), bytes = blob.len(), "wrapped key written");
    audit.record(AuditEvent::BlobPersisted {
        path: path.to_path_buf(),
        bytes: blob.len(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_second_write_replaces_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapped.b64");
        let mut audit = AuditLog::new();

        encode_and_persist(&path, &WrappedBlob::new(vec![0xFF; 300]), &mut audit).unwrap();
        encode_and_persist(&path, &WrappedBlob::new(b"second".to_vec()), &mut audit).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "c2Vjb25k");
        assert_eq!(audit.len(), 2);
    }

    #[test]
    fn test_no_line_wrapping() {
        let blob = WrappedBlob::new(vec![0xA5; 512]);
        let text = encode(&blob);
        assert!(!text.contains('\n'));
        assert_eq!(decode(&text).unwrap(), blob);
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("wrapped.b64");
        let err =
            encode_and_persist(&path, &WrappedBlob::new(vec![1]), &mut AuditLog::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_confirmation_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapped.b64");
        let mut audit = AuditLog::new();
        encode_and_persist(&path, &WrappedBlob::new(vec![9; 40]), &mut audit).unwrap();

        let record = audit.iter().next().unwrap();
        assert_eq!(
            record.event,
            AuditEvent::BlobPersisted {
                path: path.clone(),
                bytes: 40
            }
        );
    }
}
