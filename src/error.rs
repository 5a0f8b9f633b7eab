//! Error types for byok-escrow.
//!
//! Every variant is a distinct failure class of the escrow protocol. Messages
//! name what failed and carry the boundary's own diagnostic, but never key
//! material.

use std::path::PathBuf;

use thiserror::Error;

use crate::escrow::Stage;

/// The single error type for all byok-escrow operations.
#[derive(Error, Debug)]
pub enum ByokError {
    /// The secure boundary rejected a module, slot, session, login,
    /// key-generation, object-creation or destroy call.
    #[error("boundary error: {0}")]
    Boundary(String),

    /// A wrap operation was rejected (unsupported mechanism, bad parameters
    /// or a key attribute mismatch).
    #[error("wrap error: {0}")]
    Wrap(String),

    /// The recipient public key was malformed or not an RSA key.
    #[error("parse error: {0}")]
    Parse(String),

    /// Reading the recipient key or writing a wrapped blob failed.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration was incomplete or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// The host-side OAEP wrap was requested without the unsafe opt-in.
    #[error("local wrap refused: unsafe_local_oaep is not enabled")]
    LocalWrapDisabled,

    /// A protocol stage failed. Wraps the underlying cause.
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<ByokError>,
    },
}

/// Coarse classification of a [`ByokError`], independent of stage wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Boundary,
    Wrap,
    Parse,
    Io,
    Config,
    LocalWrapDisabled,
}

impl ByokError {
    /// Attach the stage in which this error surfaced.
    ///
    /// An error that already names a stage keeps the innermost one.
    pub fn at(self, stage: Stage) -> Self {
        match self {
            Self::Stage { .. } => self,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was raised in, if it has been attached.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The failure class, looking through stage wrapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Boundary(_) => ErrorKind::Boundary,
            Self::Wrap(_) => ErrorKind::Wrap,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Io { .. } => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
            Self::LocalWrapDisabled => ErrorKind::LocalWrapDisabled,
            Self::Stage { source, .. } => source.kind(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = ByokError> = std::result::Result<T, E>;
