//! Protocol sequencing.
//!
//! One escrow run walks these stages in order:
//!
//! ```text
//! Init -> ImportRecipientKey -> GenerateIntermediate -> WrapIntermediate
//!      -> GenerateUserKeyPair -> WrapPrivateKey -> Persist -> Cleanup
//! ```
//!
//! The boundary session is held by a [`BoundarySession`] guard for the whole
//! run. Cleanup (destroy the intermediate key, log out, close the session,
//! release the module) runs exactly once on every exit path, and the error
//! that stopped the run is the one returned.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::audit::{AuditEvent, AuditLog, AuditSink};
use crate::boundary::{ObjectHandle, SecureBoundary};
use crate::config::{EscrowConfig, Pin};
use crate::error::{ByokError, Result};
use crate::import::{self, RecipientKey};
use crate::keys::{self, IntermediateKey, KeyLabel, UserKeyPair};
use crate::persist;
use crate::wrap::{self, WrapPath, WrapPolicy, WrappedBlob, WrappedIntermediate};

/// A step of the escrow protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    ImportRecipientKey,
    GenerateIntermediate,
    WrapIntermediate,
    GenerateUserKeyPair,
    WrapPrivateKey,
    Persist,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ImportRecipientKey => "import recipient key",
            Self::GenerateIntermediate => "generate intermediate key",
            Self::WrapIntermediate => "wrap intermediate key",
            Self::GenerateUserKeyPair => "generate user key pair",
            Self::WrapPrivateKey => "wrap private key",
            Self::Persist => "persist",
            Self::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Session guard
// ---------------------------------------------------------------------------

/// Exclusive hold on a boundary for the duration of one run.
///
/// Tracks what has been acquired so cleanup undoes exactly that. Cleanup runs
/// from [`BoundarySession::release`], or from `Drop` if the guard is dropped
/// without being released.
pub struct BoundarySession<'b, B: SecureBoundary + ?Sized> {
    boundary: &'b mut B,
    session_open: bool,
    logged_in: bool,
    intermediate: Option<ObjectHandle>,
    released: bool,
}

impl<'b, B: SecureBoundary + ?Sized> BoundarySession<'b, B> {
    /// Take hold of a loaded boundary. Nothing is opened yet.
    pub fn new(boundary: &'b mut B) -> Self {
        Self {
            boundary,
            session_open: false,
            logged_in: false,
            intermediate: None,
            released: false,
        }
    }

    /// Open a session on the token and log in.
    pub fn open(&mut self, pin: &Pin) -> Result<()> {
        self.boundary.open_session()?;
        self.session_open = true;
        self.boundary.login(pin)?;
        self.logged_in = true;
        Ok(())
    }

    pub fn boundary(&mut self) -> &mut B {
        &mut *self.boundary
    }

    /// Register the intermediate key for destruction at cleanup.
    pub fn track_intermediate(&mut self, key: &IntermediateKey) {
        self.intermediate = Some(key.handle());
    }

    /// Run cleanup and return the first failure, if any.
    pub fn release(mut self) -> Result<()> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut first_err: Option<ByokError> = None;
        let mut note = |result: Result<()>, what: &str| {
            if let Err(e) = result {
                error!(error = %e, "cleanup: {} failed", what);
                first_err.get_or_insert(e);
            }
        };

        if let Some(handle) = self.intermediate.take() {
            note(self.boundary.destroy_object(handle), "destroy intermediate key");
        }
        if self.logged_in {
            self.logged_in = false;
            note(self.boundary.logout(), "logout");
        }
        if self.session_open {
            self.session_open = false;
            note(self.boundary.close_session(), "close session");
        }
        note(self.boundary.finalize(), "finalize module");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<B: SecureBoundary + ?Sized> Drop for BoundarySession<'_, B> {
    fn drop(&mut self) {
        if !self.released {
            warn!("boundary session dropped without release; cleaning up");
            let _ = self.cleanup();
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The recipient key as decoded and imported for the run.
#[derive(Debug)]
pub struct ImportedRecipient {
    pub key: RecipientKey,
    pub handle: ObjectHandle,
}

/// The result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct EscrowOutcome {
    pub key_label: KeyLabel,
    pub intermediate_wrap_path: WrapPath,
    pub wrapped_intermediate_path: PathBuf,
    pub wrapped_private_key_path: PathBuf,
}

/// Destroy the ephemeral recipient key object. Failure is only logged.
fn discard_recipient<B: SecureBoundary + ?Sized>(
    session: &mut BoundarySession<'_, B>,
    handle: ObjectHandle,
) {
    if let Err(e) = session.boundary().destroy_object(handle) {
        warn!(error = %e, "could not destroy recipient key object");
    }
}

/// Drives one generate-and-wrap cycle against a boundary.
pub struct Escrow {
    config: EscrowConfig,
    policy: WrapPolicy,
    audit: AuditLog,
    stage: Stage,
}

impl Escrow {
    pub fn new(config: EscrowConfig) -> Self {
        let policy = WrapPolicy::from(&config);
        Self {
            config,
            policy,
            audit: AuditLog::new(),
            stage: Stage::Init,
        }
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    /// The stage the run is in, or stopped in.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn add_audit_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.audit.add_forward_sink(sink);
    }

    /// Run the whole protocol. `boundary` must be loaded but not yet opened.
    pub fn run<B: SecureBoundary + ?Sized>(&mut self, boundary: &mut B) -> Result<EscrowOutcome> {
        info!(
            module = %self.config.module_name,
            kwp = %self.policy.kwp.mechanism(),
            unsafe_local_oaep = self.policy.unsafe_local_oaep,
            "starting escrow run"
        );
        let mut session = BoundarySession::new(boundary);
        let result = self.execute(&mut session);

        // A failed run keeps reporting the stage it stopped in.
        if result.is_ok() {
            self.enter(Stage::Cleanup);
        }
        let cleanup = session.release();
        if cleanup.is_ok() {
            self.audit.record(AuditEvent::CleanupCompleted);
        }

        match (result, cleanup) {
            (Ok(outcome), Ok(())) => {
                info!(label = %outcome.key_label, "escrow run complete");
                Ok(outcome)
            }
            (Ok(_), Err(e)) => Err(e.at(Stage::Cleanup)),
            (Err(e), _) => {
                error!(error = %e, "escrow run failed");
                Err(e)
            }
        }
    }

    fn execute<B: SecureBoundary + ?Sized>(
        &mut self,
        session: &mut BoundarySession<'_, B>,
    ) -> Result<EscrowOutcome> {
        self.init(session)?;
        let recipient = self.import_recipient_key(session)?;
        let intermediate = match self.generate_intermediate(session) {
            Ok(key) => key,
            Err(e) => {
                discard_recipient(session, recipient.handle);
                return Err(e);
            }
        };
        let wrapped_intermediate = self.wrap_intermediate(session, recipient, &intermediate)?;
        let pair = self.generate_user_key_pair(session)?;
        let wrapped_private = self.wrap_private_key(session, intermediate, &pair)?;
        self.persist(&wrapped_intermediate.blob, &wrapped_private)?;

        Ok(EscrowOutcome {
            key_label: pair.label,
            intermediate_wrap_path: wrapped_intermediate.path,
            wrapped_intermediate_path: self.config.wrapped_intermediate_path.clone(),
            wrapped_private_key_path: self.config.wrapped_private_key_path.clone(),
        })
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        info!(%stage, "stage");
    }

    /// Open the session and log in.
    pub fn init<B: SecureBoundary + ?Sized>(
        &mut self,
        session: &mut BoundarySession<'_, B>,
    ) -> Result<()> {
        self.enter(Stage::Init);
        session.open(&self.config.pin).map_err(|e| e.at(Stage::Init))?;
        self.audit.record(AuditEvent::SessionOpened {
            module: self.config.module_name.clone(),
        });
        Ok(())
    }

    /// Read, decode and import the recipient public key.
    pub fn import_recipient_key<B: SecureBoundary + ?Sized>(
        &mut self,
        session: &mut BoundarySession<'_, B>,
    ) -> Result<ImportedRecipient> {
        self.enter(Stage::ImportRecipientKey);
        let stage = |e: ByokError| e.at(Stage::ImportRecipientKey);

        let path = &self.config.recipient_key_path;
        let pem = std::fs::read_to_string(path)
            .map_err(|e| ByokError::io(path, e))
            .map_err(stage)?;
        let key = import::parse_recipient_pem(&pem).map_err(stage)?;
        let handle = import::import_external_public_key(session.boundary(), &key).map_err(stage)?;
        Ok(ImportedRecipient { key, handle })
    }

    /// Create the intermediate key and hand it to the guard for cleanup.
    pub fn generate_intermediate<B: SecureBoundary + ?Sized>(
        &mut self,
        session: &mut BoundarySession<'_, B>,
    ) -> Result<IntermediateKey> {
        self.enter(Stage::GenerateIntermediate);
        let key = keys::create_intermediate_key(session.boundary(), self.policy.unsafe_local_oaep)
            .map_err(|e| e.at(Stage::GenerateIntermediate))?;
        session.track_intermediate(&key);
        Ok(key)
    }

    /// Wrap the intermediate key under the recipient key, then drop the
    /// recipient key object.
    pub fn wrap_intermediate<B: SecureBoundary + ?Sized>(
        &mut self,
        session: &mut BoundarySession<'_, B>,
        recipient: ImportedRecipient,
        intermediate: &IntermediateKey,
    ) -> Result<WrappedIntermediate> {
        self.enter(Stage::WrapIntermediate);
        let result = wrap::wrap_intermediate(
            session.boundary(),
            &self.policy,
            &recipient.key,
            recipient.handle,
            intermediate,
        );
        discard_recipient(session, recipient.handle);

        let wrapped = result.map_err(|e| e.at(Stage::WrapIntermediate))?;
        self.audit.record(AuditEvent::IntermediateWrapped {
            path: wrapped.path,
        });
        Ok(wrapped)
    }

    /// Create the token-resident user key pair with a fresh label.
    pub fn generate_user_key_pair<B: SecureBoundary + ?Sized>(
        &mut self,
        session: &mut BoundarySession<'_, B>,
    ) -> Result<UserKeyPair> {
        self.enter(Stage::GenerateUserKeyPair);
        let pair = keys::create_user_key_pair(session.boundary(), KeyLabel::now())
            .map_err(|e| e.at(Stage::GenerateUserKeyPair))?;
        self.audit.record(AuditEvent::KeyPairCreated {
            label: pair.label.label().to_string(),
        });
        Ok(pair)
    }

    /// Wrap the user private key under the intermediate key. No fallback.
    pub fn wrap_private_key<B: SecureBoundary + ?Sized>(
        &mut self,
        session: &mut BoundarySession<'_, B>,
        intermediate: IntermediateKey,
        pair: &UserKeyPair,
    ) -> Result<WrappedBlob> {
        self.enter(Stage::WrapPrivateKey);
        wrap::wrap_private_key_with_intermediate(
            session.boundary(),
            self.policy.kwp,
            intermediate,
            pair.private,
        )
        .map_err(|e| e.at(Stage::WrapPrivateKey))
    }

    /// Write both blobs to their configured paths.
    pub fn persist(
        &mut self,
        wrapped_intermediate: &WrappedBlob,
        wrapped_private: &WrappedBlob,
    ) -> Result<()> {
        self.enter(Stage::Persist);
        let stage = |e: ByokError| e.at(Stage::Persist);
        persist::encode_and_persist(
            &self.config.wrapped_intermediate_path,
            wrapped_intermediate,
            &mut self.audit,
        )
        .map_err(stage)?;
        persist::encode_and_persist(
            &self.config.wrapped_private_key_path,
            wrapped_private,
            &mut self.audit,
        )
        .map_err(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::{BoundaryCall, SoftBoundary};

    #[test]
    fn test_stage_order() {
        assert!(Stage::Init < Stage::ImportRecipientKey);
        assert!(Stage::WrapPrivateKey < Stage::Persist);
        assert!(Stage::Persist < Stage::Cleanup);
    }

    #[test]
    fn test_guard_drop_cleans_up_once() {
        let mut soft = SoftBoundary::new(Pin::new("1234"));
        let journal = soft.journal();
        {
            let mut session = BoundarySession::new(&mut soft);
            session.open(&Pin::new("1234")).unwrap();
        }
        assert_eq!(journal.count(|c| *c == BoundaryCall::Logout), 1);
        assert_eq!(journal.count(|c| *c == BoundaryCall::CloseSession), 1);
        assert_eq!(journal.count(|c| *c == BoundaryCall::Finalize), 1);
    }

    #[test]
    fn test_release_after_failed_login_skips_logout() {
        let mut soft = SoftBoundary::new(Pin::new("1234"));
        let journal = soft.journal();
        let mut session = BoundarySession::new(&mut soft);
        assert!(session.open(&Pin::new("9999")).is_err());
        session.release().unwrap();

        assert_eq!(journal.count(|c| *c == BoundaryCall::Logout), 0);
        assert_eq!(journal.count(|c| *c == BoundaryCall::CloseSession), 1);
        assert_eq!(journal.count(|c| *c == BoundaryCall::Finalize), 1);
    }
}
