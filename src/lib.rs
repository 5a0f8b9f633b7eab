//! # byok-escrow
//!
//! Generate BYOK key material inside an HSM and double-wrap it for export.
//!
//! One run creates a 256-bit AES intermediate key and a 2048-bit RSA user key
//! pair in the secure boundary, then produces two blobs:
//!
//! ```text
//! wrapped intermediate = RSA-OAEP-SHA256(recipient public key, intermediate key)
//! wrapped private key  = AES-KWP(intermediate key, user private key)
//! ```
//!
//! Both are written as base64. The recipient unwraps the intermediate key
//! with its private key, then the user private key with the intermediate key.
//!
//! ## Public API
//!
//! [`Escrow`] sequences the protocol against any [`SecureBoundary`]:
//! [`Pkcs11Boundary`] for a real module, [`SoftBoundary`] for an in-process
//! one. Configuration is an explicit [`EscrowConfig`] value.

pub mod audit;
pub mod boundary;
pub mod config;
pub mod error;
pub mod escrow;
pub mod import;
pub mod keys;
pub mod kwp;
pub mod persist;
pub mod pkcs11;
pub mod soft;
pub mod wrap;

pub use boundary::SecureBoundary;
pub use config::{EscrowConfig, KwpMechanism, Pin};
pub use error::{ByokError, ErrorKind};
pub use escrow::{Escrow, EscrowOutcome, Stage};
pub use pkcs11::Pkcs11Boundary;
pub use soft::SoftBoundary;

/// Load the boundary named by `config` and run one escrow cycle against it.
pub fn run_with_pkcs11(config: EscrowConfig) -> Result<EscrowOutcome, ByokError> {
    // Once loaded, the module is only released by the escrow cleanup.
    let sink = match &config.audit_log_path {
        Some(path) => Some(
            audit::FileAuditSink::new(path)
                .map_err(|e| ByokError::io(path, e).at(Stage::Init))?,
        ),
        None => None,
    };
    let mut boundary = Pkcs11Boundary::from_config(&config).map_err(|e| e.at(Stage::Init))?;
    let mut escrow = Escrow::new(config);
    if let Some(sink) = sink {
        escrow.add_audit_sink(Box::new(sink));
    }
    escrow.run(&mut boundary)
}
