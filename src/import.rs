//! Recipient public key import.
//!
//! The recipient (the external key-management service) supplies an RSA
//! public key as PEM. It is decoded once into its modulus and public exponent,
//! and those exact big-endian bytes are written into an ephemeral boundary
//! object. Nothing is re-derived: a mismatch here would produce a wrapping key
//! that silently does not belong to the recipient.

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use tracing::{debug, warn};

use crate::boundary::{ObjectHandle, PublicKeyTemplate, SecureBoundary};
use crate::error::{ByokError, Result};

/// Modulus size recipients are expected to use.
pub const EXPECTED_RECIPIENT_BITS: usize = 4096;

/// A decoded recipient public key.
#[derive(Debug, Clone)]
pub struct RecipientKey {
    modulus: Vec<u8>,
    public_exponent: Vec<u8>,
    key: RsaPublicKey,
}

impl RecipientKey {
    /// Big-endian unsigned modulus, without leading zeros.
    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    /// Big-endian unsigned public exponent, without leading zeros.
    pub fn public_exponent(&self) -> &[u8] {
        &self.public_exponent
    }

    pub fn bits(&self) -> usize {
        self.key.n().bits()
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.key
    }
}

/// Decode a PEM RSA public key.
///
/// Accepts SubjectPublicKeyInfo (`BEGIN PUBLIC KEY`) and PKCS#1
/// (`BEGIN RSA PUBLIC KEY`) encodings.
pub fn parse_recipient_pem(pem: &str) -> Result<RecipientKey> {
    let pem = pem.trim();
    let key = if pem.starts_with("-----BEGIN RSA PUBLIC KEY-----") {
        RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| ByokError::Parse(e.to_string()))?
    } else if pem.starts_with("-----BEGIN PUBLIC KEY-----") {
        RsaPublicKey::from_public_key_pem(pem).map_err(|e| ByokError::Parse(e.to_string()))?
    } else {
        return Err(ByokError::Parse(
            "expected a PEM public key (BEGIN PUBLIC KEY or BEGIN RSA PUBLIC KEY)".into(),
        ));
    };

    let recipient = RecipientKey {
        modulus: key.n().to_bytes_be(),
        public_exponent: key.e().to_bytes_be(),
        key,
    };
    if recipient.bits() != EXPECTED_RECIPIENT_BITS {
        warn!(
            bits = recipient.bits(),
            expected = EXPECTED_RECIPIENT_BITS,
            "recipient key size differs from the expected size"
        );
    }
    Ok(recipient)
}

/// Create the ephemeral wrapping-key object for `recipient`.
pub fn import_external_public_key<B: SecureBoundary + ?Sized>(
    boundary: &mut B,
    recipient: &RecipientKey,
) -> Result<ObjectHandle> {
    let template = PublicKeyTemplate {
        modulus: recipient.modulus.clone(),
        public_exponent: recipient.public_exponent.clone(),
        token: false,
        wrap: true,
        encrypt: true,
    };
    let handle = boundary.create_public_key(&template)?;
    debug!(%handle, bits = recipient.bits(), "recipient public key imported");
    Ok(handle)
}
