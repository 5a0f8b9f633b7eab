//! The wrapping engine.
//!
//! Two wraps make up the export:
//!
//! ```text
//! wrapped_private      = AES-KWP(intermediate, user private key)     [boundary]
//! wrapped_intermediate = RSA-OAEP-SHA256(recipient, intermediate)    [boundary, or
//!                                                                     host if opted in]
//! ```
//!
//! The private-key wrap always happens inside the boundary and has no
//! fallback. The intermediate-key wrap may fall back to a host-side OAEP
//! encryption, but only through [`wrap_intermediate`] and only when
//! [`WrapPolicy::unsafe_local_oaep`] is set.

use std::fmt;

use rand::rngs::OsRng;
use rsa::Oaep;
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::boundary::{ObjectHandle, SecureBoundary, WrapMechanism};
use crate::config::{EscrowConfig, KwpMechanism};
use crate::error::{ByokError, Result};
use crate::import::RecipientKey;
use crate::keys::IntermediateKey;

/// The output of a wrap operation. Opaque bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedBlob(Vec<u8>);

impl WrappedBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for WrappedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedBlob({} bytes)", self.0.len())
    }
}

/// Where the intermediate-key wrap was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapPath {
    /// Inside the secure boundary.
    Boundary,
    /// On the host, after reading the intermediate key out of the boundary.
    UnsafeLocal,
}

impl fmt::Display for WrapPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boundary => write!(f, "boundary"),
            Self::UnsafeLocal => write!(f, "unsafe local"),
        }
    }
}

/// The wrapped intermediate key together with the path that produced it.
#[derive(Debug, Clone)]
pub struct WrappedIntermediate {
    pub blob: WrappedBlob,
    pub path: WrapPath,
}

/// Mechanism selection and fallback policy for the wrapping engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WrapPolicy {
    pub kwp: KwpMechanism,
    pub unsafe_local_oaep: bool,
}

impl From<&EscrowConfig> for WrapPolicy {
    fn from(config: &EscrowConfig) -> Self {
        Self {
            kwp: config.kwp_mechanism,
            unsafe_local_oaep: config.unsafe_local_oaep,
        }
    }
}

/// Wrap the user private key under the intermediate key with AES-KWP.
///
/// Consumes the intermediate key: it wraps exactly one private key.
pub fn wrap_private_key_with_intermediate<B: SecureBoundary + ?Sized>(
    boundary: &mut B,
    mechanism: KwpMechanism,
    intermediate: IntermediateKey,
    private_key: ObjectHandle,
) -> Result<WrappedBlob> {
    let mechanism = mechanism.mechanism();
    let bytes = boundary.wrap_key(&mechanism, intermediate.handle(), private_key)?;
    debug!(%mechanism, bytes = bytes.len(), "private key wrapped");
    Ok(WrappedBlob::new(bytes))
}

/// Wrap the intermediate key under the recipient key with RSA-OAEP inside
/// the boundary.
pub fn wrap_intermediate_with_external_public_key<B: SecureBoundary + ?Sized>(
    boundary: &mut B,
    recipient: ObjectHandle,
    intermediate: &IntermediateKey,
) -> Result<WrappedBlob> {
    let bytes = boundary.wrap_key(
        &WrapMechanism::RsaOaepSha256,
        recipient,
        intermediate.handle(),
    )?;
    debug!(bytes = bytes.len(), "intermediate key wrapped in boundary");
    Ok(WrappedBlob::new(bytes))
}

/// RSA-OAEP (SHA-256, MGF1-SHA-256) encryption of `plaintext` on the host.
///
/// Refused unless `policy.unsafe_local_oaep` is set.
pub fn wrap_locally(
    policy: &WrapPolicy,
    recipient: &RecipientKey,
    plaintext: &[u8],
) -> Result<WrappedBlob> {
    if !policy.unsafe_local_oaep {
        return Err(ByokError::LocalWrapDisabled);
    }
    let bytes = recipient
        .public_key()
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| ByokError::Wrap(format!("local OAEP: {}", e)))?;
    Ok(WrappedBlob::new(bytes))
}

/// Wrap the intermediate key, falling back to the host only when allowed.
///
/// A boundary failure is surfaced unchanged unless the unsafe opt-in is set.
/// The fallback reads the key value out of the boundary, so it also requires
/// the intermediate key to have been generated readable.
pub fn wrap_intermediate<B: SecureBoundary + ?Sized>(
    boundary: &mut B,
    policy: &WrapPolicy,
    recipient: &RecipientKey,
    recipient_handle: ObjectHandle,
    intermediate: &IntermediateKey,
) -> Result<WrappedIntermediate> {
    let boundary_err =
        match wrap_intermediate_with_external_public_key(boundary, recipient_handle, intermediate)
        {
            Ok(blob) => {
                return Ok(WrappedIntermediate {
                    blob,
                    path: WrapPath::Boundary,
                })
            }
            Err(e) => e,
        };

    if !policy.unsafe_local_oaep {
        return Err(boundary_err);
    }
    if !intermediate.is_readable() {
        warn!("unsafe local wrap enabled but the intermediate key is sensitive");
        return Err(boundary_err);
    }

    warn!(
        error = %boundary_err,
        "boundary OAEP wrap failed; wrapping intermediate key on the host (unsafe_local_oaep)"
    );
    let value = boundary.secret_value(intermediate.handle())?;
    let blob = wrap_locally(policy, recipient, &value)?;
    Ok(WrappedIntermediate {
        blob,
        path: WrapPath::UnsafeLocal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pin;
    use crate::import::{import_external_public_key, parse_recipient_pem};
    use crate::keys::create_intermediate_key;
    use crate::soft::{BoundaryCall, SoftBoundary};
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::RsaPrivateKey;

    const PUB_PEM: &str = include_str!("../tests/fixtures/recipient_2048.pub.pem");
    const KEY_PEM: &str = include_str!("../tests/fixtures/recipient_2048.key.pem");

    #[test]
    fn test_wrap_locally_refused_without_opt_in() {
        let recipient = parse_recipient_pem(PUB_PEM).unwrap();
        let err = wrap_locally(&WrapPolicy::default(), &recipient, &[0u8; 32]).unwrap_err();
        assert!(matches!(err, ByokError::LocalWrapDisabled));
    }

    #[test]
    fn test_wrap_locally_decrypts_with_oaep_sha256() {
        let recipient = parse_recipient_pem(PUB_PEM).unwrap();
        let private = RsaPrivateKey::from_pkcs8_pem(KEY_PEM).unwrap();
        let policy = WrapPolicy {
            unsafe_local_oaep: true,
            ..WrapPolicy::default()
        };

        let secret = [0x5Au8; 32];
        let blob = wrap_locally(&policy, &recipient, &secret).unwrap();
        assert_eq!(blob.len(), recipient.modulus().len());

        let recovered = private.decrypt(Oaep::new::<Sha256>(), blob.as_bytes()).unwrap();
        assert_eq!(recovered, secret);
    }

    #[test]
    fn test_sensitive_intermediate_never_read_even_with_opt_in() {
        let mut soft = SoftBoundary::new(Pin::new("1234")).rejecting(WrapMechanism::RsaOaepSha256);
        let journal = soft.journal();
        soft.open_session().unwrap();
        soft.login(&Pin::new("1234")).unwrap();

        let recipient = parse_recipient_pem(PUB_PEM).unwrap();
        let handle = import_external_public_key(&mut soft, &recipient).unwrap();
        let intermediate = create_intermediate_key(&mut soft, false).unwrap();
        let policy = WrapPolicy {
            unsafe_local_oaep: true,
            ..WrapPolicy::default()
        };

        let err = wrap_intermediate(&mut soft, &policy, &recipient, handle, &intermediate)
            .unwrap_err();
        assert!(matches!(err, ByokError::Wrap(_)));
        assert_eq!(
            journal.count(|c| matches!(c, BoundaryCall::SecretValue(_))),
            0
        );
    }

    #[test]
    fn test_blob_debug_hides_bytes() {
        let blob = WrappedBlob::new(vec![1, 2, 3]);
        assert_eq!(format!("{:?}", blob), "WrappedBlob(3 bytes)");
    }
}
