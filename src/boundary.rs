//! The secure boundary seam.
//!
//! Everything the escrow protocol asks of an HSM goes through the
//! [`SecureBoundary`] trait. Two implementations ship with the crate:
//! [`crate::pkcs11::Pkcs11Boundary`], which drives a real PKCS#11 module, and
//! [`crate::soft::SoftBoundary`], which runs the same primitives in-process.
//!
//! Templates here describe only the attributes the protocol sets. Anything
//! else is left to the module's defaults.

use std::fmt;

use serde::Serialize;
use zeroize::Zeroizing;

use crate::config::Pin;
use crate::error::Result;

/// An opaque reference to an object living inside the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectHandle(u64);

impl ObjectHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Attributes for a generated AES secret key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretKeyTemplate {
    /// Key length in bits.
    pub bits: usize,
    pub token: bool,
    pub extractable: bool,
    /// A sensitive key's value can never be read back out of the boundary.
    pub sensitive: bool,
    pub wrap: bool,
    pub encrypt: bool,
}

/// Attributes for a generated RSA key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairTemplate {
    pub modulus_bits: usize,
    /// Big-endian unsigned public exponent.
    pub public_exponent: Vec<u8>,
    pub label: Vec<u8>,
    pub id: Vec<u8>,
    pub token: bool,
    pub private_extractable: bool,
}

/// Attributes for an RSA public key object built from raw components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyTemplate {
    /// Big-endian unsigned modulus.
    pub modulus: Vec<u8>,
    /// Big-endian unsigned public exponent.
    pub public_exponent: Vec<u8>,
    pub token: bool,
    pub wrap: bool,
    pub encrypt: bool,
}

/// Handles of a freshly generated key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPairHandles {
    pub public: ObjectHandle,
    pub private: ObjectHandle,
}

/// Mechanism descriptor for a wrap-key call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapMechanism {
    /// `CKM_AES_KEY_WRAP_PAD` (RFC 5649).
    AesKeyWrapPad,
    /// A vendor-defined AES-KWP mechanism identified by its full numeric code.
    VendorDefined(u64),
    /// `CKM_RSA_PKCS_OAEP` with SHA-256, MGF1-SHA-256 and an empty label.
    RsaOaepSha256,
}

impl fmt::Display for WrapMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AesKeyWrapPad => write!(f, "CKM_AES_KEY_WRAP_PAD"),
            Self::VendorDefined(code) => write!(f, "vendor mechanism {:#010x}", code),
            Self::RsaOaepSha256 => write!(f, "CKM_RSA_PKCS_OAEP(SHA-256, MGF1-SHA-256)"),
        }
    }
}

/// Session-based primitives of a cryptographic module.
///
/// Calls are synchronous and are never retried by the caller. Implementations
/// report module rejections as [`crate::error::ByokError::Boundary`], except
/// `wrap_key`, which reports them as [`crate::error::ByokError::Wrap`].
pub trait SecureBoundary {
    /// Open a read-write session on the configured slot. Fails if no token is
    /// present.
    fn open_session(&mut self) -> Result<()>;

    fn login(&mut self, pin: &Pin) -> Result<()>;

    fn generate_secret_key(&mut self, template: &SecretKeyTemplate) -> Result<ObjectHandle>;

    fn generate_key_pair(&mut self, template: &KeyPairTemplate) -> Result<KeyPairHandles>;

    fn create_public_key(&mut self, template: &PublicKeyTemplate) -> Result<ObjectHandle>;

    /// Wrap `key` under `wrapping_key` and return the raw wrapped bytes.
    fn wrap_key(
        &mut self,
        mechanism: &WrapMechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> Result<Vec<u8>>;

    /// Read the value of a non-sensitive, extractable secret key.
    fn secret_value(&mut self, key: ObjectHandle) -> Result<Zeroizing<Vec<u8>>>;

    fn destroy_object(&mut self, handle: ObjectHandle) -> Result<()>;

    fn logout(&mut self) -> Result<()>;

    fn close_session(&mut self) -> Result<()>;

    /// Release the module. No further calls are valid afterwards.
    fn finalize(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanism_display() {
        assert_eq!(WrapMechanism::AesKeyWrapPad.to_string(), "CKM_AES_KEY_WRAP_PAD");
        assert_eq!(
            WrapMechanism::VendorDefined(0x8000_0171).to_string(),
            "vendor mechanism 0x80000171"
        );
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(ObjectHandle::new(7).to_string(), "#7");
    }
}
