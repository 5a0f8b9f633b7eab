//! In-process secure boundary.
//!
//! [`SoftBoundary`] implements every [`SecureBoundary`] primitive in memory
//! with PKCS#11 semantics: session and login state, token versus session
//! objects, sensitive and extractable attributes, and a mechanism table that
//! can be narrowed to reproduce modules which lack a mechanism. Rejections
//! carry the `CKR_*` code a real module would return.
//!
//! Every call is appended to a shared [`Journal`] so callers can check what
//! the protocol asked of the boundary after the fact.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use ring::rand::{SecureRandom, SystemRandom};
use rsa::pkcs8::EncodePrivateKey;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::boundary::{
    KeyPairHandles, KeyPairTemplate, ObjectHandle, PublicKeyTemplate, SecretKeyTemplate,
    SecureBoundary, WrapMechanism,
};
use crate::config::Pin;
use crate::error::{ByokError, Result};
use crate::kwp;

/// One primitive invoked on a [`SoftBoundary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryCall {
    OpenSession,
    Login,
    GenerateSecretKey(ObjectHandle),
    GenerateKeyPair { label: String },
    CreatePublicKey {
        handle: ObjectHandle,
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
    },
    WrapKey(WrapMechanism),
    SecretValue(ObjectHandle),
    DestroyObject(ObjectHandle),
    Logout,
    CloseSession,
    Finalize,
}

/// Shared, append-only list of boundary calls.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<BoundaryCall>>>);

impl Journal {
    fn push(&self, call: BoundaryCall) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).push(call);
    }

    pub fn calls(&self) -> Vec<BoundaryCall> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn count(&self, predicate: impl Fn(&BoundaryCall) -> bool) -> usize {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|call| predicate(call))
            .count()
    }
}

enum SoftObject {
    Secret {
        value: Zeroizing<Vec<u8>>,
        token: bool,
        extractable: bool,
        sensitive: bool,
        wrap: bool,
    },
    Public {
        key: RsaPublicKey,
        token: bool,
        wrap: bool,
        label: Vec<u8>,
        id: Vec<u8>,
    },
    Private {
        key: Box<RsaPrivateKey>,
        token: bool,
        extractable: bool,
        label: Vec<u8>,
        id: Vec<u8>,
    },
}

impl SoftObject {
    fn is_token(&self) -> bool {
        match self {
            Self::Secret { token, .. } | Self::Public { token, .. } | Self::Private { token, .. } => {
                *token
            }
        }
    }

    fn label_and_id(&self) -> Option<(&[u8], &[u8])> {
        match self {
            Self::Secret { .. } => None,
            Self::Public { label, id, .. } | Self::Private { label, id, .. } => {
                Some((label.as_slice(), id.as_slice()))
            }
        }
    }
}

fn rv(code: &str) -> ByokError {
    ByokError::Boundary(code.to_string())
}

fn wrap_rv(code: &str) -> ByokError {
    ByokError::Wrap(code.to_string())
}

/// A software secure boundary holding one slot.
pub struct SoftBoundary {
    pin: Pin,
    token_present: bool,
    vendor_kwp_code: Option<u64>,
    rejected: Vec<WrapMechanism>,
    secret_key_generation: bool,
    key_pair_generation: bool,
    journal: Journal,
    session_open: bool,
    logged_in: bool,
    finalized: bool,
    next_handle: u64,
    objects: HashMap<ObjectHandle, SoftObject>,
}

impl SoftBoundary {
    /// A boundary with a token present, the given user PIN, and the standard
    /// mechanism table (AES-KWP and RSA-OAEP, no vendor mechanisms).
    pub fn new(pin: Pin) -> Self {
        Self {
            pin,
            token_present: true,
            vendor_kwp_code: None,
            rejected: Vec::new(),
            secret_key_generation: true,
            key_pair_generation: true,
            journal: Journal::default(),
            session_open: false,
            logged_in: false,
            finalized: false,
            next_handle: 1,
            objects: HashMap::new(),
        }
    }

    /// Simulate an empty slot.
    pub fn without_token(mut self) -> Self {
        self.token_present = false;
        self
    }

    /// Accept `code` as a vendor-defined alias of AES-KWP.
    pub fn with_vendor_kwp(mut self, code: u64) -> Self {
        self.vendor_kwp_code = Some(code);
        self
    }

    /// Remove `mechanism` from the mechanism table.
    pub fn rejecting(mut self, mechanism: WrapMechanism) -> Self {
        self.rejected.push(mechanism);
        self
    }

    /// Fail every AES key generation with `CKR_MECHANISM_INVALID`.
    pub fn without_secret_key_generation(mut self) -> Self {
        self.secret_key_generation = false;
        self
    }

    /// Fail every RSA key pair generation with `CKR_MECHANISM_INVALID`.
    pub fn without_key_pair_generation(mut self) -> Self {
        self.key_pair_generation = false;
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// The private key of the token-resident pair labelled `label`.
    pub fn private_key(&self, label: &str) -> Option<&RsaPrivateKey> {
        self.objects.values().find_map(|object| match object {
            SoftObject::Private { key, label: l, .. } if l.as_slice() == label.as_bytes() => {
                Some(key.as_ref())
            }
            _ => None,
        })
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.objects.contains_key(&handle)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn insert(&mut self, object: SoftObject) -> ObjectHandle {
        let handle = ObjectHandle::new(self.next_handle);
        self.next_handle += 1;
        self.objects.insert(handle, object);
        handle
    }

    fn require_session(&self) -> Result<()> {
        if self.finalized {
            return Err(rv("CKR_CRYPTOKI_NOT_INITIALIZED"));
        }
        if !self.session_open {
            return Err(rv("CKR_SESSION_HANDLE_INVALID"));
        }
        Ok(())
    }

    fn require_login(&self) -> Result<()> {
        self.require_session()?;
        if !self.logged_in {
            return Err(rv("CKR_USER_NOT_LOGGED_IN"));
        }
        Ok(())
    }

    /// Bytes of `key` as they would be fed to a wrap mechanism.
    fn extract(&self, key: ObjectHandle) -> Result<Zeroizing<Vec<u8>>> {
        match self.objects.get(&key) {
            Some(SoftObject::Secret {
                value, extractable, ..
            }) if *extractable => Ok(value.clone()),
            Some(SoftObject::Private {
                key, extractable, ..
            }) if *extractable => {
                let der = key
                    .to_pkcs8_der()
                    .map_err(|e| wrap_rv(&format!("CKR_GENERAL_ERROR: {}", e)))?;
                Ok(Zeroizing::new(der.as_bytes().to_vec()))
            }
            Some(_) => Err(wrap_rv("CKR_KEY_UNEXTRACTABLE")),
            None => Err(wrap_rv("CKR_KEY_HANDLE_INVALID")),
        }
    }

    fn wrap_kwp(&self, wrapping_key: ObjectHandle, key: ObjectHandle) -> Result<Vec<u8>> {
        let kek = match self.objects.get(&wrapping_key) {
            Some(SoftObject::Secret { value, wrap, .. }) if *wrap => value.clone(),
            Some(SoftObject::Secret { .. }) => {
                return Err(wrap_rv("CKR_WRAPPING_KEY_TYPE_INCONSISTENT: wrap not permitted"))
            }
            Some(_) => return Err(wrap_rv("CKR_WRAPPING_KEY_TYPE_INCONSISTENT")),
            None => return Err(wrap_rv("CKR_WRAPPING_KEY_HANDLE_INVALID")),
        };
        let plaintext = self.extract(key)?;
        kwp::wrap(&kek, &plaintext)
    }

    fn wrap_oaep(&self, wrapping_key: ObjectHandle, key: ObjectHandle) -> Result<Vec<u8>> {
        let public = match self.objects.get(&wrapping_key) {
            Some(SoftObject::Public { key, wrap, .. }) if *wrap => key,
            Some(_) => return Err(wrap_rv("CKR_WRAPPING_KEY_TYPE_INCONSISTENT")),
            None => return Err(wrap_rv("CKR_WRAPPING_KEY_HANDLE_INVALID")),
        };
        if !matches!(self.objects.get(&key), Some(SoftObject::Secret { .. })) {
            return Err(wrap_rv("CKR_KEY_NOT_WRAPPABLE"));
        }
        let plaintext = self.extract(key)?;
        public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &plaintext)
            .map_err(|e| wrap_rv(&format!("CKR_GENERAL_ERROR: {}", e)))
    }
}

impl SecureBoundary for SoftBoundary {
    fn open_session(&mut self) -> Result<()> {
        self.journal.push(BoundaryCall::OpenSession);
        if self.finalized {
            return Err(rv("CKR_CRYPTOKI_NOT_INITIALIZED"));
        }
        if !self.token_present {
            return Err(rv("no slot with a token present"));
        }
        self.session_open = true;
        Ok(())
    }

    fn login(&mut self, pin: &Pin) -> Result<()> {
        self.journal.push(BoundaryCall::Login);
        self.require_session()?;
        if self.logged_in {
            return Err(rv("CKR_USER_ALREADY_LOGGED_IN"));
        }
        if pin.expose() != self.pin.expose() {
            return Err(rv("CKR_PIN_INCORRECT"));
        }
        self.logged_in = true;
        Ok(())
    }

    fn generate_secret_key(&mut self, template: &SecretKeyTemplate) -> Result<ObjectHandle> {
        self.require_login()?;
        if !self.secret_key_generation {
            return Err(rv("CKR_MECHANISM_INVALID: CKM_AES_KEY_GEN"));
        }
        if !matches!(template.bits, 128 | 192 | 256) {
            return Err(rv("CKR_KEY_SIZE_RANGE"));
        }
        let mut value = Zeroizing::new(vec![0u8; template.bits / 8]);
        SystemRandom::new()
            .fill(&mut value)
            .map_err(|_| rv("CKR_FUNCTION_FAILED: randomness source failed"))?;

        let handle = self.insert(SoftObject::Secret {
            value,
            token: template.token,
            extractable: template.extractable,
            sensitive: template.sensitive,
            wrap: template.wrap,
        });
        self.journal.push(BoundaryCall::GenerateSecretKey(handle));
        Ok(handle)
    }

    fn generate_key_pair(&mut self, template: &KeyPairTemplate) -> Result<KeyPairHandles> {
        self.journal.push(BoundaryCall::GenerateKeyPair {
            label: String::from_utf8_lossy(&template.label).into_owned(),
        });
        self.require_login()?;
        if !self.key_pair_generation {
            return Err(rv("CKR_MECHANISM_INVALID: CKM_RSA_PKCS_KEY_PAIR_GEN"));
        }

        let collision = self
            .objects
            .values()
            .filter(|object| object.is_token())
            .filter_map(SoftObject::label_and_id)
            .any(|(label, id)| label == template.label.as_slice() || id == template.id.as_slice());
        if collision {
            return Err(rv("CKR_ATTRIBUTE_VALUE_INVALID: label or id already in use"));
        }

        let exponent = BigUint::from_bytes_be(&template.public_exponent);
        let private = RsaPrivateKey::new_with_exp(&mut OsRng, template.modulus_bits, &exponent)
            .map_err(|e| rv(&format!("CKR_GENERAL_ERROR: {}", e)))?;
        let public = private.to_public_key();

        let public = self.insert(SoftObject::Public {
            key: public,
            token: template.token,
            wrap: false,
            label: template.label.clone(),
            id: template.id.clone(),
        });
        let private = self.insert(SoftObject::Private {
            key: Box::new(private),
            token: template.token,
            extractable: template.private_extractable,
            label: template.label.clone(),
            id: template.id.clone(),
        });
        Ok(KeyPairHandles { public, private })
    }

    fn create_public_key(&mut self, template: &PublicKeyTemplate) -> Result<ObjectHandle> {
        self.require_login()?;
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(&template.modulus),
            BigUint::from_bytes_be(&template.public_exponent),
        )
        .map_err(|e| rv(&format!("CKR_ATTRIBUTE_VALUE_INVALID: {}", e)))?;

        let handle = self.insert(SoftObject::Public {
            key,
            token: template.token,
            wrap: template.wrap,
            label: Vec::new(),
            id: Vec::new(),
        });
        self.journal.push(BoundaryCall::CreatePublicKey {
            handle,
            modulus: template.modulus.clone(),
            public_exponent: template.public_exponent.clone(),
        });
        Ok(handle)
    }

    fn wrap_key(
        &mut self,
        mechanism: &WrapMechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> Result<Vec<u8>> {
        self.journal.push(BoundaryCall::WrapKey(*mechanism));
        self.require_login()?;
        if self.rejected.contains(mechanism) {
            return Err(wrap_rv(&format!("CKR_MECHANISM_INVALID: {}", mechanism)));
        }
        match mechanism {
            WrapMechanism::AesKeyWrapPad => self.wrap_kwp(wrapping_key, key),
            WrapMechanism::VendorDefined(code) if Some(*code) == self.vendor_kwp_code => {
                self.wrap_kwp(wrapping_key, key)
            }
            WrapMechanism::VendorDefined(_) => {
                Err(wrap_rv(&format!("CKR_MECHANISM_INVALID: {}", mechanism)))
            }
            WrapMechanism::RsaOaepSha256 => self.wrap_oaep(wrapping_key, key),
        }
    }

    fn secret_value(&mut self, key: ObjectHandle) -> Result<Zeroizing<Vec<u8>>> {
        self.journal.push(BoundaryCall::SecretValue(key));
        self.require_login()?;
        match self.objects.get(&key) {
            Some(SoftObject::Secret {
                value,
                sensitive: false,
                extractable: true,
                ..
            }) => Ok(value.clone()),
            Some(_) => Err(rv("CKR_ATTRIBUTE_SENSITIVE")),
            None => Err(rv("CKR_OBJECT_HANDLE_INVALID")),
        }
    }

    fn destroy_object(&mut self, handle: ObjectHandle) -> Result<()> {
        self.journal.push(BoundaryCall::DestroyObject(handle));
        self.require_session()?;
        self.objects
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| rv("CKR_OBJECT_HANDLE_INVALID"))
    }

    fn logout(&mut self) -> Result<()> {
        self.journal.push(BoundaryCall::Logout);
        self.require_login()?;
        self.logged_in = false;
        Ok(())
    }

    fn close_session(&mut self) -> Result<()> {
        self.journal.push(BoundaryCall::CloseSession);
        self.require_session()?;
        // Session objects do not outlive their session.
        self.objects.retain(|_, object| object.is_token());
        self.session_open = false;
        self.logged_in = false;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.journal.push(BoundaryCall::Finalize);
        if self.finalized {
            return Err(rv("CKR_CRYPTOKI_NOT_INITIALIZED"));
        }
        self.finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logged_in() -> SoftBoundary {
        let mut soft = SoftBoundary::new(Pin::new("1234"));
        soft.open_session().unwrap();
        soft.login(&Pin::new("1234")).unwrap();
        soft
    }

    fn aes_template(sensitive: bool) -> SecretKeyTemplate {
        SecretKeyTemplate {
            bits: 256,
            token: false,
            extractable: true,
            sensitive,
            wrap: true,
            encrypt: true,
        }
    }

    #[test]
    fn test_wrong_pin_rejected() {
        let mut soft = SoftBoundary::new(Pin::new("1234"));
        soft.open_session().unwrap();
        let err = soft.login(&Pin::new("0000")).unwrap_err();
        assert_eq!(err.to_string(), "boundary error: CKR_PIN_INCORRECT");
    }

    #[test]
    fn test_no_token() {
        let mut soft = SoftBoundary::new(Pin::new("1234")).without_token();
        assert!(soft.open_session().is_err());
    }

    #[test]
    fn test_operations_require_login() {
        let mut soft = SoftBoundary::new(Pin::new("1234"));
        soft.open_session().unwrap();
        let err = soft.generate_secret_key(&aes_template(true)).unwrap_err();
        assert_eq!(err.to_string(), "boundary error: CKR_USER_NOT_LOGGED_IN");
    }

    #[test]
    fn test_sensitive_value_not_readable() {
        let mut soft = logged_in();
        let sensitive = soft.generate_secret_key(&aes_template(true)).unwrap();
        let readable = soft.generate_secret_key(&aes_template(false)).unwrap();
        assert!(soft.secret_value(sensitive).is_err());
        assert_eq!(soft.secret_value(readable).unwrap().len(), 32);
    }

    #[test]
    fn test_kwp_wrap_of_secret_roundtrips() {
        let mut soft = logged_in();
        let kek = soft.generate_secret_key(&aes_template(false)).unwrap();
        let target = soft.generate_secret_key(&aes_template(false)).unwrap();

        let wrapped = soft
            .wrap_key(&WrapMechanism::AesKeyWrapPad, kek, target)
            .unwrap();
        let kek_value = soft.secret_value(kek).unwrap();
        let target_value = soft.secret_value(target).unwrap();
        assert_eq!(kwp::unwrap(&kek_value, &wrapped).unwrap(), target_value);
    }

    #[test]
    fn test_unknown_vendor_mechanism_rejected() {
        let mut soft = logged_in().with_vendor_kwp(0x8000_0171);
        let kek = soft.generate_secret_key(&aes_template(true)).unwrap();
        let target = soft.generate_secret_key(&aes_template(true)).unwrap();

        assert!(soft
            .wrap_key(&WrapMechanism::VendorDefined(0x8000_0171), kek, target)
            .is_ok());
        let err = soft
            .wrap_key(&WrapMechanism::VendorDefined(0x8000_0999), kek, target)
            .unwrap_err();
        assert!(matches!(err, ByokError::Wrap(_)));
    }

    #[test]
    fn test_close_session_drops_session_objects() {
        let mut soft = logged_in();
        let handle = soft.generate_secret_key(&aes_template(true)).unwrap();
        soft.close_session().unwrap();
        assert!(!soft.contains(handle));
        assert_eq!(soft.journal().count(|c| *c == BoundaryCall::CloseSession), 1);
    }
}
