//! PKCS#11 secure boundary.
//!
//! Drives a vendor module through cryptoki. Handles returned to the protocol
//! are local indices into a table of cryptoki object handles, so nothing
//! outside this module depends on cryptoki types.

use std::collections::HashMap;
use std::path::Path;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsOaepParams, PkcsOaepSource};
use cryptoki::mechanism::vendor_defined::VendorDefinedMechanism;
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::boundary::{
    KeyPairHandles, KeyPairTemplate, ObjectHandle, PublicKeyTemplate, SecretKeyTemplate,
    SecureBoundary, WrapMechanism,
};
use crate::config::{EscrowConfig, Pin};
use crate::error::{ByokError, Result};

fn boundary_err(context: &str, e: cryptoki::error::Error) -> ByokError {
    ByokError::Boundary(format!("{}: {}", context, e))
}

/// A loaded and initialised PKCS#11 module with at most one open session.
pub struct Pkcs11Boundary {
    name: String,
    pkcs11: Option<Pkcs11>,
    slot_index: usize,
    session: Option<Session>,
    next_handle: u64,
    objects: HashMap<ObjectHandle, cryptoki::object::ObjectHandle>,
}

impl Pkcs11Boundary {
    /// Load the module at `path` and initialise it.
    pub fn load(path: impl AsRef<Path>, name: &str, slot_index: usize) -> Result<Self> {
        let path = path.as_ref();
        info!(module = name, path = %path.display(), "loading PKCS#11 module");
        let pkcs11 = Pkcs11::new(path).map_err(|e| boundary_err("load module", e))?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| boundary_err("initialize module", e))?;
        Ok(Self {
            name: name.to_string(),
            pkcs11: Some(pkcs11),
            slot_index,
            session: None,
            next_handle: 1,
            objects: HashMap::new(),
        })
    }

    pub fn from_config(config: &EscrowConfig) -> Result<Self> {
        Self::load(&config.module_path, &config.module_name, config.slot_index)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> Result<&Pkcs11> {
        self.pkcs11
            .as_ref()
            .ok_or_else(|| ByokError::Boundary("module already finalized".into()))
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| ByokError::Boundary("no open session".into()))
    }

    fn slot(&self) -> Result<Slot> {
        let slots = self
            .context()?
            .get_slots_with_token()
            .map_err(|e| boundary_err("enumerate slots", e))?;
        slots.get(self.slot_index).copied().ok_or_else(|| {
            ByokError::Boundary(format!(
                "no slot with a token present at index {}",
                self.slot_index
            ))
        })
    }

    fn register(&mut self, handle: cryptoki::object::ObjectHandle) -> ObjectHandle {
        let local = ObjectHandle::new(self.next_handle);
        self.next_handle += 1;
        self.objects.insert(local, handle);
        local
    }

    fn resolve(&self, handle: ObjectHandle) -> Result<cryptoki::object::ObjectHandle> {
        self.objects
            .get(&handle)
            .copied()
            .ok_or_else(|| ByokError::Boundary(format!("unknown object handle {}", handle)))
    }
}

fn mechanism_for(mechanism: &WrapMechanism) -> Result<Mechanism<'static>> {
    match mechanism {
        WrapMechanism::AesKeyWrapPad => Ok(Mechanism::AesKeyWrapPad),
        WrapMechanism::VendorDefined(code) => {
            // Passed to C_WrapKey as is, with no mechanism parameter.
            let ty = MechanismType::new_vendor_defined(*code as _)
                .map_err(|e| ByokError::Wrap(format!("{}: {}", mechanism, e)))?;
            Ok(Mechanism::VendorDefined(VendorDefinedMechanism::new::<()>(
                ty, None,
            )))
        }
        WrapMechanism::RsaOaepSha256 => Ok(Mechanism::RsaPkcsOaep(PkcsOaepParams::new(
            MechanismType::SHA256,
            PkcsMgfType::MGF1_SHA256,
            PkcsOaepSource::empty(),
        ))),
    }
}

impl SecureBoundary for Pkcs11Boundary {
    fn open_session(&mut self) -> Result<()> {
        let slot = self.slot()?;
        let session = self
            .context()?
            .open_rw_session(slot)
            .map_err(|e| boundary_err("open session", e))?;
        debug!(module = %self.name, ?slot, "session opened");
        self.session = Some(session);
        Ok(())
    }

    fn login(&mut self, pin: &Pin) -> Result<()> {
        self.session()?
            .login(UserType::User, Some(&AuthPin::from(pin.expose().to_string())))
            .map_err(|e| boundary_err("login", e))
    }

    fn generate_secret_key(&mut self, template: &SecretKeyTemplate) -> Result<ObjectHandle> {
        let attributes = vec![
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(KeyType::AES),
            Attribute::ValueLen(((template.bits / 8) as u64).into()),
            Attribute::Token(template.token),
            Attribute::Extractable(template.extractable),
            Attribute::Sensitive(template.sensitive),
            Attribute::Wrap(template.wrap),
            Attribute::Encrypt(template.encrypt),
        ];
        let handle = self
            .session()?
            .generate_key(&Mechanism::AesKeyGen, &attributes)
            .map_err(|e| boundary_err("generate AES key", e))?;
        Ok(self.register(handle))
    }

    fn generate_key_pair(&mut self, template: &KeyPairTemplate) -> Result<KeyPairHandles> {
        let public_template = vec![
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::KeyType(KeyType::RSA),
            Attribute::Token(template.token),
            Attribute::ModulusBits((template.modulus_bits as u64).into()),
            Attribute::PublicExponent(template.public_exponent.clone()),
            Attribute::Label(template.label.clone()),
            Attribute::Id(template.id.clone()),
        ];
        let private_template = vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::KeyType(KeyType::RSA),
            Attribute::Token(template.token),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(template.private_extractable),
            Attribute::Label(template.label.clone()),
            Attribute::Id(template.id.clone()),
        ];
        let (public, private) = self
            .session()?
            .generate_key_pair(
                &Mechanism::RsaPkcsKeyPairGen,
                &public_template,
                &private_template,
            )
            .map_err(|e| boundary_err("generate RSA key pair", e))?;
        Ok(KeyPairHandles {
            public: self.register(public),
            private: self.register(private),
        })
    }

    fn create_public_key(&mut self, template: &PublicKeyTemplate) -> Result<ObjectHandle> {
        let attributes = vec![
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::KeyType(KeyType::RSA),
            Attribute::Token(template.token),
            Attribute::Modulus(template.modulus.clone()),
            Attribute::PublicExponent(template.public_exponent.clone()),
            Attribute::Wrap(template.wrap),
            Attribute::Encrypt(template.encrypt),
        ];
        let handle = self
            .session()?
            .create_object(&attributes)
            .map_err(|e| boundary_err("create public key", e))?;
        Ok(self.register(handle))
    }

    fn wrap_key(
        &mut self,
        mechanism: &WrapMechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> Result<Vec<u8>> {
        let ck_mechanism = mechanism_for(mechanism)?;
        let wrapping_key = self.resolve(wrapping_key)?;
        let key = self.resolve(key)?;
        self.session()?
            .wrap_key(&ck_mechanism, wrapping_key, key)
            .map_err(|e| ByokError::Wrap(format!("{}: {}", mechanism, e)))
    }

    fn secret_value(&mut self, key: ObjectHandle) -> Result<Zeroizing<Vec<u8>>> {
        let handle = self.resolve(key)?;
        let attributes = self
            .session()?
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(|e| boundary_err("read key value", e))?;
        attributes
            .into_iter()
            .find_map(|attr| match attr {
                Attribute::Value(bytes) => Some(Zeroizing::new(bytes)),
                _ => None,
            })
            .ok_or_else(|| ByokError::Boundary("key value not available".into()))
    }

    fn destroy_object(&mut self, handle: ObjectHandle) -> Result<()> {
        let ck_handle = self.resolve(handle)?;
        self.session()?
            .destroy_object(ck_handle)
            .map_err(|e| boundary_err("destroy object", e))?;
        self.objects.remove(&handle);
        Ok(())
    }

    fn logout(&mut self) -> Result<()> {
        self.session()?
            .logout()
            .map_err(|e| boundary_err("logout", e))
    }

    fn close_session(&mut self) -> Result<()> {
        // Dropping the session closes it.
        self.session
            .take()
            .map(drop)
            .ok_or_else(|| ByokError::Boundary("no open session".into()))
    }

    fn finalize(&mut self) -> Result<()> {
        self.session = None;
        self.objects.clear();
        let pkcs11 = self
            .pkcs11
            .take()
            .ok_or_else(|| ByokError::Boundary("module already finalized".into()))?;
        // Dropping the last context reference calls C_Finalize.
        drop(pkcs11);
        info!(module = %self.name, "PKCS#11 module released");
        Ok(())
    }
}
