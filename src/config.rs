//! Run configuration.
//!
//! [`EscrowConfig`] is the single value object that selects the module, the
//! credential, the AES-KWP mechanism variant and the unsafe local-wrap
//! opt-in. It is loaded from JSON and passed explicitly to the orchestrator;
//! nothing in the crate reads ambient settings.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::boundary::WrapMechanism;
use crate::error::{ByokError, Result};

/// Environment variable that overrides the PIN from the config file.
pub const PIN_ENV_VAR: &str = "BYOK_HSM_PIN";

/// Vendor-defined AES-KWP code used by HSMs that do not expose
/// `CKM_AES_KEY_WRAP_PAD` under its standard number.
pub const DEFAULT_VENDOR_KWP_CODE: u64 = 0x8000_0171;

/// A boundary login credential. Zeroised on drop and never printed.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Pin(String);

impl Pin {
    pub fn new(pin: impl Into<String>) -> Self {
        Self(pin.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(<redacted>)")
    }
}

/// Which identifier to use for the AES-KWP private-key wrap.
///
/// Selected up front by the operator; never auto-detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KwpMechanism {
    /// The vendor-neutral `CKM_AES_KEY_WRAP_PAD`.
    #[default]
    Standard,
    /// A vendor-specific numeric mechanism code.
    Vendor(u64),
}

impl KwpMechanism {
    pub fn vendor_default() -> Self {
        Self::Vendor(DEFAULT_VENDOR_KWP_CODE)
    }

    pub fn mechanism(&self) -> WrapMechanism {
        match self {
            Self::Standard => WrapMechanism::AesKeyWrapPad,
            Self::Vendor(code) => WrapMechanism::VendorDefined(*code),
        }
    }
}

fn default_module_name() -> String {
    "PKCS#11 module".to_string()
}

/// Everything one escrow run needs to know.
#[derive(Debug, Clone, Deserialize)]
pub struct EscrowConfig {
    /// Path of the PKCS#11 shared library.
    pub module_path: PathBuf,
    /// Display name of the module, used in logs only.
    #[serde(default = "default_module_name")]
    pub module_name: String,
    /// Index into the list of slots that have a token present.
    #[serde(default)]
    pub slot_index: usize,
    pub pin: Pin,
    #[serde(default)]
    pub kwp_mechanism: KwpMechanism,
    /// Allow the host-side OAEP wrap of the intermediate key when the
    /// boundary cannot do it. Exposes the intermediate key outside the HSM.
    #[serde(default)]
    pub unsafe_local_oaep: bool,
    /// PEM file holding the recipient's RSA public key.
    pub recipient_key_path: PathBuf,
    pub wrapped_intermediate_path: PathBuf,
    pub wrapped_private_key_path: PathBuf,
    /// Optional JSON-lines audit file.
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

impl EscrowConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ByokError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file, apply environment overrides and validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ByokError::io(path, e))?;
        let mut config: Self =
            serde_json::from_str(&text).map_err(|e| ByokError::Config(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Replace the PIN with `BYOK_HSM_PIN` when it is set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(pin) = std::env::var(PIN_ENV_VAR) {
            self.pin = Pin::new(pin);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.module_path.as_os_str().is_empty() {
            return Err(ByokError::Config("module_path is empty".into()));
        }
        if self.pin.is_empty() {
            return Err(ByokError::Config("pin is empty".into()));
        }
        if self.wrapped_intermediate_path == self.wrapped_private_key_path {
            return Err(ByokError::Config(
                "wrapped_intermediate_path and wrapped_private_key_path must differ".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "module_path": "/usr/lib/softhsm/libsofthsm2.so",
        "pin": "1234",
        "recipient_key_path": "kek.pem",
        "wrapped_intermediate_path": "out/intermediate.b64",
        "wrapped_private_key_path": "out/private.b64"
    }"#;

    #[test]
    fn test_defaults() {
        let config = EscrowConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(config.kwp_mechanism, KwpMechanism::Standard);
        assert!(!config.unsafe_local_oaep);
        assert_eq!(config.slot_index, 0);
        assert_eq!(config.pin.expose(), "1234");
        assert!(config.audit_log_path.is_none());
    }

    #[test]
    fn test_vendor_mechanism_parses() {
        let text = MINIMAL.replace(
            r#""pin": "1234","#,
            r#""pin": "1234", "kwp_mechanism": {"vendor": 2147484017}, "unsafe_local_oaep": true,"#,
        );
        let config = EscrowConfig::from_json_str(&text).unwrap();
        assert_eq!(config.kwp_mechanism, KwpMechanism::vendor_default());
        assert_eq!(
            config.kwp_mechanism.mechanism(),
            WrapMechanism::VendorDefined(0x8000_0171)
        );
        assert!(config.unsafe_local_oaep);
    }

    #[test]
    fn test_same_output_paths_rejected() {
        let text = MINIMAL.replace("out/private.b64", "out/intermediate.b64");
        let err = EscrowConfig::from_json_str(&text).unwrap_err();
        assert!(matches!(err, ByokError::Config(_)));
    }

    #[test]
    fn test_empty_pin_rejected() {
        let text = MINIMAL.replace(r#""pin": "1234""#, r#""pin": """#);
        assert!(EscrowConfig::from_json_str(&text).is_err());
    }

    #[test]
    fn test_pin_debug_is_redacted() {
        let pin = Pin::new("secret-pin");
        assert_eq!(format!("{:?}", pin), "Pin(<redacted>)");
    }
}
