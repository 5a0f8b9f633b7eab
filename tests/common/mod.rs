//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use byok_escrow::config::{EscrowConfig, KwpMechanism, Pin};
use byok_escrow::persist;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;
use tempfile::TempDir;

pub const PIN: &str = "1234";

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// The private half of `recipient_2048.pub.pem`.
pub fn recipient_private_key() -> RsaPrivateKey {
    let pem = std::fs::read_to_string(fixture("recipient_2048.key.pem")).unwrap();
    RsaPrivateKey::from_pkcs8_pem(&pem).unwrap()
}

/// A config that writes into `dir` and reads the 2048-bit recipient fixture.
pub fn config_in(dir: &TempDir) -> EscrowConfig {
    EscrowConfig {
        module_path: PathBuf::from("in-process"),
        module_name: "soft".to_string(),
        slot_index: 0,
        pin: Pin::new(PIN),
        kwp_mechanism: KwpMechanism::Standard,
        unsafe_local_oaep: false,
        recipient_key_path: fixture("recipient_2048.pub.pem"),
        wrapped_intermediate_path: dir.path().join("intermediate.b64"),
        wrapped_private_key_path: dir.path().join("private.b64"),
        audit_log_path: None,
    }
}

pub fn read_blob(path: &Path) -> Vec<u8> {
    let text = std::fs::read_to_string(path).unwrap();
    persist::decode(&text).unwrap().into_vec()
}

/// Recover the intermediate key value the way the recipient would.
pub fn recover_intermediate(config: &EscrowConfig) -> Vec<u8> {
    let wrapped = read_blob(&config.wrapped_intermediate_path);
    recipient_private_key()
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .unwrap()
}

pub fn output_count(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).unwrap().count()
}
