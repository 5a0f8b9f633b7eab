//! Minimal example: one escrow run against the in-process boundary.
//!
//! Generates the key material, double-wraps it for a recipient key, writes
//! both blobs and a JSON-lines audit trail into a temp directory, then plays
//! the recipient and unwraps everything again.
//! Run with: `cargo run --example soft_escrow_demo`

use std::path::PathBuf;

use byok_escrow::audit::FileAuditSink;
use byok_escrow::config::{EscrowConfig, KwpMechanism, Pin};
use byok_escrow::{kwp, persist, Escrow, SoftBoundary};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;

const RECIPIENT_PUBLIC: &str = include_str!("../tests/fixtures/recipient_2048.pub.pem");
const RECIPIENT_PRIVATE: &str = include_str!("../tests/fixtures/recipient_2048.key.pem");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "byok_escrow=info".into()),
        )
        .init();

    // 1. Setup
    let out = std::env::temp_dir().join(format!("byok-escrow-demo-{}", std::process::id()));
    std::fs::create_dir_all(&out)?;
    let recipient_path = out.join("recipient.pub.pem");
    std::fs::write(&recipient_path, RECIPIENT_PUBLIC)?;

    let config = EscrowConfig {
        module_path: PathBuf::from("in-process"),
        module_name: "soft boundary".into(),
        slot_index: 0,
        pin: Pin::new("1234"),
        kwp_mechanism: KwpMechanism::Standard,
        unsafe_local_oaep: false,
        recipient_key_path: recipient_path,
        wrapped_intermediate_path: out.join("intermediate.b64"),
        wrapped_private_key_path: out.join("private.b64"),
        audit_log_path: Some(out.join("audit.jsonl")),
    };
    config.validate()?;

    // 2. Run
    let mut boundary = SoftBoundary::new(Pin::new("1234"));
    let mut escrow = Escrow::new(config.clone());
    if let Some(path) = &config.audit_log_path {
        escrow.add_audit_sink(Box::new(FileAuditSink::new(path)?));
    }
    let outcome = escrow.run(&mut boundary)?;
    println!("Created key pair {}", outcome.key_label);
    println!("Intermediate wrapped by: {}", outcome.intermediate_wrap_path);

    // 3. Recipient side: OAEP first, then KWP
    let recipient = RsaPrivateKey::from_pkcs8_pem(RECIPIENT_PRIVATE)?;
    let wrapped = persist::decode(&std::fs::read_to_string(&config.wrapped_intermediate_path)?)?;
    let intermediate = recipient.decrypt(Oaep::new::<Sha256>(), wrapped.as_bytes())?;

    let wrapped = persist::decode(&std::fs::read_to_string(&config.wrapped_private_key_path)?)?;
    let private_der = kwp::unwrap(&intermediate, wrapped.as_bytes())?;
    let private = RsaPrivateKey::from_pkcs8_der(&private_der)?;
    println!("Recipient recovered a {}-bit private key", private.size() * 8);

    // 4. Audit log
    println!("Audit log: {} record(s)", escrow.audit_log().len());
    for record in escrow.audit_log().iter() {
        println!("  {:?} @ {}", record.event, record.timestamp);
    }
    println!("Output written to: {}", out.display());

    Ok(())
}
