//! byok-escrow: generate and wrap BYOK key material in a PKCS#11 HSM.
//!
//! Usage: `byok-escrow <config.json>`

use std::process::ExitCode;

use byok_escrow::EscrowConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "byok_escrow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("usage: byok-escrow <config.json>");
        return ExitCode::from(2);
    };

    let config = match EscrowConfig::from_json_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match byok_escrow::run_with_pkcs11(config) {
        Ok(outcome) => {
            println!("key pair:             {}", outcome.key_label);
            println!("intermediate wrapped: {}", outcome.intermediate_wrap_path);
            println!(
                "wrapped intermediate: {}",
                outcome.wrapped_intermediate_path.display()
            );
            println!(
                "wrapped private key:  {}",
                outcome.wrapped_private_key_path.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("escrow failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
