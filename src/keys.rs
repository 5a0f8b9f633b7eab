//! Key generation inside the secure boundary.
//!
//! This module owns the two key-creation requests of the protocol and the
//! types that carry their results:
//! 1. The 256-bit AES intermediate key, session-scoped and destroyed at the
//!    end of the run.
//! 2. The 2048-bit RSA user key pair (public exponent 3), token-resident and
//!    labelled with a timestamp-derived identifier.
//!
//! Neither type is `Clone`. An [`IntermediateKey`] is consumed by the single
//! private-key wrap it exists for.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::boundary::{KeyPairTemplate, ObjectHandle, SecretKeyTemplate, SecureBoundary};
use crate::error::Result;

/// Intermediate key length in bits.
pub const INTERMEDIATE_KEY_BITS: usize = 256;

/// User key pair modulus length in bits.
pub const USER_KEY_BITS: usize = 2048;

/// User key pair public exponent, big-endian.
pub const USER_KEY_PUBLIC_EXPONENT: [u8; 1] = [0x03];

const LABEL_PREFIX: &str = "byok-";

/// Last millisecond value handed out by [`KeyLabel::now`] in this process.
static LAST_ISSUED_MILLIS: AtomicI64 = AtomicI64::new(i64::MIN);

// ---------------------------------------------------------------------------
// Label
// ---------------------------------------------------------------------------

/// Label and id of a user key pair, derived from its creation time.
///
/// ```text
/// label = "byok-<unix millis>"
/// id    = "<unix millis>" (ASCII)
/// ```
///
/// Within one process [`KeyLabel::now`] never repeats a value: a second call
/// in the same millisecond takes the next one. Separate processes creating
/// pairs on one token in the same millisecond still collide, and the second
/// generation is refused by the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyLabel {
    label: String,
    id: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl KeyLabel {
    pub fn now() -> Self {
        let now = Utc::now();
        let wall = now.timestamp_millis();
        let next = |last: i64| wall.max(last.saturating_add(1));
        let previous = LAST_ISSUED_MILLIS
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)))
            .unwrap_or_else(|last| last);
        Self::with_millis(next(previous), now)
    }

    pub fn at(created_at: DateTime<Utc>) -> Self {
        Self::with_millis(created_at.timestamp_millis(), created_at)
    }

    fn with_millis(millis: i64, created_at: DateTime<Utc>) -> Self {
        let millis = millis.to_string();
        Self {
            label: format!("{}{}", LABEL_PREFIX, millis),
            id: millis.into_bytes(),
            created_at,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl std::fmt::Display for KeyLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label)
    }
}

// ---------------------------------------------------------------------------
// Intermediate key
// ---------------------------------------------------------------------------

/// The AES key that wraps the user private key.
#[derive(Debug)]
pub struct IntermediateKey {
    handle: ObjectHandle,
    readable: bool,
}

impl IntermediateKey {
    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    /// Whether the boundary will release this key's value (non-sensitive).
    pub fn is_readable(&self) -> bool {
        self.readable
    }
}

/// Generate the intermediate key.
///
/// `readable` marks the key non-sensitive so the unsafe local wrap can read
/// its value. It is only ever set when that path has been opted into.
pub fn create_intermediate_key<B: SecureBoundary + ?Sized>(
    boundary: &mut B,
    readable: bool,
) -> Result<IntermediateKey> {
    let template = SecretKeyTemplate {
        bits: INTERMEDIATE_KEY_BITS,
        token: false,
        extractable: true,
        sensitive: !readable,
        wrap: true,
        encrypt: true,
    };
    let handle = boundary.generate_secret_key(&template)?;
    debug!(%handle, readable, "intermediate key generated");
    Ok(IntermediateKey { handle, readable })
}

// ---------------------------------------------------------------------------
// User key pair
// ---------------------------------------------------------------------------

/// The token-resident RSA pair whose private half is exported.
#[derive(Debug)]
pub struct UserKeyPair {
    pub label: KeyLabel,
    pub public: ObjectHandle,
    pub private: ObjectHandle,
}

/// Generate the user key pair under `label`.
pub fn create_user_key_pair<B: SecureBoundary + ?Sized>(
    boundary: &mut B,
    label: KeyLabel,
) -> Result<UserKeyPair> {
    let template = KeyPairTemplate {
        modulus_bits: USER_KEY_BITS,
        public_exponent: USER_KEY_PUBLIC_EXPONENT.to_vec(),
        label: label.label().as_bytes().to_vec(),
        id: label.id().to_vec(),
        token: true,
        private_extractable: true,
    };
    let handles = boundary.generate_key_pair(&template)?;
    info!(label = %label, "user key pair generated");
    Ok(UserKeyPair {
        label,
        public: handles.public,
        private: handles.private,
    })
}
