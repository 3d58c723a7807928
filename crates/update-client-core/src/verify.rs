//! Signature-threshold verification of signed metadata envelopes.
//!
//! An envelope is trusted for a role when enough distinct, authorised keys
//! have signed the canonical encoding of its payload, the payload version
//! has not gone backwards, and the document has not expired. Expiry is
//! evaluated against an explicit timestamp so callers control the time
//! source instead of relying on process-global state.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature as RawSignature, Verifier as _};
use thiserror::Error;

use crate::keys::{KeyDb, KeyId, RoleSpec, KEY_TYPE_ED25519};
use crate::meta::{Envelope, MetaHeader, RoleDocument, RoleType};

/// Source of the current wall-clock time used for expiry checks.
pub trait Clock: fmt::Debug + Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a fixed instant, for deterministic expiry behaviour.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Why an envelope failed verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed metadata: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("wrong metadata type: want {want}, got {got}")]
    WrongType { want: RoleType, got: RoleType },
    #[error("role {role} is not in the key database")]
    UnknownRole { role: RoleType },
    #[error("valid signatures did not meet threshold: want {want}, got {got}")]
    RoleThreshold { want: u32, got: u32 },
    #[error("version {got} is lower than the stored version {min}")]
    LowVersion { got: u64, min: u64 },
    #[error("metadata expired at {at}")]
    Expired { at: DateTime<Utc> },
}

/// Fully verifies an envelope for role `T` against the key database.
///
/// Checks run in a fixed order: payload decode, type tag, role binding
/// lookup, signature counting against the role threshold, version floor
/// (strictly lower than `min_version` is rejected), and finally expiry at
/// `now`. Returns the decoded role document on success.
pub fn verify<T: RoleDocument>(
    envelope: &Envelope,
    min_version: u64,
    db: &KeyDb,
    now: DateTime<Utc>,
) -> Result<T, VerifyError> {
    verify_inner(envelope, min_version, db, Some(now))
}

/// Verifies an envelope that originated from local storage.
///
/// Identical to [`verify`] except that expiry is not checked: local state
/// may be stale but is still the last trusted point.
pub fn verify_trusted<T: RoleDocument>(
    envelope: &Envelope,
    min_version: u64,
    db: &KeyDb,
) -> Result<T, VerifyError> {
    verify_inner(envelope, min_version, db, None)
}

fn verify_inner<T: RoleDocument>(
    envelope: &Envelope,
    min_version: u64,
    db: &KeyDb,
    now: Option<DateTime<Utc>>,
) -> Result<T, VerifyError> {
    let header: MetaHeader = serde_json::from_value(envelope.signed.clone())?;
    if header.typ != T::TYPE {
        return Err(VerifyError::WrongType {
            want: T::TYPE,
            got: header.typ,
        });
    }
    let doc: T = serde_json::from_value(envelope.signed.clone())?;

    let role = db
        .role(T::TYPE)
        .ok_or(VerifyError::UnknownRole { role: T::TYPE })?;
    let counted = count_signatures(envelope, role, db)?;
    if counted < role.threshold {
        return Err(VerifyError::RoleThreshold {
            want: role.threshold,
            got: counted,
        });
    }

    if doc.version() < min_version {
        return Err(VerifyError::LowVersion {
            got: doc.version(),
            min: min_version,
        });
    }
    if let Some(now) = now {
        if header.expires <= now {
            return Err(VerifyError::Expired { at: header.expires });
        }
    }
    Ok(doc)
}

/// Counts the signatures that verify for the role.
///
/// A signature counts iff its key id is authorised for the role, the key
/// is present in the database, the signature value verifies against the
/// canonical payload, and no earlier counted signature used the same key
/// id. Signatures that fail any condition are skipped, not fatal.
fn count_signatures(
    envelope: &Envelope,
    role: &RoleSpec,
    db: &KeyDb,
) -> Result<u32, VerifyError> {
    let message = envelope.canonical_payload()?;
    let mut seen: HashSet<&KeyId> = HashSet::new();
    let mut counted = 0u32;
    for sig in &envelope.signatures {
        if sig.method != KEY_TYPE_ED25519 {
            continue;
        }
        if !role.has_key(&sig.keyid) || seen.contains(&sig.keyid) {
            continue;
        }
        let Some(key) = db.key(&sig.keyid) else {
            continue;
        };
        let Ok(verifying_key) = key.verifying_key() else {
            continue;
        };
        let Ok(raw) = hex::decode(&sig.sig) else {
            continue;
        };
        let Ok(signature) = RawSignature::from_slice(&raw) else {
            continue;
        };
        if verifying_key.verify(&message, &signature).is_ok() {
            seen.insert(&sig.keyid);
            counted += 1;
        }
    }
    Ok(counted)
}
