//! Wire shapes for signed update metadata.
//!
//! Every document exchanged with a repository is a signed envelope: an
//! opaque payload plus a list of signatures over the payload's canonical
//! JSON encoding. Centralising the serde shapes here keeps the verifier,
//! the client state machine, and the test fixtures on one view of the
//! metadata.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use olpc_cjson::CanonicalFormatter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::keys::{Key, KeyId, RoleSpec};

/// Hash algorithm name used for all digests produced by this crate.
pub const SHA256: &str = "sha256";

/// The four top-level metadata roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    /// Sole bootstrap of trust; binds keys and thresholds to every role.
    Root,
    /// Lists every available target file with its length and hashes.
    Targets,
    /// Pins the current root and targets metadata by length and hash.
    Snapshot,
    /// Pins the current snapshot metadata; the freshness anchor.
    Timestamp,
}

impl RoleType {
    /// Returns the role name as it appears in the `_type` field.
    pub fn name(self) -> &'static str {
        match self {
            RoleType::Root => "root",
            RoleType::Targets => "targets",
            RoleType::Snapshot => "snapshot",
            RoleType::Timestamp => "timestamp",
        }
    }

    /// Returns the metadata file name for this role (`<role>.json`).
    pub fn meta_path(self) -> &'static str {
        match self {
            RoleType::Root => "root.json",
            RoleType::Targets => "targets.json",
            RoleType::Snapshot => "snapshot.json",
            RoleType::Timestamp => "timestamp.json",
        }
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single signature over a payload's canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Identifier of the key that produced this signature.
    pub keyid: KeyId,
    /// Signature scheme; only `ed25519` is recognised.
    pub method: String,
    /// Hex-encoded signature value.
    pub sig: String,
}

/// A signed metadata envelope: payload plus an ordered list of signatures.
///
/// The payload is kept as a raw JSON value so the bytes that were signed
/// can be reproduced exactly via [`Envelope::canonical_payload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The role document, as signed.
    pub signed: Value,
    /// Signatures over the canonical encoding of `signed`.
    pub signatures: Vec<Signature>,
}

impl Envelope {
    /// Parses an envelope from raw document bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Returns the canonical byte encoding of the payload, the exact input
    /// to signature verification.
    pub fn canonical_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        canonical_bytes(&self.signed)
    }
}

/// Serialises a value as canonical JSON (deterministic field ordering, no
/// insignificant whitespace), the byte-stable form used for hashing and
/// signing.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut data = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
    value.serialize(&mut ser)?;
    Ok(data)
}

/// Attributes shared by every role document, decoded leniently so the
/// verifier can report a type mismatch before attempting a full decode.
#[derive(Debug, Clone, Deserialize)]
pub struct MetaHeader {
    /// Role type tag.
    #[serde(rename = "_type")]
    pub typ: RoleType,
    /// Monotonically increasing document version.
    pub version: u64,
    /// Absolute expiry timestamp.
    pub expires: DateTime<Utc>,
}

/// Common accessors implemented by each concrete role document.
pub trait RoleDocument: serde::de::DeserializeOwned {
    /// The role this document kind belongs to.
    const TYPE: RoleType;

    /// The document version.
    fn version(&self) -> u64;
}

/// The root role document: the key and threshold bindings for all roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    #[serde(rename = "_type")]
    pub typ: RoleType,
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// Every key referenced by `roles`, addressed by fingerprint.
    pub keys: BTreeMap<KeyId, Key>,
    /// Role bindings: which key ids may sign each role, and how many must.
    pub roles: BTreeMap<RoleType, RoleSpec>,
}

impl RoleDocument for Root {
    const TYPE: RoleType = RoleType::Root;

    fn version(&self) -> u64 {
        self.version
    }
}

/// The timestamp role document, pinning the current snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "_type")]
    pub typ: RoleType,
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// File metadata keyed by metadata file name; carries `snapshot.json`.
    pub meta: BTreeMap<String, FileMeta>,
}

impl Timestamp {
    /// Returns the pinned snapshot metadata, if the document carries it.
    pub fn snapshot_meta(&self) -> Option<&FileMeta> {
        self.meta.get(RoleType::Snapshot.meta_path())
    }
}

impl RoleDocument for Timestamp {
    const TYPE: RoleType = RoleType::Timestamp;

    fn version(&self) -> u64 {
        self.version
    }
}

/// The snapshot role document, pinning the current root and targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "_type")]
    pub typ: RoleType,
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// File metadata keyed by metadata file name; carries `root.json` and
    /// `targets.json`.
    pub meta: BTreeMap<String, FileMeta>,
}

impl Snapshot {
    /// Returns the pinned root metadata, if the document carries it.
    pub fn root_meta(&self) -> Option<&FileMeta> {
        self.meta.get(RoleType::Root.meta_path())
    }

    /// Returns the pinned targets metadata, if the document carries it.
    pub fn targets_meta(&self) -> Option<&FileMeta> {
        self.meta.get(RoleType::Targets.meta_path())
    }
}

impl RoleDocument for Snapshot {
    const TYPE: RoleType = RoleType::Snapshot;

    fn version(&self) -> u64 {
        self.version
    }
}

/// The targets role document: the listing of every available target file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Targets {
    #[serde(rename = "_type")]
    pub typ: RoleType,
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// Mapping from target path to the metadata pinning its contents.
    pub targets: BTreeMap<String, FileMeta>,
}

impl RoleDocument for Targets {
    const TYPE: RoleType = RoleType::Targets;

    fn version(&self) -> u64 {
        self.version
    }
}

/// Length-and-hashes fingerprint of a byte blob, used to pin a download to
/// exactly the authenticated content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Exact byte length of the content.
    pub length: u64,
    /// Content digests keyed by algorithm, lowercase hex.
    pub hashes: BTreeMap<String, String>,
}

impl FileMeta {
    /// Computes the fingerprint of a byte slice using SHA-256.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let mut hashes = BTreeMap::new();
        hashes.insert(SHA256.to_string(), hex::encode(hasher.finalize()));
        FileMeta {
            length: bytes.len() as u64,
            hashes,
        }
    }
}

/// Why two [`FileMeta`] values failed to compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetaMismatch {
    #[error("wrong length: got {got}, want {want}")]
    WrongLength { got: u64, want: u64 },
    #[error("wrong {algorithm} hash")]
    WrongHash { algorithm: String },
    #[error("no common hash algorithm")]
    NoCommonHash,
}

/// Compares an observed fingerprint against an expected one.
///
/// Lengths must match and every algorithm present in both must carry the
/// same digest. Two fingerprints with no algorithm in common never compare
/// equal.
pub fn file_meta_equal(actual: &FileMeta, expected: &FileMeta) -> Result<(), MetaMismatch> {
    if actual.length != expected.length {
        return Err(MetaMismatch::WrongLength {
            got: actual.length,
            want: expected.length,
        });
    }
    let mut shared = 0usize;
    for (algorithm, want) in &expected.hashes {
        let Some(got) = actual.hashes.get(algorithm) else {
            continue;
        };
        shared += 1;
        if !got.eq_ignore_ascii_case(want) {
            return Err(MetaMismatch::WrongHash {
                algorithm: algorithm.clone(),
            });
        }
    }
    if shared == 0 {
        return Err(MetaMismatch::NoCommonHash);
    }
    Ok(())
}
