//! Public keys, key fingerprints, and the trusted key database.
//!
//! The key database is the authority consulted during signature
//! verification: it holds the key set and the role bindings of the root
//! document currently believed authoritative, and it is replaced wholesale
//! whenever a new root is installed.

use std::collections::HashMap;
use std::fmt;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::meta::{canonical_bytes, Root, RoleType};

/// Key type tag for Ed25519 keys, the only scheme this crate recognises.
pub const KEY_TYPE_ED25519: &str = "ed25519";

/// Deterministic fingerprint of a public key: the SHA-256 digest of the
/// key's canonical JSON encoding, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Returns the fingerprint as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for KeyId {
    fn from(value: String) -> Self {
        KeyId(value)
    }
}

impl From<&str> for KeyId {
    fn from(value: &str) -> Self {
        KeyId(value.to_string())
    }
}

/// Public key material carried inside a [`Key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    /// Hex-encoded raw public key bytes.
    pub public: String,
}

/// A public key as it appears in root metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Signature scheme tag, e.g. `ed25519`.
    pub keytype: String,
    /// The key material.
    pub keyval: KeyVal,
}

impl Key {
    /// Wraps a raw Ed25519 verifying key in its wire representation.
    pub fn ed25519(key: &VerifyingKey) -> Self {
        Key {
            keytype: KEY_TYPE_ED25519.to_string(),
            keyval: KeyVal {
                public: hex::encode(key.to_bytes()),
            },
        }
    }

    /// Derives this key's fingerprint from its canonical encoding.
    pub fn key_id(&self) -> Result<KeyId, KeyError> {
        let bytes = canonical_bytes(self).map_err(KeyError::Encode)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(KeyId(hex::encode(hasher.finalize())))
    }

    /// Decodes the key material into a usable Ed25519 verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        if self.keytype != KEY_TYPE_ED25519 {
            return Err(KeyError::UnsupportedKeyType {
                keytype: self.keytype.clone(),
            });
        }
        let bytes = hex::decode(&self.keyval.public).map_err(|_| KeyError::InvalidKey)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidKey)
    }
}

/// Which key ids may sign a role, and how many distinct signers must.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Key ids authorised for the role.
    #[serde(rename = "keyids")]
    pub key_ids: Vec<KeyId>,
    /// Minimum number of distinct valid signatures required.
    pub threshold: u32,
}

impl RoleSpec {
    /// Returns whether the given key id is authorised for this role.
    pub fn has_key(&self, id: &KeyId) -> bool {
        self.key_ids.iter().any(|k| k == id)
    }
}

/// Errors raised while building or querying the key database.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key id {got} does not match fingerprint {want}")]
    WrongKeyId { got: KeyId, want: KeyId },
    #[error("role {role} declares threshold 0")]
    InvalidThreshold { role: RoleType },
    #[error("role {role} references unknown key id {id}")]
    UnknownKeyId { role: RoleType, id: KeyId },
    #[error("unsupported key type {keytype:?}")]
    UnsupportedKeyType { keytype: String },
    #[error("invalid public key material")]
    InvalidKey,
    #[error("key encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// The trusted key set and role bindings currently believed authoritative.
///
/// Built from a root document (or, during `init`, from caller-supplied
/// keys) and never mutated incrementally from outside the root
/// installation path.
#[derive(Debug, Clone, Default)]
pub struct KeyDb {
    keys: HashMap<KeyId, Key>,
    roles: HashMap<RoleType, RoleSpec>,
}

impl KeyDb {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a database holding exactly the keys and role bindings of the
    /// given root document.
    pub fn from_root(root: &Root) -> Result<Self, KeyError> {
        let mut db = KeyDb::new();
        for (id, key) in &root.keys {
            db.add_key(id.clone(), key.clone())?;
        }
        for (role, spec) in &root.roles {
            db.add_role(*role, spec.clone())?;
        }
        Ok(db)
    }

    /// Records a key under its id. The id must match the key's fingerprint.
    pub fn add_key(&mut self, id: KeyId, key: Key) -> Result<(), KeyError> {
        let want = key.key_id()?;
        if id != want {
            return Err(KeyError::WrongKeyId { got: id, want });
        }
        self.keys.insert(id, key);
        Ok(())
    }

    /// Records the key binding for a role.
    ///
    /// The threshold must be at least one and every referenced key id must
    /// already be present in the database.
    pub fn add_role(&mut self, role: RoleType, spec: RoleSpec) -> Result<(), KeyError> {
        if spec.threshold < 1 {
            return Err(KeyError::InvalidThreshold { role });
        }
        for id in &spec.key_ids {
            if !self.keys.contains_key(id) {
                return Err(KeyError::UnknownKeyId {
                    role,
                    id: id.clone(),
                });
            }
        }
        self.roles.insert(role, spec);
        Ok(())
    }

    /// Looks up a key by id.
    pub fn key(&self, id: &KeyId) -> Option<&Key> {
        self.keys.get(id)
    }

    /// Looks up the binding for a role.
    pub fn role(&self, role: RoleType) -> Option<&RoleSpec> {
        self.roles.get(&role)
    }
}
