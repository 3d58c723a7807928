//! A miniature signing repository and a scriptable fake remote store.
//!
//! `TestRepo` produces a fully signed four-role metadata set so tests can
//! emulate a repository without reproducing signing logic inline.
//! `FakeRemote` serves those bytes and can be made to lie about sizes,
//! substitute stale documents, or stall mid-stream.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::{Signer as _, SigningKey};
use rand::rngs::OsRng;
use serde::Serialize;

use update_client_core::{
    canonical_bytes, Envelope, FileMeta, Key, KeyId, RemoteError, RemoteFile, RemoteStore,
    RoleSpec, RoleType, Root, Signature, Snapshot, Targets, Timestamp, KEY_TYPE_ED25519,
};

const ROLES: [RoleType; 4] = [
    RoleType::Root,
    RoleType::Targets,
    RoleType::Snapshot,
    RoleType::Timestamp,
];

/// An expiry comfortably in the future for freshly signed fixtures.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2035, 1, 1, 0, 0, 0).unwrap()
}

/// An expiry that has already passed.
pub fn long_past() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

/// A signing repository holding one key per role.
pub struct TestRepo {
    keys: BTreeMap<RoleType, SigningKey>,
    versions: BTreeMap<RoleType, u64>,
    expires: BTreeMap<RoleType, DateTime<Utc>>,
    target_files: BTreeMap<String, Vec<u8>>,
}

impl TestRepo {
    /// Creates a repository with fresh keys, every role at version 1, and
    /// no targets.
    pub fn new() -> Self {
        let mut keys = BTreeMap::new();
        let mut versions = BTreeMap::new();
        let mut expires = BTreeMap::new();
        for role in ROLES {
            keys.insert(role, SigningKey::generate(&mut OsRng));
            versions.insert(role, 1);
            expires.insert(role, far_future());
        }
        TestRepo {
            keys,
            versions,
            expires,
            target_files: BTreeMap::new(),
        }
    }

    /// Returns the out-of-band root keys a client would be initialised with.
    pub fn root_keys(&self) -> Vec<Key> {
        vec![Key::ed25519(&self.keys[&RoleType::Root].verifying_key())]
    }

    /// Returns the current key id for a role.
    pub fn key_id(&self, role: RoleType) -> KeyId {
        Key::ed25519(&self.keys[&role].verifying_key())
            .key_id()
            .unwrap()
    }

    /// Returns the current document version for a role.
    pub fn version(&self, role: RoleType) -> u64 {
        self.versions[&role]
    }

    /// Advances a role's document version by one.
    pub fn bump(&mut self, role: RoleType) {
        *self.versions.get_mut(&role).unwrap() += 1;
    }

    /// Overrides the expiry used when signing a role's document.
    pub fn set_expires(&mut self, role: RoleType, when: DateTime<Utc>) {
        self.expires.insert(role, when);
    }

    /// Adds or replaces a target, publishing new targets, snapshot, and
    /// timestamp documents.
    pub fn add_target(&mut self, path: &str, body: &[u8]) {
        self.target_files.insert(path.to_string(), body.to_vec());
        self.bump(RoleType::Targets);
        self.bump(RoleType::Snapshot);
        self.bump(RoleType::Timestamp);
    }

    /// Returns the raw target payloads served under `targets/`.
    pub fn target_files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.target_files
    }

    /// Replaces a role's key, publishing a new root and re-publishing the
    /// snapshot and timestamp chain. Returns the revoked key id.
    pub fn rotate_key(&mut self, role: RoleType) -> KeyId {
        let old = self.key_id(role);
        self.keys.insert(role, SigningKey::generate(&mut OsRng));
        self.bump(RoleType::Root);
        self.bump(RoleType::Snapshot);
        self.bump(RoleType::Timestamp);
        old
    }

    /// Generates the complete signed metadata set at the current state.
    pub fn meta(&self) -> BTreeMap<String, Vec<u8>> {
        let root_bytes = self.sign(&self.root_doc(), RoleType::Root);
        let targets_bytes = self.sign(&self.targets_doc(), RoleType::Targets);

        let mut snapshot_meta = BTreeMap::new();
        snapshot_meta.insert(
            RoleType::Root.meta_path().to_string(),
            FileMeta::of_bytes(&root_bytes),
        );
        snapshot_meta.insert(
            RoleType::Targets.meta_path().to_string(),
            FileMeta::of_bytes(&targets_bytes),
        );
        let snapshot = Snapshot {
            typ: RoleType::Snapshot,
            version: self.versions[&RoleType::Snapshot],
            expires: self.expires[&RoleType::Snapshot],
            meta: snapshot_meta,
        };
        let snapshot_bytes = self.sign(&snapshot, RoleType::Snapshot);

        let mut timestamp_meta = BTreeMap::new();
        timestamp_meta.insert(
            RoleType::Snapshot.meta_path().to_string(),
            FileMeta::of_bytes(&snapshot_bytes),
        );
        let timestamp = Timestamp {
            typ: RoleType::Timestamp,
            version: self.versions[&RoleType::Timestamp],
            expires: self.expires[&RoleType::Timestamp],
            meta: timestamp_meta,
        };
        let timestamp_bytes = self.sign(&timestamp, RoleType::Timestamp);

        let mut meta = BTreeMap::new();
        meta.insert(RoleType::Root.meta_path().to_string(), root_bytes);
        meta.insert(RoleType::Targets.meta_path().to_string(), targets_bytes);
        meta.insert(RoleType::Snapshot.meta_path().to_string(), snapshot_bytes);
        meta.insert(RoleType::Timestamp.meta_path().to_string(), timestamp_bytes);
        meta
    }

    fn root_doc(&self) -> Root {
        let mut keys = BTreeMap::new();
        let mut roles = BTreeMap::new();
        for role in ROLES {
            let key = Key::ed25519(&self.keys[&role].verifying_key());
            let id = key.key_id().unwrap();
            keys.insert(id.clone(), key);
            roles.insert(
                role,
                RoleSpec {
                    key_ids: vec![id],
                    threshold: 1,
                },
            );
        }
        Root {
            typ: RoleType::Root,
            version: self.versions[&RoleType::Root],
            expires: self.expires[&RoleType::Root],
            keys,
            roles,
        }
    }

    fn targets_doc(&self) -> Targets {
        Targets {
            typ: RoleType::Targets,
            version: self.versions[&RoleType::Targets],
            expires: self.expires[&RoleType::Targets],
            targets: self
                .target_files
                .iter()
                .map(|(path, body)| (path.clone(), FileMeta::of_bytes(body)))
                .collect(),
        }
    }

    /// Wraps a role document in a signed envelope.
    fn sign<T: Serialize>(&self, doc: &T, role: RoleType) -> Vec<u8> {
        let payload = serde_json::to_value(doc).unwrap();
        let message = canonical_bytes(&payload).unwrap();
        let signer = &self.keys[&role];
        let envelope = Envelope {
            signed: payload,
            signatures: vec![Signature {
                keyid: self.key_id(role),
                method: KEY_TYPE_ED25519.to_string(),
                sig: hex::encode(signer.sign(&message).to_bytes()),
            }],
        };
        serde_json::to_vec(&envelope).unwrap()
    }
}

struct FakeFile {
    body: Vec<u8>,
    announced: Option<u64>,
    blocking: bool,
    bytes_read: Arc<AtomicUsize>,
}

/// A shared, mutable in-memory remote store.
#[derive(Clone, Default)]
pub struct FakeRemote {
    files: Arc<Mutex<BTreeMap<String, FakeFile>>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a file, announcing its real length.
    pub fn set(&self, path: &str, body: Vec<u8>) {
        let announced = Some(body.len() as u64);
        self.files.lock().unwrap().insert(
            path.to_string(),
            FakeFile {
                body,
                announced,
                blocking: false,
                bytes_read: Arc::new(AtomicUsize::new(0)),
            },
        );
    }

    /// Mirrors the repository's current metadata and target payloads.
    pub fn sync(&self, repo: &TestRepo) {
        for (name, bytes) in repo.meta() {
            self.set(&name, bytes);
        }
        for (path, body) in repo.target_files() {
            self.set(&format!("targets/{path}"), body.clone());
        }
    }

    /// Removes a file so fetches hit the not-found case.
    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    /// Returns the currently served bytes for a path.
    pub fn body(&self, path: &str) -> Vec<u8> {
        self.files.lock().unwrap()[path].body.clone()
    }

    /// Overrides the length announced for a path, leaving its body alone.
    pub fn announce_size(&self, path: &str, size: u64) {
        self.files.lock().unwrap().get_mut(path).unwrap().announced = Some(size);
    }

    /// Makes reads of a path block past any reasonable inactivity window.
    pub fn set_blocking(&self, path: &str) {
        self.files.lock().unwrap().get_mut(path).unwrap().blocking = true;
    }

    /// Returns how many body bytes have been consumed for a path.
    pub fn bytes_read(&self, path: &str) -> usize {
        self.files.lock().unwrap()[path]
            .bytes_read
            .load(Ordering::SeqCst)
    }
}

impl RemoteStore for FakeRemote {
    fn get(&self, path: &str) -> Result<RemoteFile, RemoteError> {
        let files = self.files.lock().unwrap();
        let Some(file) = files.get(path) else {
            return Err(RemoteError::NotFound {
                path: path.to_string(),
            });
        };
        Ok(RemoteFile {
            stream: Box::new(FakeStream {
                body: Cursor::new(file.body.clone()),
                blocking: file.blocking,
                bytes_read: Arc::clone(&file.bytes_read),
            }),
            size: file.announced,
        })
    }
}

struct FakeStream {
    body: Cursor<Vec<u8>>,
    blocking: bool,
    bytes_read: Arc<AtomicUsize>,
}

impl Read for FakeStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.blocking {
            // Far longer than any test's inactivity window.
            thread::sleep(Duration::from_secs(3600));
        }
        let n = self.body.read(out)?;
        self.bytes_read.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }
}
