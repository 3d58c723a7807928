//! The update client: trust state and the ordered fetch-verify-persist loop.
//!
//! A client owns the four last-known role versions, the trusted targets
//! listing, and the key database of the currently installed root. `update`
//! drives the role chain (timestamp, snapshot, root, targets) through
//! download, verification, and persistence; `download` streams a target
//! file under the pinning derived from the trusted targets listing.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use serde::de::Error as _;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fetch::{download_pinned, download_unsafe, read_measured, TimeoutReader};
use crate::keys::{Key, KeyDb, RoleSpec};
use crate::meta::{
    file_meta_equal, Envelope, FileMeta, MetaMismatch, RoleDocument, RoleType, Root, Snapshot,
    Targets, Timestamp,
};
use crate::store::{Destination, LocalStore, RemoteStore};
use crate::verify::{verify, verify_trusted, Clock, SystemClock, VerifyError};

/// Default inactivity window for remote reads.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Knobs influencing how the client talks to the remote store.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Inactivity window applied to every remote stream read.
    pub read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Result of a successful [`Client::update`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The metadata chain advanced; carries the targets that are new or
    /// changed relative to the previous trusted listing.
    Updated {
        targets: BTreeMap<String, FileMeta>,
    },
    /// The local snapshot already matches the remote; nothing changed.
    LatestSnapshot { version: u64 },
}

/// The last-known version of each role, for diagnostics and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoleVersions {
    pub root: u64,
    pub targets: u64,
    pub snapshot: u64,
    pub timestamp: u64,
}

/// States of the update loop. Root recovery restarts at `LoadLocal`, at
/// most once, gated by the `already_refreshed_root` flag.
enum Phase {
    LoadLocal,
    FetchTimestamp,
    FetchSnapshot {
        snapshot_meta: FileMeta,
    },
    FetchRoot {
        pinned: Option<FileMeta>,
    },
    FetchTargets {
        targets_meta: FileMeta,
        snapshot_bytes: Vec<u8>,
        snapshot_version: u64,
    },
    CommitSnapshot {
        snapshot_bytes: Vec<u8>,
        snapshot_version: u64,
        updated: BTreeMap<String, FileMeta>,
    },
}

/// Client for fetching updates from a remote repository and downloading
/// target files.
///
/// Not safe for concurrent use: one instance is one writer of its local
/// state, which the `&mut self` receivers enforce.
#[derive(Debug)]
pub struct Client<L, R> {
    local: L,
    remote: R,
    config: ClientConfig,
    clock: Box<dyn Clock>,

    root_ver: u64,
    targets_ver: u64,
    snapshot_ver: u64,
    timestamp_ver: u64,

    /// Trusted targets listing, populated from local storage or a
    /// downloaded targets document.
    targets: Option<BTreeMap<String, FileMeta>>,
    /// Raw metadata as last observed from the local store, used to decide
    /// whether remote metadata is already present locally.
    local_meta: BTreeMap<String, Vec<u8>>,
    /// Key database of the currently installed root.
    db: Option<KeyDb>,
}

impl<L: LocalStore, R: RemoteStore> Client<L, R> {
    /// Creates a client over the given stores with default configuration.
    pub fn new(local: L, remote: R) -> Self {
        Self::with_config(local, remote, ClientConfig::default())
    }

    /// Creates a client with explicit configuration.
    pub fn with_config(local: L, remote: R, config: ClientConfig) -> Self {
        Client {
            local,
            remote,
            config,
            clock: Box::new(SystemClock),
            root_ver: 0,
            targets_ver: 0,
            snapshot_ver: 0,
            timestamp_ver: 0,
            targets: None,
            local_meta: BTreeMap::new(),
            db: None,
        }
    }

    /// Replaces the time source consulted for expiry checks.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Returns the last-known version of each role.
    pub fn versions(&self) -> RoleVersions {
        RoleVersions {
            root: self.root_ver,
            targets: self.targets_ver,
            snapshot: self.snapshot_ver,
            timestamp: self.timestamp_ver,
        }
    }

    /// Returns the key database of the currently installed root, if any.
    pub fn key_db(&self) -> Option<&KeyDb> {
        self.db.as_ref()
    }

    /// Initialises the local repository.
    ///
    /// The latest root metadata is fetched from the remote store, verified
    /// against the caller-supplied keys and threshold, installed as the
    /// trusted root, and persisted. The caller is expected to have obtained
    /// `root_keys` out of band, securely distributed with the software
    /// being updated.
    pub fn init(&mut self, root_keys: &[Key], threshold: u32) -> Result<()> {
        if threshold < 1 {
            return Err(Error::InvalidThreshold);
        }
        if (root_keys.len() as u32) < threshold {
            return Err(Error::InsufficientKeys);
        }
        let name = RoleType::Root.meta_path();
        let bytes = download_unsafe(&self.remote, name, self.config.read_timeout)?;

        let mut bootstrap = KeyDb::new();
        let mut key_ids = Vec::with_capacity(root_keys.len());
        for key in root_keys {
            let id = key.key_id()?;
            bootstrap.add_key(id.clone(), key.clone())?;
            key_ids.push(id);
        }
        bootstrap.add_role(RoleType::Root, RoleSpec { key_ids, threshold })?;

        let envelope = parse_envelope(name, &bytes)?;
        let root: Root = verify(&envelope, self.root_ver, &bootstrap, self.clock.now())
            .map_err(|err| Error::decode(name, err))?;

        let db = KeyDb::from_root(&root)?;
        self.local.set_meta(name, bytes)?;
        self.db = Some(db);
        self.root_ver = root.version;
        info!(version = root.version, "initialised trust root");
        Ok(())
    }

    /// Downloads and verifies remote metadata, returning the targets that
    /// changed.
    ///
    /// Performs the client-side metadata workflow: the trusted local state
    /// is loaded first, then timestamp, snapshot, root (when rotated), and
    /// targets are fetched, verified, and persisted in order. Revoked
    /// timestamp or snapshot keys and an expired local root each trigger at
    /// most one root refresh before the update restarts.
    pub fn update(&mut self) -> Result<UpdateOutcome> {
        let mut already_refreshed_root = false;
        let mut phase = Phase::LoadLocal;
        loop {
            phase = match phase {
                Phase::LoadLocal => match self.load_and_verify() {
                    Ok(()) => Phase::FetchTimestamp,
                    Err(err) if !already_refreshed_root && is_expired_root(&err) => {
                        warn!("local root metadata has expired, fetching the latest root");
                        Phase::FetchRoot { pinned: None }
                    }
                    Err(err) => return Err(err),
                },

                Phase::FetchTimestamp => {
                    let name = RoleType::Timestamp.meta_path();
                    let bytes = download_unsafe(&self.remote, name, self.config.read_timeout)?;
                    let envelope = parse_envelope(name, &bytes)?;
                    match verify::<Timestamp>(
                        &envelope,
                        self.timestamp_ver,
                        self.db()?,
                        self.clock.now(),
                    ) {
                        Ok(timestamp) => {
                            let snapshot_meta = timestamp
                                .snapshot_meta()
                                .cloned()
                                .ok_or_else(|| missing_meta_entry(name, "snapshot.json"))?;
                            self.local.set_meta(name, bytes)?;
                            self.timestamp_ver = timestamp.version;
                            if self.has_meta(RoleType::Snapshot.meta_path(), &snapshot_meta) {
                                debug!(
                                    version = self.snapshot_ver,
                                    "local snapshot already matches the timestamp pin"
                                );
                                return Ok(UpdateOutcome::LatestSnapshot {
                                    version: self.snapshot_ver,
                                });
                            }
                            Phase::FetchSnapshot { snapshot_meta }
                        }
                        // Threshold failure can mean the timestamp keys were
                        // revoked by a newer root.
                        Err(VerifyError::RoleThreshold { .. }) if !already_refreshed_root => {
                            warn!("timestamp threshold not met, fetching the latest root");
                            Phase::FetchRoot { pinned: None }
                        }
                        Err(err) => return Err(Error::decode(name, err)),
                    }
                }

                Phase::FetchSnapshot { snapshot_meta } => {
                    let name = RoleType::Snapshot.meta_path();
                    let bytes = download_pinned(
                        &self.remote,
                        name,
                        &snapshot_meta,
                        self.config.read_timeout,
                    )?;
                    let envelope = parse_envelope(name, &bytes)?;
                    match verify::<Snapshot>(
                        &envelope,
                        self.snapshot_ver,
                        self.db()?,
                        self.clock.now(),
                    ) {
                        Ok(snapshot) => {
                            let root_meta = snapshot
                                .root_meta()
                                .cloned()
                                .ok_or_else(|| missing_meta_entry(name, "root.json"))?;
                            let targets_meta = snapshot
                                .targets_meta()
                                .cloned()
                                .ok_or_else(|| missing_meta_entry(name, "targets.json"))?;
                            if !self.has_meta(RoleType::Root.meta_path(), &root_meta) {
                                // The snapshot announces a root we do not
                                // hold. Snapshot bytes are not persisted yet
                                // so a failed refresh forces a re-fetch.
                                info!("snapshot announces a newer root, fetching it pinned");
                                Phase::FetchRoot {
                                    pinned: Some(root_meta),
                                }
                            } else {
                                Phase::FetchTargets {
                                    targets_meta,
                                    snapshot_bytes: bytes,
                                    snapshot_version: snapshot.version,
                                }
                            }
                        }
                        // Threshold failure can mean the snapshot keys were
                        // revoked by a newer root.
                        Err(VerifyError::RoleThreshold { .. }) if !already_refreshed_root => {
                            warn!("snapshot threshold not met, fetching the latest root");
                            Phase::FetchRoot { pinned: None }
                        }
                        Err(err) => return Err(Error::decode(name, err)),
                    }
                }

                Phase::FetchRoot { pinned } => {
                    let name = RoleType::Root.meta_path();
                    let bytes = match &pinned {
                        Some(meta) => {
                            download_pinned(&self.remote, name, meta, self.config.read_timeout)?
                        }
                        None => download_unsafe(&self.remote, name, self.config.read_timeout)?,
                    };
                    let envelope = parse_envelope(name, &bytes)?;
                    let unverified: Root = serde_json::from_value(envelope.signed.clone())
                        .map_err(|err| Error::decode(name, err.into()))?;
                    let db = KeyDb::from_root(&unverified)?;
                    let root: Root = verify(&envelope, self.root_ver, &db, self.clock.now())
                        .map_err(|err| Error::decode(name, err))?;
                    self.local.set_meta(name, bytes)?;
                    self.db = Some(db);
                    self.root_ver = root.version;
                    info!(version = root.version, "installed new root metadata");
                    already_refreshed_root = true;
                    Phase::LoadLocal
                }

                Phase::FetchTargets {
                    targets_meta,
                    snapshot_bytes,
                    snapshot_version,
                } => {
                    let name = RoleType::Targets.meta_path();
                    let updated = if self.has_meta(name, &targets_meta) {
                        BTreeMap::new()
                    } else {
                        let bytes = download_pinned(
                            &self.remote,
                            name,
                            &targets_meta,
                            self.config.read_timeout,
                        )?;
                        let envelope = parse_envelope(name, &bytes)?;
                        let targets: Targets = verify(
                            &envelope,
                            self.targets_ver,
                            self.db()?,
                            self.clock.now(),
                        )
                        .map_err(|err| Error::decode(name, err))?;
                        let updated = diff_targets(self.targets.as_ref(), &targets.targets);
                        self.local.set_meta(name, bytes)?;
                        self.targets_ver = targets.version;
                        self.targets = Some(targets.targets);
                        updated
                    };
                    Phase::CommitSnapshot {
                        snapshot_bytes,
                        snapshot_version,
                        updated,
                    }
                }

                Phase::CommitSnapshot {
                    snapshot_bytes,
                    snapshot_version,
                    updated,
                } => {
                    // The snapshot is written last: if the targets step had
                    // failed, the next update must re-fetch the snapshot
                    // rather than trust a partially applied one.
                    self.local
                        .set_meta(RoleType::Snapshot.meta_path(), snapshot_bytes)?;
                    self.snapshot_ver = snapshot_version;
                    debug!(
                        snapshot_version,
                        updated = updated.len(),
                        "update complete"
                    );
                    return Ok(UpdateOutcome::Updated { targets: updated });
                }
            };
        }
    }

    /// Downloads the named target file from the remote store into `dest`.
    ///
    /// The stream is pinned to the length and hashes of the trusted
    /// targets listing. On any failure `dest.delete()` is invoked so a
    /// partially written target is never left in place.
    pub fn download<D: Destination + ?Sized>(&mut self, name: &str, dest: &mut D) -> Result<()> {
        let result = self.download_target(name, dest);
        if result.is_err() {
            if let Err(err) = dest.delete() {
                warn!(target = name, error = %err, "failed to remove partial target");
            }
        }
        result
    }

    fn download_target<D: Destination + ?Sized>(&mut self, name: &str, dest: &mut D) -> Result<()> {
        if self.targets.is_none() {
            self.load_and_verify()?;
        }
        let local_meta = self
            .targets
            .as_ref()
            .and_then(|targets| targets.get(name))
            .cloned()
            .ok_or_else(|| Error::UnknownTarget {
                name: name.to_string(),
            })?;

        let path = format!("targets/{name}");
        let file = self.remote.get(&path)?;
        if let Some(size) = file.size {
            if size != local_meta.length {
                return Err(Error::WrongSize {
                    name: name.to_string(),
                    got: size,
                    want: local_meta.length,
                });
            }
        }
        let stream = TimeoutReader::spawn(
            file.stream.take(local_meta.length),
            self.config.read_timeout,
        )
        .map_err(|err| Error::download(name, err))?;
        let observed = read_measured(stream, dest).map_err(|err| Error::download(name, err))?;
        match file_meta_equal(&observed, &local_meta) {
            Ok(()) => Ok(()),
            Err(MetaMismatch::WrongLength { got, want }) => Err(Error::WrongSize {
                name: name.to_string(),
                got,
                want,
            }),
            Err(mismatch) => Err(Error::download(name, mismatch)),
        }
    }

    /// Returns the complete trusted targets listing, loading local state
    /// first when necessary.
    pub fn targets(&mut self) -> Result<BTreeMap<String, FileMeta>> {
        if self.targets.is_none() {
            self.load_and_verify()?;
        }
        Ok(self.targets.clone().unwrap_or_default())
    }

    /// Loads and verifies metadata from local storage.
    ///
    /// Local verification is for consistency, not security: a compromised
    /// local store cannot be trusted anyway, but verifying it catches bugs
    /// and partial corruption. Root is the one document whose expiry is
    /// fatal here, since an expired root cannot authenticate a
    /// replacement.
    fn load_and_verify(&mut self) -> Result<()> {
        let meta = self.local.get_meta()?;

        let root_name = RoleType::Root.meta_path();
        let Some(root_bytes) = meta.get(root_name) else {
            return Err(Error::NoRootKeys);
        };
        // The root keys are needed before the root can be verified, so the
        // payload is decoded unverified first and checked against itself.
        let envelope = parse_envelope(root_name, root_bytes)?;
        let unverified: Root = serde_json::from_value(envelope.signed.clone())
            .map_err(|err| Error::decode(root_name, err.into()))?;
        let db = KeyDb::from_root(&unverified)?;
        let root: Root = verify(&envelope, 0, &db, self.clock.now())
            .map_err(|err| Error::decode(root_name, err))?;

        // The non-root documents are checked for consistency only. One that
        // no longer verifies (stale signatures after a key rotation, local
        // corruption) is treated as absent: the version floor it would have
        // provided stays in place and the update flow re-fetches it.
        let mut snapshot_ver = self.snapshot_ver;
        if let Some(doc) =
            load_trusted::<Snapshot>(&meta, RoleType::Snapshot, self.snapshot_ver, &db)
        {
            snapshot_ver = doc.version;
        }

        let mut targets_ver = self.targets_ver;
        let mut targets = None;
        if let Some(doc) = load_trusted::<Targets>(&meta, RoleType::Targets, self.targets_ver, &db)
        {
            targets_ver = doc.version;
            targets = Some(doc.targets);
        }

        let mut timestamp_ver = self.timestamp_ver;
        if let Some(doc) =
            load_trusted::<Timestamp>(&meta, RoleType::Timestamp, self.timestamp_ver, &db)
        {
            timestamp_ver = doc.version;
        }

        self.db = Some(db);
        self.root_ver = root.version;
        self.snapshot_ver = snapshot_ver;
        self.targets_ver = targets_ver;
        if let Some(targets) = targets {
            self.targets = Some(targets);
        }
        self.timestamp_ver = timestamp_ver;
        self.local_meta = meta;
        Ok(())
    }

    /// Returns whether the locally stored blob under `name` matches the
    /// given fingerprint.
    fn has_meta(&self, name: &str, expected: &FileMeta) -> bool {
        match self.local_meta.get(name) {
            Some(bytes) => file_meta_equal(&FileMeta::of_bytes(bytes), expected).is_ok(),
            None => false,
        }
    }

    fn db(&self) -> Result<&KeyDb> {
        self.db.as_ref().ok_or(Error::NoRootKeys)
    }
}

/// Parses a signed envelope, attributing malformed bytes to `file`.
fn parse_envelope(file: &str, bytes: &[u8]) -> Result<Envelope> {
    Envelope::from_slice(bytes).map_err(|err| Error::decode(file, err.into()))
}

/// Loads one non-root document from the local metadata mapping, returning
/// `None` when it is absent or no longer passes trusted verification.
fn load_trusted<T: RoleDocument>(
    meta: &BTreeMap<String, Vec<u8>>,
    role: RoleType,
    min_version: u64,
    db: &KeyDb,
) -> Option<T> {
    let name = role.meta_path();
    let bytes = meta.get(name)?;
    let envelope = match Envelope::from_slice(bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(file = name, error = %err, "ignoring unparseable local metadata");
            return None;
        }
    };
    match verify_trusted::<T>(&envelope, min_version, db) {
        Ok(doc) => Some(doc),
        Err(err) => {
            warn!(file = name, error = %err, "ignoring local metadata that fails verification");
            None
        }
    }
}

/// Error for a role document missing a `meta` entry it must carry.
fn missing_meta_entry(file: &str, entry: &str) -> Error {
    Error::decode(
        file,
        VerifyError::Malformed(serde_json::Error::custom(format!(
            "missing meta entry {entry}"
        ))),
    )
}

/// Returns whether the error is an expired local root, the one local
/// failure the update loop recovers from.
fn is_expired_root(err: &Error) -> bool {
    matches!(
        err,
        Error::DecodeFailed { file, cause: VerifyError::Expired { .. } }
            if file == RoleType::Root.meta_path()
    )
}

/// Computes the updated-targets diff: paths absent from the old listing or
/// present with a different fingerprint.
fn diff_targets(
    old: Option<&BTreeMap<String, FileMeta>>,
    new: &BTreeMap<String, FileMeta>,
) -> BTreeMap<String, FileMeta> {
    let mut updated = BTreeMap::new();
    for (path, meta) in new {
        let unchanged = old
            .and_then(|old| old.get(path))
            .is_some_and(|existing| file_meta_equal(existing, meta).is_ok());
        if !unchanged {
            updated.insert(path.clone(), meta.clone());
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(entries: &[(&str, &[u8])]) -> BTreeMap<String, FileMeta> {
        entries
            .iter()
            .map(|(path, body)| (path.to_string(), FileMeta::of_bytes(body)))
            .collect()
    }

    #[test]
    /// Every entry is new when there is no previous listing.
    fn diff_reports_everything_on_first_listing() {
        let new = listing(&[("foo.txt", b"foo".as_slice()), ("bar.txt", b"bar".as_slice())]);
        let updated = diff_targets(None, &new);
        assert_eq!(updated, new);
    }

    #[test]
    /// Re-listing a target with an identical fingerprint yields an empty
    /// diff.
    fn diff_is_stable_for_identical_entries() {
        let old = listing(&[("foo.txt", b"foo".as_slice())]);
        let new = listing(&[("foo.txt", b"foo".as_slice())]);
        assert!(diff_targets(Some(&old), &new).is_empty());
    }

    #[test]
    /// A changed fingerprint or a new path shows up in the diff.
    fn diff_reports_changed_and_added_entries() {
        let old = listing(&[("foo.txt", b"foo".as_slice()), ("bar.txt", b"bar".as_slice())]);
        let new = listing(&[
            ("foo.txt", b"foo2".as_slice()),
            ("bar.txt", b"bar".as_slice()),
            ("baz.txt", b"baz".as_slice()),
        ]);
        let updated = diff_targets(Some(&old), &new);
        assert_eq!(updated.len(), 2);
        assert!(updated.contains_key("foo.txt"));
        assert!(updated.contains_key("baz.txt"));
    }

    #[test]
    /// A removed path does not appear in the diff.
    fn diff_ignores_removed_entries() {
        let old = listing(&[("foo.txt", b"foo".as_slice()), ("bar.txt", b"bar".as_slice())]);
        let new = listing(&[("foo.txt", b"foo".as_slice())]);
        assert!(diff_targets(Some(&old), &new).is_empty());
    }
}
