//! Client for signed, versioned update metadata.
//!
//! This crate implements the client side of a metadata update system
//! patterned on The Update Framework: an ordered, role-keyed
//! fetch-verify-persist loop over root, timestamp, snapshot, and targets
//! metadata, with bounded downloads and length-and-hash pinned target
//! files. It defends against rollback, mix-and-match, endless-data, and
//! slow-retrieval attacks, and recovers from key rotation of the non-root
//! roles by refreshing root.
//!
//! The crate root re-exports the building blocks needed to embed the
//! client without digging into the internal module layout.

pub mod client;
pub mod error;
pub mod fetch;
pub mod keys;
pub mod meta;
pub mod store;
pub mod verify;

pub use client::{Client, ClientConfig, RoleVersions, UpdateOutcome, DEFAULT_READ_TIMEOUT};
pub use error::{Error, Result};
pub use fetch::{DownloadError, TimeoutReader, MAX_META_SIZE};
pub use keys::{Key, KeyDb, KeyError, KeyId, KeyVal, RoleSpec, KEY_TYPE_ED25519};
pub use meta::{
    canonical_bytes, file_meta_equal, Envelope, FileMeta, MetaMismatch, RoleType, Root, Signature,
    Snapshot, Targets, Timestamp,
};
pub use store::{
    Destination, FileLocalStore, HttpRemoteStore, LocalStore, MemoryLocalStore, RemoteError,
    RemoteFile, RemoteStore, StoreError,
};
pub use verify::{verify, verify_trusted, Clock, FixedClock, SystemClock, VerifyError};

#[cfg(test)]
mod tests {
    use super::*;

    /// The metadata size cap matches the documented constant.
    #[test]
    fn meta_size_cap_is_fifty_kib() {
        assert_eq!(MAX_META_SIZE, 50 * 1024);
    }

    /// Clients can be constructed through the crate-root re-exports.
    #[test]
    fn client_types_are_reexported() {
        let local = MemoryLocalStore::new();
        let remote_err = HttpRemoteStore::new("https://updates.example.com").map(|remote| {
            let client = Client::new(local, remote);
            client.versions()
        });
        assert_eq!(remote_err.unwrap(), RoleVersions::default());
    }
}
