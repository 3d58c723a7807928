//! Crate-level error taxonomy.
//!
//! Each failure mode of the update and download flows is a distinct kind
//! carrying the payload callers need to act on it. Stream-level causes are
//! wrapped in `DownloadFailed`, verifier causes in `DecodeFailed`.

use thiserror::Error;

use crate::fetch::DownloadError;
use crate::keys::KeyError;
use crate::store::{RemoteError, StoreError};
use crate::verify::VerifyError;

/// Convenience alias for results produced by the client.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// `init` was given a threshold below one.
    #[error("threshold must be at least 1")]
    InvalidThreshold,
    /// `init` was given fewer root keys than the threshold requires.
    #[error("insufficient keys to meet the threshold")]
    InsufficientKeys,
    /// `update` or `download` attempted with no root metadata in local
    /// storage.
    #[error("no root keys found in local metadata")]
    NoRootKeys,
    /// A metadata fetch hit the remote store's not-found case.
    #[error("missing remote metadata {name}")]
    MissingRemoteMetadata { name: String },
    /// The remote announced a metadata size above the hard cap.
    #[error("remote metadata {name} is too large: {size} bytes")]
    MetaTooLarge { name: String, size: u64 },
    /// The announced or measured length differs from the trusted length.
    #[error("wrong size for {name}: got {got}, want {want}")]
    WrongSize { name: String, got: u64, want: u64 },
    /// A stream-level failure while downloading `name`.
    #[error("download of {name} failed: {cause}")]
    DownloadFailed {
        name: String,
        #[source]
        cause: DownloadError,
    },
    /// A verification failure while decoding `file`.
    #[error("decoding {file} failed: {cause}")]
    DecodeFailed {
        file: String,
        #[source]
        cause: VerifyError,
    },
    /// `download` was asked for a path absent from the trusted targets.
    #[error("unknown target {name}")]
    UnknownTarget { name: String },
    /// A remote store error passed through unchanged (target not-found,
    /// pre-stream transport failures).
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// A local store failure.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
    /// A key database failure (`init` key registration, root installs).
    #[error("key database error: {0}")]
    Key(#[from] KeyError),
}

impl Error {
    /// Wraps a verifier error for the given metadata file.
    pub(crate) fn decode(file: &str, cause: VerifyError) -> Self {
        Error::DecodeFailed {
            file: file.to_string(),
            cause,
        }
    }

    /// Wraps a stream-level cause for the given file name.
    pub(crate) fn download(name: &str, cause: impl Into<DownloadError>) -> Self {
        Error::DownloadFailed {
            name: name.to_string(),
            cause: cause.into(),
        }
    }
}
