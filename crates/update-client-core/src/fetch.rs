//! Bounded downloads from the remote store.
//!
//! Two independent defences protect every fetch: a hard length cap defeats
//! endless-data responses, and an inactivity timeout defeats byte-drip
//! slow-retrieval. The cap wraps the underlying stream and the timeout
//! wraps the cap, so a truncated stream can never mask a stall.

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::error::Error;
use crate::meta::{file_meta_equal, FileMeta, MetaMismatch, SHA256};
use crate::store::{RemoteError, RemoteStore};

/// Maximum number of bytes downloaded for metadata of unknown length.
pub const MAX_META_SIZE: u64 = 51_200;

/// Chunk size used when pumping remote streams.
const CHUNK_SIZE: usize = 8 * 1024;

/// Stream-level causes wrapped by `Error::DownloadFailed`.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("wrong length: got {got}, want {want}")]
    WrongLength { got: u64, want: u64 },
    #[error("wrong {algorithm} hash")]
    WrongHash { algorithm: String },
    #[error("no common hash algorithm")]
    NoCommonHash,
    #[error("no data received within the inactivity window")]
    ReadTimeout,
    #[error("read error: {0}")]
    Io(#[source] io::Error),
    #[error(transparent)]
    Transport(#[from] RemoteError),
}

impl From<MetaMismatch> for DownloadError {
    fn from(mismatch: MetaMismatch) -> Self {
        match mismatch {
            MetaMismatch::WrongLength { got, want } => DownloadError::WrongLength { got, want },
            MetaMismatch::WrongHash { algorithm } => DownloadError::WrongHash { algorithm },
            MetaMismatch::NoCommonHash => DownloadError::NoCommonHash,
        }
    }
}

impl From<io::Error> for DownloadError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            DownloadError::ReadTimeout
        } else {
            DownloadError::Io(err)
        }
    }
}

/// A reader enforcing an inactivity timeout on an inner stream.
///
/// A pump thread reads the inner stream in chunks and hands them over a
/// bounded channel; if no chunk arrives within the window, the read fails
/// with `io::ErrorKind::TimedOut`. Dropping the reader disconnects the
/// channel, which stops the pump at its next send.
pub struct TimeoutReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    buf: Vec<u8>,
    pos: usize,
    timeout: Duration,
    done: bool,
}

impl TimeoutReader {
    /// Spawns the pump thread over `inner` with the given inactivity window.
    pub fn spawn<R>(mut inner: R, timeout: Duration) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name("update-client-read".into())
            .spawn(move || {
                let mut chunk = [0u8; CHUNK_SIZE];
                loop {
                    match inner.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(Ok(chunk[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(err));
                            break;
                        }
                    }
                }
            })?;
        Ok(TimeoutReader {
            rx,
            buf: Vec::new(),
            pos: 0,
            timeout,
            done: false,
        })
    }

    fn take_buffered(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

impl Read for TimeoutReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos < self.buf.len() {
            return Ok(self.take_buffered(out));
        }
        if self.done {
            return Ok(0);
        }
        match self.rx.recv_timeout(self.timeout) {
            Ok(Ok(chunk)) => {
                self.buf = chunk;
                self.pos = 0;
                Ok(self.take_buffered(out))
            }
            Ok(Err(err)) => {
                self.done = true;
                Err(err)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.done = true;
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no data received within the inactivity window",
                ))
            }
            // The pump exited after a clean end of stream.
            Err(RecvTimeoutError::Disconnected) => {
                self.done = true;
                Ok(0)
            }
        }
    }
}

/// Copies a stream into `out` while measuring its fingerprint.
///
/// This is the tee of every pinned download: each chunk updates the hash
/// and reaches the sink in one pass, so the caller can compare the
/// observed [`FileMeta`] before considering the sink committed.
pub(crate) fn read_measured<R: Read, W: Write + ?Sized>(
    mut reader: R,
    out: &mut W,
) -> io::Result<FileMeta> {
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut length = 0u64;
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        out.write_all(&chunk[..n])?;
        length += n as u64;
    }
    let mut hashes = std::collections::BTreeMap::new();
    hashes.insert(SHA256.to_string(), hex::encode(hasher.finalize()));
    Ok(FileMeta { length, hashes })
}

/// Downloads metadata whose length is not known up front.
///
/// At most [`MAX_META_SIZE`] bytes are read; a remote that announces more
/// than the cap is rejected before any of the body is consumed.
pub(crate) fn download_unsafe<R>(remote: &R, name: &str, timeout: Duration) -> Result<Vec<u8>, Error>
where
    R: RemoteStore + ?Sized,
{
    debug!(name, "downloading metadata of unknown size");
    let file = remote.get(name).map_err(|err| {
        if err.is_not_found() {
            Error::MissingRemoteMetadata {
                name: name.to_string(),
            }
        } else {
            Error::download(name, err)
        }
    })?;
    if let Some(size) = file.size {
        if size > MAX_META_SIZE {
            return Err(Error::MetaTooLarge {
                name: name.to_string(),
                size,
            });
        }
    }
    // The announced size may be absent or inaccurate, so the cap is
    // enforced on the stream regardless.
    let mut stream = TimeoutReader::spawn(file.stream.take(MAX_META_SIZE), timeout)
        .map_err(|err| Error::download(name, err))?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .map_err(|err| Error::download(name, err))?;
    Ok(buf)
}

/// Downloads metadata pinned to an exact length and hash set.
pub(crate) fn download_pinned<R>(
    remote: &R,
    name: &str,
    expected: &FileMeta,
    timeout: Duration,
) -> Result<Vec<u8>, Error>
where
    R: RemoteStore + ?Sized,
{
    debug!(name, length = expected.length, "downloading pinned metadata");
    let file = remote.get(name).map_err(|err| {
        if err.is_not_found() {
            Error::MissingRemoteMetadata {
                name: name.to_string(),
            }
        } else {
            Error::Remote(err)
        }
    })?;
    if let Some(size) = file.size {
        if size != expected.length {
            return Err(Error::WrongSize {
                name: name.to_string(),
                got: size,
                want: expected.length,
            });
        }
    }
    let stream = TimeoutReader::spawn(file.stream.take(expected.length), timeout)
        .map_err(|err| Error::download(name, err))?;
    let mut buf = Vec::new();
    let observed = read_measured(stream, &mut buf).map_err(|err| Error::download(name, err))?;
    file_meta_equal(&observed, expected).map_err(|mismatch| Error::download(name, mismatch))?;
    Ok(buf)
}
