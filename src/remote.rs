//! Remote storage seam.
//!
//! All backup payloads go through this trait; paths are `/`-separated
//! strings relative to the remote's root. Implementations must surface
//! `ENOENT` on listing a missing directory (callers probing partial
//! layouts rely on it, see [`is_missing`]) and must write `.checksum`
//! sidecars atomically when asked to.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Error;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;

use crate::byte_stream::ByteStream;

#[derive(Clone, Copy, Debug, Default)]
pub struct ReadStreamOptions {
    /// Verify the payload against its `.checksum` sidecar.
    pub checksum: bool,
    /// Tolerate a missing sidecar (older layouts).
    pub ignore_missing_checksum: bool,
}

#[async_trait]
pub trait RemoteHandler: Send + Sync {
    fn id(&self) -> &str;

    /// Entry names directly under `dir`.
    async fn list(&self, dir: &str) -> Result<Vec<String>, Error>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, Error>;

    /// Atomic write of a small blob.
    async fn output_file(&self, path: &str, data: &[u8]) -> Result<(), Error>;

    async fn create_read_stream(
        &self,
        path: &str,
        options: ReadStreamOptions,
    ) -> Result<ByteStream, Error>;

    /// Exclusive-create `path`, pipe `source` into it and flush; with
    /// `checksum`, also write the `.checksum` sidecar before returning.
    /// Returns the number of bytes written.
    async fn write_stream(
        &self,
        path: &str,
        source: ByteStream,
        checksum: bool,
    ) -> Result<u64, Error>;

    /// With `checksum`, the sidecar is moved in tandem.
    async fn rename(&self, from: &str, to: &str, checksum: bool) -> Result<(), Error>;

    /// With `checksum`, the sidecar is removed in tandem (if present).
    async fn unlink(&self, path: &str, checksum: bool) -> Result<(), Error>;
}

pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

pub fn checksum_path(path: &str) -> String {
    format!("{}.checksum", path)
}

/// Whether `err` is a tolerable hole in the layout (ENOENT, or ENOTDIR
/// when a path component turns out to be a file).
pub fn is_missing(err: &Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<io::Error>().map_or(false, |io_err| {
            matches!(
                io_err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            )
        })
    })
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(data))
}

/// Stream wrapper hashing the payload on the fly and failing at EOF when
/// it does not match the expected sidecar digest.
pub struct ChecksumStream {
    inner: ByteStream,
    hasher: Option<openssl::sha::Sha256>,
    expected: String,
    path: String,
}

impl ChecksumStream {
    pub fn new(inner: ByteStream, expected: String, path: String) -> Self {
        Self {
            inner,
            hasher: Some(openssl::sha::Sha256::new()),
            expected,
            path,
        }
    }
}

impl Stream for ChecksumStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match futures::ready!(this.inner.as_mut().poll_next(cx)) {
            Some(Ok(chunk)) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => match this.hasher.take() {
                Some(hasher) => {
                    let digest = hex::encode(hasher.finish());
                    if digest == this.expected {
                        Poll::Ready(None)
                    } else {
                        Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "wrong checksum for {} ({} != {})",
                                this.path, digest, this.expected
                            ),
                        ))))
                    }
                }
                None => Poll::Ready(None),
            },
        }
    }
}
