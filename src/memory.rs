//! In-memory remote, the deterministic backend of the test suite.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use anyhow::Error;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::byte_stream::ByteStream;
use crate::remote::{checksum_path, sha256_hex, ChecksumStream, ReadStreamOptions, RemoteHandler};

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, Vec<u8>>,
    /// Substrings of paths whose streamed writes fail mid-transfer.
    fail_writes: Vec<String>,
}

/// A remote holding its tree in a map. Streamed writes can be made to
/// fail for chosen paths, to exercise the per-target error paths.
#[derive(Clone)]
pub struct MemoryRemote {
    id: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Make every `write_stream` whose path contains `pattern` fail
    /// after consuming its first chunk.
    pub fn fail_writes<S: Into<String>>(&self, pattern: S) {
        self.inner.lock().unwrap().fail_writes.push(pattern.into());
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.inner.lock().unwrap().files.keys().cloned().collect()
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    fn enoent(path: &str) -> Error {
        Error::from(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such file or directory: '{}'", path),
        ))
    }
}

#[async_trait]
impl RemoteHandler for MemoryRemote {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, Error> {
        let inner = self.inner.lock().unwrap();
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let mut names: Vec<String> = inner
            .files
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .map(|rest| match rest.find('/') {
                Some(pos) => rest[..pos].to_string(),
                None => rest.to_string(),
            })
            .collect();
        if names.is_empty() && !dir.is_empty() {
            return Err(Self::enoent(dir));
        }
        names.dedup();
        Ok(names)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Self::enoent(path))
    }

    async fn output_file(&self, path: &str, data: &[u8]) -> Result<(), Error> {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn create_read_stream(
        &self,
        path: &str,
        options: ReadStreamOptions,
    ) -> Result<ByteStream, Error> {
        let data = self.read_file(path).await?;
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(64 * 1024)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        let stream: ByteStream = futures::stream::iter(chunks).boxed();

        if !options.checksum {
            return Ok(stream);
        }
        match self.read_file(&checksum_path(path)).await {
            Ok(expected) => Ok(Box::pin(ChecksumStream::new(
                stream,
                String::from_utf8_lossy(&expected).trim().to_string(),
                path.to_string(),
            ))),
            Err(err) if crate::remote::is_missing(&err) && options.ignore_missing_checksum => {
                Ok(stream)
            }
            Err(err) => Err(err),
        }
    }

    async fn write_stream(
        &self,
        path: &str,
        mut source: ByteStream,
        checksum: bool,
    ) -> Result<u64, Error> {
        let injected_failure = {
            let inner = self.inner.lock().unwrap();
            if inner.files.contains_key(path) {
                return Err(Error::from(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("file exists: '{}'", path),
                )));
            }
            inner
                .fail_writes
                .iter()
                .any(|pattern| path.contains(pattern.as_str()))
        };

        let mut data = Vec::new();
        while let Some(chunk) = source.next().await {
            data.extend_from_slice(&chunk.map_err(Error::from)?);
            if injected_failure {
                return Err(Error::from(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("injected write failure on '{}'", path),
                )));
            }
        }

        let size = data.len() as u64;
        let mut inner = self.inner.lock().unwrap();
        if checksum {
            inner
                .files
                .insert(checksum_path(path), sha256_hex(&data).into_bytes());
        }
        inner.files.insert(path.to_string(), data);
        Ok(size)
    }

    async fn rename(&self, from: &str, to: &str, checksum: bool) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let data = inner
            .files
            .remove(from)
            .ok_or_else(|| Self::enoent(from))?;
        inner.files.insert(to.to_string(), data);
        if checksum {
            let sidecar = inner
                .files
                .remove(&checksum_path(from))
                .ok_or_else(|| Self::enoent(&checksum_path(from)))?;
            inner.files.insert(checksum_path(to), sidecar);
        }
        Ok(())
    }

    async fn unlink(&self, path: &str, checksum: bool) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .files
            .remove(path)
            .ok_or_else(|| Self::enoent(path))?;
        if checksum {
            inner.files.remove(&checksum_path(path));
        }
        Ok(())
    }
}
