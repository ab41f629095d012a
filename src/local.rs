//! Directory-backed remote.
//!
//! Maps remote paths onto a rooted directory tree. Writes go to the
//! final name only through exclusive create or a rename, never in place.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context as _, Error};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::byte_stream::ByteStream;
use crate::remote::{
    basename, checksum_path, dirname, ChecksumStream, ReadStreamOptions, RemoteHandler,
};

pub struct LocalRemote {
    id: String,
    root: PathBuf,
}

impl LocalRemote {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(id: S, root: P) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }

    fn abs(&self, path: &str) -> Result<PathBuf, Error> {
        if path.starts_with('/') || path.split('/').any(|part| part == "..") {
            bail!("invalid remote path '{}'", path);
        }
        Ok(self.root.join(path))
    }

    async fn ensure_parent(&self, abs: &Path) -> Result<(), Error> {
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("unable to create {:?}", parent))?;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteHandler for LocalRemote {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, Error> {
        let abs = self.abs(dir)?;
        let mut entries = fs::read_dir(&abs).await.map_err(Error::from)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, Error> {
        let abs = self.abs(path)?;
        fs::read(&abs).await.map_err(Error::from)
    }

    async fn output_file(&self, path: &str, data: &[u8]) -> Result<(), Error> {
        let abs = self.abs(path)?;
        self.ensure_parent(&abs).await?;
        let tmp = self.abs(&crate::remote::join(
            dirname(path),
            &format!(".{}.tmp", basename(path)),
        ))?;
        fs::write(&tmp, data)
            .await
            .with_context(|| format!("unable to write {:?}", tmp))?;
        fs::rename(&tmp, &abs)
            .await
            .with_context(|| format!("unable to rename {:?}", tmp))?;
        Ok(())
    }

    async fn create_read_stream(
        &self,
        path: &str,
        options: ReadStreamOptions,
    ) -> Result<ByteStream, Error> {
        let abs = self.abs(path)?;
        let file = fs::File::open(&abs).await.map_err(Error::from)?;
        let stream: ByteStream = ReaderStream::new(file).boxed();

        if !options.checksum {
            return Ok(stream);
        }
        match fs::read_to_string(self.abs(&checksum_path(path))?).await {
            Ok(expected) => Ok(Box::pin(ChecksumStream::new(
                stream,
                expected.trim().to_string(),
                path.to_string(),
            ))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound
                && options.ignore_missing_checksum =>
            {
                Ok(stream)
            }
            Err(err) => Err(Error::from(err)),
        }
    }

    async fn write_stream(
        &self,
        path: &str,
        mut source: ByteStream,
        checksum: bool,
    ) -> Result<u64, Error> {
        let abs = self.abs(path)?;
        self.ensure_parent(&abs).await?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&abs)
            .await
            .map_err(Error::from)?;

        let mut hasher = checksum.then(openssl::sha::Sha256::new);
        let mut size = 0u64;
        while let Some(chunk) = source.next().await {
            let chunk = chunk.map_err(Error::from)?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if let Some(hasher) = hasher {
            let digest = hex::encode(hasher.finish());
            self.output_file(&checksum_path(path), digest.as_bytes())
                .await?;
        }
        Ok(size)
    }

    async fn rename(&self, from: &str, to: &str, checksum: bool) -> Result<(), Error> {
        fs::rename(self.abs(from)?, self.abs(to)?)
            .await
            .map_err(|err| format_err!("atomic rename {} -> {} failed - {}", from, to, err))?;
        if checksum {
            fs::rename(
                self.abs(&checksum_path(from))?,
                self.abs(&checksum_path(to))?,
            )
            .await
            .map_err(|err| format_err!("checksum rename for {} failed - {}", to, err))?;
        }
        Ok(())
    }

    async fn unlink(&self, path: &str, checksum: bool) -> Result<(), Error> {
        fs::remove_file(self.abs(path)?).await.map_err(Error::from)?;
        if checksum {
            match fs::remove_file(self.abs(&checksum_path(path))?).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(Error::from(err)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::byte_stream::from_bytes;
    use crate::remote::{is_missing, sha256_hex};
    use futures::TryStreamExt;

    fn remote() -> (LocalRemote, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (LocalRemote::new("local-1", dir.path()), dir)
    }

    #[tokio::test]
    async fn listing_a_missing_directory_is_enoent() {
        let (remote, _dir) = remote();
        let err = remote.list("xo-vm-backups").await.unwrap_err();
        assert!(is_missing(&err));
    }

    #[tokio::test]
    async fn write_stream_is_exclusive_and_checksummed() {
        let (remote, _dir) = remote();
        let payload = b"one two three".to_vec();
        let size = remote
            .write_stream("a/b.xva", from_bytes(payload.clone()), true)
            .await
            .unwrap();
        assert_eq!(size, payload.len() as u64);
        assert_eq!(
            remote.read_file("a/b.xva.checksum").await.unwrap(),
            sha256_hex(&payload).into_bytes()
        );

        // a second exclusive create on the same path must fail
        let err = remote
            .write_stream("a/b.xva", from_bytes(vec![1]), false)
            .await
            .unwrap_err();
        assert!(!is_missing(&err));
    }

    #[tokio::test]
    async fn rename_moves_the_sidecar_in_tandem() {
        let (remote, _dir) = remote();
        remote
            .write_stream("a/.b.xva", from_bytes(b"x".to_vec()), true)
            .await
            .unwrap();
        remote.rename("a/.b.xva", "a/b.xva", true).await.unwrap();
        assert_eq!(
            remote.list("a").await.unwrap(),
            vec!["b.xva".to_string(), "b.xva.checksum".to_string()]
        );

        let stream = remote
            .create_read_stream(
                "a/b.xva",
                ReadStreamOptions {
                    checksum: true,
                    ignore_missing_checksum: false,
                },
            )
            .await
            .unwrap();
        let chunks: Vec<bytes::Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"x");
    }

    #[tokio::test]
    async fn unlink_tolerates_a_missing_sidecar() {
        let (remote, _dir) = remote();
        remote.output_file("a/b.vhd", b"data").await.unwrap();
        remote.unlink("a/b.vhd", true).await.unwrap();
        let err = remote.read_file("a/b.vhd").await.unwrap_err();
        assert!(is_missing(&err));
    }
}
