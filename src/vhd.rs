//! Seam to the VHD format library and the out-of-process merge worker.
//!
//! Coalescing CPU-binds, so merges are delegated to a dedicated worker
//! process and awaited over its RPC instead of running on the event
//! loop.

use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::byte_stream::ByteStream;
use crate::remote::RemoteHandler;

/// The header fields the engine reads; the rest of the format stays
/// inside the library.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VhdHeader {
    /// Basename of the parent VHD for delta disks, none for full disks.
    pub parent_unicode_name: Option<String>,
}

#[async_trait]
pub trait VhdLibrary: Send + Sync {
    async fn read_header(
        &self,
        remote: &dyn RemoteHandler,
        path: &str,
    ) -> Result<VhdHeader, Error>;

    /// Rewrite the child's parent locators to point at `parent_path`.
    /// Idempotent.
    async fn chain(
        &self,
        parent_remote: &dyn RemoteHandler,
        parent_path: &str,
        child_remote: &dyn RemoteHandler,
        child_path: &str,
    ) -> Result<(), Error>;

    /// Single VHD stream representing the coalesced chain from `path`
    /// (child-most) up through its parents.
    async fn synthetic_stream(
        &self,
        remote: Arc<dyn RemoteHandler>,
        path: &str,
    ) -> Result<ByteStream, Error>;
}

#[async_trait]
pub trait MergeWorker: Send + Sync {
    /// Fold the child's blocks into the parent file. On success the
    /// parent file holds the coalesced image and the caller renames it
    /// over the child.
    async fn merge_vhd(
        &self,
        parent_remote: Arc<dyn RemoteHandler>,
        parent_path: &str,
        child_remote: Arc<dyn RemoteHandler>,
        child_path: &str,
    ) -> Result<(), Error>;
}
