//! Hypervisor client seam.
//!
//! The client returns records with domain-specific shapes (VM, VDI, VBD,
//! VIF); the engine only reads a handful of fields, so records stay
//! opaque JSON values behind typed accessors.

use std::collections::HashMap;

use anyhow::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::byte_stream::{ByteStream, ExportStream, StreamFactory};

/// `other_config` keys marking objects owned by the backup engine. They
/// are the ground truth for retention selection across restarts.
pub const TAG_JOB: &str = "xo:backup:job";
pub const TAG_SCHEDULE: &str = "xo:backup:schedule";
pub const TAG_VM: &str = "xo:backup:vm";
pub const TAG_SR: &str = "xo:backup:sr";

/// Role tags of replicated VMs.
pub const ROLE_TAG_FULL: &str = "Disaster Recovery";
pub const ROLE_TAG_DELTA: &str = "Continuous Replication";

pub const RESTORED_TAG: &str = "restored from backup";

/// Reason stamped on the blocked `start` operation of replicas.
pub const BLOCKED_START_REASON: &str =
    "Start operation for this vm is blocked, clone it if you want to use it.";

/// Exported VDIs carry this key when they are deltas against a base.
pub const BASE_DELTA_KEY: &str = "xo:base_delta";

/// An object from the hypervisor cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct XoObject(pub Value);

impl XoObject {
    fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Opaque cache id of the object.
    pub fn id(&self) -> &str {
        self.str_field("id").unwrap_or_default()
    }

    pub fn uuid(&self) -> &str {
        self.str_field("uuid").unwrap_or_default()
    }

    pub fn name_label(&self) -> &str {
        self.str_field("name_label").unwrap_or_default()
    }

    pub fn is_a_snapshot(&self) -> bool {
        self.0
            .get("is_a_snapshot")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_a_template(&self) -> bool {
        self.0
            .get("is_a_template")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Seconds since the epoch, 0 when absent.
    pub fn snapshot_time(&self) -> i64 {
        self.0
            .get("snapshot_time")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn other_config(&self) -> Option<&Map<String, Value>> {
        self.0.get("other_config").and_then(Value::as_object)
    }

    pub fn other_config_value(&self, key: &str) -> Option<&str> {
        self.other_config()?.get(key)?.as_str()
    }

    /// Ids of the snapshots of this VM.
    pub fn snapshots(&self) -> Vec<&str> {
        self.0
            .get("$snapshots")
            .and_then(Value::as_array)
            .map(|refs| refs.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Uuid of the live VDI a snapshot VDI was taken of, when known.
    pub fn snapshot_of_uuid(&self) -> Option<&str> {
        self.str_field("$snapshot_of$uuid")
    }

    pub fn tags(&self) -> Vec<&str> {
        self.0
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Result of a delta export: one lazy stream per VDI plus the device
/// records needed to rebuild the VM.
pub struct DeltaExport {
    pub streams: HashMap<String, StreamFactory>,
    pub vbds: Value,
    pub vdis: Value,
    pub vifs: Value,
    pub vm: Value,
}

/// Input of a delta import.
pub struct DeltaImport {
    pub streams: HashMap<String, ByteStream>,
    pub vbds: Value,
    pub vdis: Value,
    pub vifs: Value,
    pub vm: Value,
}

#[derive(Clone, Debug)]
pub struct ImportDeltaOptions {
    pub sr_id: String,
    pub name_label: String,
    pub disable_start_after_import: bool,
}

#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Snapshot of the shared object cache.
    fn objects(&self) -> Vec<XoObject>;

    async fn get_object(&self, id: &str) -> Result<XoObject, Error>;

    async fn snapshot(
        &self,
        token: &CancellationToken,
        vm_id: &str,
        label: &str,
    ) -> Result<String, Error>;

    /// Wait until the local cache reflects `snapshot_id`.
    async fn barrier(&self, snapshot_id: &str) -> Result<(), Error>;

    async fn delete_vm(&self, vm_id: &str, force_destroy_disks: bool) -> Result<(), Error>;

    /// Fails when the live chain would yield an unsafe delta.
    async fn assert_healthy_vdi_chains(&self, vm_id: &str) -> Result<(), Error>;

    async fn export_vm(
        &self,
        token: &CancellationToken,
        snapshot_id: &str,
        compress: Option<&str>,
    ) -> Result<ExportStream, Error>;

    async fn import_vm(&self, stream: ByteStream, sr_id: &str) -> Result<String, Error>;

    async fn export_delta_vm(
        &self,
        token: &CancellationToken,
        snapshot_id: &str,
        base_snapshot_id: Option<&str>,
    ) -> Result<DeltaExport, Error>;

    async fn import_delta_vm(
        &self,
        delta: DeltaImport,
        options: ImportDeltaOptions,
    ) -> Result<XoObject, Error>;

    /// Merge `updates` into a map property; `None` removes the key.
    async fn update_object_map_property(
        &self,
        id: &str,
        property: &str,
        updates: &HashMap<String, Option<String>>,
    ) -> Result<(), Error>;

    async fn set_object_properties(&self, id: &str, properties: Value) -> Result<(), Error>;

    async fn add_tag(&self, id: &str, tag: &str) -> Result<(), Error>;
}
