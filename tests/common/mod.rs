//! Shared harness: a scripted hypervisor and a toy VHD codec.
//!
//! The toy "VHD" is a JSON object `{uuid, parent, blocks}`; parent links
//! and block overlays behave like the real chain, which is all the
//! engine observes through the library seam.

// each test binary uses a different slice of the harness
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use xo_backup::byte_stream::{ByteStream, ExportStream, StreamFactory, TaskHandle};
use xo_backup::hypervisor::{
    DeltaExport, DeltaImport, HypervisorClient, ImportDeltaOptions, XoObject,
};
use xo_backup::remote::{basename, dirname, join, RemoteHandler};
use xo_backup::vhd::{MergeWorker, VhdHeader, VhdLibrary};

pub type Blocks = BTreeMap<String, String>;

fn chunked(data: Vec<u8>) -> ByteStream {
    let chunks: Vec<std::io::Result<Bytes>> = data
        .chunks(512)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    futures::stream::iter(chunks).boxed()
}

async fn collect(mut stream: ByteStream) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data)
}

#[derive(Default)]
struct XapiState {
    objects: BTreeMap<String, Value>,
    /// Live VDI contents.
    disks: BTreeMap<String, Blocks>,
    /// Per-snapshot copy of the live disks at snapshot time.
    snapshot_disks: BTreeMap<String, BTreeMap<String, Blocks>>,
    unhealthy: HashSet<String>,
    hang_exports: bool,
    next_id: usize,
    clock: i64,
}

impl XapiState {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }
}

#[derive(Clone, Default)]
pub struct MockXapi {
    state: Arc<Mutex<XapiState>>,
}

impl MockXapi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a VM with the given VDIs (uuid plus initial blocks) and
    /// a number of VIFs.
    pub fn add_vm(&self, uuid: &str, name_label: &str, vdis: &[(&str, Blocks)], vifs: usize) {
        let mut state = self.state.lock().unwrap();
        let vdi_uuids: Vec<String> = vdis.iter().map(|(vdi, _)| vdi.to_string()).collect();
        let vbds: Vec<Value> = vdi_uuids
            .iter()
            .map(|vdi| json!({"uuid": format!("vbd-{}", vdi), "VDI": vdi}))
            .collect();
        let vif_records: Vec<Value> = (0..vifs)
            .map(|index| json!({"uuid": format!("vif-{}-{}", uuid, index)}))
            .collect();
        state.objects.insert(
            uuid.to_string(),
            json!({
                "id": uuid,
                "uuid": uuid,
                "name_label": name_label,
                "other_config": {},
                "tags": [],
                "is_a_snapshot": false,
                "is_a_template": false,
                "$snapshots": [],
                "$VDIs": vdi_uuids,
                "$VBDs": vbds,
                "VIFs": vif_records,
            }),
        );
        for (vdi, blocks) in vdis {
            state.disks.insert(vdi.to_string(), blocks.clone());
        }
    }

    pub fn write_block(&self, vdi: &str, block: &str, data: &str) {
        self.state
            .lock()
            .unwrap()
            .disks
            .entry(vdi.to_string())
            .or_default()
            .insert(block.to_string(), data.to_string());
    }

    pub fn set_unhealthy(&self, vm: &str) {
        self.state.lock().unwrap().unhealthy.insert(vm.to_string());
    }

    /// Make full exports hang forever (their streams never yield).
    pub fn hang_exports(&self) {
        self.state.lock().unwrap().hang_exports = true;
    }

    pub fn object(&self, id: &str) -> Option<Value> {
        self.state.lock().unwrap().objects.get(id).cloned()
    }

    /// Snapshots of `vm` as raw records, oldest first.
    pub fn snapshots_of(&self, vm: &str) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        let mut snapshots: Vec<Value> = state
            .objects
            .get(vm)
            .and_then(|record| record["$snapshots"].as_array())
            .into_iter()
            .flatten()
            .filter_map(|id| state.objects.get(id.as_str()?).cloned())
            .collect();
        snapshots.sort_by_key(|record| record["snapshot_time"].as_i64().unwrap_or(0));
        snapshots
    }

    /// VMs (not snapshots) whose `other_config` carries `key == value`.
    pub fn vms_marked(&self, key: &str, value: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .values()
            .filter(|record| {
                record["is_a_snapshot"] != json!(true)
                    && record["other_config"][key].as_str() == Some(value)
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HypervisorClient for MockXapi {
    fn objects(&self) -> Vec<XoObject> {
        self.state
            .lock()
            .unwrap()
            .objects
            .values()
            .cloned()
            .map(XoObject)
            .collect()
    }

    async fn get_object(&self, id: &str) -> Result<XoObject, Error> {
        self.object(id)
            .map(XoObject)
            .ok_or_else(|| format_err!("no such object '{}'", id))
    }

    async fn snapshot(
        &self,
        token: &CancellationToken,
        vm_id: &str,
        label: &str,
    ) -> Result<String, Error> {
        if token.is_cancelled() {
            bail!("snapshot cancelled");
        }
        let mut state = self.state.lock().unwrap();
        let snapshot_id = state.allocate("snap");
        let snapshot_time = state.tick();

        let vm = state
            .objects
            .get(vm_id)
            .cloned()
            .ok_or_else(|| format_err!("no such VM '{}'", vm_id))?;
        let vdi_uuids: Vec<String> = vm["$VDIs"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|vdi| vdi.as_str().map(str::to_string))
            .collect();

        let mut captured = BTreeMap::new();
        for vdi in &vdi_uuids {
            captured.insert(vdi.clone(), state.disks.get(vdi).cloned().unwrap_or_default());
        }
        state.snapshot_disks.insert(snapshot_id.clone(), captured);

        let mut snapshot = vm.clone();
        snapshot["id"] = json!(snapshot_id);
        snapshot["uuid"] = json!(snapshot_id);
        snapshot["name_label"] = json!(label);
        snapshot["is_a_snapshot"] = json!(true);
        snapshot["snapshot_time"] = json!(snapshot_time);
        snapshot["other_config"] = json!({});
        snapshot["$snapshots"] = json!([]);
        state.objects.insert(snapshot_id.clone(), snapshot);

        if let Some(list) = state
            .objects
            .get_mut(vm_id)
            .and_then(|record| record["$snapshots"].as_array_mut())
        {
            list.push(json!(snapshot_id));
        }
        Ok(snapshot_id)
    }

    async fn barrier(&self, snapshot_id: &str) -> Result<(), Error> {
        if self.object(snapshot_id).is_none() {
            bail!("barrier: snapshot '{}' not in cache", snapshot_id);
        }
        Ok(())
    }

    async fn delete_vm(&self, vm_id: &str, _force_destroy_disks: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .remove(vm_id)
            .ok_or_else(|| format_err!("no such VM '{}'", vm_id))?;
        state.snapshot_disks.remove(vm_id);
        for record in state.objects.values_mut() {
            if let Some(list) = record["$snapshots"].as_array_mut() {
                list.retain(|id| id.as_str() != Some(vm_id));
            }
        }
        Ok(())
    }

    async fn assert_healthy_vdi_chains(&self, vm_id: &str) -> Result<(), Error> {
        if self.state.lock().unwrap().unhealthy.contains(vm_id) {
            bail!("unhealthy VDI chain");
        }
        Ok(())
    }

    async fn export_vm(
        &self,
        token: &CancellationToken,
        snapshot_id: &str,
        _compress: Option<&str>,
    ) -> Result<ExportStream, Error> {
        if token.is_cancelled() {
            bail!("export cancelled");
        }
        let state = self.state.lock().unwrap();
        if state.hang_exports {
            return Ok(ExportStream {
                stream: futures::stream::pending::<std::io::Result<Bytes>>().boxed(),
                task: TaskHandle::ready(),
            });
        }
        let snapshot = state
            .objects
            .get(snapshot_id)
            .ok_or_else(|| format_err!("no such snapshot '{}'", snapshot_id))?;
        let disks = state
            .snapshot_disks
            .get(snapshot_id)
            .ok_or_else(|| format_err!("no disks for snapshot '{}'", snapshot_id))?;
        let payload = json!({
            "name_label": snapshot["name_label"],
            "disks": disks,
            "vbds": snapshot["$VBDs"],
            "vifs": snapshot["VIFs"],
        });
        Ok(ExportStream {
            stream: chunked(serde_json::to_vec(&payload)?),
            task: TaskHandle::ready(),
        })
    }

    async fn import_vm(&self, stream: ByteStream, sr_id: &str) -> Result<String, Error> {
        let data = collect(stream).await?;
        let imported: Value = serde_json::from_slice(&data)?;
        let mut state = self.state.lock().unwrap();
        let id = state.allocate("replica");
        state.objects.insert(
            id.clone(),
            json!({
                "id": id,
                "uuid": id,
                "name_label": imported["name_label"],
                "other_config": {},
                "tags": [],
                "is_a_snapshot": false,
                "is_a_template": false,
                "$snapshots": [],
                "$SR": sr_id,
                "imported": imported,
            }),
        );
        Ok(id)
    }

    async fn export_delta_vm(
        &self,
        token: &CancellationToken,
        snapshot_id: &str,
        base_snapshot_id: Option<&str>,
    ) -> Result<DeltaExport, Error> {
        if token.is_cancelled() {
            bail!("export cancelled");
        }
        let state = self.state.lock().unwrap();
        let snapshot = state
            .objects
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| format_err!("no such snapshot '{}'", snapshot_id))?;
        let snap_disks = state
            .snapshot_disks
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| format_err!("no disks for snapshot '{}'", snapshot_id))?;
        let base_disks = match base_snapshot_id {
            Some(base) => Some(
                state
                    .snapshot_disks
                    .get(base)
                    .cloned()
                    .ok_or_else(|| format_err!("no disks for base snapshot '{}'", base))?,
            ),
            None => None,
        };

        let mut streams: HashMap<String, StreamFactory> = HashMap::new();
        let mut vdis = Map::new();
        for (live_vdi, blocks) in &snap_disks {
            let changed: Blocks = match &base_disks {
                Some(base) => {
                    let before = base.get(live_vdi);
                    blocks
                        .iter()
                        .filter(|(block, data)| {
                            before.and_then(|blocks| blocks.get(*block)) != Some(data)
                        })
                        .map(|(block, data)| (block.clone(), data.clone()))
                        .collect()
                }
                None => blocks.clone(),
            };

            let snap_vdi_uuid = format!("{}.{}", live_vdi, snapshot_id);
            let key = format!("OpaqueRef:{}", snap_vdi_uuid);
            let mut record = json!({
                "uuid": snap_vdi_uuid,
                "$snapshot_of$uuid": live_vdi,
                "name_label": live_vdi,
                "other_config": {},
            });
            if let Some(base) = base_snapshot_id {
                record["other_config"]["xo:base_delta"] = json!(base);
            }
            vdis.insert(key.clone(), record);

            let payload = serde_json::to_vec(&json!({
                "uuid": live_vdi,
                "parent": base_snapshot_id.map(|_| "unresolved.vhd"),
                "blocks": changed,
            }))?;
            let factory_token = token.clone();
            let factory: StreamFactory = Box::new(move || {
                Box::pin(async move {
                    if factory_token.is_cancelled() {
                        bail!("delta export cancelled");
                    }
                    Ok(ExportStream {
                        stream: chunked(payload),
                        task: TaskHandle::ready(),
                    })
                })
            });
            streams.insert(key, factory);
        }

        Ok(DeltaExport {
            streams,
            vbds: snapshot["$VBDs"].clone(),
            vdis: Value::Object(vdis),
            vifs: snapshot["VIFs"].clone(),
            vm: snapshot,
        })
    }

    async fn import_delta_vm(
        &self,
        delta: DeltaImport,
        options: ImportDeltaOptions,
    ) -> Result<XoObject, Error> {
        let mut disks = Map::new();
        for (vdi_id, stream) in delta.streams {
            let data = collect(stream).await?;
            disks.insert(vdi_id, serde_json::from_slice(&data)?);
        }
        let mut state = self.state.lock().unwrap();
        let id = state.allocate("replica");
        let mut record = json!({
            "id": id,
            "uuid": id,
            "name_label": options.name_label,
            "other_config": {},
            "tags": [],
            "is_a_snapshot": false,
            "is_a_template": false,
            "$snapshots": [],
            "$SR": options.sr_id,
            "imported": {
                "disks": disks,
                "vbds": delta.vbds,
                "vdis": delta.vdis,
                "vifs": delta.vifs,
            },
        });
        if options.disable_start_after_import {
            record["blocked_operations"] = json!({"start": "imported"});
        }
        state.objects.insert(id.clone(), record.clone());
        Ok(XoObject(record))
    }

    async fn update_object_map_property(
        &self,
        id: &str,
        property: &str,
        updates: &HashMap<String, Option<String>>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .objects
            .get_mut(id)
            .ok_or_else(|| format_err!("no such object '{}'", id))?;
        if record[property].as_object().is_none() {
            record[property] = json!({});
        }
        let map = record[property].as_object_mut().unwrap();
        for (key, value) in updates {
            match value {
                Some(value) => {
                    map.insert(key.clone(), json!(value));
                }
                None => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn set_object_properties(&self, id: &str, properties: Value) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .objects
            .get_mut(id)
            .ok_or_else(|| format_err!("no such object '{}'", id))?;
        if let Some(properties) = properties.as_object() {
            for (key, value) in properties {
                record[key.as_str()] = value.clone();
            }
        }
        Ok(())
    }

    async fn add_tag(&self, id: &str, tag: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .objects
            .get_mut(id)
            .ok_or_else(|| format_err!("no such object '{}'", id))?;
        if record["tags"].as_array().is_none() {
            record["tags"] = json!([]);
        }
        record["tags"].as_array_mut().unwrap().push(json!(tag));
        Ok(())
    }
}

/// Toy codec behind the VHD library seam.
#[derive(Default)]
pub struct ToyVhd {
    fail_next_merge: AtomicBool,
}

impl ToyVhd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_merge(&self) {
        self.fail_next_merge.store(true, Ordering::SeqCst);
    }

    async fn read(remote: &dyn RemoteHandler, path: &str) -> Result<Value, Error> {
        let data = remote.read_file(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[async_trait]
impl VhdLibrary for ToyVhd {
    async fn read_header(
        &self,
        remote: &dyn RemoteHandler,
        path: &str,
    ) -> Result<VhdHeader, Error> {
        let vhd = Self::read(remote, path).await?;
        Ok(VhdHeader {
            parent_unicode_name: vhd["parent"].as_str().map(str::to_string),
        })
    }

    async fn chain(
        &self,
        _parent_remote: &dyn RemoteHandler,
        parent_path: &str,
        child_remote: &dyn RemoteHandler,
        child_path: &str,
    ) -> Result<(), Error> {
        let mut child = Self::read(child_remote, child_path).await?;
        child["parent"] = json!(basename(parent_path));
        child_remote
            .output_file(child_path, &serde_json::to_vec(&child)?)
            .await
    }

    async fn synthetic_stream(
        &self,
        remote: Arc<dyn RemoteHandler>,
        path: &str,
    ) -> Result<ByteStream, Error> {
        let dir = dirname(path).to_string();
        let mut vhd = Self::read(remote.as_ref(), path).await?;
        let uuid = vhd["uuid"].clone();
        let mut blocks = vhd["blocks"].as_object().cloned().unwrap_or_default();
        while let Some(parent) = vhd["parent"].as_str().map(str::to_string) {
            vhd = Self::read(remote.as_ref(), &join(&dir, &parent)).await?;
            for (block, data) in vhd["blocks"].as_object().cloned().unwrap_or_default() {
                blocks.entry(block).or_insert(data);
            }
        }
        let merged = json!({"uuid": uuid, "parent": null, "blocks": blocks});
        Ok(chunked(serde_json::to_vec(&merged)?))
    }
}

#[async_trait]
impl MergeWorker for ToyVhd {
    async fn merge_vhd(
        &self,
        parent_remote: Arc<dyn RemoteHandler>,
        parent_path: &str,
        child_remote: Arc<dyn RemoteHandler>,
        child_path: &str,
    ) -> Result<(), Error> {
        if self.fail_next_merge.swap(false, Ordering::SeqCst) {
            bail!("merge worker crashed");
        }
        let mut parent = Self::read(parent_remote.as_ref(), parent_path).await?;
        let child = Self::read(child_remote.as_ref(), child_path).await?;
        // the child's view wins; the merged file keeps the parent's own
        // parent link so grandparents stay reachable
        let mut blocks = parent["blocks"].as_object().cloned().unwrap_or_default();
        for (block, data) in child["blocks"].as_object().cloned().unwrap_or_default() {
            blocks.insert(block, data);
        }
        parent["blocks"] = Value::Object(blocks);
        parent["uuid"] = child["uuid"].clone();
        parent_remote
            .output_file(parent_path, &serde_json::to_vec(&parent)?)
            .await
    }
}
