//! Per-VM backup worker.
//!
//! One run per VM and fired schedule: snapshot, export, fan-out to every
//! configured target, rotate retention, clean up. Target failures are
//! recorded as task failures and never disturb sibling targets; the
//! snapshot retention cleanup runs on every exit path.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{format_err, Error};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::atomic::write_atomic;
use crate::backups::{self, retention_filter};
use crate::byte_stream::{guard_stream, CountedStream, ExportStream, StreamFactory};
use crate::chain;
use crate::errors::{BackupError, ErrorKind};
use crate::fork_stream::{fork_factory, fork_stream, ForkedVdiFactory};
use crate::hypervisor::{
    DeltaImport, HypervisorClient, ImportDeltaOptions, XoObject, BASE_DELTA_KEY,
    BLOCKED_START_REASON, ROLE_TAG_DELTA, ROLE_TAG_FULL, TAG_JOB, TAG_SCHEDULE, TAG_SR, TAG_VM,
};
use crate::job::{Job, Mode, Schedule};
use crate::metadata::{backup_basename, BackupMetadata, BACKUP_ROOT_DIR, METADATA_VERSION};
use crate::remote::{join, RemoteHandler};
use crate::retention::old_entries;
use crate::settings::JOB_DEFAULT_SCOPE;
use crate::tasklog::{TaskLogger, TaskOptions};
use crate::vhd::{MergeWorker, VhdLibrary};

/// How long a cancelled or timed-out worker is drained so its error
/// paths can unlink temporary files.
const CANCEL_DRAIN: Duration = Duration::from_secs(30);

pub struct VmBackup {
    pub hypervisor: Arc<dyn HypervisorClient>,
    pub vhd: Arc<dyn VhdLibrary>,
    pub merge_worker: Arc<dyn MergeWorker>,
    pub logger: Arc<TaskLogger>,
    pub job: Job,
    pub schedule: Schedule,
    pub remotes: Vec<Arc<dyn RemoteHandler>>,
    pub srs: Vec<String>,
    /// Fire time of the run, milliseconds.
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VmRunStats {
    /// Bytes read from the hypervisor export (full mode only).
    pub transfer_size: Option<u64>,
}

/// Records exported by a delta, kept for sidecars and SR imports.
struct DeltaRecords {
    vbds: Value,
    vdis: Value,
    vifs: Value,
    vm: Value,
}

impl VmBackup {
    /// Run the backup of one VM under `token` (forked from the job's
    /// token by the executor; cancelling it never affects siblings).
    pub async fn run(
        &self,
        token: CancellationToken,
        vm_uuid: &str,
        task_id: &str,
    ) -> Result<VmRunStats, Error> {
        let scopes = [vm_uuid, self.schedule.id.as_str(), JOB_DEFAULT_SCOPE];
        let export_retention = self.job.settings.export_retention(&scopes);
        let snapshot_retention = self.job.settings.snapshot_retention(&scopes);
        let vm_timeout = self.job.settings.vm_timeout(&scopes);

        if export_retention == 0 && snapshot_retention == 0 {
            return Err(BackupError::new(
                ErrorKind::InvalidConfig,
                "both exportRetention and snapshotRetention are 0",
            ));
        }
        if export_retention > 0 && self.remotes.is_empty() && self.srs.is_empty() {
            return Err(BackupError::new(
                ErrorKind::InvalidConfig,
                "no-target: exportRetention > 0 but no remote nor SR is configured",
            ));
        }

        let vm = self.hypervisor.get_object(vm_uuid).await?;
        self.strip_backup_marks(&vm).await?;

        let prior_snapshots = self.list_prior_snapshots(&vm).await?;

        if let Err(err) = self.hypervisor.assert_healthy_vdi_chains(vm.id()).await {
            return Err(BackupError::wrap(ErrorKind::UnhealthyVdiChain, err));
        }

        // Anything from here on allocates a snapshot: the retention
        // cleanup below must run on every exit path.
        let new_snapshot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let work = self.snapshot_and_export(
            &token,
            &vm,
            &prior_snapshots,
            Arc::clone(&new_snapshot),
            export_retention,
            task_id,
        );
        let result = Self::race(work, &token, vm_uuid, vm_timeout).await;

        let created = new_snapshot.lock().unwrap().take();
        self.rotate_snapshots(snapshot_retention, &prior_snapshots, created, result.is_ok())
            .await;

        result
    }

    /// Race `work` against cancellation and the per-VM deadline. The
    /// loser is drained, not dropped, so its cleanup paths run.
    async fn race<F>(
        work: F,
        token: &CancellationToken,
        vm_uuid: &str,
        vm_timeout: u64,
    ) -> Result<VmRunStats, Error>
    where
        F: Future<Output = Result<VmRunStats, Error>>,
    {
        tokio::pin!(work);

        if vm_timeout > 0 {
            tokio::select! {
                result = &mut work => result,
                _ = token.cancelled() => {
                    let _ = tokio::time::timeout(CANCEL_DRAIN, &mut work).await;
                    Err(BackupError::new(ErrorKind::Cancelled, "backup cancelled"))
                }
                _ = tokio::time::sleep(Duration::from_millis(vm_timeout)) => {
                    token.cancel();
                    let _ = tokio::time::timeout(CANCEL_DRAIN, &mut work).await;
                    Err(BackupError::new(
                        ErrorKind::Timeout,
                        format!("VM {} exceeded the {} ms timeout", vm_uuid, vm_timeout),
                    ))
                }
            }
        } else {
            tokio::select! {
                result = &mut work => result,
                _ = token.cancelled() => {
                    let _ = tokio::time::timeout(CANCEL_DRAIN, &mut work).await;
                    Err(BackupError::new(ErrorKind::Cancelled, "backup cancelled"))
                }
            }
        }
    }

    /// The managed VM must not carry the backup marks, or manual
    /// snapshots would inherit them and pollute retention.
    async fn strip_backup_marks(&self, vm: &XoObject) -> Result<(), Error> {
        let mut updates = HashMap::new();
        for key in [TAG_JOB, TAG_SCHEDULE, TAG_VM] {
            if vm.other_config_value(key).is_some() {
                updates.insert(key.to_string(), None);
            }
        }
        if updates.is_empty() {
            return Ok(());
        }
        self.hypervisor
            .update_object_map_property(vm.id(), "other_config", &updates)
            .await
    }

    /// Snapshots of this VM created by this job, oldest first.
    async fn list_prior_snapshots(&self, vm: &XoObject) -> Result<Vec<XoObject>, Error> {
        let mut snapshots = Vec::new();
        for id in vm.snapshots() {
            match self.hypervisor.get_object(id).await {
                Ok(snapshot) => {
                    if snapshot.other_config_value(TAG_JOB) == Some(self.job.id.as_str()) {
                        snapshots.push(snapshot);
                    }
                }
                Err(err) => {
                    log::warn!("snapshot {} vanished from the cache - {:#}", id, err);
                }
            }
        }
        snapshots.sort_by_key(XoObject::snapshot_time);
        Ok(snapshots)
    }

    fn backup_marks(&self, vm_uuid: &str) -> HashMap<String, Option<String>> {
        HashMap::from([
            (TAG_JOB.to_string(), Some(self.job.id.clone())),
            (TAG_SCHEDULE.to_string(), Some(self.schedule.id.clone())),
            (TAG_VM.to_string(), Some(vm_uuid.to_string())),
        ])
    }

    async fn snapshot_and_export(
        &self,
        token: &CancellationToken,
        vm: &XoObject,
        prior_snapshots: &[XoObject],
        new_snapshot: Arc<Mutex<Option<String>>>,
        export_retention: u32,
        task_id: &str,
    ) -> Result<VmRunStats, Error> {
        let label = format!("[XO Backup {}] {}", self.job.label(), vm.name_label());
        let snapshot_id = self.hypervisor.snapshot(token, vm.id(), &label).await?;
        *new_snapshot.lock().unwrap() = Some(snapshot_id.clone());

        self.hypervisor
            .update_object_map_property(
                &snapshot_id,
                "other_config",
                &self.backup_marks(vm.uuid()),
            )
            .await?;
        self.hypervisor.barrier(&snapshot_id).await?;

        if export_retention == 0 {
            // snapshot-only run
            return Ok(VmRunStats::default());
        }

        let snapshot = self.hypervisor.get_object(&snapshot_id).await?;
        let basename = backup_basename(self.timestamp)?;

        match self.job.mode {
            Mode::Full => {
                self.export_full(token, vm, &snapshot, &basename, export_retention, task_id)
                    .await
            }
            Mode::Delta => {
                self.export_delta(
                    token,
                    vm,
                    &snapshot,
                    prior_snapshots,
                    &basename,
                    export_retention,
                    task_id,
                )
                .await
            }
        }
    }

    async fn export_full(
        &self,
        token: &CancellationToken,
        vm: &XoObject,
        snapshot: &XoObject,
        basename: &str,
        export_retention: u32,
        task_id: &str,
    ) -> Result<VmRunStats, Error> {
        let export = self
            .hypervisor
            .export_vm(token, snapshot.id(), self.job.compression.as_deref())
            .await?;

        let (counted, exported) = CountedStream::new(guard_stream(export.stream, token));
        let target_count = self.remotes.len() + self.srs.len();
        let mut branches = fork_stream(Box::pin(counted), target_count);
        let source_task = export.task;

        let mut targets: Vec<Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>>> =
            Vec::new();
        for remote in &self.remotes {
            let export = ExportStream {
                stream: branches.remove(0),
                task: source_task.clone(),
            };
            let opts = TaskOptions::new("export")
                .parent(task_id)
                .data(json!({"type": "remote", "id": remote.id()}));
            targets.push(Box::pin(self.logger.wrap_fn(opts, move |target_task| {
                self.full_to_remote(
                    remote,
                    vm,
                    snapshot,
                    export,
                    basename,
                    export_retention,
                    target_task,
                )
            })));
        }
        for sr_id in &self.srs {
            let export = ExportStream {
                stream: branches.remove(0),
                task: source_task.clone(),
            };
            let opts = TaskOptions::new("export")
                .parent(task_id)
                .data(json!({"type": "SR", "id": sr_id}));
            targets.push(Box::pin(self.logger.wrap_fn(opts, move |target_task| {
                self.replicate_to_sr(sr_id, vm, None, Some(export), basename, export_retention, target_task)
            })));
        }

        Self::settle(targets).await?;

        Ok(VmRunStats {
            transfer_size: Some(exported.load(std::sync::atomic::Ordering::Relaxed)),
        })
    }

    async fn export_delta(
        &self,
        token: &CancellationToken,
        vm: &XoObject,
        snapshot: &XoObject,
        prior_snapshots: &[XoObject],
        basename: &str,
        export_retention: u32,
        task_id: &str,
    ) -> Result<VmRunStats, Error> {
        let mut base_snapshot = prior_snapshots.last();
        let mut forced_full = false;
        if base_snapshot.is_some() {
            for remote in &self.remotes {
                if self.has_tainted_chain(remote.as_ref(), vm.uuid()).await? {
                    log::warn!(
                        "tainted VHD chain for VM {} on remote {}, forcing a full export",
                        vm.uuid(),
                        remote.id()
                    );
                    base_snapshot = None;
                    forced_full = true;
                    break;
                }
            }
        }

        let delta = self
            .hypervisor
            .export_delta_vm(token, snapshot.id(), base_snapshot.map(XoObject::id))
            .await?;
        let records = DeltaRecords {
            vbds: delta.vbds,
            vdis: delta.vdis,
            vifs: delta.vifs,
            vm: delta.vm,
        };

        let target_count = self.remotes.len() + self.srs.len();
        let mut per_target: Vec<HashMap<String, ForkedVdiFactory>> =
            (0..target_count).map(|_| HashMap::new()).collect();
        for (vdi_id, factory) in delta.streams {
            let factory = Self::guard_factory(factory, token);
            for (index, branch) in fork_factory(factory, target_count).into_iter().enumerate() {
                per_target[index].insert(vdi_id.clone(), branch);
            }
        }
        per_target.reverse(); // pop() below hands branches out in target order

        let mut targets: Vec<Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>>> =
            Vec::new();
        for remote in &self.remotes {
            let streams = per_target.pop().ok_or_else(|| format_err!("fork underflow"))?;
            let opts = TaskOptions::new("export")
                .parent(task_id)
                .data(json!({"type": "remote", "id": remote.id()}));
            let records = &records;
            targets.push(Box::pin(self.logger.wrap_fn(opts, move |target_task| {
                self.delta_to_remote(
                    remote,
                    vm,
                    snapshot,
                    records,
                    streams,
                    basename,
                    export_retention,
                    forced_full,
                    target_task,
                )
            })));
        }
        for sr_id in &self.srs {
            let streams = per_target.pop().ok_or_else(|| format_err!("fork underflow"))?;
            let opts = TaskOptions::new("export")
                .parent(task_id)
                .data(json!({"type": "SR", "id": sr_id}));
            let records = &records;
            targets.push(Box::pin(self.logger.wrap_fn(opts, move |target_task| {
                self.delta_to_sr(
                    sr_id,
                    vm,
                    records,
                    streams,
                    basename,
                    export_retention,
                    target_task,
                )
            })));
        }

        Self::settle(targets).await?;
        Ok(VmRunStats::default())
    }

    fn guard_factory(factory: StreamFactory, token: &CancellationToken) -> StreamFactory {
        let token = token.clone();
        Box::new(move || {
            Box::pin(async move {
                let export = factory().await?;
                Ok(ExportStream {
                    stream: guard_stream(export.stream, &token),
                    task: export.task,
                })
            })
        })
    }

    /// Await every target; errors are already recorded as task failures,
    /// the first one fails the VM once all siblings have settled.
    async fn settle<'a>(
        targets: Vec<Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>>,
    ) -> Result<(), Error> {
        let results = futures::future::join_all(targets).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn full_to_remote(
        &self,
        remote: &Arc<dyn RemoteHandler>,
        vm: &XoObject,
        snapshot: &XoObject,
        export: ExportStream,
        basename: &str,
        export_retention: u32,
        target_task: String,
    ) -> Result<(), Error> {
        let vm_dir = join(BACKUP_ROOT_DIR, vm.uuid());
        let delete_first = self
            .job
            .settings
            .delete_first(&[remote.id(), JOB_DEFAULT_SCOPE]);

        let filter = retention_filter(Mode::Full, &self.schedule.id);
        let prior = backups::list_vm_backups(remote.as_ref(), vm.uuid(), Some(&filter)).await?;
        let old = old_entries(export_retention, &prior);

        if delete_first {
            backups::delete_backups(remote, self.vhd.as_ref(), self.merge_worker.as_ref(), old)
                .await?;
        }

        let xva_name = format!("{}.xva", basename);
        let xva_path = join(&vm_dir, &xva_name);
        self.logger
            .wrap_with(
                TaskOptions::new("transfer").parent(target_task.clone()),
                |size: &u64| json!({"size": size}),
                async {
                    write_atomic(remote.as_ref(), &xva_path, export, true)
                        .await
                        .map_err(|err| BackupError::wrap(ErrorKind::TransferFailed, err))
                },
            )
            .await?;

        let metadata = BackupMetadata {
            job_id: self.job.id.clone(),
            schedule_id: self.schedule.id.clone(),
            timestamp: self.timestamp,
            version: METADATA_VERSION.to_string(),
            mode: Mode::Full,
            vm: vm.0.clone(),
            vm_snapshot: snapshot.0.clone(),
            xva: Some(format!("./{}", xva_name)),
            vbds: None,
            vdis: None,
            vifs: None,
            vhds: None,
            filename: None,
        };
        remote
            .output_file(
                &join(&vm_dir, &format!("{}.json", basename)),
                &metadata.to_vec()?,
            )
            .await?;

        if !delete_first {
            backups::delete_backups(remote, self.vhd.as_ref(), self.merge_worker.as_ref(), old)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn delta_to_remote(
        &self,
        remote: &Arc<dyn RemoteHandler>,
        vm: &XoObject,
        snapshot: &XoObject,
        records: &DeltaRecords,
        streams: HashMap<String, ForkedVdiFactory>,
        basename: &str,
        export_retention: u32,
        forced_full: bool,
        target_task: String,
    ) -> Result<(), Error> {
        let vm_dir = join(BACKUP_ROOT_DIR, vm.uuid());
        let delete_first = self
            .job
            .settings
            .delete_first(&[remote.id(), JOB_DEFAULT_SCOPE]);

        let filter = retention_filter(Mode::Delta, &self.schedule.id);
        let prior = backups::list_vm_backups(remote.as_ref(), vm.uuid(), Some(&filter)).await?;
        let old = old_entries(export_retention, &prior);

        // deleting first with a retention of 1 would coalesce the only
        // base away before the new delta lands
        let deleted_first = delete_first && export_retention > 1;
        if deleted_first {
            backups::delete_backups(remote, self.vhd.as_ref(), self.merge_worker.as_ref(), old)
                .await?;
        }

        let vm_dir_ref: &str = &vm_dir;
        let (_, vhds) = self
            .logger
            .wrap_with(
                TaskOptions::new("transfer").parent(target_task.clone()),
                |(size, _): &(u64, BTreeMap<String, String>)| json!({"size": size}),
                async move {
                    let mut vhds = BTreeMap::new();
                    let mut total = 0u64;
                    for (vdi_id, factory) in streams {
                        let (size, vhd_rel) = self
                            .write_vdi_delta(remote, vm_dir_ref, records, &vdi_id, factory, basename)
                            .await?;
                        total += size;
                        vhds.insert(vdi_id, vhd_rel);
                    }
                    Ok((total, vhds))
                },
            )
            .await?;

        if forced_full {
            self.clear_tainted(remote.as_ref(), vm.uuid()).await;
        }

        let metadata = BackupMetadata {
            job_id: self.job.id.clone(),
            schedule_id: self.schedule.id.clone(),
            timestamp: self.timestamp,
            version: METADATA_VERSION.to_string(),
            mode: Mode::Delta,
            vm: vm.0.clone(),
            vm_snapshot: snapshot.0.clone(),
            xva: None,
            vbds: Some(records.vbds.clone()),
            vdis: Some(records.vdis.clone()),
            vifs: Some(records.vifs.clone()),
            vhds: Some(vhds),
            filename: None,
        };
        remote
            .output_file(
                &join(&vm_dir, &format!("{}.json", basename)),
                &metadata.to_vec()?,
            )
            .await?;

        if !deleted_first {
            backups::delete_backups(remote, self.vhd.as_ref(), self.merge_worker.as_ref(), old)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    /// Write one VDI's delta payload, splicing it onto the chain when it
    /// has a base. Returns the byte count and the sidecar-relative path.
    async fn write_vdi_delta(
        &self,
        remote: &Arc<dyn RemoteHandler>,
        vm_dir: &str,
        records: &DeltaRecords,
        vdi_id: &str,
        factory: ForkedVdiFactory,
        basename: &str,
    ) -> Result<(u64, String), Error> {
        let vdi = records
            .vdis
            .get(vdi_id)
            .cloned()
            .map(XoObject)
            .ok_or_else(|| format_err!("delta export has no VDI record for {}", vdi_id))?;
        // one directory per live VDI, so chains accumulate across runs
        let stable_uuid = vdi.snapshot_of_uuid().unwrap_or(vdi.uuid()).to_string();

        let vdi_dir = format!("vdis/{}/{}", self.job.id, stable_uuid);
        let abs_dir = join(vm_dir, &vdi_dir);
        let existing = chain::list_vhds(remote.as_ref(), &abs_dir).await?;

        let export = factory.open().await?;
        let vhd_rel = format!("{}/{}.vhd", vdi_dir, basename);
        let vhd_abs = join(vm_dir, &vhd_rel);
        let size = write_atomic(remote.as_ref(), &vhd_abs, export, false)
            .await
            .map_err(|err| BackupError::wrap(ErrorKind::TransferFailed, err))?;

        if vdi.other_config_value(BASE_DELTA_KEY).is_some() {
            // splice the new child onto the chain already on this remote
            let parent_name = existing.last().ok_or_else(|| {
                BackupError::new(
                    ErrorKind::TransferFailed,
                    format!("no parent VHD on remote for delta of VDI {}", stable_uuid),
                )
            })?;
            let parent_abs = join(&abs_dir, parent_name);
            self.vhd
                .chain(remote.as_ref(), &parent_abs, remote.as_ref(), &vhd_abs)
                .await?;
        }

        Ok((size, vhd_rel))
    }

    async fn delta_to_sr(
        &self,
        sr_id: &str,
        vm: &XoObject,
        records: &DeltaRecords,
        streams: HashMap<String, ForkedVdiFactory>,
        basename: &str,
        export_retention: u32,
        target_task: String,
    ) -> Result<(), Error> {
        self.replicate_to_sr(
            sr_id,
            vm,
            Some((records, streams)),
            None,
            basename,
            export_retention,
            target_task,
        )
        .await
    }

    /// Replication to an SR, both modes. Exactly one of `delta` and
    /// `full_export` is provided.
    #[allow(clippy::type_complexity)]
    async fn replicate_to_sr(
        &self,
        sr_id: &str,
        vm: &XoObject,
        delta: Option<(&DeltaRecords, HashMap<String, ForkedVdiFactory>)>,
        full_export: Option<ExportStream>,
        basename: &str,
        export_retention: u32,
        target_task: String,
    ) -> Result<(), Error> {
        let delete_first = self.job.settings.delete_first(&[sr_id, JOB_DEFAULT_SCOPE]);
        let replicas = self.list_replicas(sr_id, vm.uuid());
        let old = old_entries(export_retention, &replicas);

        if delete_first {
            self.delete_replicas(old).await?;
        }

        let name_label = format!("{} ({})", vm.name_label(), basename);
        let vm_id = match (delta, full_export) {
            (None, Some(export)) => {
                let ExportStream { stream, task } = export;
                let vm_id = self
                    .logger
                    .wrap_with(
                        TaskOptions::new("transfer").parent(target_task.clone()),
                        |id: &String| json!({"id": id}),
                        async {
                            let vm_id = self
                                .hypervisor
                                .import_vm(stream, sr_id)
                                .await
                                .map_err(|err| BackupError::wrap(ErrorKind::TransferFailed, err))?;
                            task.wait()
                                .await
                                .map_err(|err| BackupError::wrap(ErrorKind::TransferFailed, err))?;
                            Ok(vm_id)
                        },
                    )
                    .await?;
                self.hypervisor
                    .set_object_properties(&vm_id, json!({ "name_label": name_label }))
                    .await?;
                vm_id
            }
            (Some((records, streams)), None) => {
                let imported = self
                    .logger
                    .wrap_with(
                        TaskOptions::new("transfer").parent(target_task.clone()),
                        |imported: &XoObject| json!({"id": imported.uuid()}),
                        async {
                            let mut opened = HashMap::new();
                            let mut tasks = Vec::new();
                            for (vdi_id, factory) in streams {
                                let export = factory.open().await?;
                                opened.insert(vdi_id, export.stream);
                                tasks.push(export.task);
                            }
                            let imported = self
                                .hypervisor
                                .import_delta_vm(
                                    DeltaImport {
                                        streams: opened,
                                        vbds: records.vbds.clone(),
                                        vdis: records.vdis.clone(),
                                        vifs: records.vifs.clone(),
                                        vm: records.vm.clone(),
                                    },
                                    ImportDeltaOptions {
                                        sr_id: sr_id.to_string(),
                                        name_label: name_label.clone(),
                                        disable_start_after_import: true,
                                    },
                                )
                                .await
                                .map_err(|err| BackupError::wrap(ErrorKind::TransferFailed, err))?;
                            for task in tasks {
                                task.wait()
                                    .await
                                    .map_err(|err| BackupError::wrap(ErrorKind::TransferFailed, err))?;
                            }
                            Ok(imported)
                        },
                    )
                    .await?;
                imported.id().to_string()
            }
            _ => return Err(format_err!("replication needs exactly one payload")),
        };

        self.hypervisor
            .update_object_map_property(
                &vm_id,
                "blocked_operations",
                &HashMap::from([("start".to_string(), Some(BLOCKED_START_REASON.to_string()))]),
            )
            .await?;
        self.hypervisor
            .update_object_map_property(
                &vm_id,
                "other_config",
                &HashMap::from([
                    (TAG_SR.to_string(), Some(sr_id.to_string())),
                    (TAG_SCHEDULE.to_string(), Some(self.schedule.id.clone())),
                    (TAG_VM.to_string(), Some(vm.uuid().to_string())),
                ]),
            )
            .await?;
        let role = match self.job.mode {
            Mode::Full => ROLE_TAG_FULL,
            Mode::Delta => ROLE_TAG_DELTA,
        };
        self.hypervisor.add_tag(&vm_id, role).await?;

        if !delete_first {
            self.delete_replicas(old).await?;
        }
        Ok(())
    }

    /// Replicas of `(schedule, vm)` on `sr_id`, oldest first — the
    /// timestamp suffix of `name_label` makes the lexicographic order
    /// chronological for a given VM.
    fn list_replicas(&self, sr_id: &str, vm_uuid: &str) -> Vec<XoObject> {
        let mut replicas: Vec<XoObject> = self
            .hypervisor
            .objects()
            .into_iter()
            .filter(|object| {
                object.other_config_value(TAG_SR) == Some(sr_id)
                    && object.other_config_value(TAG_SCHEDULE) == Some(self.schedule.id.as_str())
                    && object.other_config_value(TAG_VM) == Some(vm_uuid)
            })
            .collect();
        replicas.sort_by(|a, b| a.name_label().cmp(b.name_label()));
        replicas
    }

    async fn delete_replicas(&self, replicas: &[XoObject]) -> Result<(), Error> {
        let mut first_error = None;
        for replica in replicas {
            if let Err(err) = self.hypervisor.delete_vm(replica.id(), true).await {
                log::warn!("unable to delete replica {} - {:#}", replica.uuid(), err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Retention-driven snapshot cleanup, run on every exit path.
    /// Failures are logged and never mask the primary outcome.
    async fn rotate_snapshots(
        &self,
        snapshot_retention: u32,
        prior_snapshots: &[XoObject],
        new_snapshot: Option<String>,
        success: bool,
    ) {
        if new_snapshot.is_none() {
            // nothing was allocated, nothing to clean up
            return;
        }

        if snapshot_retention > 0 {
            let scoped: Vec<&XoObject> = prior_snapshots
                .iter()
                .filter(|snapshot| {
                    snapshot.other_config_value(TAG_SCHEDULE) == Some(self.schedule.id.as_str())
                })
                .collect();
            for snapshot in old_entries(snapshot_retention, &scoped) {
                if let Err(err) = self.hypervisor.delete_vm(snapshot.id(), true).await {
                    log::warn!(
                        "unable to delete old snapshot {} - {:#}",
                        snapshot.uuid(),
                        err
                    );
                }
            }
        } else if success {
            // the snapshot was only an export source
            if let Some(snapshot_id) = new_snapshot {
                if let Err(err) = self.hypervisor.delete_vm(&snapshot_id, true).await {
                    log::warn!("unable to delete snapshot {} - {:#}", snapshot_id, err);
                }
            }
        }
    }

    /// Quarantined VHDs under any of this job's VDI directories?
    async fn has_tainted_chain(
        &self,
        remote: &dyn RemoteHandler,
        vm_uuid: &str,
    ) -> Result<bool, Error> {
        for dir in self.vdi_dirs(remote, vm_uuid).await? {
            if !chain::list_tainted(remote, &dir).await?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn clear_tainted(&self, remote: &dyn RemoteHandler, vm_uuid: &str) {
        let dirs = match self.vdi_dirs(remote, vm_uuid).await {
            Ok(dirs) => dirs,
            Err(err) => {
                log::warn!("unable to enumerate VDI directories - {:#}", err);
                return;
            }
        };
        for dir in dirs {
            let tainted = match chain::list_tainted(remote, &dir).await {
                Ok(tainted) => tainted,
                Err(err) => {
                    log::warn!("unable to list {} - {:#}", dir, err);
                    continue;
                }
            };
            for name in tainted {
                let path = join(&dir, &name);
                if let Err(err) = remote.unlink(&path, false).await {
                    log::warn!("unable to remove quarantined VHD {} - {:#}", path, err);
                }
            }
        }
    }

    async fn vdi_dirs(
        &self,
        remote: &dyn RemoteHandler,
        vm_uuid: &str,
    ) -> Result<Vec<String>, Error> {
        let job_dir = join(
            &join(BACKUP_ROOT_DIR, vm_uuid),
            &format!("vdis/{}", self.job.id),
        );
        match remote.list(&job_dir).await {
            Ok(entries) => Ok(entries
                .into_iter()
                .map(|name| join(&job_dir, &name))
                .collect()),
            Err(err) if crate::remote::is_missing(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}
