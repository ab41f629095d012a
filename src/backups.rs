//! Browse, restore and delete stored backups.

use std::sync::Arc;

use anyhow::{format_err, Error};
use serde::Serialize;
use serde_json::Value;

use crate::byte_stream::ByteStream;
use crate::errors::{BackupError, ErrorKind};
use crate::hypervisor::{DeltaImport, HypervisorClient, ImportDeltaOptions, RESTORED_TAG};
use crate::job::Mode;
use crate::metadata::{backup_basename, BackupMetadata, BACKUP_ROOT_DIR, METADATA_FILE_REGEX};
use crate::remote::{dirname, is_missing, join, ReadStreamOptions, RemoteHandler};
use crate::chain;
use crate::vhd::{MergeWorker, VhdLibrary};

/// One backup as presented to users: stable id, payload disks, parsed
/// sidecar.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupListing {
    /// `<remoteId>/<sidecarPath>`.
    pub id: String,
    pub disks: Vec<DiskEntry>,
    #[serde(flatten)]
    pub metadata: BackupMetadata,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskEntry {
    /// Sidecar-relative path of the VHD.
    pub id: String,
    pub vdi_uuid: String,
}

/// Sidecars of one VM on one remote, sorted by timestamp ascending.
///
/// A missing VM directory (or backup root) is an empty list, not an
/// error. Unreadable sidecars are skipped with a warning; the reserved
/// `index.json` is ignored.
pub async fn list_vm_backups(
    remote: &dyn RemoteHandler,
    vm_uuid: &str,
    filter: Option<&(dyn Fn(&BackupMetadata) -> bool + Sync)>,
) -> Result<Vec<BackupMetadata>, Error> {
    let dir = join(BACKUP_ROOT_DIR, vm_uuid);
    let entries = match remote.list(&dir).await {
        Ok(entries) => entries,
        Err(err) if is_missing(&err) => return Ok(Vec::new()),
        Err(err) => return Err(BackupError::wrap(ErrorKind::RemoteUnavailable, err)),
    };

    let mut list = Vec::new();
    for name in entries {
        if !METADATA_FILE_REGEX.is_match(&name) {
            continue;
        }
        let path = join(&dir, &name);
        let metadata = async {
            let data = remote.read_file(&path).await?;
            BackupMetadata::from_slice(&data)
        }
        .await;
        let mut metadata = match metadata {
            Ok(metadata) => metadata,
            Err(err) => {
                log::warn!("skipping unreadable backup metadata {} - {:#}", path, err);
                continue;
            }
        };
        metadata.filename = Some(path);
        if filter.map_or(true, |filter| filter(&metadata)) {
            list.push(metadata);
        }
    }
    BackupMetadata::sort_list(&mut list);
    Ok(list)
}

/// All backups on a remote, as user-facing listings.
pub async fn list_backups(remote: &dyn RemoteHandler) -> Result<Vec<BackupListing>, Error> {
    let vm_dirs = match remote.list(BACKUP_ROOT_DIR).await {
        Ok(entries) => entries,
        Err(err) if is_missing(&err) => return Ok(Vec::new()),
        Err(err) => return Err(BackupError::wrap(ErrorKind::RemoteUnavailable, err)),
    };

    let mut listings = Vec::new();
    for vm_uuid in vm_dirs {
        if vm_uuid == "index.json" {
            continue;
        }
        for metadata in list_vm_backups(remote, &vm_uuid, None).await? {
            let disks = metadata
                .vhds
                .iter()
                .flatten()
                .map(|(vdi_uuid, path)| DiskEntry {
                    id: path.clone(),
                    vdi_uuid: vdi_uuid.clone(),
                })
                .collect();
            let filename = metadata.filename.clone().unwrap_or_default();
            listings.push(BackupListing {
                id: format!("{}/{}", remote.id(), filename),
                disks,
                metadata,
            });
        }
    }
    Ok(listings)
}

/// Read and parse one sidecar; a missing file is `no-such-backup`.
pub async fn read_metadata(
    remote: &dyn RemoteHandler,
    sidecar_path: &str,
) -> Result<BackupMetadata, Error> {
    let data = match remote.read_file(sidecar_path).await {
        Ok(data) => data,
        Err(err) if is_missing(&err) => {
            return Err(BackupError::new(
                ErrorKind::NoSuchBackup,
                format!("no backup metadata at '{}'", sidecar_path),
            ))
        }
        Err(err) => return Err(BackupError::wrap(ErrorKind::RemoteUnavailable, err)),
    };
    let mut metadata = BackupMetadata::from_slice(&data)?;
    metadata.filename = Some(sidecar_path.to_string());
    Ok(metadata)
}

/// Restore a backup as a new VM on `sr_id`. Returns the id of the
/// imported VM.
pub async fn import_backup(
    hypervisor: &dyn HypervisorClient,
    remote: Arc<dyn RemoteHandler>,
    vhd: &dyn VhdLibrary,
    metadata: &BackupMetadata,
    sr_id: &str,
) -> Result<String, Error> {
    let name_label = format!(
        "{} ({})",
        metadata.vm.get("name_label").and_then(Value::as_str).unwrap_or(""),
        backup_basename(metadata.timestamp)?,
    );

    let vm_id = match metadata.mode {
        Mode::Full => {
            let xva = metadata
                .xva
                .as_deref()
                .ok_or_else(|| format_err!("full backup metadata without an xva path"))?;
            let stream = remote
                .create_read_stream(
                    &metadata.resolve(xva)?,
                    ReadStreamOptions {
                        checksum: true,
                        ignore_missing_checksum: true,
                    },
                )
                .await?;
            let vm_id = hypervisor.import_vm(stream, sr_id).await?;
            hypervisor
                .set_object_properties(&vm_id, serde_json::json!({ "name_label": name_label }))
                .await?;
            vm_id
        }
        Mode::Delta => {
            let vhds = metadata
                .vhds
                .as_ref()
                .ok_or_else(|| format_err!("delta backup metadata without vhds"))?;
            let mut streams = std::collections::HashMap::new();
            for (vdi_id, path) in vhds {
                let stream: ByteStream = vhd
                    .synthetic_stream(Arc::clone(&remote), &metadata.resolve(path)?)
                    .await?;
                streams.insert(vdi_id.clone(), stream);
            }
            let imported = hypervisor
                .import_delta_vm(
                    DeltaImport {
                        streams,
                        vbds: metadata.vbds.clone().unwrap_or(Value::Null),
                        vdis: metadata.vdis.clone().unwrap_or(Value::Null),
                        vifs: metadata.vifs.clone().unwrap_or(Value::Null),
                        vm: metadata.vm.clone(),
                    },
                    ImportDeltaOptions {
                        sr_id: sr_id.to_string(),
                        name_label,
                        disable_start_after_import: false,
                    },
                )
                .await?;
            imported.id().to_string()
        }
    };

    hypervisor.add_tag(&vm_id, RESTORED_TAG).await?;
    Ok(vm_id)
}

/// Delete one stored backup: the sidecar first (so an interruption
/// leaves unreferenced payloads, never a dangling sidecar), then its
/// payloads — with VHDs going through [`safe_delete_vhd`] so the chain
/// invariant holds.
pub async fn delete_backup(
    remote: Arc<dyn RemoteHandler>,
    vhd: &dyn VhdLibrary,
    merge_worker: &dyn MergeWorker,
    metadata: &BackupMetadata,
) -> Result<(), Error> {
    let sidecar = metadata
        .filename
        .as_deref()
        .ok_or_else(|| format_err!("metadata was not read from a remote"))?;
    remote.unlink(sidecar, false).await?;

    match metadata.mode {
        Mode::Full => {
            if let Some(xva) = metadata.xva.as_deref() {
                remote.unlink(&metadata.resolve(xva)?, true).await?;
            }
        }
        Mode::Delta => {
            for path in metadata.vhds.iter().flatten().map(|(_, path)| path) {
                safe_delete_vhd(Arc::clone(&remote), vhd, merge_worker, &metadata.resolve(path)?)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Delete a list of backups, keeping going on individual failures and
/// reporting the first error.
pub async fn delete_backups(
    remote: &Arc<dyn RemoteHandler>,
    vhd: &dyn VhdLibrary,
    merge_worker: &dyn MergeWorker,
    list: &[BackupMetadata],
) -> Result<(), Error> {
    let mut first_error = None;
    for metadata in list {
        if let Err(err) = delete_backup(Arc::clone(remote), vhd, merge_worker, metadata).await {
            log::warn!(
                "unable to delete backup {:?} - {:#}",
                metadata.filename,
                err
            );
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Remove one VHD from its chain without breaking descendants.
///
/// When the VHD has no child it is simply unlinked. Otherwise the child
/// is folded into it by the merge worker and the merged file is renamed
/// over the child, so grandchildren keep resolving their parent by
/// basename. A failed merge quarantines the VHD under a `.tainted` name
/// and surfaces `merge-failed`; the next run for that chain falls back
/// to a full.
pub async fn safe_delete_vhd(
    remote: Arc<dyn RemoteHandler>,
    vhd: &dyn VhdLibrary,
    merge_worker: &dyn MergeWorker,
    path: &str,
) -> Result<(), Error> {
    let dir = dirname(path);
    let child = chain::child_of(vhd, remote.as_ref(), dir, path).await?;

    let child_path = match child {
        None => return remote.unlink(path, false).await,
        Some(child_path) => child_path,
    };

    if let Err(err) = merge_worker
        .merge_vhd(Arc::clone(&remote), path, Arc::clone(&remote), &child_path)
        .await
    {
        let quarantine = format!("{}{}", path, chain::TAINTED_SUFFIX);
        if let Err(rename_err) = remote.rename(path, &quarantine, false).await {
            log::warn!("unable to quarantine {} - {:#}", path, rename_err);
        }
        return Err(BackupError::wrap(ErrorKind::MergeFailed, err));
    }

    remote.rename(path, &child_path, false).await
}

/// Filter matching the retention scope of a run.
pub fn retention_filter<'a>(
    mode: Mode,
    schedule_id: &'a str,
) -> impl Fn(&BackupMetadata) -> bool + Sync + 'a {
    move |metadata| metadata.mode == mode && metadata.schedule_id == schedule_id
}
