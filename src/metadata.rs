use std::collections::BTreeMap;

use anyhow::{format_err, Error};
use chrono::{TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::Mode;

/// Format version written into every sidecar.
pub const METADATA_VERSION: &str = "2.0.0";

/// Top-level directory of the backup layout on every remote.
pub const BACKUP_ROOT_DIR: &str = "xo-vm-backups";

lazy_static! {
    /// `<YYYYMMDD>T<HHmmss>Z` — fixed width, so lexicographic order is
    /// chronological order.
    pub static ref BACKUP_BASENAME_REGEX: Regex =
        Regex::new(r"^[0-9]{8}T[0-9]{6}Z$").unwrap();
    pub static ref METADATA_FILE_REGEX: Regex =
        Regex::new(r"^[0-9]{8}T[0-9]{6}Z\.json$").unwrap();
}

/// Render a millisecond UTC timestamp as a backup basename.
pub fn backup_basename(timestamp: i64) -> Result<String, Error> {
    let time = Utc
        .timestamp_millis_opt(timestamp)
        .single()
        .ok_or_else(|| format_err!("timestamp {} out of range", timestamp))?;
    Ok(time.format("%Y%m%dT%H%M%SZ").to_string())
}

/// Sidecar describing one stored backup.
///
/// Unknown top-level keys are tolerated on read so newer writers do not
/// break older readers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub job_id: String,
    pub schedule_id: String,
    /// Milliseconds since the epoch; sort key for retention.
    pub timestamp: i64,
    pub version: String,
    pub mode: Mode,
    /// VM record at snapshot time.
    pub vm: Value,
    /// Snapshot record the payload was exported from.
    pub vm_snapshot: Value,
    /// Full mode: sidecar-relative path of the XVA payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xva: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vbds: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vdis: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vifs: Option<Value>,
    /// Delta mode: VDI id to the sidecar-relative path of the VHD written
    /// for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhds: Option<BTreeMap<String, String>>,
    /// Remote path of the sidecar itself, attached by the lister.
    #[serde(skip)]
    pub filename: Option<String>,
}

impl BackupMetadata {
    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let metadata: BackupMetadata = serde_json::from_slice(data)
            .map_err(|err| format_err!("unable to parse backup metadata - {}", err))?;
        Ok(metadata)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Resolve a sidecar-relative payload path against the sidecar's own
    /// location.
    pub fn resolve(&self, relative: &str) -> Result<String, Error> {
        let filename = self
            .filename
            .as_deref()
            .ok_or_else(|| format_err!("metadata was not read from a remote"))?;
        Ok(resolve_relative(crate::remote::dirname(filename), relative))
    }

    /// Oldest first.
    pub fn sort_list(list: &mut [BackupMetadata]) {
        list.sort_unstable_by_key(|metadata| metadata.timestamp);
    }
}

/// Join a sidecar-relative string onto a directory, stripping a leading
/// `./` if present.
pub fn resolve_relative(dir: &str, relative: &str) -> String {
    let relative = relative.strip_prefix("./").unwrap_or(relative);
    if dir.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", dir, relative)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn sample(timestamp: i64) -> BackupMetadata {
        BackupMetadata {
            job_id: "job-1".into(),
            schedule_id: "schedule-1".into(),
            timestamp,
            version: METADATA_VERSION.into(),
            mode: Mode::Full,
            vm: json!({"uuid": "vm-1"}),
            vm_snapshot: json!({"uuid": "snap-1"}),
            xva: Some("./20240101T000000Z.xva".into()),
            vbds: None,
            vdis: None,
            vifs: None,
            vhds: None,
            filename: None,
        }
    }

    #[test]
    fn basename_is_fixed_width_utc() {
        assert_eq!(
            backup_basename(1_704_067_200_000).unwrap(),
            "20240101T000000Z"
        );
        assert!(BACKUP_BASENAME_REGEX.is_match("20240101T000000Z"));
        assert!(METADATA_FILE_REGEX.is_match("20240101T000000Z.json"));
        assert!(!METADATA_FILE_REGEX.is_match("index.json"));
    }

    #[test]
    fn roundtrip_tolerates_unknown_keys() {
        let mut raw = serde_json::to_value(sample(0)).unwrap();
        raw["futureField"] = json!({"anything": true});
        let metadata = BackupMetadata::from_slice(&serde_json::to_vec(&raw).unwrap()).unwrap();
        assert_eq!(metadata.version, METADATA_VERSION);
        assert_eq!(metadata.xva.as_deref(), Some("./20240101T000000Z.xva"));
    }

    #[test]
    fn resolves_payload_paths_against_the_sidecar() {
        let mut metadata = sample(0);
        metadata.filename = Some("xo-vm-backups/vm-1/20240101T000000Z.json".into());
        assert_eq!(
            metadata.resolve("./20240101T000000Z.xva").unwrap(),
            "xo-vm-backups/vm-1/20240101T000000Z.xva"
        );
        assert_eq!(
            metadata
                .resolve("vdis/job-1/vdi-1/20240101T000000Z.vhd")
                .unwrap(),
            "xo-vm-backups/vm-1/vdis/job-1/vdi-1/20240101T000000Z.vhd"
        );
    }

    #[test]
    fn sorts_by_timestamp_ascending() {
        let mut list = vec![sample(30), sample(10), sample(20)];
        BackupMetadata::sort_list(&mut list);
        let times: Vec<i64> = list.iter().map(|metadata| metadata.timestamp).collect();
        assert_eq!(times, vec![10, 20, 30]);
    }
}
