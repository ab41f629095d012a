use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::settings::SettingsMap;

/// Export mode of a backup job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Self-contained XVA image per run.
    Full,
    /// Incremental chain of changed-block VHDs.
    Delta,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Full => "full",
            Mode::Delta => "delta",
        }
    }
}

/// A backup job. Immutable within a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub mode: Mode,
    /// Compression of full exports, passed through to the hypervisor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    /// Opaque match pattern; evaluation is delegated to the caller.
    #[serde(default)]
    pub vms: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remotes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<Vec<String>>,
    #[serde(default)]
    pub settings: SettingsMap,
}

impl Job {
    /// Display name used in snapshot labels.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub job_id: String,
    /// Cron expression, interpreted by the scheduler.
    pub cron: String,
    pub enabled: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn job_roundtrip_tolerates_unknown_keys() {
        let job: Job = serde_json::from_str(
            r#"{
                "id": "job-1",
                "mode": "delta",
                "vms": {"type": "VM", "tags": ["prod"]},
                "remotes": ["nfs-1"],
                "settings": {"": {"exportRetention": 3}},
                "userId": "someone"
            }"#,
        )
        .unwrap();
        assert_eq!(job.mode, Mode::Delta);
        assert_eq!(job.label(), "job-1");
        assert_eq!(job.remotes.as_deref(), Some(&["nfs-1".to_string()][..]));
    }
}
