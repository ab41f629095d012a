use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Scope key for job-level defaults.
pub const JOB_DEFAULT_SCOPE: &str = "";

/// When to trigger an external report for a finished run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportWhen {
    Always,
    Failure,
    Never,
}

impl ReportWhen {
    pub fn should_report(self, success: bool) -> bool {
        match self {
            ReportWhen::Always => true,
            ReportWhen::Failure => !success,
            ReportWhen::Never => false,
        }
    }
}

/// Partial setting record attached to a single scope (job default,
/// schedule id, target id or VM uuid). Absent knobs fall through to the
/// next scope.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_first: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_retention: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_retention: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_when: Option<ReportWhen>,
    /// Per-VM deadline in milliseconds, 0 means none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_timeout: Option<u64>,
}

/// Settings of a job, keyed by scope. Each lookup walks an explicit,
/// caller-supplied scope list and returns the first defined value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsMap(pub HashMap<String, SettingsPatch>);

impl SettingsMap {
    fn get<T, F>(&self, scopes: &[&str], pick: F, default: T) -> T
    where
        F: Fn(&SettingsPatch) -> Option<T>,
    {
        for scope in scopes {
            if let Some(value) = self.0.get(*scope).and_then(&pick) {
                return value;
            }
        }
        default
    }

    pub fn delete_first(&self, scopes: &[&str]) -> bool {
        self.get(scopes, |patch| patch.delete_first, false)
    }

    pub fn export_retention(&self, scopes: &[&str]) -> u32 {
        self.get(scopes, |patch| patch.export_retention, 0)
    }

    pub fn snapshot_retention(&self, scopes: &[&str]) -> u32 {
        self.get(scopes, |patch| patch.snapshot_retention, 0)
    }

    pub fn report_when(&self, scopes: &[&str]) -> ReportWhen {
        self.get(scopes, |patch| patch.report_when, ReportWhen::Failure)
    }

    pub fn vm_timeout(&self, scopes: &[&str]) -> u64 {
        self.get(scopes, |patch| patch.vm_timeout, 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn map(entries: &[(&str, SettingsPatch)]) -> SettingsMap {
        SettingsMap(
            entries
                .iter()
                .map(|(scope, patch)| (scope.to_string(), patch.clone()))
                .collect(),
        )
    }

    #[test]
    fn first_defining_scope_wins() {
        let settings = map(&[
            (
                JOB_DEFAULT_SCOPE,
                SettingsPatch {
                    export_retention: Some(3),
                    snapshot_retention: Some(1),
                    ..Default::default()
                },
            ),
            (
                "schedule-1",
                SettingsPatch {
                    export_retention: Some(7),
                    ..Default::default()
                },
            ),
            (
                "vm-1",
                SettingsPatch {
                    vm_timeout: Some(60_000),
                    ..Default::default()
                },
            ),
        ]);

        let scopes = ["vm-1", "schedule-1", JOB_DEFAULT_SCOPE];
        assert_eq!(settings.export_retention(&scopes), 7);
        assert_eq!(settings.snapshot_retention(&scopes), 1);
        assert_eq!(settings.vm_timeout(&scopes), 60_000);
    }

    #[test]
    fn documented_defaults() {
        let settings = SettingsMap::default();
        let scopes = ["vm-1", JOB_DEFAULT_SCOPE];
        assert!(!settings.delete_first(&scopes));
        assert_eq!(settings.export_retention(&scopes), 0);
        assert_eq!(settings.snapshot_retention(&scopes), 0);
        assert_eq!(settings.report_when(&scopes), ReportWhen::Failure);
        assert_eq!(settings.vm_timeout(&scopes), 0);
    }

    #[test]
    fn report_when_filter() {
        assert!(ReportWhen::Always.should_report(true));
        assert!(ReportWhen::Always.should_report(false));
        assert!(!ReportWhen::Failure.should_report(true));
        assert!(ReportWhen::Failure.should_report(false));
        assert!(!ReportWhen::Never.should_report(false));
    }

    #[test]
    fn parses_scope_keyed_json() {
        let settings: SettingsMap = serde_json::from_str(
            r#"{"": {"exportRetention": 2, "reportWhen": "always"},
                "vm-9": {"deleteFirst": true}}"#,
        )
        .unwrap();
        assert!(settings.delete_first(&["vm-9", JOB_DEFAULT_SCOPE]));
        assert_eq!(
            settings.report_when(&["vm-9", JOB_DEFAULT_SCOPE]),
            ReportWhen::Always
        );
    }
}
