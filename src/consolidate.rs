//! Fold the flat event stream of a run back into per-parent task trees.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tasklog::{LogEvent, TaskStatus, EVENT_JOB_END, EVENT_JOB_START, EVENT_TASK_END, EVENT_TASK_START};

/// Group key of job-level records.
pub const ROOT_GROUP: &str = "roots";

// Degenerate pairs emitted by synchronous wrappers: same start and end
// time, no payload. The misspelt "tranfer" is part of the historical log
// corpus and must keep matching.
const DEGENERATE_MESSAGES: &[&str] = &["merge", "tranfer"];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
}

/// Consolidate a time-ordered event stream, keyed by parent id
/// ([`ROOT_GROUP`] for job-level records).
pub fn consolidate(events: &[LogEvent]) -> HashMap<String, Vec<TaskRecord>> {
    let mut order: Vec<String> = Vec::new();
    let mut records: HashMap<String, TaskRecord> = HashMap::new();

    for event in events {
        let id = match event.id.as_deref() {
            Some(id) => id,
            None => continue,
        };
        match event.event.as_str() {
            e if e == EVENT_TASK_START || e == EVENT_JOB_START => {
                order.push(id.to_string());
                records.insert(
                    id.to_string(),
                    TaskRecord {
                        id: id.to_string(),
                        parent_id: event.parent_id.clone(),
                        message: event.message.clone(),
                        data: event.data.clone(),
                        start: event.time,
                        end: None,
                        duration: None,
                        status: None,
                        result: Value::Null,
                    },
                );
            }
            e if e == EVENT_TASK_END || e == EVENT_JOB_END => {
                if let Some(record) = records.get_mut(id) {
                    record.end = Some(event.time);
                    record.duration = Some(event.time - record.start);
                    record.status = event.status;
                    record.result = event.result.clone();
                }
            }
            _ => {}
        }
    }

    let mut groups: HashMap<String, Vec<TaskRecord>> = HashMap::new();
    for id in order {
        let record = match records.remove(&id) {
            Some(record) => record,
            None => continue,
        };
        if record.duration == Some(0)
            && record
                .message
                .as_deref()
                .map_or(false, |message| DEGENERATE_MESSAGES.contains(&message))
        {
            continue;
        }
        let group = record
            .parent_id
            .clone()
            .unwrap_or_else(|| ROOT_GROUP.to_string());
        groups.entry(group).or_default().push(record);
    }
    groups
}
