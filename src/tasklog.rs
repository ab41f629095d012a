//! Structured task log.
//!
//! Every piece of work in a run is bracketed by a `task.start` /
//! `task.end` pair chained to its parent task, so a failure anywhere
//! becomes a structured event instead of poisoning the run. The flat
//! event stream is folded back into trees by [`crate::consolidate`].

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Error;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{error_kind, serialize_error};

pub const EVENT_JOB_START: &str = "job.start";
pub const EVENT_JOB_END: &str = "job.end";
pub const EVENT_TASK_START: &str = "task.start";
pub const EVENT_TASK_END: &str = "task.end";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failure,
    Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub event: String,
    /// Milliseconds since the epoch.
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
}

/// Destination of the event stream, injected by the host.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Sink collecting events in memory; the consolidation input and the
/// test suite both read from it.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, event: LogEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Clone, Debug, Default)]
pub struct TaskOptions {
    pub parent: Option<String>,
    pub message: String,
    pub data: Value,
}

impl TaskOptions {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            parent: None,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn parent<S: Into<String>>(mut self, parent: S) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

pub struct TaskLogger {
    sink: Arc<dyn LogSink>,
    next_id: AtomicUsize,
}

impl TaskLogger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            next_id: AtomicUsize::new(0),
        }
    }

    fn allocate_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn start(&self, event: &str, task_id: &str, opts: &TaskOptions) {
        self.sink.emit(LogEvent {
            event: event.to_string(),
            time: Self::now(),
            id: Some(task_id.to_string()),
            parent_id: opts.parent.clone(),
            message: Some(opts.message.clone()),
            data: opts.data.clone(),
            status: None,
            result: Value::Null,
        });
    }

    fn end(&self, event: &str, task_id: &str, status: TaskStatus, result: Value) {
        self.sink.emit(LogEvent {
            event: event.to_string(),
            time: Self::now(),
            id: Some(task_id.to_string()),
            parent_id: None,
            message: None,
            data: Value::Null,
            status: Some(status),
            result,
        });
    }

    async fn run<T, F, S>(
        &self,
        start_event: &str,
        end_event: &str,
        opts: TaskOptions,
        shape: S,
        task_id: String,
        fut: F,
    ) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
        S: FnOnce(&T) -> Value,
    {
        self.start(start_event, &task_id, &opts);
        match fut.await {
            Ok(value) => {
                self.end(end_event, &task_id, TaskStatus::Success, shape(&value));
                Ok(value)
            }
            Err(err) => {
                let status = match error_kind(&err) {
                    Some(kind) if kind.is_skip() => TaskStatus::Skipped,
                    _ => TaskStatus::Failure,
                };
                self.end(end_event, &task_id, status, serialize_error(&err));
                Err(err)
            }
        }
    }

    /// Bracket `fut` in `task.start` / `task.end`, re-propagating its
    /// outcome unchanged.
    pub async fn wrap<T, F>(&self, opts: TaskOptions, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        let task_id = self.allocate_id();
        self.run(EVENT_TASK_START, EVENT_TASK_END, opts, |_| Value::Null, task_id, fut)
            .await
    }

    /// Like [`wrap`](Self::wrap), shaping the success value into the
    /// `task.end` result.
    pub async fn wrap_with<T, F, S>(&self, opts: TaskOptions, shape: S, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
        S: FnOnce(&T) -> Value,
    {
        let task_id = self.allocate_id();
        self.run(EVENT_TASK_START, EVENT_TASK_END, opts, shape, task_id, fut)
            .await
    }

    /// Like [`wrap`](Self::wrap), but the future builder receives the
    /// allocated task id so nested tasks can chain to it.
    pub async fn wrap_fn<T, B, F>(&self, opts: TaskOptions, build: B) -> Result<T, Error>
    where
        B: FnOnce(String) -> F,
        F: Future<Output = Result<T, Error>>,
    {
        let task_id = self.allocate_id();
        let fut = build(task_id.clone());
        self.run(EVENT_TASK_START, EVENT_TASK_END, opts, |_| Value::Null, task_id, fut)
            .await
    }

    /// [`wrap_fn`](Self::wrap_fn) with result shaping.
    pub async fn wrap_fn_with<T, B, F, S>(
        &self,
        opts: TaskOptions,
        shape: S,
        build: B,
    ) -> Result<T, Error>
    where
        B: FnOnce(String) -> F,
        F: Future<Output = Result<T, Error>>,
        S: FnOnce(&T) -> Value,
    {
        let task_id = self.allocate_id();
        let fut = build(task_id.clone());
        self.run(EVENT_TASK_START, EVENT_TASK_END, opts, shape, task_id, fut)
            .await
    }

    /// Same protocol with `job.start` / `job.end` at the root; the
    /// builder receives the run id.
    pub async fn wrap_job<T, B, F>(&self, opts: TaskOptions, build: B) -> Result<T, Error>
    where
        B: FnOnce(String) -> F,
        F: Future<Output = Result<T, Error>>,
    {
        let run_id = self.allocate_id();
        let fut = build(run_id.clone());
        self.run(EVENT_JOB_START, EVENT_JOB_END, opts, |_| Value::Null, run_id, fut)
            .await
    }
}
