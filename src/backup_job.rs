//! Job executor: resolve the VMs a job matches, run one worker per VM
//! with bounded parallelism, aggregate the outcome.

use std::sync::Arc;

use anyhow::Error;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::errors::{error_kind, BackupError, ErrorKind};
use crate::hypervisor::{HypervisorClient, XoObject};
use crate::job::{Job, Schedule};
use crate::remote::RemoteHandler;
use crate::settings::{ReportWhen, JOB_DEFAULT_SCOPE};
use crate::tasklog::{TaskLogger, TaskOptions};
use crate::vhd::{MergeWorker, VhdLibrary};
use crate::vm_backup::VmBackup;

pub struct RunParams {
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
    /// Upper bound on concurrent VM workers; `None` is fully parallel.
    pub concurrency: Option<usize>,
}

/// Aggregate of a finished run, for callers that do not want to replay
/// the event log.
#[derive(Clone, Debug)]
pub struct JobSummary {
    pub run_id: String,
    pub vms: usize,
    pub failures: usize,
    pub skipped: usize,
    /// Merged `reportWhen` of the run, for the external notifier.
    pub report_when: ReportWhen,
}

impl JobSummary {
    pub fn should_report(&self) -> bool {
        self.report_when.should_report(self.failures == 0)
    }
}

/// Run `params.job` once, against the VMs selected by `vm_filter`
/// (the match-pattern evaluation is supplied by the caller).
///
/// Workers never fail fast: one VM's failure or cancellation does not
/// disturb its siblings, and the job fails iff at least one VM failed —
/// skipped VMs (unhealthy chains) do not count.
pub async fn run_backup_job<F>(
    params: RunParams,
    token: &CancellationToken,
    vm_filter: F,
) -> Result<JobSummary, Error>
where
    F: Fn(&XoObject) -> bool + Sync,
{
    let RunParams {
        hypervisor,
        vhd,
        merge_worker,
        logger,
        job,
        schedule,
        remotes,
        srs,
        timestamp,
        concurrency,
    } = params;

    let report_when = job
        .settings
        .report_when(&[schedule.id.as_str(), JOB_DEFAULT_SCOPE]);

    let opts = TaskOptions::new("backup").data(json!({
        "jobId": job.id.clone(),
        "scheduleId": schedule.id.clone(),
        "mode": job.mode.as_str(),
        "reportWhen": report_when,
    }));

    let logger_ref = &logger;
    let hypervisor_ref = &hypervisor;
    logger
        .wrap_job(opts, |run_id| async move {
            let vms: Vec<XoObject> = hypervisor_ref
                .objects()
                .into_iter()
                .filter(|object| !object.is_a_snapshot() && !object.is_a_template())
                .filter(&vm_filter)
                .collect();
            if vms.is_empty() {
                return Err(BackupError::new(
                    ErrorKind::NoVmsMatchPattern,
                    "no VMs match this job's pattern",
                ));
            }

            let worker = VmBackup {
                hypervisor: Arc::clone(hypervisor_ref),
                vhd,
                merge_worker,
                logger: Arc::clone(logger_ref),
                job,
                schedule,
                remotes,
                srs,
                timestamp,
            };
            let worker = &worker;
            let run_id = &run_id;

            let limit = concurrency.unwrap_or(vms.len()).max(1);
            let total = vms.len();
            let results: Vec<(String, Result<_, Error>)> = futures::stream::iter(vms)
                .map(|vm| {
                    // fork the job token so one VM's cancellation or
                    // timeout never affects siblings
                    let vm_token = token.child_token();
                    async move {
                        let vm_uuid = vm.uuid().to_string();
                        let opts = TaskOptions::new("backup VM")
                            .parent(run_id.clone())
                            .data(json!({"type": "VM", "id": vm_uuid}));
                        let result = logger_ref
                            .wrap_fn_with(
                                opts,
                                |stats: &crate::vm_backup::VmRunStats| match stats.transfer_size {
                                    Some(size) => json!({"size": size}),
                                    None => serde_json::Value::Null,
                                },
                                |task_id| async move {
                                    worker.run(vm_token, &vm_uuid, &task_id).await
                                },
                            )
                            .await;
                        (vm.uuid().to_string(), result)
                    }
                })
                .buffer_unordered(limit)
                .collect()
                .await;

            let mut failures = 0;
            let mut skipped = 0;
            let mut first_error: Option<(String, Error)> = None;
            for (vm_uuid, result) in results {
                if let Err(err) = result {
                    match error_kind(&err) {
                        Some(kind) if kind.is_skip() => skipped += 1,
                        _ => {
                            failures += 1;
                            if first_error.is_none() {
                                first_error = Some((vm_uuid, err));
                            }
                        }
                    }
                }
            }

            if let Some((vm_uuid, err)) = first_error {
                return Err(err.context(format!(
                    "{} of {} VMs failed, first error on VM {}",
                    failures, total, vm_uuid
                )));
            }

            Ok(JobSummary {
                run_id: run_id.clone(),
                vms: total,
                failures,
                skipped,
                report_when,
            })
        })
        .await
}
