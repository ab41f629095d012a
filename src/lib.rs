//! Backup orchestration engine for VMs on hypervisor pools.
//!
//! A scheduler fires a [`job::Job`] at a chosen time; the
//! [`backup_job`] executor resolves the VMs the job matches and runs one
//! [`vm_backup`] worker per VM. Each worker snapshots its VM through the
//! injected [`hypervisor`] client, exports it — as a self-contained XVA
//! (full mode) or as a chain of changed-block VHDs (delta mode) — and
//! fans the single export stream out to every configured target:
//! file-based [`remote`] storage and/or peer SRs (replication).
//!
//! # On-disk layout
//!
//! Every remote follows the same tree:
//!
//! ```text
//! xo-vm-backups/
//!   <vm-uuid>/
//!     <YYYYMMDD>T<HHmmss>Z.json        metadata sidecar
//!     <YYYYMMDD>T<HHmmss>Z.xva         full payload
//!     <YYYYMMDD>T<HHmmss>Z.xva.checksum
//!     vdis/<job-id>/<vdi-uuid>/<YYYYMMDD>T<HHmmss>Z.vhd
//! ```
//!
//! Timestamps are fixed-width UTC so lexicographic order is
//! chronological order. Payloads are streamed to a dotted temporary name
//! and renamed into place only once fully flushed ([`atomic`]); the
//! sidecar is written last, so a sidecar never references a missing or
//! truncated payload, whatever the interruption.
//!
//! # Retention
//!
//! Retention is counted per `(vm, schedule, mode)` on each target and
//! per `(job, schedule)` for snapshots ([`retention`]). Deleting a delta
//! backup coalesces its VHDs into their children before unlinking
//! ([`backups`]), so every remaining VHD keeps resolving its parent
//! chain down to a full disk.
//!
//! # Observability
//!
//! Every operation is bracketed in `task.start` / `task.end` events
//! chained to the run ([`tasklog`]); [`consolidate`] folds the flat
//! stream back into per-run task trees.

pub mod atomic;
pub mod backup_job;
pub mod backups;
pub mod byte_stream;
pub mod chain;
pub mod consolidate;
pub mod errors;
pub mod fork_stream;
pub mod hypervisor;
pub mod job;
pub mod local;
pub mod memory;
pub mod metadata;
pub mod remote;
pub mod retention;
pub mod settings;
pub mod tasklog;
pub mod vhd;
pub mod vm_backup;

pub use backup_job::{run_backup_job, JobSummary, RunParams};
pub use errors::{BackupError, ErrorKind};
pub use job::{Job, Mode, Schedule};
pub use metadata::BackupMetadata;
pub use tasklog::{LogSink, MemorySink, TaskLogger};
pub use vm_backup::VmBackup;
