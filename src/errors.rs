use std::fmt;

use anyhow::Error;
use serde_json::{json, Value};

/// Failure classes surfaced to users through task results.
///
/// The codes are part of the log format consumed by the UI and the
/// reporting plugins, so they are stable kebab-case strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfig,
    NoVmsMatchPattern,
    UnhealthyVdiChain,
    Timeout,
    TransferFailed,
    MergeFailed,
    RemoteUnavailable,
    NoSuchBackup,
    Cancelled,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidConfig => "invalid-config",
            ErrorKind::NoVmsMatchPattern => "no-vms-match-pattern",
            ErrorKind::UnhealthyVdiChain => "unhealthy-vdi-chain",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransferFailed => "transfer-failed",
            ErrorKind::MergeFailed => "merge-failed",
            ErrorKind::RemoteUnavailable => "remote-unavailable",
            ErrorKind::NoSuchBackup => "no-such-backup",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Unhealthy VDI chains skip the VM instead of failing it.
    pub fn is_skip(self) -> bool {
        matches!(self, ErrorKind::UnhealthyVdiChain)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug)]
pub struct BackupError {
    kind: ErrorKind,
    message: String,
}

impl BackupError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Error {
        Error::new(Self {
            kind,
            message: message.into(),
        })
    }

    /// Attach a kind to an existing error, keeping it as the cause.
    pub fn wrap(kind: ErrorKind, err: Error) -> Error {
        err.context(Self {
            kind,
            message: kind.code().to_string(),
        })
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message == self.kind.code() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for BackupError {}

/// Typed kind of an error, if any; context layers are looked through,
/// outermost kind first.
pub fn error_kind(err: &Error) -> Option<ErrorKind> {
    err.downcast_ref::<BackupError>().map(BackupError::kind)
}

/// Shape an error chain into the `task.end` result value.
pub fn serialize_error(err: &Error) -> Value {
    let stack: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
    let mut value = json!({
        "message": err.to_string(),
        "stack": stack,
    });
    if let Some(kind) = error_kind(err) {
        value["code"] = Value::String(kind.code().to_string());
    }
    value
}
