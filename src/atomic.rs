//! Atomic placement of streamed payloads.

use anyhow::Error;

use crate::byte_stream::ExportStream;
use crate::remote::{basename, dirname, is_missing, join, RemoteHandler};

/// Stream `source` into `final_path` through a dotted temporary name.
///
/// The payload is only renamed into place once it is fully flushed (and
/// its checksum sidecar written, when requested) *and* the source-side
/// export task has completed, so hypervisor-side errors can never leave
/// a live file behind. On failure the temporary is unlinked best-effort
/// and the original error propagates. Returns the number of bytes
/// written.
pub async fn write_atomic(
    remote: &dyn RemoteHandler,
    final_path: &str,
    source: ExportStream,
    checksum: bool,
) -> Result<u64, Error> {
    let tmp_path = join(dirname(final_path), &format!(".{}", basename(final_path)));
    let ExportStream { stream, task } = source;

    let result = async {
        let size = remote.write_stream(&tmp_path, stream, checksum).await?;
        task.wait().await?;
        remote.rename(&tmp_path, final_path, checksum).await?;
        Ok(size)
    }
    .await;

    if result.is_err() {
        if let Err(err) = remote.unlink(&tmp_path, checksum).await {
            if !is_missing(&err) {
                log::warn!("unable to remove temporary file {} - {:#}", tmp_path, err);
            }
        }
    }
    result
}
