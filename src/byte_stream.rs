use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{format_err, Error};
use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::stream::Stream;
use futures::{FutureExt, StreamExt};

/// Payload stream of an export or a remote file.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Lazy stream constructor, one per VDI in a delta export.
pub type StreamFactory =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<ExportStream, Error>> + Send>;

/// Completion handle of the source-side (hypervisor) export task.
///
/// The handle is cheap to clone and every clone resolves to the same
/// outcome, so any consumer of a forked stream can await the source
/// finishing independently of its own I/O. Errors are broadcast as
/// strings since `anyhow::Error` is not `Clone`.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Shared<BoxFuture<'static, Result<(), String>>>,
}

impl TaskHandle {
    pub fn new<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self {
            inner: fut.map(|res| res.map_err(|err| format!("{:#}", err))).boxed().shared(),
        }
    }

    /// Handle for sources without a deferred completion.
    pub fn ready() -> Self {
        Self::new(async { Ok(()) })
    }

    pub async fn wait(&self) -> Result<(), Error> {
        self.inner
            .clone()
            .await
            .map_err(|msg| format_err!("{}", msg))
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskHandle").finish()
    }
}

/// A payload stream together with its source-side task.
pub struct ExportStream {
    pub stream: ByteStream,
    pub task: TaskHandle,
}

impl ExportStream {
    /// Wrap a plain stream; the task completes as soon as it is awaited.
    pub fn from_stream(stream: ByteStream) -> Self {
        Self {
            stream,
            task: TaskHandle::ready(),
        }
    }
}

/// Build a one-chunk stream from a byte buffer.
pub fn from_bytes(data: Vec<u8>) -> ByteStream {
    futures::stream::once(async move { Ok(Bytes::from(data)) }).boxed()
}

/// Turn a fired cancellation token into a stream error.
///
/// Cancellation must travel the same path as any transfer error so the
/// consumers' cleanup (unlinking temporaries) runs; a dropped future
/// cannot do that.
pub fn guard_stream(stream: ByteStream, token: &tokio_util::sync::CancellationToken) -> ByteStream {
    Box::pin(GuardedStream {
        inner: stream,
        cancelled: Box::pin(token.clone().cancelled_owned()),
        fired: false,
    })
}

struct GuardedStream {
    inner: ByteStream,
    cancelled: Pin<Box<tokio_util::sync::WaitForCancellationFutureOwned>>,
    fired: bool,
}

impl Stream for GuardedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.fired {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.fired = true;
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "backup cancelled",
            ))));
        }
        this.inner.as_mut().poll_next(cx)
    }
}

/// Passthrough counting the bytes that flow through it.
pub struct CountedStream {
    inner: ByteStream,
    count: Arc<AtomicU64>,
}

impl CountedStream {
    pub fn new(inner: ByteStream) -> (Self, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                count: Arc::clone(&count),
            },
            count,
        )
    }
}

impl Stream for CountedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = futures::ready!(this.inner.as_mut().poll_next(cx));
        if let Some(Ok(ref chunk)) = item {
            this.count.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        Poll::Ready(item)
    }
}
