//! Fan a single export stream out to several live consumers.
//!
//! One driver task reads the source and feeds a bounded channel per
//! consumer; `send` on the slowest branch throttles the driver, so the
//! slowest consumer throttles the hypervisor export instead of the
//! payload piling up in memory.

use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use anyhow::{format_err, Error};
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::OnceCell;

use crate::byte_stream::{ByteStream, ExportStream, StreamFactory, TaskHandle};

/// Chunks buffered per branch before backpressure kicks in.
const FORK_WINDOW: usize = 16;

/// Split `source` into `count` identical streams.
///
/// A branch whose receiver is dropped is detached without disturbing its
/// siblings; once every branch is gone the source is dropped, tearing
/// down the underlying export. Source errors are fanned out to all live
/// branches.
pub fn fork_stream(source: ByteStream, count: usize) -> Vec<ByteStream> {
    if count <= 1 {
        return vec![source];
    }

    let mut senders = Vec::with_capacity(count);
    let mut branches: Vec<ByteStream> = Vec::with_capacity(count);
    for _ in 0..count {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(FORK_WINDOW);
        senders.push(Some(tx));
        branches.push(Box::pin(ChannelStream { receiver: rx }));
    }

    tokio::spawn(drive(source, senders));

    branches
}

async fn drive(mut source: ByteStream, mut sinks: Vec<Option<mpsc::Sender<io::Result<Bytes>>>>) {
    while let Some(item) = source.next().await {
        match item {
            Ok(chunk) => {
                let mut live = 0;
                for slot in sinks.iter_mut() {
                    if let Some(tx) = slot {
                        if tx.send(Ok(chunk.clone())).await.is_err() {
                            *slot = None;
                        } else {
                            live += 1;
                        }
                    }
                }
                if live == 0 {
                    return;
                }
            }
            Err(err) => {
                let kind = err.kind();
                let message = err.to_string();
                for slot in sinks.iter_mut() {
                    if let Some(tx) = slot.take() {
                        let _ = tx.send(Err(io::Error::new(kind, message.clone()))).await;
                    }
                }
                return;
            }
        }
    }
    // EOF: dropping the senders closes every branch
}

struct ChannelStream {
    receiver: mpsc::Receiver<io::Result<Bytes>>,
}

impl Stream for ChannelStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

struct ForkState {
    count: usize,
    factory: Mutex<Option<StreamFactory>>,
    ignition: OnceCell<TaskHandle>,
    branches: Mutex<Vec<Option<ByteStream>>>,
}

/// One branch of a lazily-forked VDI stream.
///
/// The underlying factory runs once, on the first branch opened; every
/// branch's `ExportStream` carries a clone of the same source task
/// handle.
pub struct ForkedVdiFactory {
    index: usize,
    state: Arc<ForkState>,
}

impl ForkedVdiFactory {
    pub async fn open(self) -> Result<ExportStream, Error> {
        let state = Arc::clone(&self.state);
        let task = state
            .ignition
            .get_or_try_init(|| async {
                let factory = state
                    .factory
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| format_err!("stream factory already consumed"))?;
                let ExportStream { stream, task } = factory().await?;
                let branches = fork_stream(stream, state.count);
                *state.branches.lock().unwrap() = branches.into_iter().map(Some).collect();
                Ok::<_, Error>(task)
            })
            .await?
            .clone();

        let stream = self.state.branches.lock().unwrap()[self.index]
            .take()
            .ok_or_else(|| format_err!("stream branch {} opened twice", self.index))?;
        Ok(ExportStream { stream, task })
    }
}

/// Replace a one-shot stream factory by `count` one-shot branches.
pub fn fork_factory(factory: StreamFactory, count: usize) -> Vec<ForkedVdiFactory> {
    let state = Arc::new(ForkState {
        count,
        factory: Mutex::new(Some(factory)),
        ignition: OnceCell::new(),
        branches: Mutex::new(Vec::new()),
    });
    (0..count)
        .map(|index| ForkedVdiFactory {
            index,
            state: Arc::clone(&state),
        })
        .collect()
}
