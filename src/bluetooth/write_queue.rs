// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Serialized write queue.
//!
//! Writes are executed strictly in submission order with at most one job in
//! flight per connection. The head of the queue is always the job currently
//! executing; everything behind it is pending. The queue lock only guards
//! this bookkeeping and is never held while bytes are being sent.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::socket::SocketHandle;
use super::worker::{Completion, JobHandle};
use crate::error::WriteError;
use crate::Result;

/// Open/closed flag of a link.
///
/// Shared with the write queue so that closing also stops a send that is
/// stuck on a peer that no longer reads.
#[derive(Debug)]
pub struct OpenFlag {
    tx: watch::Sender<bool>,
}

impl OpenFlag {
    pub fn new(open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self { tx }
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Set the flag, returning the previous value.
    pub fn set(&self, open: bool) -> bool {
        self.tx.send_replace(open)
    }

    /// Resolve once the flag is cleared.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = rx.wait_for(|open| !*open).await;
    }
}

/// One pending write.
struct WriteJob {
    id: u64,
    buffer: Vec<u8>,
    done: Completion<usize>,
}

/// Queue entry. `job` is taken out when the entry is dispatched, so the head
/// node with `job == None` marks the write in flight.
struct WriteQueueNode {
    id: u64,
    job: Option<WriteJob>,
}

struct QueueState {
    nodes: VecDeque<WriteQueueNode>,
    next_id: u64,
}

/// Per-connection FIFO of write jobs.
pub struct WriteQueue<W> {
    state: Mutex<QueueState>,
    writer: tokio::sync::Mutex<SocketHandle<W>>,
    open: Arc<OpenFlag>,
}

impl<W> WriteQueue<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Create a queue writing to whatever socket is installed in it, as long
    /// as `open` is set.
    pub fn new(open: Arc<OpenFlag>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                nodes: VecDeque::new(),
                next_id: 0,
            }),
            writer: tokio::sync::Mutex::new(SocketHandle::unset()),
            open,
        })
    }

    /// The socket the queue writes to.
    pub(crate) fn writer(&self) -> &tokio::sync::Mutex<SocketHandle<W>> {
        &self.writer
    }

    /// Jobs queued, including the one in flight.
    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `buffer` for sending.
    ///
    /// The job starts right away when the queue is empty, otherwise it runs
    /// once every job submitted before it has completed.
    pub fn enqueue(self: &Arc<Self>, buffer: Vec<u8>) -> JobHandle<usize> {
        let (done, handle) = JobHandle::pair();

        let ready = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;

            let was_empty = state.nodes.is_empty();
            let mut node = WriteQueueNode {
                id,
                job: Some(WriteJob { id, buffer, done }),
            };
            let ready = if was_empty { node.job.take() } else { None };
            state.nodes.push_back(node);
            trace!("Write job {} queued ({} in queue)", id, state.nodes.len());
            ready
        };

        if let Some(job) = ready {
            self.dispatch(job);
        }
        handle
    }

    fn dispatch(self: &Arc<Self>, job: WriteJob) {
        let queue = self.clone();
        tokio::spawn(async move {
            let WriteJob { id, buffer, done } = job;
            let result = queue.execute(&buffer).await;
            if let Err(e) = &result {
                debug!("Write job {} failed: {}", id, e);
            }
            let _ = done.send(result);
            queue.on_job_complete(id);
        });
    }

    /// Remove the finished head and start the next job, if any.
    fn on_job_complete(self: &Arc<Self>, id: u64) {
        let next = {
            let mut state = self.state.lock();
            match state.nodes.front() {
                Some(head) if head.id == id => {
                    state.nodes.pop_front();
                }
                _ => warn!("Completed write job {} is not at the queue head", id),
            }
            state.nodes.front_mut().and_then(|head| head.job.take())
        };

        if let Some(job) = next {
            self.dispatch(job);
        }
    }

    async fn execute(&self, buffer: &[u8]) -> Result<usize> {
        if !self.open.is_open() {
            return Err(WriteError::Closed.into());
        }
        let mut writer = self.writer.lock().await;
        let Some(socket) = writer.get_mut() else {
            return Err(WriteError::Closed.into());
        };
        Ok(send_all(socket, buffer, self.open.closed()).await?)
    }
}

/// Send the whole of `buffer`, looping over short writes.
///
/// Returns the full length on success. On failure the error carries the
/// number of bytes that did go out. Resolving `closed` abandons the send.
pub(crate) async fn send_all<W, C>(
    writer: &mut W,
    buffer: &[u8],
    closed: C,
) -> Result<usize, WriteError>
where
    W: AsyncWrite + Unpin,
    C: Future<Output = ()>,
{
    tokio::pin!(closed);
    let requested = buffer.len();
    let mut written = 0;
    let failed = |written, source| WriteError::Unsuccessful {
        written,
        requested,
        source,
    };

    while written < requested {
        let result = tokio::select! {
            biased;
            _ = &mut closed => return Err(failed(written, closed_during_write())),
            result = writer.write(&buffer[written..]) => result,
        };
        match result {
            Ok(0) => return Err(failed(written, io::Error::from(io::ErrorKind::WriteZero))),
            Ok(n) => {
                written += n;
                trace!("Sent {} bytes ({}/{})", n, written, requested);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(failed(written, source)),
        }
    }

    let flushed = tokio::select! {
        biased;
        _ = &mut closed => Err(closed_during_write()),
        result = writer.flush() => result,
    };
    flushed.map_err(|source| failed(written, source))?;

    Ok(written)
}

fn closed_during_write() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed during write")
}
