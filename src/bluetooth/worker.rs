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

//! Background execution of connection jobs.
//!
//! Every connect, listen, read and write runs as its own tokio task. The
//! caller gets a [`JobHandle`] that resolves to the job's `Result` once the
//! task reports back. Dropping the handle does not cancel the job: a write
//! that was dispatched still completes and a read still releases the socket
//! in an orderly way.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

use crate::{Error, Result};

/// Completion side of a job, handed to whoever finishes the work.
pub(crate) type Completion<T> = oneshot::Sender<Result<T>>;

/// Future resolving to the result of a background job.
#[must_use = "a job handle does nothing unless awaited"]
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    /// A handle plus the sender that completes it.
    pub(crate) fn pair() -> (Completion<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A handle that is already resolved.
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (tx, handle) = Self::pair();
        let _ = tx.send(result);
        handle
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::WorkerGone)))
    }
}

/// Run `job` on the runtime and hand back its result through a [`JobHandle`].
pub(crate) fn spawn_job<T, F>(name: &'static str, job: F) -> JobHandle<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let (tx, handle) = JobHandle::pair();
    tokio::spawn(async move {
        let result = job.await;
        if tx.send(result).is_err() {
            trace!("Result of {} job dropped by caller", name);
        }
    });
    handle
}
