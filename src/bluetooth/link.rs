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

//! Read/write machinery of one open RFCOMM stream.
//!
//! Shared by the client [`Connection`](super::Connection) and the
//! [`Server`](super::Server). A link owns the two halves of the stream, the
//! wake pipe that interrupts a blocked read and the write queue.

use std::sync::Arc;
use tokio::io::{split, AsyncReadExt, ReadHalf, WriteHalf};
use tracing::debug;

use super::socket::{RfcommStream, SocketHandle};
use super::wake::{WakePipe, WakeSignal};
use super::worker::JobHandle;
use super::write_queue::{OpenFlag, WriteQueue};
use crate::{Error, Result};

/// Default upper bound of a single read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Outcome of a read that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// Bytes received, sized to exactly what was read.
    Data(Vec<u8>),
    /// The connection is closed from the caller's point of view.
    Closed,
}

/// What a single link-level read observed.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Data(Vec<u8>),
    /// Orderly close by the remote side (zero-length read).
    Eof,
    /// The wake pipe fired; the socket was not touched.
    Woken(WakeSignal),
}

pub(crate) struct Link<S: RfcommStream> {
    reader: tokio::sync::Mutex<SocketHandle<ReadHalf<S>>>,
    queue: Arc<WriteQueue<WriteHalf<S>>>,
    open: Arc<OpenFlag>,
    wake: WakePipe,
    read_buffer_size: usize,
}

impl<S: RfcommStream> Link<S> {
    pub fn new(read_buffer_size: usize) -> Arc<Self> {
        let open = Arc::new(OpenFlag::new(false));
        Arc::new(Self {
            reader: tokio::sync::Mutex::new(SocketHandle::unset()),
            queue: WriteQueue::new(open.clone()),
            open,
            wake: WakePipe::new(),
            read_buffer_size: read_buffer_size.max(1),
        })
    }

    pub fn wake(&self) -> &WakePipe {
        &self.wake
    }

    pub fn is_open(&self) -> bool {
        self.open.is_open()
    }

    /// Install a freshly connected stream and open the link.
    ///
    /// Any wake tag left over from a previous stream is discarded.
    pub async fn attach(&self, stream: S) {
        let (read_half, write_half) = split(stream);
        let mut reader = self.reader.lock().await;
        let mut writer = self.queue.writer().lock().await;

        if let Some(stale) = self.wake.drain() {
            debug!("Discarding stale wake signal: {}", stale.as_str());
        }
        reader.replace(read_half);
        writer.replace(write_half);
        self.open.set(true);
    }

    /// Stop accepting reads and writes. Returns whether the link was open.
    ///
    /// A write stuck on a full socket gives up and releases the writer.
    pub fn mark_closed(&self) -> bool {
        self.open.set(false)
    }

    /// Release both halves of the stream.
    ///
    /// Waits for an in-flight read or write to finish first, so the socket is
    /// never closed underneath it. Callers wake a blocked read before calling
    /// this; a blocked write gives up on its own once the link is marked
    /// closed.
    pub async fn shutdown_and_close(&self) {
        self.mark_closed();
        self.reader.lock().await.close();
        self.queue.writer().lock().await.shutdown_and_close().await;
    }

    /// Queue `data` behind every write submitted before it.
    pub fn write(&self, data: Vec<u8>) -> JobHandle<usize> {
        self.queue.enqueue(data)
    }

    /// Jobs waiting in the write queue, including the one in flight.
    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    /// One bounded read raced against the wake pipe.
    ///
    /// Waits without timeout until either side is ready. The wake pipe wins
    /// when both are.
    pub async fn read(&self) -> Result<ReadOutcome> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }

        let mut reader = self.reader.lock().await;
        let Some(socket) = reader.get_mut() else {
            return Err(Error::ConnectionClosed);
        };

        let mut buf = vec![0u8; self.read_buffer_size];
        tokio::select! {
            biased;
            signal = self.wake.wait() => {
                self.wake.drain();
                debug!("Read woken by {} signal", signal.as_str());
                Ok(ReadOutcome::Woken(signal))
            }
            result = socket.read(&mut buf) => match result {
                Ok(0) => Ok(ReadOutcome::Eof),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(ReadOutcome::Data(buf))
                }
                Err(e) => Err(Error::read(e)),
            },
        }
    }
}
