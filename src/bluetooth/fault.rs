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

//! Transport whose streams fail to read, for exercising error paths.

use bluer::rfcomm::SocketAddr;
use bluer::Address;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;

use super::socket::{Listener, Transport};

pub(crate) fn peer_address() -> Address {
    Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x99])
}

/// Every read fails with `kind`; writes are swallowed.
pub(crate) struct FailingStream {
    kind: io::ErrorKind,
}

impl AsyncRead for FailingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::from(self.kind)))
    }
}

impl AsyncWrite for FailingStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Hands out [`FailingStream`]s.
///
/// The listener accepts exactly one client. With a gate set, `connect`
/// waits until the gate is notified.
pub(crate) struct FaultyTransport {
    kind: io::ErrorKind,
    gate: Option<Arc<Notify>>,
}

impl FaultyTransport {
    pub fn new(kind: io::ErrorKind) -> Self {
        Self { kind, gate: None }
    }

    pub fn gated(kind: io::ErrorKind, gate: Arc<Notify>) -> Self {
        Self {
            kind,
            gate: Some(gate),
        }
    }
}

impl Transport for FaultyTransport {
    type Stream = FailingStream;
    type Listener = FaultyListener;

    async fn connect(&self, _addr: SocketAddr) -> io::Result<FailingStream> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(FailingStream { kind: self.kind })
    }

    async fn bind_and_listen(&self, _addr: SocketAddr) -> io::Result<FaultyListener> {
        Ok(FaultyListener {
            pending: Mutex::new(Some(FailingStream { kind: self.kind })),
        })
    }
}

pub(crate) struct FaultyListener {
    pending: Mutex<Option<FailingStream>>,
}

impl Listener for FaultyListener {
    type Stream = FailingStream;

    async fn accept(&self) -> io::Result<(FailingStream, SocketAddr)> {
        let stream = self.pending.lock().take();
        match stream {
            Some(stream) => Ok((stream, SocketAddr::new(peer_address(), 1))),
            None => std::future::pending().await,
        }
    }
}
