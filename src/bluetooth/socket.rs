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

//! Socket primitives.
//!
//! [`Transport`] and [`Listener`] are the seam between the connection logic
//! and a concrete Bluetooth stack. Streams handed out by a transport are
//! already registered with the tokio reactor, so they are non-blocking from
//! the moment they exist; readiness is awaited instead of polled.

use bluer::rfcomm::SocketAddr;
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Highest RFCOMM channel number.
pub const MAX_CHANNEL: u8 = 30;

/// A connected RFCOMM byte stream.
pub trait RfcommStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RfcommStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A bound and listening RFCOMM socket.
pub trait Listener: Send + Sync + 'static {
    type Stream: RfcommStream;

    /// Wait for the next incoming connection.
    ///
    /// Must be cancel safe: the accept loop drops this future at every poll
    /// interval.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

/// Factory for RFCOMM sockets.
pub trait Transport: Send + Sync + 'static {
    type Stream: RfcommStream;
    type Listener: Listener<Stream = Self::Stream>;

    /// Allocate a socket and connect it to `addr`.
    fn connect(&self, addr: SocketAddr) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Allocate a socket, bind it to `addr` and start listening with a backlog
    /// of one.
    fn bind_and_listen(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = io::Result<Self::Listener>> + Send;
}

/// Exclusive owner of one socket (or one half of a split stream).
///
/// A handle is either unset or holds exactly one socket. Taking the socket out
/// leaves the handle unset, so a socket can never be closed twice.
#[derive(Debug)]
pub struct SocketHandle<S> {
    socket: Option<S>,
}

impl<S> Default for SocketHandle<S> {
    fn default() -> Self {
        Self::unset()
    }
}

impl<S> SocketHandle<S> {
    /// A handle that owns nothing.
    pub const fn unset() -> Self {
        Self { socket: None }
    }

    pub fn new(socket: S) -> Self {
        Self {
            socket: Some(socket),
        }
    }

    pub fn is_set(&self) -> bool {
        self.socket.is_some()
    }

    pub fn get(&self) -> Option<&S> {
        self.socket.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.socket.as_mut()
    }

    /// Install `socket`, returning the one previously held.
    pub fn replace(&mut self, socket: S) -> Option<S> {
        self.socket.replace(socket)
    }

    /// Remove the socket, leaving the handle unset.
    pub fn take(&mut self) -> Option<S> {
        self.socket.take()
    }

    /// Drop the socket without a shutdown handshake. No-op when unset.
    pub fn close(&mut self) -> bool {
        self.socket.take().is_some()
    }
}

impl<S: AsyncWrite + Unpin> SocketHandle<S> {
    /// Shut down the write direction and release the socket.
    ///
    /// Safe to call any number of times; only the first call on a set handle
    /// touches the socket.
    pub async fn shutdown_and_close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.shutdown().await {
                debug!("Socket shutdown failed: {}", e);
            }
        }
    }
}

/// Reject channel numbers RFCOMM cannot carry.
pub fn validate_channel(channel: u8) -> crate::Result<u8> {
    if channel == 0 || channel > MAX_CHANNEL {
        return Err(crate::Error::InvalidChannel(channel));
    }
    Ok(channel)
}
