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

//! Client side RFCOMM connection.

use bluer::rfcomm::SocketAddr;
use bluer::Address;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::link::{Link, ReadEvent, ReadOutcome};
use super::socket::{validate_channel, Transport};
use super::wake::WakeSignal;
use super::worker::{spawn_job, JobHandle};
use crate::config::LinkConfig;
use crate::{Error, Result};

/// State of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, `connect` not called yet.
    Idle,
    /// Connect in progress.
    Connecting,
    /// Connected; reads and writes are accepted.
    Open,
    /// Closed by the caller, the remote side or a failure. Terminal.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

struct Inner<T: Transport> {
    transport: T,
    link: Arc<Link<T::Stream>>,
    state: RwLock<ConnectionState>,
    peer: RwLock<Option<SocketAddr>>,
}

/// Outgoing RFCOMM connection.
///
/// Every operation runs in the background and reports through a
/// [`JobHandle`]. Dropping the connection closes it.
pub struct Connection<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, config: &LinkConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                link: Link::new(config.read_buffer_size),
                state: RwLock::new(ConnectionState::Idle),
                peer: RwLock::new(None),
            }),
        }
    }

    /// Connect to `channel` on the device at `address`.
    ///
    /// Only valid on an idle connection. A failed attempt leaves the
    /// connection closed.
    pub fn connect(&self, address: &str, channel: u8) -> JobHandle<()> {
        let target = match parse_target(address, channel) {
            Ok(target) => target,
            Err(e) => return JobHandle::ready(Err(e)),
        };

        {
            let mut state = self.inner.state.write();
            if *state != ConnectionState::Idle {
                return JobHandle::ready(Err(Error::InvalidState(state.as_str())));
            }
            *state = ConnectionState::Connecting;
        }

        let inner = self.inner.clone();
        spawn_job("connect", async move { inner.establish(target).await })
    }

    /// Wait for the next chunk of incoming bytes.
    ///
    /// Resolves to [`ReadEvent::Closed`] when the remote side closes the
    /// stream or [`close`](Self::close) is called while the read waits.
    pub fn read(&self) -> JobHandle<ReadEvent> {
        if !self.is_open() {
            return JobHandle::ready(Err(Error::ConnectionClosed));
        }
        let inner = self.inner.clone();
        spawn_job("read", async move { inner.read_once().await })
    }

    /// Queue `data` for sending. Resolves to the number of bytes sent.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> JobHandle<usize> {
        self.inner.link.write(data.into())
    }

    /// Close the connection. Safe to call any number of times.
    ///
    /// Wakes a pending read and releases the socket in the background.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        *self.inner.state.read() == ConnectionState::Open && self.inner.link.is_open()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Remote address once connected.
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.inner.peer.read()
    }

    /// Writes queued and not yet completed.
    pub fn pending_writes(&self) -> usize {
        self.inner.link.pending_writes()
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<T: Transport> Inner<T> {
    async fn establish(&self, target: SocketAddr) -> Result<()> {
        debug!("Connecting to {} channel {}", target.addr, target.channel);

        let stream = match self.transport.connect(target).await {
            Ok(stream) => stream,
            Err(e) => {
                *self.state.write() = ConnectionState::Closed;
                warn!("Connection to {} failed: {}", target.addr, e);
                return Err(Error::connect(e));
            }
        };

        self.link.attach(stream).await;

        let closed_meanwhile = {
            let mut state = self.state.write();
            if *state == ConnectionState::Closed {
                true
            } else {
                *state = ConnectionState::Open;
                *self.peer.write() = Some(target);
                false
            }
        };
        if closed_meanwhile {
            self.link.shutdown_and_close().await;
            return Err(Error::ConnectionClosed);
        }

        info!("Connected to {} on channel {}", target.addr, target.channel);
        Ok(())
    }

    async fn read_once(&self) -> Result<ReadEvent> {
        match self.link.read().await {
            Ok(ReadOutcome::Data(data)) => Ok(ReadEvent::Data(data)),
            Ok(ReadOutcome::Eof) => {
                info!("Connection closed by remote");
                self.teardown().await;
                Ok(ReadEvent::Closed)
            }
            Ok(ReadOutcome::Woken(signal)) => {
                debug!("Read interrupted ({})", signal.as_str());
                Ok(ReadEvent::Closed)
            }
            // The read was accepted while open and lost a race with close.
            Err(Error::ConnectionClosed) => Ok(ReadEvent::Closed),
            Err(e) => {
                warn!("Read failed: {}", e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn teardown(&self) {
        *self.state.write() = ConnectionState::Closed;
        self.link.shutdown_and_close().await;
    }

    fn close(self: &Arc<Self>) {
        let previous = std::mem::replace(&mut *self.state.write(), ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }

        self.link.mark_closed();
        self.link.wake().signal(WakeSignal::Close);
        debug!("Closing connection (was {})", previous.as_str());

        // Without a runtime nothing can be in flight; the halves drop with us.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let link = self.link.clone();
            runtime.spawn(async move { link.shutdown_and_close().await });
        }
    }
}

fn parse_target(address: &str, channel: u8) -> Result<SocketAddr> {
    let addr: Address = address
        .trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(address.to_string()))?;
    let channel = validate_channel(channel)?;
    Ok(SocketAddr::new(addr, channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::fault::FaultyTransport;
    use crate::bluetooth::memory::{MemoryListener, MemoryNetwork};
    use crate::bluetooth::socket::Listener;
    use crate::error::WriteError;
    use std::io;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Notify;

    const SERVER: &str = "00:11:22:33:44:01";

    fn addr(last: u8) -> Address {
        Address::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    async fn listen(network: &MemoryNetwork, channel: u8) -> MemoryListener {
        network
            .transport(addr(1))
            .bind_and_listen(SocketAddr::new(Address::any(), channel))
            .await
            .unwrap()
    }

    async fn connected_pair(
        network: &MemoryNetwork,
    ) -> (Connection<crate::bluetooth::memory::MemoryTransport>, DuplexStream) {
        let listener = listen(network, 3).await;
        let conn = Connection::new(network.transport(addr(2)), &LinkConfig::default());
        conn.connect(SERVER, 3).await.unwrap();
        let (remote, _) = listener.accept().await.unwrap();
        (conn, remote)
    }

    #[test]
    fn test_parse_target() {
        let target = parse_target("00:11:22:33:44:01", 5).unwrap();
        assert_eq!(target.addr, addr(1));
        assert_eq!(target.channel, 5);

        assert!(matches!(
            parse_target("not an address", 1),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            parse_target(SERVER, 0),
            Err(Error::InvalidChannel(0))
        ));
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let network = MemoryNetwork::new();
        let (conn, mut remote) = connected_pair(&network).await;

        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(conn.is_open());
        assert_eq!(conn.peer().map(|p| p.addr), Some(addr(1)));

        assert_eq!(conn.write(b"hello".to_vec()).await.unwrap(), 5);
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote.write_all(b"world").await.unwrap();
        assert_eq!(
            conn.read().await.unwrap(),
            ReadEvent::Data(b"world".to_vec())
        );
    }

    #[tokio::test]
    async fn test_connect_refused_closes_connection() {
        let network = MemoryNetwork::new();
        let conn = Connection::new(network.transport(addr(2)), &LinkConfig::default());

        let err = conn.connect(SERVER, 3).await.unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
        assert_eq!(conn.state(), ConnectionState::Closed);

        // A closed connection cannot be reused.
        assert!(matches!(
            conn.connect(SERVER, 3).await,
            Err(Error::InvalidState("closed"))
        ));
    }

    #[tokio::test]
    async fn test_invalid_input_keeps_connection_idle() {
        let network = MemoryNetwork::new();
        let conn = Connection::new(network.transport(addr(2)), &LinkConfig::default());

        assert!(matches!(
            conn.connect("zz:zz", 1).await,
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            conn.connect(SERVER, 31).await,
            Err(Error::InvalidChannel(31))
        ));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_io_before_connect_is_rejected() {
        let network = MemoryNetwork::new();
        let conn = Connection::new(network.transport(addr(2)), &LinkConfig::default());

        assert!(matches!(conn.read().await, Err(Error::ConnectionClosed)));
        assert!(matches!(
            conn.write(b"early".to_vec()).await,
            Err(Error::Write(WriteError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_read() {
        let network = MemoryNetwork::new();
        let (conn, _remote) = connected_pair(&network).await;

        let pending = conn.read();
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();

        let event = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ReadEvent::Closed);
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Idempotent.
        conn.close();
        assert!(matches!(conn.read().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let network = MemoryNetwork::new();
        let (conn, mut remote) = connected_pair(&network).await;

        conn.close();
        let err = conn.write(b"late".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::Write(WriteError::Closed)));

        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_remote_close_is_terminal() {
        let network = MemoryNetwork::new();
        let (conn, remote) = connected_pair(&network).await;

        drop(remote);
        assert_eq!(conn.read().await.unwrap(), ReadEvent::Closed);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_writes_arrive_in_order_through_small_pipe() {
        let network = MemoryNetwork::new();
        let listener = listen(&network, 7).await;
        let conn = Connection::new(
            network.transport(addr(2)).with_pipe_capacity(7),
            &LinkConfig::default(),
        );
        conn.connect(SERVER, 7).await.unwrap();
        let (mut remote, _) = listener.accept().await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            remote.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let handles: Vec<_> = (0..10u8).map(|i| conn.write(vec![i; 50])).collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 50);
        }
        conn.close();

        let received = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        let expected: Vec<u8> = (0..10u8).flat_map(|i| vec![i; 50]).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_close_releases_stalled_write() {
        let network = MemoryNetwork::new();
        let listener = listen(&network, 8).await;
        let conn = Connection::new(
            network.transport(addr(2)).with_pipe_capacity(16),
            &LinkConfig::default(),
        );
        conn.connect(SERVER, 8).await.unwrap();
        // Accepted but never read.
        let (_remote, _) = listener.accept().await.unwrap();

        let stalled = conn.write(vec![3u8; 512]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();

        let result = tokio::time::timeout(Duration::from_secs(1), stalled)
            .await
            .expect("write still blocked after close");
        assert!(matches!(
            result,
            Err(Error::Write(WriteError::Unsuccessful { written: 16, .. }))
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_read_error_closes_connection() {
        let conn = Connection::new(
            FaultyTransport::new(io::ErrorKind::InvalidData),
            &LinkConfig::default(),
        );
        conn.connect(SERVER, 1).await.unwrap();

        let err = conn.read().await.unwrap_err();
        assert!(matches!(err, Error::Read { errno: None, .. }));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.read().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_while_connecting() {
        let gate = Arc::new(Notify::new());
        let conn = Connection::new(
            FaultyTransport::gated(io::ErrorKind::InvalidData, gate.clone()),
            &LinkConfig::default(),
        );

        let pending = conn.connect(SERVER, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.close();
        gate.notify_one();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_open());
        assert!(conn.peer().is_none());
    }
}
