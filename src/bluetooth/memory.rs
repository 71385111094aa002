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

//! In-process RFCOMM backend.
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryTransport`]s, each with
//! its own Bluetooth address, through in-memory duplex pipes. Together with
//! [`MemoryAdvertiser`] it lets the connection and server logic run without a
//! radio or a BlueZ daemon.

use bluer::rfcomm::SocketAddr;
use bluer::Address;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use super::sdp::{ServiceAdvertiser, ServiceRecord};
use super::socket::{Listener, Transport};
use crate::{Error, Result};

/// Default capacity of each direction of an in-memory stream.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

type Backlog = mpsc::UnboundedSender<(DuplexStream, SocketAddr)>;

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<(Address, u8), (u64, Backlog)>,
    next_listener: u64,
}

/// Shared medium for in-memory transports.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose sockets use `address` as their local address.
    pub fn transport(&self, address: Address) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            address,
            capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    /// Whether anything listens on `channel` of `address`.
    pub fn is_listening(&self, address: Address, channel: u8) -> bool {
        self.state.lock().listeners.contains_key(&(address, channel))
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: Address,
    capacity: usize,
}

impl MemoryTransport {
    /// Limit how many bytes each direction of a stream buffers before a
    /// write has to wait for the peer.
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

impl Transport for MemoryTransport {
    type Stream = DuplexStream;
    type Listener = MemoryListener;

    async fn connect(&self, addr: SocketAddr) -> io::Result<DuplexStream> {
        let backlog = self
            .network
            .state
            .lock()
            .listeners
            .get(&(addr.addr, addr.channel))
            .map(|(_, backlog)| backlog.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        let (local, remote) = tokio::io::duplex(self.capacity);
        backlog
            .send((remote, SocketAddr::new(self.address, 0)))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        debug!("Memory connect {} -> {:?}", self.address, addr);
        Ok(local)
    }

    async fn bind_and_listen(&self, addr: SocketAddr) -> io::Result<MemoryListener> {
        let address = if addr.addr == Address::any() {
            self.address
        } else {
            addr.addr
        };
        let key = (address, addr.channel);

        let mut state = self.network.state.lock();
        if state.listeners.contains_key(&key) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        let id = state.next_listener;
        state.next_listener += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(key, (id, tx));

        Ok(MemoryListener {
            network: self.network.clone(),
            key,
            id,
            backlog: tokio::sync::Mutex::new(rx),
        })
    }
}

/// Listening endpoint. Dropping it frees the channel.
pub struct MemoryListener {
    network: MemoryNetwork,
    key: (Address, u8),
    id: u64,
    backlog: tokio::sync::Mutex<mpsc::UnboundedReceiver<(DuplexStream, SocketAddr)>>,
}

impl Listener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&self) -> io::Result<(DuplexStream, SocketAddr)> {
        self.backlog
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut state = self.network.state.lock();
        if matches!(state.listeners.get(&self.key), Some((id, _)) if *id == self.id) {
            state.listeners.remove(&self.key);
        }
    }
}

#[derive(Default)]
struct DirectoryState {
    records: HashMap<u64, ServiceRecord>,
    next_session: u64,
    registrations: usize,
    withdrawals: usize,
    rejecting: bool,
}

/// Registration handle of a [`MemoryAdvertiser`].
#[derive(Debug)]
pub struct MemorySession(u64);

/// In-memory SDP database.
#[derive(Clone)]
pub struct MemoryAdvertiser {
    state: Arc<Mutex<DirectoryState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for MemoryAdvertiser {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdvertiser {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::default(),
            changes: Arc::new(changes),
        }
    }

    /// Make subsequent registrations fail.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.lock().rejecting = rejecting;
    }

    pub fn is_advertised(&self, uuid: &Uuid) -> bool {
        self.state.lock().records.values().any(|r| &r.uuid == uuid)
    }

    /// Records currently registered.
    pub fn records(&self) -> Vec<ServiceRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Successful registrations so far.
    pub fn registrations(&self) -> usize {
        self.state.lock().registrations
    }

    pub fn withdrawals(&self) -> usize {
        self.state.lock().withdrawals
    }

    /// Wait until `condition` holds, re-checking after every change.
    pub async fn wait_until<F>(&self, mut condition: F)
    where
        F: FnMut(&MemoryAdvertiser) -> bool,
    {
        let mut rx = self.changes.subscribe();
        let _ = rx.wait_for(|_| condition(self)).await;
    }

    fn bump(&self) {
        self.changes.send_modify(|n| *n += 1);
    }
}

impl ServiceAdvertiser for MemoryAdvertiser {
    type Session = MemorySession;

    async fn advertise(&self, record: &ServiceRecord) -> Result<MemorySession> {
        let session = {
            let mut state = self.state.lock();
            if state.rejecting {
                return Err(Error::Advertise("registration rejected".to_string()));
            }
            let id = state.next_session;
            state.next_session += 1;
            state.registrations += 1;
            state.records.insert(id, record.clone());
            MemorySession(id)
        };
        self.bump();
        Ok(session)
    }

    async fn withdraw(&self, session: MemorySession) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.records.remove(&session.0).is_some();
            if removed {
                state.withdrawals += 1;
            }
            removed
        };
        if removed {
            self.bump();
        }
    }
}
