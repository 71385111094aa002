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

//! Bluetooth RFCOMM server implementation.
//!
//! The server serves one client at a time. While nobody is connected the
//! service record is advertised and the accept loop waits for a connection;
//! accepting a client withdraws the record, losing it registers the record
//! again and restarts the accept loop.

use bluer::rfcomm::SocketAddr;
use bluer::Address;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use super::link::{Link, ReadEvent, ReadOutcome};
use super::sdp::{parse_service_uuid, Advertisement, ServiceAdvertiser, ServiceRecord};
use super::socket::{validate_channel, Listener, SocketHandle, Transport};
use super::wake::WakeSignal;
use super::worker::{spawn_job, JobHandle};
use crate::config::LinkConfig;
use crate::{Error, Result};

/// Events emitted by a listening server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client was accepted.
    Connected { address: Address },
    /// The client went away or was disconnected.
    Disconnected { address: Address },
    /// Something went wrong in the background; the server keeps going.
    Error(String),
}

/// Receiver half of the server event channel.
///
/// The server never waits for the receiver: events that find the channel
/// full are dropped with a warning.
pub type ServerEvents = mpsc::Receiver<ServerEvent>;

/// What to listen on and how to advertise it.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Service class UUID in 16-bit, 32-bit or 128-bit form.
    pub uuid: String,
    pub channel: u8,
    /// Advertised name. Empty picks a default.
    pub name: String,
}

/// Lifecycle of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenPhase {
    Idle,
    /// Bound, service not registered yet.
    Listening,
    /// Waiting for a client.
    Advertising,
    /// Serving a client.
    Accepted,
    /// Terminal.
    Closed,
}

impl ListenPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenPhase::Idle => "idle",
            ListenPhase::Listening => "listening",
            ListenPhase::Advertising => "advertising",
            ListenPhase::Accepted => "accepted",
            ListenPhase::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Client {
    generation: u64,
    address: Address,
}

struct ListenState {
    phase: ListenPhase,
    client: Option<Client>,
    generation: u64,
    last_client: Option<Address>,
    events: Option<mpsc::Sender<ServerEvent>>,
}

struct Inner<T: Transport, A: ServiceAdvertiser> {
    transport: T,
    advertiser: A,
    config: LinkConfig,
    link: Arc<Link<T::Stream>>,
    /// Unset once the server is closed; the accept loop stops when it sees that.
    listener: Mutex<SocketHandle<Arc<T::Listener>>>,
    advertisement: tokio::sync::Mutex<Option<Advertisement<A>>>,
    state: Mutex<ListenState>,
}

/// Listening RFCOMM endpoint serving a single client at a time.
///
/// Dropping the server closes it.
pub struct Server<T: Transport, A: ServiceAdvertiser + Clone> {
    inner: Arc<Inner<T, A>>,
}

impl<T, A> Server<T, A>
where
    T: Transport,
    A: ServiceAdvertiser + Clone,
{
    pub fn new(transport: T, advertiser: A, config: &LinkConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                advertiser,
                config: config.clone(),
                link: Link::new(config.read_buffer_size),
                listener: Mutex::new(SocketHandle::unset()),
                advertisement: tokio::sync::Mutex::new(None),
                state: Mutex::new(ListenState {
                    phase: ListenPhase::Idle,
                    client: None,
                    generation: 0,
                    last_client: None,
                    events: None,
                }),
            }),
        }
    }

    /// Bind the channel, advertise the service and start accepting.
    ///
    /// Resolves to the event receiver once the service is advertised. A bind
    /// or registration failure is reported here and the server returns to
    /// idle.
    pub fn listen(&self, options: ListenOptions) -> JobHandle<ServerEvents> {
        let record = match service_record(&options) {
            Ok(record) => record,
            Err(e) => return JobHandle::ready(Err(e)),
        };

        {
            let mut state = self.inner.state.lock();
            if state.phase != ListenPhase::Idle {
                return JobHandle::ready(Err(Error::InvalidState(state.phase.as_str())));
            }
            state.phase = ListenPhase::Listening;
        }

        let inner = self.inner.clone();
        spawn_job("listen", async move { inner.start(record).await })
    }

    /// Wait for the next chunk of bytes from the current client.
    ///
    /// Losing the client resolves to [`ReadEvent::Closed`]; the server then
    /// advertises again on its own.
    pub fn read(&self) -> JobHandle<ReadEvent> {
        let generation = match self.inner.state.lock().client {
            Some(client) if self.inner.link.is_open() => client.generation,
            _ => return JobHandle::ready(Err(Error::ConnectionClosed)),
        };
        let inner = self.inner.clone();
        spawn_job("read", async move { inner.read_client(generation).await })
    }

    /// Queue `data` for the current client.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> JobHandle<usize> {
        self.inner.link.write(data.into())
    }

    /// Drop the current client and go back to advertising.
    ///
    /// The listening socket is left alone. Does nothing when no client is
    /// connected.
    pub fn disconnect_client(&self) {
        let generation = match self.inner.state.lock().client {
            Some(client) => client.generation,
            None => {
                debug!("No client to disconnect");
                return;
            }
        };

        self.inner.link.mark_closed();
        self.inner.link.wake().signal(WakeSignal::Disconnect);
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.release_client(generation).await });
    }

    /// Stop listening, withdraw the service and close the client.
    ///
    /// Safe to call any number of times. The event channel ends once the
    /// accept loop has stopped.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether a client is connected.
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().client.is_some() && self.inner.link.is_open()
    }

    pub fn phase(&self) -> ListenPhase {
        self.inner.state.lock().phase
    }

    /// Address of the most recently accepted client.
    pub fn client_address(&self) -> Option<Address> {
        self.inner.state.lock().last_client
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.link.pending_writes()
    }
}

impl<T, A> Drop for Server<T, A>
where
    T: Transport,
    A: ServiceAdvertiser + Clone,
{
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<T, A> Inner<T, A>
where
    T: Transport,
    A: ServiceAdvertiser + Clone,
{
    fn is_closed(&self) -> bool {
        self.state.lock().phase == ListenPhase::Closed
    }

    async fn start(self: Arc<Self>, record: ServiceRecord) -> Result<ServerEvents> {
        let channel = record.channel;
        let listener = match self
            .transport
            .bind_and_listen(SocketAddr::new(Address::any(), channel))
            .await
        {
            Ok(listener) => listener,
            Err(source) => {
                error!("Couldn't listen on channel {}: {}", channel, source);
                self.reset_after_failed_listen();
                return Err(Error::Listen { channel, source });
            }
        };
        info!("RFCOMM server listening on channel {}", channel);

        let mut advertisement = Advertisement::new(self.advertiser.clone(), record);
        if let Err(e) = advertisement.activate().await {
            error!("Failed to advertise service: {}", e);
            drop(listener);
            self.reset_after_failed_listen();
            return Err(e);
        }

        self.listener.lock().replace(Arc::new(listener));
        *self.advertisement.lock().await = Some(advertisement);

        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let closed = {
            let mut state = self.state.lock();
            if state.phase == ListenPhase::Closed {
                true
            } else {
                state.phase = ListenPhase::Advertising;
                state.events = Some(tx);
                false
            }
        };
        if closed {
            self.listener.lock().close();
            self.withdraw().await;
            return Err(Error::ConnectionClosed);
        }

        self.spawn_accept_loop();
        Ok(rx)
    }

    fn reset_after_failed_listen(&self) {
        let mut state = self.state.lock();
        if state.phase != ListenPhase::Closed {
            state.phase = ListenPhase::Idle;
        }
    }

    fn spawn_accept_loop(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move { inner.accept_loop().await });
    }

    /// Wait for one client, polling so that closing the listening socket
    /// stops the loop within one interval.
    async fn accept_loop(self: Arc<Self>) {
        let poll_interval = self.config.accept_poll_interval();
        info!("Waiting for connections...");

        loop {
            let Some(listener) = self.listener.lock().get().cloned() else {
                debug!("Listening socket closed, accept loop exiting");
                return;
            };

            let accepted = match tokio::time::timeout(poll_interval, listener.accept()).await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
            drop(listener);

            match accepted {
                Ok((stream, peer)) => {
                    self.on_accept(stream, peer.addr).await;
                    return;
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    self.emit(ServerEvent::Error(format!("Accept error: {e}")));
                    tokio::time::sleep(self.config.accept_retry_delay()).await;
                }
            }
        }
    }

    async fn on_accept(&self, stream: T::Stream, address: Address) {
        self.withdraw().await;
        self.link.attach(stream).await;

        let accepted = {
            let mut state = self.state.lock();
            if state.phase == ListenPhase::Closed {
                false
            } else {
                state.generation += 1;
                state.client = Some(Client {
                    generation: state.generation,
                    address,
                });
                state.last_client = Some(address);
                state.phase = ListenPhase::Accepted;
                true
            }
        };

        if !accepted {
            debug!("Server closed while accepting {}, dropping client", address);
            self.link.shutdown_and_close().await;
            return;
        }

        info!("Connection from: {}", address);
        self.emit(ServerEvent::Connected { address });
    }

    async fn read_client(self: Arc<Self>, generation: u64) -> Result<ReadEvent> {
        match self.link.read().await {
            Ok(ReadOutcome::Data(data)) => Ok(ReadEvent::Data(data)),
            Ok(ReadOutcome::Eof) => {
                info!("Connection closed by remote");
                self.release_client(generation).await;
                Ok(ReadEvent::Closed)
            }
            Ok(ReadOutcome::Woken(WakeSignal::Disconnect)) => {
                self.release_client(generation).await;
                Ok(ReadEvent::Closed)
            }
            Ok(ReadOutcome::Woken(WakeSignal::Close)) => Ok(ReadEvent::Closed),
            Err(Error::ConnectionClosed) => Ok(ReadEvent::Closed),
            Err(e) if e.is_disconnect() => {
                warn!("Client connection lost: {}", e);
                self.release_client(generation).await;
                Ok(ReadEvent::Closed)
            }
            Err(e) => Err(e),
        }
    }

    /// Close the client of `generation` and go back to advertising.
    ///
    /// Only the first call for a given client does anything.
    async fn release_client(self: &Arc<Self>, generation: u64) {
        let (client, closed) = {
            let mut state = self.state.lock();
            match state.client {
                Some(client) if client.generation == generation => {
                    state.client = None;
                    (client, state.phase == ListenPhase::Closed)
                }
                _ => return,
            }
        };

        self.link.shutdown_and_close().await;
        info!("Client disconnected: {}", client.address);
        self.emit(ServerEvent::Disconnected {
            address: client.address,
        });

        if !closed {
            self.rearm().await;
        }
    }

    /// Register the service again and restart the accept loop.
    async fn rearm(self: &Arc<Self>) {
        let result = {
            let mut advertisement = self.advertisement.lock().await;
            if self.is_closed() {
                return;
            }
            match advertisement.as_mut() {
                Some(advertisement) => advertisement.activate().await,
                None => Ok(()),
            }
        };

        let phase = match result {
            Ok(()) => ListenPhase::Advertising,
            Err(e) => {
                error!("Failed to advertise service again: {}", e);
                self.emit(ServerEvent::Error(e.to_string()));
                ListenPhase::Listening
            }
        };

        {
            let mut state = self.state.lock();
            if state.phase == ListenPhase::Closed {
                return;
            }
            state.phase = phase;
        }
        self.spawn_accept_loop();
    }

    async fn withdraw(&self) {
        if let Some(advertisement) = self.advertisement.lock().await.as_mut() {
            advertisement.withdraw().await;
        }
    }

    /// Deliver `event` without waiting for the receiver.
    ///
    /// Events that do not fit in the channel are dropped.
    fn emit(&self, event: ServerEvent) {
        let Some(tx) = self.state.lock().events.clone() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("Event channel full, dropping {:?}", event),
            Err(TrySendError::Closed(event)) => debug!("Server event dropped: {:?}", event),
        }
    }

    fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.phase == ListenPhase::Closed {
                return;
            }
            state.phase = ListenPhase::Closed;
            state.client = None;
            state.events = None;
        }

        self.listener.lock().close();
        self.link.mark_closed();
        self.link.wake().signal(WakeSignal::Close);
        info!("Server closed");

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.clone();
            runtime.spawn(async move {
                inner.withdraw().await;
                inner.link.shutdown_and_close().await;
            });
        }
    }
}

fn service_record(options: &ListenOptions) -> Result<ServiceRecord> {
    let uuid = parse_service_uuid(&options.uuid)?;
    let channel = validate_channel(options.channel)?;
    Ok(ServiceRecord::new(uuid, channel, &options.name))
}
