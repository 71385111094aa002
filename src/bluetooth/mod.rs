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

//! Bluetooth communication module.
//!
//! RFCOMM client connections and a single-client RFCOMM server with SDP
//! advertisement.

pub mod bluez;
mod connection;
#[cfg(test)]
mod fault;
mod link;
pub mod memory;
pub mod sdp;
mod server;
pub mod socket;
mod wake;
mod worker;
mod write_queue;

pub use bluez::{prepare_adapter, BluezAdvertiser, BluezTransport};
pub use connection::{Connection, ConnectionState};
pub use link::{ReadEvent, DEFAULT_READ_BUFFER_SIZE};
pub use sdp::{parse_service_uuid, ServiceAdvertiser, ServiceRecord, SPP_UUID};
pub use server::{ListenOptions, ListenPhase, Server, ServerEvent, ServerEvents};
pub use socket::{Listener, RfcommStream, SocketHandle, Transport};
pub use wake::{WakePipe, WakeSignal};
pub use worker::JobHandle;
pub use write_queue::{OpenFlag, WriteQueue};
