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

//! BlueZ backed sockets and SDP registration.

use bluer::rfcomm::{self, ProfileHandle, Role, SocketAddr};
use bluer::{Adapter, Session};
use std::io;
use tracing::{debug, info};

use super::sdp::{ServiceAdvertiser, ServiceRecord};
use super::socket::{Listener, Transport};
use crate::{Error, Result};

/// Kernel RFCOMM sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct BluezTransport;

impl Transport for BluezTransport {
    type Stream = rfcomm::Stream;
    type Listener = rfcomm::Listener;

    async fn connect(&self, addr: SocketAddr) -> io::Result<rfcomm::Stream> {
        let socket = rfcomm::Socket::new()?;
        socket.connect(addr).await
    }

    async fn bind_and_listen(&self, addr: SocketAddr) -> io::Result<rfcomm::Listener> {
        let socket = rfcomm::Socket::new()?;
        socket.bind(addr)?;
        // RFCOMM serves one peer at a time.
        socket.listen(1)
    }
}

impl Listener for rfcomm::Listener {
    type Stream = rfcomm::Stream;

    async fn accept(&self) -> io::Result<(rfcomm::Stream, SocketAddr)> {
        rfcomm::Listener::accept(self).await
    }
}

/// Registers service records through the BlueZ profile manager.
///
/// The record is passed as SDP XML, so the advertised channel is the one
/// the server bound rather than one picked by BlueZ.
#[derive(Clone)]
pub struct BluezAdvertiser {
    session: Session,
}

impl BluezAdvertiser {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

impl ServiceAdvertiser for BluezAdvertiser {
    type Session = ProfileHandle;

    async fn advertise(&self, record: &ServiceRecord) -> Result<ProfileHandle> {
        let profile = rfcomm::Profile {
            uuid: record.uuid,
            name: Some(record.name.clone()),
            role: Some(Role::Server),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            service_record: Some(record.to_sdp_xml()),
            ..Default::default()
        };

        self.session
            .register_profile(profile)
            .await
            .map_err(|e| Error::Advertise(e.to_string()))
    }

    async fn withdraw(&self, session: ProfileHandle) {
        // Dropping the handle unregisters the profile.
        drop(session);
        debug!("Profile unregistered");
    }
}

/// Power on the default adapter and make it discoverable.
///
/// `alias` renames the adapter when given.
pub async fn prepare_adapter(session: &Session, alias: Option<&str>) -> bluer::Result<Adapter> {
    let adapter = session.default_adapter().await?;
    info!("Using Bluetooth adapter: {}", adapter.name());

    if !adapter.is_powered().await? {
        info!("Powering on Bluetooth adapter...");
        adapter.set_powered(true).await?;
    }

    if let Some(alias) = alias {
        adapter.set_alias(alias.to_string()).await?;
        info!("Bluetooth name set to: {}", alias);
    }

    adapter.set_discoverable(true).await?;
    adapter.set_pairable(true).await?;
    info!(
        "Adapter {} is discoverable and pairable",
        adapter.address().await?
    );

    Ok(adapter)
}
