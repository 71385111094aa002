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

//! SDP service records and advertisement.

use std::fmt::Write as _;
use std::future::Future;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Error, Result};

/// Serial Port Profile service class.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Bluetooth base UUID; 16 and 32-bit UUIDs are aliases inside it.
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
const BASE_UUID_MASK: u128 = 0x00000000_FFFF_FFFF_FFFF_FFFFFFFFFFFF;

const L2CAP_UUID16: u16 = 0x0100;
const RFCOMM_UUID16: u16 = 0x0003;
const PUBLIC_BROWSE_GROUP: u16 = 0x1002;

const DEFAULT_SERVICE_NAME: &str = "RFCOMM custom service";
const SPP_SERVICE_NAME: &str = "Serial Port";
const SERVICE_DESCRIPTION: &str = "An RFCOMM listening socket";

/// Parse a service UUID.
///
/// Accepts 4 hex digits (16-bit alias), 8 hex digits (32-bit alias) or the
/// 36-character hyphenated form.
pub fn parse_service_uuid(input: &str) -> Result<Uuid> {
    let invalid = || Error::InvalidUuid(input.to_string());
    let all_hex = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());

    match input.len() {
        4 | 8 if all_hex(input) => {
            let short = u32::from_str_radix(input, 16).map_err(|_| invalid())?;
            Ok(Uuid::from_u128(BASE_UUID | ((short as u128) << 96)))
        }
        36 => {
            let groups: Vec<&str> = input.split('-').collect();
            let lengths: Vec<usize> = groups.iter().map(|g| g.len()).collect();
            if lengths != [8, 4, 4, 4, 12] || !groups.iter().all(|g| all_hex(g)) {
                return Err(invalid());
            }
            Uuid::parse_str(input).map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

/// The 16 or 32-bit alias of `uuid`, if it lies in the Bluetooth base range.
pub fn short_uuid(uuid: &Uuid) -> Option<u32> {
    let value = uuid.as_u128();
    if value & BASE_UUID_MASK == BASE_UUID {
        Some((value >> 96) as u32)
    } else {
        None
    }
}

fn xml_uuid(uuid: &Uuid) -> String {
    match short_uuid(uuid) {
        Some(short) if short <= 0xFFFF => format!("<uuid value=\"0x{:04x}\" />", short),
        Some(short) => format!("<uuid value=\"0x{:08x}\" />", short),
        None => format!("<uuid value=\"{}\" />", uuid.hyphenated()),
    }
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Discoverable description of an RFCOMM service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub uuid: Uuid,
    pub channel: u8,
    pub name: String,
    pub description: String,
}

impl ServiceRecord {
    /// Build a record for `uuid` on `channel`.
    ///
    /// An empty `name` picks "Serial Port" for the SPP class and
    /// "RFCOMM custom service" for anything else.
    pub fn new(uuid: Uuid, channel: u8, name: &str) -> Self {
        let name = if !name.trim().is_empty() {
            name.to_string()
        } else if uuid == SPP_UUID {
            SPP_SERVICE_NAME.to_string()
        } else {
            DEFAULT_SERVICE_NAME.to_string()
        };

        Self {
            uuid,
            channel,
            name,
            description: SERVICE_DESCRIPTION.to_string(),
        }
    }

    /// Render the record in the BlueZ SDP XML format.
    ///
    /// Carries the service class list, service id, the L2CAP/RFCOMM protocol
    /// descriptor bound to the channel, the public browse group, the service
    /// name and the description.
    pub fn to_sdp_xml(&self) -> String {
        let uuid = xml_uuid(&self.uuid);
        let mut xml = String::new();

        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<record>\n");
        // ServiceClassIDList
        let _ = write!(
            xml,
            "  <attribute id=\"0x0001\">\n    <sequence>\n      {uuid}\n    </sequence>\n  </attribute>\n"
        );
        // ServiceID
        let _ = write!(xml, "  <attribute id=\"0x0003\">\n    {uuid}\n  </attribute>\n");
        // ProtocolDescriptorList
        let _ = write!(
            xml,
            "  <attribute id=\"0x0004\">\n    <sequence>\n      <sequence>\n        <uuid value=\"0x{:04x}\" />\n      </sequence>\n      <sequence>\n        <uuid value=\"0x{:04x}\" />\n        <uint8 value=\"0x{:02x}\" />\n      </sequence>\n    </sequence>\n  </attribute>\n",
            L2CAP_UUID16, RFCOMM_UUID16, self.channel
        );
        // BrowseGroupList
        let _ = write!(
            xml,
            "  <attribute id=\"0x0005\">\n    <sequence>\n      <uuid value=\"0x{:04x}\" />\n    </sequence>\n  </attribute>\n",
            PUBLIC_BROWSE_GROUP
        );
        let _ = write!(
            xml,
            "  <attribute id=\"0x0100\">\n    <text value=\"{}\" />\n  </attribute>\n",
            escape_xml(&self.name)
        );
        let _ = write!(
            xml,
            "  <attribute id=\"0x0101\">\n    <text value=\"{}\" />\n  </attribute>\n",
            escape_xml(&self.description)
        );
        xml.push_str("</record>\n");
        xml
    }
}

/// Registers service records with the local SDP database.
pub trait ServiceAdvertiser: Send + Sync + 'static {
    /// Opaque registration; dropping or withdrawing it removes the record.
    type Session: Send + 'static;

    fn advertise(
        &self,
        record: &ServiceRecord,
    ) -> impl Future<Output = Result<Self::Session>> + Send;

    fn withdraw(&self, session: Self::Session) -> impl Future<Output = ()> + Send;
}

/// A record plus its registration state.
///
/// Withdrawing only acts on a session that is still held, so it can be called
/// any number of times.
pub struct Advertisement<A: ServiceAdvertiser> {
    advertiser: A,
    record: ServiceRecord,
    session: Option<A::Session>,
}

impl<A: ServiceAdvertiser> Advertisement<A> {
    pub fn new(advertiser: A, record: ServiceRecord) -> Self {
        Self {
            advertiser,
            record,
            session: None,
        }
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Register the record unless it already is.
    pub async fn activate(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = self.advertiser.advertise(&self.record).await?;
        self.session = Some(session);
        info!(
            "Service '{}' advertised (UUID: {}, channel {})",
            self.record.name, self.record.uuid, self.record.channel
        );
        Ok(())
    }

    /// Deregister the record. No-op when not registered.
    pub async fn withdraw(&mut self) {
        if let Some(session) = self.session.take() {
            self.advertiser.withdraw(session).await;
            debug!("Service '{}' withdrawn", self.record.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_short_uuids() {
        assert_eq!(parse_service_uuid("1101").unwrap(), SPP_UUID);
        assert_eq!(parse_service_uuid("00001101").unwrap(), SPP_UUID);
        assert_eq!(short_uuid(&parse_service_uuid("1101").unwrap()), Some(0x1101));
    }

    #[test]
    fn test_parse_full_uuid() {
        let uuid = parse_service_uuid("185f3df4-3268-4e3f-9fca-d4d5059915bd").unwrap();
        assert_eq!(uuid.to_string(), "185f3df4-3268-4e3f-9fca-d4d5059915bd");
        assert_eq!(short_uuid(&uuid), None);

        let spp = parse_service_uuid("00001101-0000-1000-8000-00805F9B34FB").unwrap();
        assert_eq!(spp, SPP_UUID);
    }

    #[test]
    fn test_reject_malformed_uuids() {
        for bad in ["", "110", "11011", "zz01", "1101010", "185f3df432684e3f9fcad4d5059915bd"] {
            assert!(
                matches!(parse_service_uuid(bad), Err(Error::InvalidUuid(_))),
                "accepted {bad:?}"
            );
        }
        assert!(parse_service_uuid("185f3df4-3268-4e3f-9fca+d4d5059915bd").is_err());
    }

    #[test]
    fn test_default_service_names() {
        assert_eq!(ServiceRecord::new(SPP_UUID, 1, "").name, "Serial Port");
        let custom = parse_service_uuid("185f3df4-3268-4e3f-9fca-d4d5059915bd").unwrap();
        assert_eq!(ServiceRecord::new(custom, 1, "").name, "RFCOMM custom service");
        assert_eq!(ServiceRecord::new(custom, 1, "Test").name, "Test");
    }

    #[test]
    fn test_sdp_xml_describes_rfcomm_channel() {
        let record = ServiceRecord::new(SPP_UUID, 5, "Test <1>");
        let xml = record.to_sdp_xml();

        assert!(xml.contains("<attribute id=\"0x0001\">"));
        assert!(xml.contains("<uuid value=\"0x1101\" />"));
        assert!(xml.contains("<uuid value=\"0x0100\" />"));
        assert!(xml.contains("<uuid value=\"0x0003\" />"));
        assert!(xml.contains("<uint8 value=\"0x05\" />"));
        assert!(xml.contains("<uuid value=\"0x1002\" />"));
        assert!(xml.contains("<text value=\"Test &lt;1&gt;\" />"));
        assert!(xml.contains("An RFCOMM listening socket"));
    }

    #[test]
    fn test_sdp_xml_full_uuid() {
        let uuid = parse_service_uuid("185f3df4-3268-4e3f-9fca-d4d5059915bd").unwrap();
        let xml = ServiceRecord::new(uuid, 3, "x").to_sdp_xml();
        assert!(xml.contains("<uuid value=\"185f3df4-3268-4e3f-9fca-d4d5059915bd\" />"));
    }

    #[derive(Clone, Default)]
    struct CountingAdvertiser {
        registered: Arc<AtomicUsize>,
        withdrawn: Arc<AtomicUsize>,
    }

    impl ServiceAdvertiser for CountingAdvertiser {
        type Session = ();

        async fn advertise(&self, _record: &ServiceRecord) -> Result<()> {
            self.registered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn withdraw(&self, _session: ()) {
            self.withdrawn.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_withdraw_is_idempotent() {
        let advertiser = CountingAdvertiser::default();
        let mut adv = Advertisement::new(advertiser.clone(), ServiceRecord::new(SPP_UUID, 1, ""));

        // Never registered.
        adv.withdraw().await;
        assert_eq!(advertiser.withdrawn.load(Ordering::SeqCst), 0);

        adv.activate().await.unwrap();
        adv.activate().await.unwrap();
        assert!(adv.is_active());
        assert_eq!(advertiser.registered.load(Ordering::SeqCst), 1);

        adv.withdraw().await;
        adv.withdraw().await;
        assert!(!adv.is_active());
        assert_eq!(advertiser.withdrawn.load(Ordering::SeqCst), 1);
    }
}
