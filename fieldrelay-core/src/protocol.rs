//! Service discovery messages and the peer descriptor they resolve to.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Current discovery protocol version. Datagrams with another version are ignored.
pub const PROTOCOL_VERSION: u8 = 1;

/// Well-known name the companion device advertises.
pub const DEFAULT_SERVICE_NAME: &str = "EyeOfTechnology";

/// Discovery datagrams. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Sent by the sensing device: who offers `service_name`?
    Query {
        protocol_version: u8,
        service_name: String,
    },
    /// Sent by a companion, either in reply to a query or unsolicited.
    Advertisement {
        protocol_version: u8,
        service_name: String,
        listen_port: u16,
    },
}

impl Message {
    pub fn query(service_name: &str) -> Self {
        Message::Query {
            protocol_version: PROTOCOL_VERSION,
            service_name: service_name.to_string(),
        }
    }

    pub fn advertisement(service_name: &str, listen_port: u16) -> Self {
        Message::Advertisement {
            protocol_version: PROTOCOL_VERSION,
            service_name: service_name.to_string(),
            listen_port,
        }
    }
}

/// A discovered peer offering the service at `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerDescriptor {
    pub service_name: String,
    pub host: IpAddr,
    pub port: u16,
}

impl PeerDescriptor {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Resolve an advertisement received from `from` into a peer, if it matches `service_name`.
pub fn match_advertisement(msg: &Message, from: IpAddr, service_name: &str) -> Option<PeerDescriptor> {
    match msg {
        Message::Advertisement {
            protocol_version,
            service_name: advertised,
            listen_port,
        } if *protocol_version == PROTOCOL_VERSION && advertised == service_name => {
            Some(PeerDescriptor {
                service_name: advertised.clone(),
                host: from,
                port: *listen_port,
            })
        }
        _ => None,
    }
}
