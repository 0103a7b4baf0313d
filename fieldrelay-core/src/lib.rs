//! Field relay core: the host-independent half of the relay.
//! No I/O; the daemon crate owns sockets, files and tasks.

pub mod audit;
pub mod error;
pub mod integrity;
pub mod location;
pub mod protocol;
pub mod wire;

pub use error::{DiscoveryError, LinkError, LocalIoError, RelayError, TelemetryError};
pub use location::{is_valid_altitude, is_valid_lat_lng, parse_line, LocationRecord, LocationState};
pub use protocol::{Message, PeerDescriptor, DEFAULT_SERVICE_NAME, PROTOCOL_VERSION};
pub use wire::{decode_datagram, encode_datagram, DatagramError};
