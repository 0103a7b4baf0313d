//! Discovery datagram codec: one bincode-encoded [`Message`] per UDP datagram.
//! The datagram boundary is the message boundary, so there is no length prefix.

use bincode::Options;

use crate::protocol::Message;

/// Largest discovery datagram: an Ethernet MTU minus IPv4 and UDP headers, so queries never fragment.
pub const MAX_DATAGRAM_LEN: usize = 1500 - 20 - 8;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_DATAGRAM_LEN as u64)
        .reject_trailing_bytes()
}

pub fn encode_datagram(msg: &Message) -> Result<Vec<u8>, DatagramError> {
    options().serialize(msg).map_err(DatagramError::from_bincode)
}

/// Decode a whole datagram. Truncated input, trailing garbage and oversized
/// length fields inside the payload are all rejected.
pub fn decode_datagram(bytes: &[u8]) -> Result<Message, DatagramError> {
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(DatagramError::TooLarge(bytes.len()));
    }
    options().deserialize(bytes).map_err(DatagramError::from_bincode)
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("datagram exceeds {MAX_DATAGRAM_LEN} bytes ({0})")]
    TooLarge(usize),
    #[error("malformed datagram: {0}")]
    Malformed(bincode::Error),
}

impl DatagramError {
    fn from_bincode(e: bincode::Error) -> Self {
        if matches!(*e, bincode::ErrorKind::SizeLimit) {
            DatagramError::TooLarge(MAX_DATAGRAM_LEN + 1)
        } else {
            DatagramError::Malformed(e)
        }
    }
}
