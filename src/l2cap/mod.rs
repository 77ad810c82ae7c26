//! The Logical Link Control and Adaptation Protocol (L2CAP) layer of the proxy.
//!
//! The proxy does not implement L2CAP as a host stack would. It owns a small set of channels end
//! to end (the per-connection signaling channels and any connection-oriented channels acquired
//! by local clients) and forwards traffic for every other channel untouched. A channel is
//! identified by the `(connection handle, CID)` pair, where the CID is directional: the *local*
//! CID addresses us in from-controller traffic, the *remote* CID addresses the peer in from-host
//! traffic.
//!
//! A number of channel identifiers are reserved for predefined functions; the proxy cares about
//! two of them:
//!
//! * `0x0001`: L2CAP signaling channel (BR/EDR).
//! * `0x0005`: LE L2CAP signaling channel.
//!
//! Everything else the proxy owns is dynamically allocated (`0x0040` and up) and handed to it by
//! the client that acquired the channel.

pub mod channel;
pub mod coc;
pub mod manager;
pub mod signaling;
pub mod status;

use crate::bytes::*;
use crate::hci::AclTransport;
use crate::Error;

/// BR/EDR L2CAP signaling channel identifier.
pub const SIGNALING_CID: u16 = 0x0001;

/// LE L2CAP signaling channel identifier.
pub const LE_SIGNALING_CID: u16 = 0x0005;

/// Returns the fixed signaling CID used on `transport`.
pub fn signaling_cid(transport: AclTransport) -> u16 {
    match transport {
        AclTransport::BrEdr => SIGNALING_CID,
        AclTransport::Le => LE_SIGNALING_CID,
    }
}

/// Basic header preceding every L2CAP PDU.
#[derive(Debug, Copy, Clone)]
pub struct BasicHeader {
    /// Number of payload bytes following this header.
    pub pdu_length: u16,
    /// Destination endpoint of the PDU.
    pub channel_id: u16,
}

impl BasicHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 4;
}

impl<'a> FromBytes<'a> for BasicHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let pdu_length = bytes.read_u16_le()?;
        let channel_id = bytes.read_u16_le()?;
        Ok(BasicHeader {
            pdu_length,
            channel_id,
        })
    }
}

impl ToBytes for BasicHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.pdu_length)?;
        writer.write_u16_le(self.channel_id)
    }
}
