//! The ACL data packet header.
//!
//! Layout (little-endian, 4 bytes):
//!
//! ```notrust
//! LSB                                                          MSB
//! +---------------------+----------+----------+-----------------+
//! |  connection handle  |    PB    |    BC    |  data_total_length  |
//! |     (12 bits)       | (2 bits) | (2 bits) |     (16 bits)   |
//! +---------------------+----------+----------+-----------------+
//! ```
//!
//! The packet boundary flag (`PB`) distinguishes complete or first L2CAP fragments from
//! continuing fragments; the proxy's recombiner keys off it. The broadcast flag (`BC`) is always
//! point-to-point for proxy-generated traffic.

use byteorder::{ByteOrder, LittleEndian};

use crate::bytes::*;
use crate::Error;

wire_enum! {
    /// Packet boundary flag of an ACL data packet.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum BoundaryFlag(u8) {
        /// Complete L2CAP PDU, or the first fragment of one, that must not be flushed.
        FirstNonFlushable = 0b00,
        /// A continuation of a fragmented L2CAP PDU.
        ContinuingFragment = 0b01,
        /// Complete L2CAP PDU, or the first fragment of one, that the controller may flush.
        FirstFlushable = 0b10,
    }
}

wire_enum! {
    /// Broadcast flag of an ACL data packet.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum BroadcastFlag(u8) {
        PointToPoint = 0b00,
        Broadcast = 0b01,
    }
}

/// Parsed ACL data packet header.
#[derive(Debug, Copy, Clone)]
pub struct AclHeader {
    pub handle: u16,
    pub boundary_flag: BoundaryFlag,
    pub broadcast_flag: BroadcastFlag,
    pub data_total_length: u16,
}

impl AclHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 4;
}

impl<'a> FromBytes<'a> for AclHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let handle_and_flags = bytes.read_u16_le()?;
        let data_total_length = bytes.read_u16_le()?;
        Ok(AclHeader {
            handle: handle_and_flags & 0x0FFF,
            boundary_flag: BoundaryFlag::from(((handle_and_flags >> 12) & 0b11) as u8),
            broadcast_flag: BroadcastFlag::from(((handle_and_flags >> 14) & 0b11) as u8),
            data_total_length,
        })
    }
}

impl ToBytes for AclHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let pb: u8 = self.boundary_flag.into();
        let bc: u8 = self.broadcast_flag.into();
        let handle_and_flags =
            (self.handle & 0x0FFF) | (u16::from(pb) << 12) | (u16::from(bc) << 14);
        writer.write_u16_le(handle_and_flags)?;
        writer.write_u16_le(self.data_total_length)
    }
}

/// Reads the connection handle out of a raw ACL data packet without a full parse.
pub fn peek_handle(acl: &[u8]) -> Option<u16> {
    if acl.len() < AclHeader::SIZE {
        return None;
    }
    Some(LittleEndian::read_u16(acl) & 0x0FFF)
}
