//! Typed views over the HCI events the proxy intercepts.
//!
//! Events arrive in caller-owned buffers and two of them (`ReadBufferSize`-family command
//! completes and `NumberOfCompletedPackets`) must be rewritten in place before the proxy forwards
//! them to the host. Each event is therefore described as a `zerocopy` struct of unaligned
//! little-endian fields, and views into the original buffer are obtained with
//! [`zerocopy::LayoutVerified`] so field writes land directly in the packet image.
//!
//! Every event packet is `[event_code, parameter_total_length, parameters...]`; the structures
//! here describe the parameters only.

use byteorder::LittleEndian;
use zerocopy::byteorder::U16;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use super::{EventCode, OpCode};

/// 16-bit little-endian field of an event structure.
pub type U16Le = U16<LittleEndian>;

/// Size of the `[event_code, parameter_total_length]` event packet header.
pub const EVENT_HEADER_SIZE: usize = 2;

/// Splits an HCI event packet into its code and parameter bytes.
pub fn split_event(hci: &mut [u8]) -> Option<(EventCode, &mut [u8])> {
    if hci.len() < EVENT_HEADER_SIZE {
        return None;
    }
    let code = EventCode::from(hci[0]);
    Some((code, &mut hci[EVENT_HEADER_SIZE..]))
}

/// Leading parameters shared by every Command Complete event.
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct CommandCompleteHeader {
    pub num_hci_command_packets: u8,
    pub opcode: U16Le,
}

impl CommandCompleteHeader {
    pub const SIZE: usize = 3;

    pub fn opcode(&self) -> OpCode {
        OpCode::from(self.opcode.get())
    }
}

/// Return parameters of the Read_Buffer_Size command (BR/EDR).
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct ReadBufferSizeParams {
    pub status: u8,
    pub acl_data_packet_length: U16Le,
    pub synchronous_data_packet_length: u8,
    pub total_num_acl_data_packets: U16Le,
    pub total_num_synchronous_data_packets: U16Le,
}

/// Return parameters of the LE_Read_Buffer_Size [v1] command.
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct LeReadBufferSizeV1Params {
    pub status: u8,
    pub le_acl_data_packet_length: U16Le,
    pub total_num_le_acl_data_packets: u8,
}

/// Return parameters of the LE_Read_Buffer_Size [v2] command.
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct LeReadBufferSizeV2Params {
    pub status: u8,
    pub le_acl_data_packet_length: U16Le,
    pub total_num_le_acl_data_packets: u8,
    pub iso_data_packet_length: U16Le,
    pub total_num_iso_data_packets: u8,
}

/// One `(handle, count)` entry of a Number_Of_Completed_Packets event.
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct CompletedPacketsEntry {
    pub connection_handle: U16Le,
    pub num_completed_packets: U16Le,
}

/// Parameters of the (classic) Connection Complete event.
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct ConnectionCompleteParams {
    pub status: u8,
    pub connection_handle: U16Le,
    pub bd_addr: [u8; 6],
    pub link_type: u8,
    pub encryption_enabled: u8,
}

/// Parameters of the Disconnection Complete event.
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DisconnectionCompleteParams {
    pub status: u8,
    pub connection_handle: U16Le,
    pub reason: u8,
}

/// Common prefix of the LE Connection Complete and LE Enhanced Connection Complete (v1/v2)
/// subevents. The proxy only consumes the status and handle; the remaining parameters differ
/// between versions and pass through unread.
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct LeConnectionCompletePrefix {
    pub subevent_code: u8,
    pub status: u8,
    pub connection_handle: U16Le,
}

/// Returns a typed read-only view over the leading bytes of `params`.
pub fn view<T: FromBytes + Unaligned>(params: &[u8]) -> Option<&T> {
    let (view, _rest): (LayoutVerified<&[u8], T>, _) =
        LayoutVerified::new_unaligned_from_prefix(params)?;
    Some(view.into_ref())
}

/// Returns a typed view over the leading bytes of `params` whose field writes mutate the packet
/// in place.
pub fn view_mut<T: FromBytes + AsBytes + Unaligned>(params: &mut [u8]) -> Option<&mut T> {
    let (view, _rest): (LayoutVerified<&mut [u8], T>, _) =
        LayoutVerified::new_unaligned_from_prefix(params)?;
    Some(view.into_mut())
}

/// Returns the mutable entry list of a Number_Of_Completed_Packets event, or `None` if the
/// buffer is shorter than its `num_handles` field claims.
pub fn completed_packets_entries(params: &mut [u8]) -> Option<&mut [CompletedPacketsEntry]> {
    let (num_handles, rest) = params.split_first_mut()?;
    let num_handles = usize::from(*num_handles);
    let (entries, _rest): (LayoutVerified<&mut [u8], [CompletedPacketsEntry]>, _) =
        LayoutVerified::new_slice_unaligned_from_prefix(rest, num_handles)?;
    Some(entries.into_mut_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_le_v1_credits_in_place() {
        // status, le_acl_data_packet_length = 0x001B, total = 10
        let mut params = [0x00, 0x1B, 0x00, 10];
        let view = view_mut::<LeReadBufferSizeV1Params>(&mut params).unwrap();
        assert_eq!(view.le_acl_data_packet_length.get(), 0x001B);
        assert_eq!(view.total_num_le_acl_data_packets, 10);
        view.total_num_le_acl_data_packets = 8;
        assert_eq!(params[3], 8);
    }

    #[test]
    fn nocp_entries_view() {
        let mut params = [
            2, // num_handles
            0x0B, 0x00, 0x02, 0x00, // handle 0x000B, 2 packets
            0xCB, 0x0A, 0x01, 0x00, // handle 0x0ACB, 1 packet
        ];
        let entries = completed_packets_entries(&mut params).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].connection_handle.get(), 0x000B);
        assert_eq!(entries[1].num_completed_packets.get(), 1);
        entries[0].num_completed_packets.set(0);
        assert_eq!(params[3], 0);
    }

    #[test]
    fn nocp_truncated_entries_rejected() {
        let mut params = [2, 0x0B, 0x00, 0x02, 0x00]; // claims 2 entries, carries 1
        assert!(completed_packets_entries(&mut params).is_none());
    }
}
