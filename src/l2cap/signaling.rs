//! The L2CAP signaling channel.
//!
//! One signaling channel exists per ACL connection, on CID `0x0001` (BR/EDR) or `0x0005` (LE).
//! The proxy listens to the signaling conversation between host and peer without owning it:
//! connection, configuration and disconnection exchanges are tracked so the status tracker can
//! tell delegates when channels on interesting PSMs come and go, and every such command passes
//! through unchanged. The single exception is `L2CAP_FLOW_CONTROL_CREDIT_IND` addressed to a
//! proxy-owned credit-based channel, which is consumed: the credits are applied locally and the
//! host never sees the indication.
//!
//! The channel can also originate credit indications on behalf of a CoC client replenishing its
//! peer's Rx credits.

use parking_lot::Mutex;
use std::sync::Weak;

use crate::bytes::*;
use crate::config::{MAX_PENDING_CONFIGURATIONS, MAX_PENDING_CONNECTIONS};
use crate::hci::{AclTransport, Direction};
use crate::l2cap::channel::{ChannelCore, ChannelState, ProxyChannel};
use crate::l2cap::signaling_cid;
use crate::l2cap::status::{DisconnectParams, L2capChannelConfigurationInfo, L2capChannelConnectionInfo};
use crate::l2cap::BasicHeader;
use crate::proxy::ProxyInner;
use crate::utils::Hex;
use crate::Error;

wire_enum! {
    /// Command codes carried on the signaling channel that the proxy inspects.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum SignalingCode(u8) {
        ConnectionReq = 0x02,
        ConnectionRsp = 0x03,
        ConfigurationReq = 0x04,
        ConfigurationRsp = 0x05,
        DisconnectionReq = 0x06,
        DisconnectionRsp = 0x07,
        FlowControlCreditInd = 0x16,
    }
}

wire_enum! {
    /// Result field of an `L2CAP_CONNECTION_RSP`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ConnectionResult(u16) {
        Successful = 0x0000,
        Pending = 0x0001,
    }
}

wire_enum! {
    /// Result field of an `L2CAP_CONFIGURATION_RSP`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ConfigurationResult(u16) {
        Success = 0x0000,
        Pending = 0x0004,
    }
}

/// Configuration option type carrying the channel MTU.
const OPTION_TYPE_MTU: u8 = 0x01;

/// Header shared by every signaling command.
#[derive(Debug, Copy, Clone)]
pub struct CommandHeader {
    pub code: SignalingCode,
    pub identifier: u8,
    pub data_length: u16,
}

impl CommandHeader {
    pub const SIZE: usize = 4;
}

impl<'a> FromBytes<'a> for CommandHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(CommandHeader {
            code: SignalingCode::from(bytes.read_u8()?),
            identifier: bytes.read_u8()?,
            data_length: bytes.read_u16_le()?,
        })
    }
}

impl ToBytes for CommandHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.code.into())?;
        writer.write_u8(self.identifier)?;
        writer.write_u16_le(self.data_length)
    }
}

/// A connection request seen but not yet answered.
struct PendingConnection {
    direction: Direction,
    source_cid: u16,
    psm: u16,
}

/// A configuration request seen but not yet answered, keyed by command identifier.
struct PendingConfiguration {
    identifier: u8,
    info: L2capChannelConfigurationInfo,
}

struct Pending {
    connections: heapless::Vec<PendingConnection, MAX_PENDING_CONNECTIONS>,
    configurations: heapless::Vec<PendingConfiguration, MAX_PENDING_CONFIGURATIONS>,
}

/// Signaling channel of a single ACL connection.
pub(crate) struct L2capSignalingChannel {
    core: ChannelCore,
    pending: Mutex<Pending>,
    // Matches responses with requests; a different value per successive command, recycled once
    // all others have been used.
    next_identifier: Mutex<u8>,
}

impl L2capSignalingChannel {
    pub fn new(proxy: Weak<ProxyInner>, connection_handle: u16, transport: AclTransport) -> Self {
        let cid = signaling_cid(transport);
        L2capSignalingChannel {
            core: ChannelCore::new(
                proxy,
                connection_handle,
                transport,
                cid,
                cid,
                None,
                None,
                None,
                None,
            ),
            pending: Mutex::new(Pending {
                connections: heapless::Vec::new(),
                configurations: heapless::Vec::new(),
            }),
            next_identifier: Mutex::new(1),
        }
    }

    /// Parses a C-frame and processes its first command.
    ///
    /// Returns whether the frame was consumed; anything malformed or uninteresting passes
    /// through for the host (or controller) to deal with.
    fn handle_cframe(&self, direction: Direction, proxy: &ProxyInner, cframe: &[u8]) -> bool {
        let mut reader = ByteReader::new(cframe);
        let header = match BasicHeader::from_bytes(&mut reader) {
            Ok(header) => header,
            Err(_) => {
                error!("buffer too small for C-frame; forwarding without processing");
                return false;
            }
        };
        let payload = match reader.read_slice(usize::from(header.pdu_length)) {
            Ok(payload) => payload,
            Err(_) => {
                error!("C-frame shorter than its PDU length; forwarding without processing");
                return false;
            }
        };

        self.handle_command(direction, proxy, payload)
    }

    /// Processes one signaling command.
    ///
    /// Returns `false` when the command is not consumed, either because it is not addressed to a
    /// channel managed by the proxy or because we do not listen for that command type.
    fn handle_command(&self, direction: Direction, proxy: &ProxyInner, payload: &[u8]) -> bool {
        let mut reader = ByteReader::new(payload);
        let header = match CommandHeader::from_bytes(&mut reader) {
            Ok(header) => header,
            Err(_) => return false,
        };
        let cmd = match reader.read_slice(usize::from(header.data_length)) {
            Ok(cmd) => cmd,
            Err(_) => return false,
        };

        match header.code {
            SignalingCode::ConnectionReq => {
                self.handle_connection_req(direction, cmd);
                false
            }
            SignalingCode::ConnectionRsp => {
                self.handle_connection_rsp(direction, proxy, cmd);
                false
            }
            SignalingCode::ConfigurationReq => {
                self.handle_configuration_req(direction, header.identifier, cmd);
                false
            }
            SignalingCode::ConfigurationRsp => {
                self.handle_configuration_rsp(direction, proxy, header.identifier, cmd);
                false
            }
            SignalingCode::DisconnectionReq => {
                // Nothing to tear down yet; the response carries the CIDs we act on.
                false
            }
            SignalingCode::DisconnectionRsp => {
                self.handle_disconnection_rsp(direction, proxy, cmd);
                false
            }
            SignalingCode::FlowControlCreditInd => self.handle_flow_control_credit_ind(proxy, cmd),
            _ => false,
        }
    }

    fn handle_connection_req(&self, direction: Direction, cmd: &[u8]) {
        let mut reader = ByteReader::new(cmd);
        let (psm, source_cid) = match (reader.read_u16_le(), reader.read_u16_le()) {
            (Ok(psm), Ok(cid)) => (psm, cid),
            _ => return,
        };

        let mut pending = self.pending.lock();
        if pending.connections.is_full() {
            error!("reached max number of tracked pending L2CAP connections");
            return;
        }
        pending
            .connections
            .push(PendingConnection {
                direction,
                source_cid,
                psm,
            })
            .ok();
    }

    fn handle_connection_rsp(&self, direction: Direction, proxy: &ProxyInner, cmd: &[u8]) {
        let mut reader = ByteReader::new(cmd);
        let (destination_cid, source_cid, result) = match (
            reader.read_u16_le(),
            reader.read_u16_le(),
            reader.read_u16_le(),
        ) {
            (Ok(dst), Ok(src), Ok(result)) => (dst, src, ConnectionResult::from(result)),
            _ => return,
        };

        // The response's source CID is the request's source CID, and the request traveled in the
        // opposite direction.
        let request_direction = direction.opposite();

        let mut pending = self.pending.lock();
        let index = pending.connections.iter().position(|p| {
            p.source_cid == source_cid && p.direction == request_direction
        });
        let index = match index {
            Some(index) => index,
            None => {
                warn!("no match found for L2CAP connection response");
                return;
            }
        };

        match result {
            ConnectionResult::Successful => {
                let (local_cid, remote_cid) = match direction {
                    Direction::FromHost => (destination_cid, source_cid),
                    Direction::FromController => (source_cid, destination_cid),
                };
                let info = L2capChannelConnectionInfo {
                    direction: request_direction,
                    psm: pending.connections[index].psm,
                    connection_handle: self.core.connection_handle(),
                    remote_cid,
                    local_cid,
                };
                pending.connections.swap_remove(index);
                drop(pending);
                proxy.manager.handle_connection_complete(info);
            }
            ConnectionResult::Pending => {}
            _ => {
                // All other codes mean the connection has failed.
                pending.connections.swap_remove(index);
            }
        }
    }

    fn handle_configuration_req(&self, direction: Direction, identifier: u8, cmd: &[u8]) {
        let mut reader = ByteReader::new(cmd);
        let destination_cid = match (reader.read_u16_le(), reader.read_u16_le()) {
            (Ok(dst), Ok(_flags)) => dst,
            _ => return,
        };

        // Walk the options TLV for an MTU option only.
        let mut mtu = None;
        let mut options = ByteReader::new(reader.read_rest());
        while !options.is_empty() {
            let (option_type, option_length) = match (options.read_u8(), options.read_u8()) {
                (Ok(t), Ok(l)) => (t, l),
                _ => return,
            };
            let value = match options.read_slice(usize::from(option_length)) {
                Ok(value) => value,
                Err(_) => return,
            };
            if option_type == OPTION_TYPE_MTU {
                if value.len() != 2 {
                    warn!(
                        "malformed MTU configuration option for destination_cid {:?}; dropping \
                         the configuration options",
                        Hex(destination_cid)
                    );
                    return;
                }
                mtu = Some(u16::from_le_bytes([value[0], value[1]]));
            }
        }

        let info = L2capChannelConfigurationInfo {
            direction,
            connection_handle: self.core.connection_handle(),
            remote_cid: match direction {
                Direction::FromHost => destination_cid,
                Direction::FromController => 0,
            },
            local_cid: match direction {
                Direction::FromController => destination_cid,
                Direction::FromHost => 0,
            },
            mtu,
        };

        let mut pending = self.pending.lock();
        if pending
            .configurations
            .push(PendingConfiguration { identifier, info })
            .is_err()
        {
            error!("reached max number of tracked pending L2CAP configurations");
        }
    }

    fn handle_configuration_rsp(
        &self,
        direction: Direction,
        proxy: &ProxyInner,
        identifier: u8,
        cmd: &[u8],
    ) {
        let mut reader = ByteReader::new(cmd);
        let (source_cid, result) = match (
            reader.read_u16_le(),
            reader.read_u16_le(),
            reader.read_u16_le(),
        ) {
            (Ok(src), Ok(_flags), Ok(result)) => (src, ConfigurationResult::from(result)),
            _ => return,
        };

        let mut pending = self.pending.lock();
        let index = match pending
            .configurations
            .iter()
            .position(|p| p.identifier == identifier)
        {
            Some(index) => index,
            None => {
                warn!("no match found for L2CAP configuration response");
                return;
            }
        };

        // The response fills in the CID of whichever endpoint answered.
        match direction {
            Direction::FromHost => pending.configurations[index].info.remote_cid = source_cid,
            Direction::FromController => pending.configurations[index].info.local_cid = source_cid,
        }

        match result {
            ConfigurationResult::Success => {
                let info = pending.configurations[index].info;
                pending.configurations.swap_remove(index);
                drop(pending);
                proxy.manager.handle_configuration_changed(info);
            }
            ConfigurationResult::Pending => {}
            _ => {
                pending.configurations.swap_remove(index);
            }
        }
    }

    fn handle_disconnection_rsp(&self, direction: Direction, proxy: &ProxyInner, cmd: &[u8]) {
        let mut reader = ByteReader::new(cmd);
        let (destination_cid, source_cid) = match (reader.read_u16_le(), reader.read_u16_le()) {
            (Ok(dst), Ok(src)) => (dst, src),
            _ => return,
        };

        let (local_cid, remote_cid) = match direction {
            Direction::FromHost => (destination_cid, source_cid),
            Direction::FromController => (source_cid, destination_cid),
        };

        proxy.manager.handle_disconnection_complete(DisconnectParams {
            connection_handle: self.core.connection_handle(),
            remote_cid,
            local_cid,
        });
    }

    /// Applies an `L2CAP_FLOW_CONTROL_CREDIT_IND` to a proxy-owned channel.
    ///
    /// Returns whether the indication was consumed. Indications for channels the proxy does not
    /// own are forwarded like any other command.
    fn handle_flow_control_credit_ind(&self, proxy: &ProxyInner, cmd: &[u8]) -> bool {
        let mut reader = ByteReader::new(cmd);
        let (cid, credits) = match (reader.read_u16_le(), reader.read_u16_le()) {
            (Ok(cid), Ok(credits)) => (cid, credits),
            _ => {
                error!("buffer too small for L2CAP_FLOW_CONTROL_CREDIT_IND; forwarding");
                return false;
            }
        };

        let channel = proxy
            .manager
            .find_channel_by_remote_cid(self.core.connection_handle(), cid);
        match channel {
            Some(channel) => channel.add_tx_credits(credits),
            None => false,
        }
    }

    /// Sends an `L2CAP_FLOW_CONTROL_CREDIT_IND` telling the peer that local endpoint `cid` can
    /// receive `credits` additional K-frames.
    pub fn send_flow_control_credit_ind(
        &self,
        proxy: &ProxyInner,
        cid: u16,
        credits: u16,
    ) -> Result<(), Error> {
        if cid == 0 {
            error!("tried to send signaling packet on invalid CID 0x0");
            return Err(Error::InvalidArgument);
        }
        if self.core.state() != ChannelState::Running {
            return Err(Error::FailedPrecondition);
        }

        let mut command = [0; CommandHeader::SIZE + 4];
        {
            let mut writer = ByteWriter::new(&mut command);
            CommandHeader {
                code: SignalingCode::FlowControlCreditInd,
                identifier: self.next_identifier(),
                data_length: 4,
            }
            .to_bytes(&mut writer)?;
            writer.write_u16_le(cid)?;
            writer.write_u16_le(credits)?;
        }

        self.core.queue_payload(&command)?;
        proxy.manager.report_new_tx_packets_or_credits();
        proxy.drain_channel_queues_if_new_tx();
        Ok(())
    }

    fn next_identifier(&self) -> u8 {
        let mut next = self.next_identifier.lock();
        if *next == u8::MAX {
            *next = 1;
            return u8::MAX;
        }
        let id = *next;
        *next += 1;
        id
    }
}

impl ProxyChannel for L2capSignalingChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn do_handle_pdu_from_controller(&self, proxy: &ProxyInner, pdu: &[u8]) -> bool {
        self.handle_cframe(Direction::FromController, proxy, pdu)
    }

    fn handle_pdu_from_host(&self, proxy: &ProxyInner, pdu: &[u8]) -> bool {
        self.handle_cframe(Direction::FromHost, proxy, pdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_header_round_trip() {
        let header = CommandHeader {
            code: SignalingCode::FlowControlCreditInd,
            identifier: 7,
            data_length: 4,
        };
        let mut buf = [0; 4];
        header.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        assert_eq!(buf, [0x16, 7, 4, 0]);

        let parsed = CommandHeader::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed.code, SignalingCode::FlowControlCreditInd);
        assert_eq!(parsed.identifier, 7);
        assert_eq!(parsed.data_length, 4);
    }

    #[test]
    fn unknown_signaling_code_is_preserved() {
        assert_eq!(SignalingCode::from(0x01), SignalingCode::Unknown(0x01));
        let raw: u8 = SignalingCode::Unknown(0x01).into();
        assert_eq!(raw, 0x01);
    }
}
