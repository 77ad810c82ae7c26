//! The ACL data channel: credit accounting, connection tracking, and the Rx fragment gate.
//!
//! This module owns the proxy's view of the controller's ACL buffer pool. At host initialization
//! it intercepts the buffer-size command completes and carves out the proxy's credit reservation
//! before the host sees the totals; afterwards it watches `NumberOfCompletedPackets` to reclaim
//! credits for its own sends, rewriting each entry so the host only observes completions for
//! packets it sent itself.
//!
//! Inbound ACL data flows through [`AclDataChannel::handle_acl_data`], which recombines
//! fragmented L2CAP PDUs destined for proxy-owned channels and passes everything else through.

mod credits;
mod recombine;

pub use self::credits::SendCredit;
use self::credits::CreditLedger;
use self::recombine::Recombiner;

use parking_lot::Mutex;
use std::sync::Arc;

use crate::bytes::*;
use crate::config::MAX_ACL_CONNECTIONS;
use crate::hci::acl::{self, AclHeader, BoundaryFlag};
use crate::hci::event::{
    self, DisconnectionCompleteParams, LeReadBufferSizeV1Params, LeReadBufferSizeV2Params,
    ReadBufferSizeParams,
};
use crate::hci::{AclTransport, Direction, STATUS_SUCCESS};
use crate::l2cap::channel::ProxyChannel;
use crate::l2cap::signaling::L2capSignalingChannel;
use crate::l2cap::BasicHeader;
use crate::proxy::{HciTransport, ProxyInner};
use crate::utils::{Hex, HexSlice};
use crate::Error;

/// Per-handle record of an open ACL connection.
pub(crate) struct AclConnection {
    transport: AclTransport,
    connection_handle: u16,
    /// ACL packets the proxy has sent on this connection that the controller has not completed.
    num_pending_packets: u16,
    signaling: Arc<L2capSignalingChannel>,
    /// One recombiner per direction.
    recombiners: [Recombiner; 2],
}

impl AclConnection {
    fn recombiner_mut(&mut self, direction: Direction) -> &mut Recombiner {
        &mut self.recombiners[direction.index()]
    }
}

/// Credit state and connection table for both transports.
pub(crate) struct AclDataChannel {
    ledger: Arc<Mutex<CreditLedger>>,
    connections: Mutex<heapless::Vec<AclConnection, MAX_ACL_CONNECTIONS>>,
}

impl AclDataChannel {
    pub fn new(br_edr_credits_to_reserve: u16, le_credits_to_reserve: u16) -> Self {
        AclDataChannel {
            ledger: Arc::new(Mutex::new(CreditLedger::new(
                br_edr_credits_to_reserve,
                le_credits_to_reserve,
            ))),
            connections: Mutex::new(heapless::Vec::new()),
        }
    }

    pub fn reset_credits(&self) {
        self.ledger.lock().reset();
    }

    pub fn clear_connections(&self) {
        self.connections.lock().clear();
    }

    /// Reserves one send credit on `transport`, or `None` if none are free.
    pub fn reserve_send_credit(&self, transport: AclTransport) -> Option<SendCredit> {
        let mut ledger = self.ledger.lock();
        ledger.credits_mut(transport).mark_pending(1).ok()?;
        Some(SendCredit::new(transport, self.ledger.clone()))
    }

    pub fn get_num_free_acl_packets(&self, transport: AclTransport) -> u16 {
        self.ledger.lock().credits(transport).remaining()
    }

    pub fn has_send_acl_capability(&self, transport: AclTransport) -> bool {
        self.ledger.lock().credits(transport).has_send_capability()
    }

    /// Sends `packet` to the controller, consuming `credit` and charging the packet to its
    /// connection.
    pub fn send_acl(
        &self,
        packet: crate::h4::H4PacketWithH4,
        credit: SendCredit,
        transport: &HciTransport,
    ) -> Result<(), Error> {
        let mut connections = self.connections.lock();

        let handle = match acl::peek_handle(packet.hci_bytes()) {
            Some(handle) => handle,
            None => {
                error!("an invalid ACL packet was provided; will not send");
                return Err(Error::InvalidArgument);
            }
        };
        let connection = match connections
            .iter_mut()
            .find(|c| c.connection_handle == handle)
        {
            Some(connection) => connection,
            None => {
                error!("tried to send ACL packet on unregistered connection");
                return Err(Error::NotFound);
            }
        };
        if connection.transport != credit.transport() {
            warn!("provided credit for wrong transport; will not send");
            return Err(Error::InvalidArgument);
        }
        credit.mark_used();
        connection.num_pending_packets += 1;

        transport.send_to_controller(packet);
        Ok(())
    }

    /// Rewrites a BR/EDR Read_Buffer_Size command complete, reserving the proxy's share of the
    /// controller's ACL buffers.
    pub fn process_read_buffer_size(&self, params: &mut [u8]) {
        let view = match event::view_mut::<ReadBufferSizeParams>(params) {
            Some(view) => view,
            None => {
                error!("buffer too small for READ_BUFFER_SIZE command complete; not processing");
                return;
            }
        };
        let mut ledger = self.ledger.lock();
        let controller_max = view.total_num_acl_data_packets.get();
        let host_max = ledger.credits_mut(AclTransport::BrEdr).reserve(controller_max);
        view.total_num_acl_data_packets.set(host_max);
    }

    /// Rewrites an LE_Read_Buffer_Size [v1] command complete.
    pub fn process_le_read_buffer_size_v1(&self, proxy: &ProxyInner, params: &mut [u8]) {
        let view = match event::view_mut::<LeReadBufferSizeV1Params>(params) {
            Some(view) => view,
            None => {
                error!("buffer too small for LE_READ_BUFFER_SIZE command complete; not processing");
                return;
            }
        };
        let host_max = self.reserve_le_credits(u16::from(view.total_num_le_acl_data_packets));
        view.total_num_le_acl_data_packets = host_max as u8;
        self.record_le_acl_data_packet_length(proxy, view.le_acl_data_packet_length.get());
    }

    /// Rewrites an LE_Read_Buffer_Size [v2] command complete.
    pub fn process_le_read_buffer_size_v2(&self, proxy: &ProxyInner, params: &mut [u8]) {
        let view = match event::view_mut::<LeReadBufferSizeV2Params>(params) {
            Some(view) => view,
            None => {
                error!("buffer too small for LE_READ_BUFFER_SIZE command complete; not processing");
                return;
            }
        };
        let host_max = self.reserve_le_credits(u16::from(view.total_num_le_acl_data_packets));
        view.total_num_le_acl_data_packets = host_max as u8;
        self.record_le_acl_data_packet_length(proxy, view.le_acl_data_packet_length.get());
    }

    fn reserve_le_credits(&self, controller_max: u16) -> u16 {
        let mut ledger = self.ledger.lock();
        ledger.credits_mut(AclTransport::Le).reserve(controller_max)
    }

    fn record_le_acl_data_packet_length(&self, proxy: &ProxyInner, length: u16) {
        if length == 0 {
            error!(
                "controller shares data buffers between BR/EDR and LE, which is not supported; \
                 channels on the LE transport will not be functional"
            );
        }
        proxy.manager.set_le_acl_data_packet_length(length);
    }

    /// Reclaims credits out of a NumberOfCompletedPackets event, rewriting each entry to the
    /// count the host is still owed.
    ///
    /// Returns whether the event should still be forwarded to the host: it is suppressed only if
    /// every entry was fully consumed by the proxy.
    pub fn handle_number_of_completed_packets(
        &self,
        proxy: &ProxyInner,
        params: &mut [u8],
    ) -> bool {
        let entries = match event::completed_packets_entries(params) {
            Some(entries) => entries,
            None => {
                error!(
                    "buffer too small for NUMBER_OF_COMPLETED_PACKETS event; not processing"
                );
                return true;
            }
        };

        let mut should_send_to_host = false;
        let mut did_reclaim_credits = false;
        {
            let mut connections = self.connections.lock();
            for entry in entries {
                let num_completed_packets = entry.num_completed_packets.get();
                if num_completed_packets == 0 {
                    continue;
                }
                let handle = entry.connection_handle.get();

                let connection = connections
                    .iter_mut()
                    .find(|c| c.connection_handle == handle);
                let connection = match connection {
                    Some(connection) => connection,
                    None => {
                        // Credits for a connection we are not tracking; they belong to the host.
                        should_send_to_host = true;
                        continue;
                    }
                };

                // Reclaim the proxy's credits before the event reaches the host.
                let num_reclaimed = num_completed_packets.min(connection.num_pending_packets);
                if num_reclaimed > 0 {
                    did_reclaim_credits = true;
                    self.ledger
                        .lock()
                        .credits_mut(connection.transport)
                        .mark_completed(num_reclaimed);
                }
                connection.num_pending_packets -= num_reclaimed;

                let credits_remaining = num_completed_packets - num_reclaimed;
                entry.num_completed_packets.set(credits_remaining);
                if credits_remaining > 0 {
                    should_send_to_host = true;
                }
            }
        }

        if did_reclaim_credits {
            proxy.manager.report_new_tx_packets_or_credits();
            proxy.drain_channel_queues_if_new_tx();
        }
        should_send_to_host
    }

    /// Starts tracking a new connection reported by a `*ConnectionComplete` event.
    pub fn create_acl_connection(
        &self,
        proxy: &Arc<ProxyInner>,
        connection_handle: u16,
        transport: AclTransport,
    ) -> Result<(), Error> {
        let mut connections = self.connections.lock();
        if connections
            .iter()
            .any(|c| c.connection_handle == connection_handle)
        {
            warn!(
                "attempt to create an AclConnection when an open one exists - handle: {:?}",
                Hex(connection_handle)
            );
            return Err(Error::AlreadyExists);
        }
        if connections.is_full() {
            error!(
                "attempt to create an AclConnection when the table is full - handle: {:?}",
                Hex(connection_handle)
            );
            return Err(Error::ResourceExhausted);
        }

        let signaling = Arc::new(L2capSignalingChannel::new(
            Arc::downgrade(proxy),
            connection_handle,
            transport,
        ));
        proxy.manager.register_channel(signaling.clone());

        connections
            .push(AclConnection {
                transport,
                connection_handle,
                num_pending_packets: 0,
                signaling,
                recombiners: [Recombiner::new(), Recombiner::new()],
            })
            .ok();
        info!(
            "AclConnection created - transport: {:?}, handle: {:?}",
            transport,
            Hex(connection_handle)
        );
        Ok(())
    }

    /// Handles a DisconnectionComplete event: on success, refunds in-flight credits, closes the
    /// connection's channels, and erases the record.
    pub fn process_disconnection_complete(&self, proxy: &ProxyInner, params: &[u8]) {
        let view = match event::view::<DisconnectionCompleteParams>(params) {
            Some(view) => view,
            None => {
                error!("buffer too small for DISCONNECTION_COMPLETE event; not processing");
                return;
            }
        };
        let connection_handle = view.connection_handle.get();

        let mut connections = self.connections.lock();
        let index = connections
            .iter()
            .position(|c| c.connection_handle == connection_handle);
        let index = match index {
            Some(index) => index,
            None => {
                warn!(
                    "viewed disconnect (reason {:?}) for connection {:?} with no open \
                     AclConnection",
                    Hex(view.reason),
                    Hex(connection_handle)
                );
                return;
            }
        };

        if view.status == STATUS_SUCCESS {
            info!(
                "proxy viewed disconnect (reason {:?}) for connection {:?}",
                Hex(view.reason),
                Hex(connection_handle)
            );
            let connection = &connections[index];
            if connection.num_pending_packets > 0 {
                warn!(
                    "connection {:?} is disconnecting with packets in flight; releasing credits",
                    Hex(connection_handle)
                );
                self.ledger
                    .lock()
                    .credits_mut(connection.transport)
                    .mark_completed(connection.num_pending_packets);
            }

            proxy.manager.handle_acl_disconnection_complete(connection_handle);
            connections.swap_remove(index);
        } else if connections[index].num_pending_packets > 0 {
            warn!(
                "proxy viewed failed disconnect (status {:?}) for connection {:?} with packets \
                 in flight; not releasing credits",
                Hex(view.status),
                Hex(connection_handle)
            );
        }
    }

    /// Returns the transport and signaling channel of a tracked connection.
    pub fn connection_parts(
        &self,
        connection_handle: u16,
    ) -> Option<(AclTransport, Arc<L2capSignalingChannel>)> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.connection_handle == connection_handle)
            .map(|c| (c.transport, c.signaling.clone()))
    }

    /// Gates an inbound ACL data packet.
    ///
    /// Returns whether the packet was consumed by the proxy. Unconsumed packets are forwarded to
    /// the other side by the caller. Special care is taken with fragments: once the proxy
    /// consumes a first fragment it consumes the rest of that PDU too, so the receiving side
    /// never observes an unexpected continuation.
    pub fn handle_acl_data(&self, proxy: &ProxyInner, direction: Direction, hci: &[u8]) -> bool {
        const HANDLED: bool = true;
        const UNHANDLED: bool = false;

        let header = match AclHeader::from_bytes(&mut ByteReader::new(hci)) {
            Ok(header) => header,
            Err(_) => {
                error!("ACL packet too small for its header; passing on");
                return UNHANDLED;
            }
        };
        let acl_payload = match hci
            .get(AclHeader::SIZE..AclHeader::SIZE + usize::from(header.data_total_length))
        {
            Some(payload) => payload,
            None => {
                error!("ACL packet shorter than its data_total_length; passing on");
                return UNHANDLED;
            }
        };
        debug!(
            "ACL data {:?} on connection {:?}: {:?}",
            direction,
            Hex(header.handle),
            HexSlice(acl_payload)
        );

        let mut is_fragment = false;
        let mut recombined: Option<Box<[u8]>> = None;
        {
            let mut connections = self.connections.lock();
            let connection = match connections
                .iter_mut()
                .find(|c| c.connection_handle == header.handle)
            {
                Some(connection) => connection,
                None => return UNHANDLED,
            };
            let recombiner = connection.recombiner_mut(direction);

            match header.boundary_flag {
                BoundaryFlag::ContinuingFragment => {
                    // With no recombination active, these are fragments of a PDU the proxy chose
                    // not to claim. Pass them on.
                    if !recombiner.is_active() {
                        return UNHANDLED;
                    }
                    is_fragment = true;
                }
                BoundaryFlag::FirstNonFlushable | BoundaryFlag::FirstFlushable => {
                    if recombiner.is_active() {
                        warn!(
                            "received non-continuation packet {:?} on connection {:?} while \
                             recombination is active; dropping the partial PDU",
                            direction,
                            Hex(header.handle)
                        );
                        recombiner.end();
                    }

                    // The full L2CAP basic header is required up front: the pdu_length field
                    // sizes the recombination and the channel_id decides whether we claim the
                    // PDU at all.
                    let l2cap_header =
                        match BasicHeader::from_bytes(&mut ByteReader::new(acl_payload)) {
                            Ok(l2cap_header) => l2cap_header,
                            Err(_) => {
                                error!(
                                    "ACL packet {:?} on connection {:?} does not include a full \
                                     L2CAP header; passing on",
                                    direction,
                                    Hex(header.handle)
                                );
                                return UNHANDLED;
                            }
                        };

                    let channel = find_channel(proxy, direction, header.handle, l2cap_header.channel_id);
                    let channel = match channel {
                        Some(channel) => channel,
                        None => return UNHANDLED,
                    };

                    let l2cap_frame_length =
                        BasicHeader::SIZE + usize::from(l2cap_header.pdu_length);

                    if l2cap_frame_length < acl_payload.len() {
                        error!(
                            "ACL packet {:?} on connection {:?} has payload ({} bytes) larger \
                             than its L2CAP PDU size ({} bytes); dropping",
                            direction,
                            Hex(header.handle),
                            acl_payload.len(),
                            l2cap_frame_length
                        );
                        return HANDLED;
                    }

                    // A first fragment is recognized when the L2CAP frame length exceeds the ACL
                    // payload.
                    if l2cap_frame_length > acl_payload.len() {
                        is_fragment = true;

                        let allocator = match channel.core().rx_allocator() {
                            Some(allocator) => allocator.clone(),
                            None => {
                                error!(
                                    "cannot start recombination for channel {:?}: no Rx \
                                     allocator; passing on",
                                    Hex(channel.core().local_cid())
                                );
                                return UNHANDLED;
                            }
                        };
                        if recombiner
                            .start(channel.core().local_cid(), &allocator, l2cap_frame_length)
                            .is_err()
                        {
                            error!(
                                "cannot start recombination for channel {:?}; passing on",
                                Hex(channel.core().local_cid())
                            );
                            return UNHANDLED;
                        }
                    }
                }
                BoundaryFlag::Unknown(flag) => {
                    error!(
                        "packet {:?} on connection {:?}: unexpected ACL boundary flag {}",
                        direction,
                        Hex(header.handle),
                        flag
                    );
                    return UNHANDLED;
                }
            }

            if is_fragment {
                if recombiner.recombine_fragment(acl_payload).is_err() {
                    // Only a continuing fragment can overflow; the first fragment sized the
                    // buffer above.
                    error!(
                        "continuation packet {:?} on connection {:?} over the specified PDU \
                         length; dropping entire PDU",
                        direction,
                        Hex(header.handle)
                    );
                    recombiner.end();
                    return HANDLED;
                }
                if !recombiner.is_complete() {
                    // Awaiting the remaining fragments.
                    return HANDLED;
                }
                recombined = Some(recombiner.take_and_end());
            }
        }

        // A complete L2CAP PDU is in hand: either the payload of a single first packet, or the
        // recombination finished by the last continuing packet.
        let pdu: &[u8] = match &recombined {
            Some(buf) => buf,
            None => acl_payload,
        };
        let channel_id = match BasicHeader::from_bytes(&mut ByteReader::new(pdu)) {
            Ok(l2cap_header) => l2cap_header.channel_id,
            Err(_) => return HANDLED,
        };

        // The channel may have closed while the connection lock was released; the PDU is ours
        // either way, so a vanished channel just means dropping it.
        let channel = match find_channel(proxy, direction, header.handle, channel_id) {
            Some(channel) => channel,
            None => return HANDLED,
        };

        let result = match direction {
            Direction::FromController => channel.handle_pdu_from_controller(proxy, pdu),
            Direction::FromHost => channel.handle_pdu_from_host(proxy, pdu),
        };

        if !result && is_fragment {
            // The channel rejected a recombined PDU, but only the final continuing packet is in
            // hand; forwarding it alone would present a torn PDU. Drop the whole thing.
            error!("channel rejected a recombined PDU, which is unsupported; dropping it");
            return HANDLED;
        }

        // Rx processing may have queued Tx traffic (eg. credit indications).
        proxy.drain_channel_queues_if_new_tx();
        proxy.manager.deliver_pending_events();

        result
    }
}

fn find_channel(
    proxy: &ProxyInner,
    direction: Direction,
    connection_handle: u16,
    channel_id: u16,
) -> Option<Arc<dyn ProxyChannel>> {
    match direction {
        Direction::FromController => proxy
            .manager
            .find_channel_by_local_cid(connection_handle, channel_id),
        Direction::FromHost => proxy
            .manager
            .find_channel_by_remote_cid(connection_handle, channel_id),
    }
}
