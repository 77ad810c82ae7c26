//! The proxy itself: H4 packet dispatch and the client-facing API.
//!
//! A [`Proxy`] sits in the bidirectional packet path between a Bluetooth host stack and a
//! controller. The container that owns the transport calls [`handle_h4_from_host`] and
//! [`handle_h4_from_controller`] with every packet; the proxy inspects ACL data and a handful of
//! HCI events, consumes what belongs to proxy-owned channels, and forwards everything else
//! through the send callbacks supplied at construction.
//!
//! [`Proxy`]: struct.Proxy.html
//! [`handle_h4_from_host`]: struct.Proxy.html#method.handle_h4_from_host
//! [`handle_h4_from_controller`]: struct.Proxy.html#method.handle_h4_from_controller

use parking_lot::Mutex;
use std::sync::Arc;

use crate::acl::AclDataChannel;
use crate::h4::{H4PacketType, H4PacketWithH4, H4PacketWithHci, ReleaseFn};
use crate::hci::event::{
    self, CommandCompleteHeader, ConnectionCompleteParams, LeConnectionCompletePrefix,
};
use crate::hci::{AclTransport, Direction, EventCode, LeSubeventCode, OpCode, STATUS_SUCCESS};
use crate::l2cap::channel::{EventFn, L2capChannelEvent, ReceiveFn, RxBufferAllocator};
use crate::l2cap::coc::{CocChannel, CocConfig, L2capCoc};
use crate::l2cap::manager::ChannelManager;
use crate::l2cap::status::L2capStatusDelegate;
use crate::Error;

/// Callback through which the proxy forwards packets to the host.
pub type SendToHostFn = Box<dyn FnMut(H4PacketWithHci<'_>) + Send>;

/// Callback through which the proxy forwards packets to the controller.
pub type SendToControllerFn = Box<dyn FnMut(H4PacketWithH4) + Send>;

/// The pair of outward send callbacks. Used for non-ACL traffic directly; ACL traffic reaches
/// the controller through the ACL data channel's credit-charging send path.
pub(crate) struct HciTransport {
    to_host: Mutex<SendToHostFn>,
    to_controller: Mutex<SendToControllerFn>,
}

impl HciTransport {
    pub fn send_to_host(&self, packet: H4PacketWithHci<'_>) {
        (self.to_host.lock())(packet);
    }

    pub fn send_to_controller(&self, packet: H4PacketWithH4) {
        (self.to_controller.lock())(packet);
    }
}

/// State shared between the proxy, its channels, and outstanding H4 packets.
pub(crate) struct ProxyInner {
    pub(crate) transport: HciTransport,
    pub(crate) acl: AclDataChannel,
    pub(crate) manager: ChannelManager,
    /// Release hook installed on every pool-backed Tx packet; returns the buffer and re-triggers
    /// draining.
    pub(crate) release_fn: ReleaseFn,
}

impl ProxyInner {
    pub fn drain_channel_queues_if_new_tx(&self) {
        self.manager.drain_channel_queues_if_new_tx(self);
    }

    pub fn force_drain_channel_queues(&self) {
        self.manager.report_new_tx_packets_or_credits();
        self.drain_channel_queues_if_new_tx();
    }
}

/// An intercepting proxy between a Bluetooth HCI host and controller.
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    /// Creates a proxy that reserves `br_edr_acl_credits_to_reserve` and
    /// `le_acl_credits_to_reserve` controller buffer credits for its own sends once the host
    /// reads the controller's buffer sizes.
    ///
    /// `send_to_host_fn` and `send_to_controller_fn` carry all outbound traffic.
    pub fn new(
        send_to_host_fn: SendToHostFn,
        send_to_controller_fn: SendToControllerFn,
        br_edr_acl_credits_to_reserve: u16,
        le_acl_credits_to_reserve: u16,
    ) -> Proxy {
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<ProxyInner>| {
            let release_weak = weak.clone();
            ProxyInner {
                transport: HciTransport {
                    to_host: Mutex::new(send_to_host_fn),
                    to_controller: Mutex::new(send_to_controller_fn),
                },
                acl: AclDataChannel::new(
                    br_edr_acl_credits_to_reserve,
                    le_acl_credits_to_reserve,
                ),
                manager: ChannelManager::new(),
                release_fn: Arc::new(move |buf| {
                    if let Some(proxy) = release_weak.upgrade() {
                        proxy.manager.storage.release(buf);
                        proxy.force_drain_channel_queues();
                    }
                }),
            }
        });
        Proxy { inner }
    }

    /// Handles an H4 packet traveling from the host towards the controller.
    ///
    /// Consumed packets are dropped (releasing their buffer); everything else is passed on
    /// through `send_to_controller_fn`.
    pub fn handle_h4_from_host(&self, packet: H4PacketWithH4) {
        match packet.h4_type() {
            H4PacketType::AclData => {
                let handled = self.inner.acl.handle_acl_data(
                    &self.inner,
                    Direction::FromHost,
                    packet.hci_bytes(),
                );
                if !handled {
                    self.inner.transport.send_to_controller(packet);
                }
            }
            _ => self.inner.transport.send_to_controller(packet),
        }
    }

    /// Handles an H4 packet traveling from the controller towards the host.
    ///
    /// The four flow-control events are processed (and possibly rewritten or suppressed); ACL
    /// data is offered to the recombination gate. Everything else is passed on through
    /// `send_to_host_fn`.
    pub fn handle_h4_from_controller(&self, packet: H4PacketWithHci<'_>) {
        match packet.h4_type() {
            H4PacketType::Event => self.handle_event_from_controller(packet),
            H4PacketType::AclData => {
                let handled = self.inner.acl.handle_acl_data(
                    &self.inner,
                    Direction::FromController,
                    packet.hci_bytes(),
                );
                if !handled {
                    self.inner.transport.send_to_host(packet);
                }
            }
            _ => self.inner.transport.send_to_host(packet),
        }
    }

    fn handle_event_from_controller(&self, mut packet: H4PacketWithHci<'_>) {
        let inner = &self.inner;

        let forward = {
            match event::split_event(packet.hci_bytes_mut()) {
                None => true,
                Some((code, params)) => match code {
                    EventCode::CommandComplete => {
                        self.handle_command_complete_event(params);
                        true
                    }
                    EventCode::NumberOfCompletedPackets => {
                        inner.acl.handle_number_of_completed_packets(inner, params)
                    }
                    EventCode::ConnectionComplete => {
                        if let Some(view) = event::view::<ConnectionCompleteParams>(params) {
                            if view.status == STATUS_SUCCESS {
                                let _ = inner.acl.create_acl_connection(
                                    inner,
                                    view.connection_handle.get(),
                                    AclTransport::BrEdr,
                                );
                            }
                        }
                        true
                    }
                    EventCode::DisconnectionComplete => {
                        inner.acl.process_disconnection_complete(inner, params);
                        true
                    }
                    EventCode::LeMeta => {
                        self.handle_le_meta_event(params);
                        true
                    }
                    _ => true,
                },
            }
        };

        if forward {
            inner.transport.send_to_host(packet);
        }
        inner.manager.deliver_pending_events();
    }

    fn handle_command_complete_event(&self, params: &mut [u8]) {
        let opcode = match event::view::<CommandCompleteHeader>(params) {
            Some(header) => header.opcode(),
            None => return,
        };
        let return_params = &mut params[CommandCompleteHeader::SIZE..];

        match opcode {
            OpCode::ReadBufferSize => {
                self.inner.acl.process_read_buffer_size(return_params);
                self.inner.force_drain_channel_queues();
            }
            OpCode::LeReadBufferSizeV1 => {
                self.inner
                    .acl
                    .process_le_read_buffer_size_v1(&self.inner, return_params);
                // Send packets that may have queued before any LE ACL credits existed.
                self.inner.force_drain_channel_queues();
            }
            OpCode::LeReadBufferSizeV2 => {
                self.inner
                    .acl
                    .process_le_read_buffer_size_v2(&self.inner, return_params);
                self.inner.force_drain_channel_queues();
            }
            _ => {}
        }
    }

    fn handle_le_meta_event(&self, params: &mut [u8]) {
        let subevent = match params.first() {
            Some(&subevent) => LeSubeventCode::from(subevent),
            None => return,
        };
        match subevent {
            LeSubeventCode::ConnectionComplete
            | LeSubeventCode::EnhancedConnectionCompleteV1
            | LeSubeventCode::EnhancedConnectionCompleteV2 => {
                if let Some(view) = event::view::<LeConnectionCompletePrefix>(params) {
                    if view.status == STATUS_SUCCESS {
                        let _ = self.inner.acl.create_acl_connection(
                            &self.inner,
                            view.connection_handle.get(),
                            AclTransport::Le,
                        );
                    }
                }
            }
            LeSubeventCode::Unknown(_) => {}
        }
    }

    /// Resets the proxy's internal state: credits are cleared, every channel is closed with a
    /// [`Reset`] event, and the connection table is emptied.
    ///
    /// Outstanding H4 packets are not invalidated; their release hooks remain safe to run.
    ///
    /// [`Reset`]: ../l2cap/channel/enum.L2capChannelEvent.html#variant.Reset
    pub fn reset(&self) {
        // Credits first, so nothing queued in a closing channel can be sent.
        self.inner.acl.reset_credits();
        self.inner
            .manager
            .deregister_and_close_channels(L2capChannelEvent::Reset);
        self.inner.acl.clear_connections();
    }

    /// Acquires an LE credit-based connection-oriented channel on `connection_handle`, owned end
    /// to end by the local client.
    ///
    /// `rx_config` describes the local endpoint (its CID, MTU, MPS, and the credits already
    /// apportioned to the peer); `tx_config` describes the remote endpoint. `receive_fn` is
    /// called with every SDU the peer sends; `event_fn` with asynchronous channel events.
    pub fn acquire_l2cap_coc(
        &self,
        rx_allocator: Arc<dyn RxBufferAllocator>,
        connection_handle: u16,
        rx_config: CocConfig,
        tx_config: CocConfig,
        receive_fn: Option<ReceiveFn>,
        event_fn: Option<EventFn>,
    ) -> Result<L2capCoc, Error> {
        let (transport, signaling) = self
            .inner
            .acl
            .connection_parts(connection_handle)
            .ok_or(Error::NotFound)?;

        let shared = Arc::new(CocChannel::new(
            Arc::downgrade(&self.inner),
            signaling,
            connection_handle,
            transport,
            rx_config,
            tx_config,
            rx_allocator,
            receive_fn,
            event_fn,
        )?);
        self.inner.manager.register_channel(shared.clone());
        Ok(L2capCoc::from_shared(shared))
    }

    /// Registers a delegate to be notified of L2CAP channel connections on PSMs it tracks.
    pub fn register_status_delegate(&self, delegate: Arc<dyn L2capStatusDelegate>) {
        self.inner.manager.register_status_delegate(delegate);
    }

    pub fn unregister_status_delegate(&self, delegate: &Arc<dyn L2capStatusDelegate>) {
        self.inner.manager.unregister_status_delegate(delegate);
    }

    /// Whether the proxy intends to send ACL packets on `transport`. True as soon as a nonzero
    /// reservation is configured, even before credits have been reserved.
    pub fn has_send_acl_capability(&self, transport: AclTransport) -> bool {
        self.inner.acl.has_send_acl_capability(transport)
    }

    /// Number of ACL send credits currently free for the proxy on `transport`. Zero until the
    /// host has initialized the controller.
    pub fn get_num_free_acl_packets(&self, transport: AclTransport) -> u16 {
        self.inner.acl.get_num_free_acl_packets(transport)
    }

    /// Convenience accessor for [`get_num_free_acl_packets`] on the LE transport.
    ///
    /// [`get_num_free_acl_packets`]: #method.get_num_free_acl_packets
    pub fn get_num_free_le_acl_packets(&self) -> u16 {
        self.get_num_free_acl_packets(AclTransport::Le)
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h4::H4PacketType;
    use crate::hci::acl::BoundaryFlag;
    use crate::l2cap::channel::ChannelState;
    use crate::l2cap::status::L2capChannelConnectionInfo;
    use crate::l2cap::{LE_SIGNALING_CID, SIGNALING_CID};

    type Captured = Arc<Mutex<Vec<Vec<u8>>>>;

    struct HeapAllocator;

    impl RxBufferAllocator for HeapAllocator {
        fn allocate(&self, size: usize) -> Option<Box<[u8]>> {
            Some(vec![0; size].into_boxed_slice())
        }
    }

    fn new_proxy(br_edr_credits: u16, le_credits: u16) -> (Proxy, Captured, Captured) {
        let to_host: Captured = Arc::new(Mutex::new(Vec::new()));
        let to_controller: Captured = Arc::new(Mutex::new(Vec::new()));

        let host = to_host.clone();
        let controller = to_controller.clone();
        let proxy = Proxy::new(
            Box::new(move |packet: H4PacketWithHci<'_>| {
                host.lock().push(packet.hci_bytes().to_vec());
            }),
            Box::new(move |packet: H4PacketWithH4| {
                controller.lock().push(packet.h4_bytes().to_vec());
            }),
            br_edr_credits,
            le_credits,
        );
        (proxy, to_host, to_controller)
    }

    fn event_from_controller(proxy: &Proxy, event: &mut [u8]) {
        proxy.handle_h4_from_controller(H4PacketWithHci::new(H4PacketType::Event, event));
    }

    fn acl_from_controller(proxy: &Proxy, acl: &mut [u8]) {
        proxy.handle_h4_from_controller(H4PacketWithHci::new(H4PacketType::AclData, acl));
    }

    fn acl_from_host(proxy: &Proxy, acl: &[u8]) {
        let mut h4 = vec![H4PacketType::AclData.into()];
        h4.extend_from_slice(acl);
        proxy.handle_h4_from_host(H4PacketWithH4::new(h4.into_boxed_slice(), None));
    }

    // Event builders. All return the HCI packet image (event code onward, no H4 byte).

    fn le_read_buffer_size_v1_event(le_acl_data_packet_length: u16, total: u8) -> Vec<u8> {
        let mut event = vec![0x0E, 7, 0x01, 0x02, 0x20, 0x00];
        event.extend_from_slice(&le_acl_data_packet_length.to_le_bytes());
        event.push(total);
        event
    }

    fn read_buffer_size_event(total: u16) -> Vec<u8> {
        let mut event = vec![0x0E, 11, 0x01, 0x05, 0x10, 0x00];
        event.extend_from_slice(&1021u16.to_le_bytes());
        event.push(64);
        event.extend_from_slice(&total.to_le_bytes());
        event.extend_from_slice(&0u16.to_le_bytes());
        event
    }

    fn connection_complete_event(handle: u16) -> Vec<u8> {
        let mut event = vec![0x03, 11, 0x00];
        event.extend_from_slice(&handle.to_le_bytes());
        event.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]); // bd_addr
        event.extend_from_slice(&[0x01, 0x00]); // ACL link, no encryption
        event
    }

    fn le_connection_complete_event(handle: u16) -> Vec<u8> {
        let mut event = vec![0x3E, 19, 0x01, 0x00];
        event.extend_from_slice(&handle.to_le_bytes());
        event.extend_from_slice(&[0; 15]);
        event
    }

    fn disconnection_complete_event(handle: u16, status: u8) -> Vec<u8> {
        let mut event = vec![0x05, 4, status];
        event.extend_from_slice(&handle.to_le_bytes());
        event.push(0x13); // reason: remote user terminated
        event
    }

    fn nocp_event(entries: &[(u16, u16)]) -> Vec<u8> {
        let mut event = vec![0x13, 1 + 4 * entries.len() as u8, entries.len() as u8];
        for &(handle, completed) in entries {
            event.extend_from_slice(&handle.to_le_bytes());
            event.extend_from_slice(&completed.to_le_bytes());
        }
        event
    }

    // ACL and L2CAP frame builders.

    fn acl_frame(handle: u16, boundary_flag: BoundaryFlag, payload: &[u8]) -> Vec<u8> {
        let pb: u8 = boundary_flag.into();
        let handle_and_flags = handle | (u16::from(pb) << 12);
        let mut acl = Vec::new();
        acl.extend_from_slice(&handle_and_flags.to_le_bytes());
        acl.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        acl.extend_from_slice(payload);
        acl
    }

    fn first_kframe(cid: u16, sdu_length: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u16 + 2).to_le_bytes());
        frame.extend_from_slice(&cid.to_le_bytes());
        frame.extend_from_slice(&sdu_length.to_le_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn subsequent_kframe(cid: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&cid.to_le_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn cframe(signaling_cid: u16, code: u8, identifier: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(data.len() as u16 + 4).to_le_bytes());
        frame.extend_from_slice(&signaling_cid.to_le_bytes());
        frame.push(code);
        frame.push(identifier);
        frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
        frame.extend_from_slice(data);
        frame
    }

    struct CocHarness {
        chan: L2capCoc,
        events: Arc<Mutex<Vec<L2capChannelEvent>>>,
        received: Captured,
    }

    fn acquire_coc(
        proxy: &Proxy,
        handle: u16,
        rx_config: CocConfig,
        tx_config: CocConfig,
    ) -> CocHarness {
        let events: Arc<Mutex<Vec<L2capChannelEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let received: Captured = Arc::new(Mutex::new(Vec::new()));

        let events2 = events.clone();
        let received2 = received.clone();
        let chan = proxy
            .acquire_l2cap_coc(
                Arc::new(HeapAllocator),
                handle,
                rx_config,
                tx_config,
                Some(Box::new(move |payload| {
                    received2.lock().push(payload.to_vec());
                })),
                Some(Box::new(move |event| {
                    events2.lock().push(event);
                })),
            )
            .unwrap();
        CocHarness {
            chan,
            events,
            received,
        }
    }

    /// LE setup used by most CoC tests: reserve credits, grant them via the buffer-size event,
    /// then open a connection.
    fn le_proxy_with_connection(
        le_credits_to_reserve: u16,
        controller_total: u8,
        handle: u16,
    ) -> (Proxy, Captured, Captured) {
        let (proxy, to_host, to_controller) = new_proxy(0, le_credits_to_reserve);
        let mut event = le_read_buffer_size_v1_event(1021, controller_total);
        event_from_controller(&proxy, &mut event);
        let mut event = le_connection_complete_event(handle);
        event_from_controller(&proxy, &mut event);
        to_host.lock().clear();
        (proxy, to_host, to_controller)
    }

    fn coc_config(cid: u16, mtu: u16, mps: u16, credits: u16) -> CocConfig {
        CocConfig {
            cid,
            mtu,
            mps,
            credits,
        }
    }

    #[test]
    fn le_credit_reservation_rewrites_buffer_size_event() {
        let (proxy, to_host, _to_controller) = new_proxy(0, 2);

        let mut event = le_read_buffer_size_v1_event(0x001B, 10);
        let mut expected = event.clone();
        event_from_controller(&proxy, &mut event);

        // Host sees the same event with the proxy's share removed.
        *expected.last_mut().unwrap() = 8;
        assert_eq!(to_host.lock().as_slice(), &[expected]);
        assert_eq!(proxy.get_num_free_le_acl_packets(), 2);
        assert!(proxy.has_send_acl_capability(AclTransport::Le));
        assert!(!proxy.has_send_acl_capability(AclTransport::BrEdr));
    }

    #[test]
    fn br_edr_credit_reservation_rewrites_buffer_size_event() {
        let (proxy, to_host, _to_controller) = new_proxy(3, 0);

        let mut event = read_buffer_size_event(5);
        event_from_controller(&proxy, &mut event);

        let forwarded = to_host.lock();
        let total = u16::from_le_bytes([forwarded[0][9], forwarded[0][10]]);
        assert_eq!(total, 2);
        assert_eq!(proxy.get_num_free_acl_packets(AclTransport::BrEdr), 3);
    }

    #[test]
    fn reservation_capped_by_controller_total() {
        let (proxy, _to_host, _to_controller) = new_proxy(0, 10);
        let mut event = le_read_buffer_size_v1_event(1021, 4);
        event_from_controller(&proxy, &mut event);
        assert_eq!(proxy.get_num_free_le_acl_packets(), 4);
    }

    #[test]
    fn coc_write_builds_exact_packet() {
        let (proxy, _to_host, to_controller) = le_proxy_with_connection(1, 10, 0x0ACB);
        let coc = acquire_coc(
            &proxy,
            0x0ACB,
            coc_config(0x0040, 100, 100, 1),
            coc_config(0x1234, 100, 100, 1),
        );

        coc.chan.write(&[0xAB, 0xCD, 0xEF]).unwrap();

        let sent = to_controller.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            vec![
                0x02, // H4: ACL data
                0xCB, 0x0A, // handle 0x0ACB, first non-flushable, point-to-point
                0x09, 0x00, // ACL length 9
                0x05, 0x00, // L2CAP PDU length 5
                0x34, 0x12, // remote CID 0x1234
                0x03, 0x00, // SDU length 3
                0xAB, 0xCD, 0xEF,
            ]
        );
    }

    #[test]
    fn coc_write_echoed_by_controller_round_trips() {
        let (proxy, _to_host, to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let writer = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );
        // Mirror channel whose local CID is the writer's remote CID.
        let reader = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0041, 100, 100, 10),
            coc_config(0x0040, 100, 100, 1),
        );

        let payload = [0xDE, 0xAD, 0xBE, 0xEF, 0x42];
        writer.chan.write(&payload).unwrap();

        // Echo the packet the controller saw straight back in.
        let mut echoed = to_controller.lock()[0][1..].to_vec();
        acl_from_controller(&proxy, &mut echoed);

        assert_eq!(reader.received.lock().as_slice(), &[payload.to_vec()]);
        assert!(writer.received.lock().is_empty());
    }

    #[test]
    fn coc_write_rejects_oversized_payloads() {
        let (proxy, _to_host, _to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 1),
            coc_config(0x0041, 10, 23, 1),
        );

        assert_eq!(coc.chan.write(&[0; 11]), Err(Error::InvalidArgument));
        let payload = [0; 30]; // within MTU is irrelevant; MPS is the limit here
        let coc2 = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0050, 100, 100, 1),
            coc_config(0x0051, 100, 23, 1),
        );
        assert_eq!(coc2.chan.write(&payload), Err(Error::InvalidArgument));
    }

    #[test]
    fn segmented_sdu_is_dropped_without_state_change() {
        let (proxy, _to_host, _to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );

        // First K-frame declares a 32-byte SDU but carries 13 bytes.
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &first_kframe(0x0040, 32, &[0x11; 13]),
        );
        acl_from_controller(&proxy, &mut acl);

        // Second K-frame carries the remaining 19 bytes of the dropped SDU.
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &subsequent_kframe(0x0040, &[0x22; 19]),
        );
        acl_from_controller(&proxy, &mut acl);

        // A zero-length SDU then delivers normally.
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &first_kframe(0x0040, 0, &[]),
        );
        acl_from_controller(&proxy, &mut acl);

        assert_eq!(coc.received.lock().as_slice(), &[Vec::<u8>::new()]);
        assert_eq!(coc.chan.state(), ChannelState::Running);
        assert!(coc.events.lock().is_empty());
    }

    #[test]
    fn oversized_sdu_continuation_stops_channel() {
        let (proxy, _to_host, _to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );

        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &first_kframe(0x0040, 20, &[0x11; 13]),
        );
        acl_from_controller(&proxy, &mut acl);

        // 8 continuation bytes exceed the 7 still expected for the SDU.
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &subsequent_kframe(0x0040, &[0x22; 8]),
        );
        acl_from_controller(&proxy, &mut acl);

        assert_eq!(coc.chan.state(), ChannelState::Stopped);
        assert_eq!(
            coc.events.lock().as_slice(),
            &[L2capChannelEvent::RxInvalid]
        );
    }

    #[test]
    fn sdu_over_mtu_stops_channel() {
        let (proxy, _to_host, _to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 10, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );

        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &first_kframe(0x0040, 20, &[0x11; 5]),
        );
        acl_from_controller(&proxy, &mut acl);

        assert_eq!(coc.chan.state(), ChannelState::Stopped);
        assert_eq!(
            coc.events.lock().as_slice(),
            &[L2capChannelEvent::RxInvalid]
        );
        assert_eq!(coc.chan.write(&[1]), Err(Error::FailedPrecondition));

        // Subsequent traffic on the stopped channel is dropped with an event.
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &first_kframe(0x0040, 0, &[]),
        );
        acl_from_controller(&proxy, &mut acl);
        assert_eq!(
            coc.events.lock().last(),
            Some(&L2capChannelEvent::RxWhileStopped)
        );
        assert!(coc.received.lock().is_empty());
    }

    #[test]
    fn channel_closed_on_disconnect() {
        let (proxy, to_host, _to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );

        let mut event = disconnection_complete_event(0x0B, STATUS_SUCCESS);
        event_from_controller(&proxy, &mut event);

        assert_eq!(coc.chan.state(), ChannelState::Closed);
        assert_eq!(
            coc.events.lock().as_slice(),
            &[L2capChannelEvent::ChannelClosedByOther]
        );
        // The event itself still reaches the host.
        assert_eq!(to_host.lock().len(), 1);
    }

    #[test]
    fn failed_disconnect_preserves_connection() {
        let (proxy, _to_host, to_controller) = le_proxy_with_connection(2, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );
        coc.chan.write(&[1]).unwrap();
        assert_eq!(to_controller.lock().len(), 1);
        assert_eq!(proxy.get_num_free_le_acl_packets(), 1);

        let mut event = disconnection_complete_event(0x0B, 0x0C);
        event_from_controller(&proxy, &mut event);

        // Credits stay charged and the channel stays up.
        assert_eq!(proxy.get_num_free_le_acl_packets(), 1);
        assert_eq!(coc.chan.state(), ChannelState::Running);
    }

    #[test]
    fn disconnect_refunds_inflight_credits() {
        let (proxy, _to_host, to_controller) = le_proxy_with_connection(2, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );
        coc.chan.write(&[1]).unwrap();
        assert_eq!(to_controller.lock().len(), 1);
        assert_eq!(proxy.get_num_free_le_acl_packets(), 1);

        let mut event = disconnection_complete_event(0x0B, STATUS_SUCCESS);
        event_from_controller(&proxy, &mut event);

        assert_eq!(proxy.get_num_free_le_acl_packets(), 2);
    }

    #[test]
    fn credit_ind_intercepted_and_applied() {
        let (proxy, to_host, to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 0),
        );

        // No peer credits yet: the write queues but nothing is sent.
        coc.chan.write(&[0x55]).unwrap();
        assert!(to_controller.lock().is_empty());

        // Credit indication for our remote CID arrives from the peer.
        let mut data = Vec::new();
        data.extend_from_slice(&0x0041u16.to_le_bytes());
        data.extend_from_slice(&5u16.to_le_bytes());
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &cframe(LE_SIGNALING_CID, 0x16, 9, &data),
        );
        acl_from_controller(&proxy, &mut acl);

        // The indication was consumed, not forwarded, and the queued write went out.
        assert!(to_host.lock().is_empty());
        assert_eq!(to_controller.lock().len(), 1);
        assert_eq!(*to_controller.lock()[0].last().unwrap(), 0x55);
    }

    #[test]
    fn credit_ind_for_unknown_channel_passes_through() {
        let (proxy, to_host, _to_controller) = le_proxy_with_connection(1, 10, 0x0B);

        let mut data = Vec::new();
        data.extend_from_slice(&0x0077u16.to_le_bytes());
        data.extend_from_slice(&5u16.to_le_bytes());
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &cframe(LE_SIGNALING_CID, 0x16, 9, &data),
        );
        acl_from_controller(&proxy, &mut acl);

        assert_eq!(to_host.lock().len(), 1);
    }

    #[test]
    fn credit_overflow_stops_channel() {
        let (proxy, _to_host, _to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, u16::MAX),
        );

        let mut data = Vec::new();
        data.extend_from_slice(&0x0041u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &cframe(LE_SIGNALING_CID, 0x16, 9, &data),
        );
        acl_from_controller(&proxy, &mut acl);

        assert_eq!(coc.chan.state(), ChannelState::Stopped);
        assert_eq!(
            coc.events.lock().as_slice(),
            &[L2capChannelEvent::RxInvalid]
        );
    }

    #[test]
    fn round_robin_fairness_under_credit_pressure() {
        let (proxy, to_host, to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let a = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0050, 100, 100, 1),
        );
        let b = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0041, 100, 100, 10),
            coc_config(0x0051, 100, 100, 1),
        );
        let c = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0042, 100, 100, 10),
            coc_config(0x0052, 100, 100, 1),
        );

        a.chan.write(&[0xAA]).unwrap();
        b.chan.write(&[0xBB]).unwrap();
        c.chan.write(&[0xCC]).unwrap();

        // One ACL credit: exactly one channel transmits.
        assert_eq!(to_controller.lock().len(), 1);
        assert_eq!(*to_controller.lock()[0].last().unwrap(), 0xAA);

        // Completing that packet hands the credit to the next channel in round-robin order.
        let mut event = nocp_event(&[(0x0B, 1)]);
        event_from_controller(&proxy, &mut event);
        assert_eq!(to_controller.lock().len(), 2);
        assert_eq!(*to_controller.lock()[1].last().unwrap(), 0xBB);

        let mut event = nocp_event(&[(0x0B, 1)]);
        event_from_controller(&proxy, &mut event);
        assert_eq!(to_controller.lock().len(), 3);
        assert_eq!(*to_controller.lock()[2].last().unwrap(), 0xCC);

        // Every completion was consumed by the proxy, so the host never saw the NOCP events.
        assert!(to_host.lock().is_empty());
    }

    #[test]
    fn nocp_rewrite_preserves_totals() {
        let (proxy, to_host, to_controller) = le_proxy_with_connection(2, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 2),
        );
        coc.chan.write(&[1]).unwrap();
        assert_eq!(to_controller.lock().len(), 1);

        // The controller completes 2 packets on our handle (only 1 was ours) and 1 on a handle
        // the proxy does not track.
        let mut event = nocp_event(&[(0x0B, 2), (0x0C, 1)]);
        event_from_controller(&proxy, &mut event);

        let forwarded = to_host.lock();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0], nocp_event(&[(0x0B, 1), (0x0C, 1)]));
        assert_eq!(proxy.get_num_free_le_acl_packets(), 2);
    }

    #[test]
    fn queue_exhaustion_reports_unavailable_then_write_available() {
        let (proxy, _to_host, to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 0),
        );

        for i in 0..crate::config::TX_QUEUE_CAPACITY {
            coc.chan.write(&[i as u8]).unwrap();
        }
        assert_eq!(coc.chan.write(&[0xFF]), Err(Error::Unavailable));
        assert_eq!(coc.chan.is_write_available(), Err(Error::Unavailable));

        // One peer credit drains exactly one queued write and frees queue space.
        let mut data = Vec::new();
        data.extend_from_slice(&0x0041u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &cframe(LE_SIGNALING_CID, 0x16, 9, &data),
        );
        acl_from_controller(&proxy, &mut acl);

        assert_eq!(to_controller.lock().len(), 1);
        assert_eq!(
            coc.events.lock().as_slice(),
            &[L2capChannelEvent::WriteAvailable]
        );
        assert_eq!(coc.chan.is_write_available(), Ok(()));
    }

    #[test]
    fn fragmented_pdu_is_recombined() {
        let (proxy, to_host, _to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );

        let payload: Vec<u8> = (0..10).collect();
        let frame = first_kframe(0x0040, 10, &payload); // 16 bytes total

        let mut acl = acl_frame(0x0B, BoundaryFlag::FirstNonFlushable, &frame[..6]);
        acl_from_controller(&proxy, &mut acl);
        let mut acl = acl_frame(0x0B, BoundaryFlag::ContinuingFragment, &frame[6..11]);
        acl_from_controller(&proxy, &mut acl);
        assert!(coc.received.lock().is_empty());

        let mut acl = acl_frame(0x0B, BoundaryFlag::ContinuingFragment, &frame[11..]);
        acl_from_controller(&proxy, &mut acl);

        assert_eq!(coc.received.lock().as_slice(), &[payload]);
        // All fragments were consumed by the proxy.
        assert!(to_host.lock().is_empty());
    }

    #[test]
    fn continuing_fragment_overflow_drops_whole_pdu() {
        let (proxy, _to_host, _to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );

        let frame = first_kframe(0x0040, 10, &(0..10).collect::<Vec<u8>>());
        let mut acl = acl_frame(0x0B, BoundaryFlag::FirstNonFlushable, &frame[..6]);
        acl_from_controller(&proxy, &mut acl);

        // 12 continuation bytes overflow the 10 still expected.
        let mut acl = acl_frame(0x0B, BoundaryFlag::ContinuingFragment, &[0; 12]);
        acl_from_controller(&proxy, &mut acl);
        assert!(coc.received.lock().is_empty());

        // The channel is unaffected; a fresh complete PDU delivers.
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &first_kframe(0x0040, 2, &[0xA5, 0x5A]),
        );
        acl_from_controller(&proxy, &mut acl);
        assert_eq!(coc.received.lock().as_slice(), &[vec![0xA5, 0x5A]]);
        assert_eq!(coc.chan.state(), ChannelState::Running);
    }

    #[test]
    fn stray_continuing_fragment_passes_through() {
        let (proxy, to_host, _to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let _coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );

        let mut acl = acl_frame(0x0B, BoundaryFlag::ContinuingFragment, &[1, 2, 3]);
        acl_from_controller(&proxy, &mut acl);

        assert_eq!(to_host.lock().len(), 1);
    }

    #[test]
    fn acl_for_unknown_connection_passes_through() {
        let (proxy, to_host, _to_controller) = new_proxy(0, 1);
        let mut acl = acl_frame(
            0x099,
            BoundaryFlag::FirstNonFlushable,
            &first_kframe(0x0040, 1, &[7]),
        );
        acl_from_controller(&proxy, &mut acl);
        assert_eq!(to_host.lock().len(), 1);
    }

    #[test]
    fn unrelated_events_pass_through_unchanged() {
        let (proxy, to_host, _to_controller) = new_proxy(0, 1);
        let mut event = vec![0x0A, 1, 0x00]; // inquiry-ish event the proxy ignores
        let expected = event.clone();
        event_from_controller(&proxy, &mut event);
        assert_eq!(to_host.lock().as_slice(), &[expected]);
    }

    #[test]
    fn from_host_traffic_passes_through() {
        let (proxy, _to_host, to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let _coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );

        // Host traffic addressed to the CoC's remote CID is forwarded, not consumed.
        let acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &first_kframe(0x0041, 1, &[9]),
        );
        acl_from_host(&proxy, &acl);
        assert_eq!(to_controller.lock().len(), 1);
    }

    #[test]
    fn send_additional_rx_credits_emits_indication() {
        let (proxy, _to_host, to_controller) = le_proxy_with_connection(1, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );

        coc.chan.send_additional_rx_credits(3).unwrap();

        let sent = to_controller.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            vec![
                0x02, // H4: ACL data
                0x0B, 0x00, // handle 0x000B
                0x0C, 0x00, // ACL length 12
                0x08, 0x00, // L2CAP PDU length 8
                0x05, 0x00, // LE signaling channel
                0x16, // FLOW_CONTROL_CREDIT_IND
                0x01, // identifier
                0x04, 0x00, // data length 4
                0x40, 0x00, // our local CID
                0x03, 0x00, // 3 credits
            ]
        );
    }

    #[test]
    fn reset_closes_channels_and_clears_credits() {
        let (proxy, _to_host, to_controller) = le_proxy_with_connection(2, 10, 0x0B);
        let coc = acquire_coc(
            &proxy,
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
        );
        coc.chan.write(&[1]).unwrap();
        assert_eq!(to_controller.lock().len(), 1);

        proxy.reset();

        assert_eq!(coc.chan.state(), ChannelState::Closed);
        assert_eq!(coc.events.lock().as_slice(), &[L2capChannelEvent::Reset]);
        assert_eq!(proxy.get_num_free_le_acl_packets(), 0);
        assert!(proxy.has_send_acl_capability(AclTransport::Le));
        assert_eq!(coc.chan.write(&[2]), Err(Error::FailedPrecondition));
    }

    #[test]
    fn acquire_coc_requires_tracked_connection() {
        let (proxy, _to_host, _to_controller) = new_proxy(0, 1);
        let result = proxy.acquire_l2cap_coc(
            Arc::new(HeapAllocator),
            0x0B,
            coc_config(0x0040, 100, 100, 10),
            coc_config(0x0041, 100, 100, 1),
            None,
            None,
        );
        assert!(matches!(result, Err(Error::NotFound)));
    }

    struct RecordingDelegate {
        psm: u16,
        connected: Mutex<Vec<L2capChannelConnectionInfo>>,
        disconnected: Mutex<Vec<L2capChannelConnectionInfo>>,
    }

    impl L2capStatusDelegate for RecordingDelegate {
        fn should_track_psm(&self, psm: u16) -> bool {
            psm == self.psm
        }

        fn handle_connection_complete(&self, info: L2capChannelConnectionInfo) {
            self.connected.lock().push(info);
        }

        fn handle_disconnection_complete(&self, info: L2capChannelConnectionInfo) {
            self.disconnected.lock().push(info);
        }
    }

    #[test]
    fn signaling_connection_lifecycle_notifies_delegate() {
        let (proxy, _to_host, _to_controller) = new_proxy(1, 0);
        let mut event = read_buffer_size_event(5);
        event_from_controller(&proxy, &mut event);
        let mut event = connection_complete_event(0x0B);
        event_from_controller(&proxy, &mut event);

        let delegate = Arc::new(RecordingDelegate {
            psm: 0x0019,
            connected: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
        });
        proxy.register_status_delegate(delegate.clone());

        // Host opens a channel on PSM 0x0019 with source CID 0x0051.
        let mut data = Vec::new();
        data.extend_from_slice(&0x0019u16.to_le_bytes());
        data.extend_from_slice(&0x0051u16.to_le_bytes());
        let acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &cframe(SIGNALING_CID, 0x02, 5, &data),
        );
        acl_from_host(&proxy, &acl);

        // Peer answers with its CID 0x0070 and success.
        let mut data = Vec::new();
        data.extend_from_slice(&0x0070u16.to_le_bytes());
        data.extend_from_slice(&0x0051u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &cframe(SIGNALING_CID, 0x03, 5, &data),
        );
        acl_from_controller(&proxy, &mut acl);

        {
            let connected = delegate.connected.lock();
            assert_eq!(connected.len(), 1);
            assert_eq!(connected[0].psm, 0x0019);
            assert_eq!(connected[0].connection_handle, 0x0B);
            assert_eq!(connected[0].local_cid, 0x0051);
            assert_eq!(connected[0].remote_cid, 0x0070);
        }

        // Peer acknowledges the later disconnect of the same channel.
        let mut data = Vec::new();
        data.extend_from_slice(&0x0070u16.to_le_bytes());
        data.extend_from_slice(&0x0051u16.to_le_bytes());
        let mut acl = acl_frame(
            0x0B,
            BoundaryFlag::FirstNonFlushable,
            &cframe(SIGNALING_CID, 0x07, 6, &data),
        );
        acl_from_controller(&proxy, &mut acl);

        let disconnected = delegate.disconnected.lock();
        assert_eq!(disconnected.len(), 1);
        assert_eq!(disconnected[0].local_cid, 0x0051);
    }
}
