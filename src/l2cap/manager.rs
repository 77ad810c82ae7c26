//! The channel registry and the fair Tx drain loop.
//!
//! The manager mediates between the proxy and the channels held by clients: it owns the channel
//! registry used to route Rx traffic, the H4 buffer pool backing Tx packets, and the drain loop
//! that moves queued payloads to the controller as ACL credits become available.
//!
//! Draining is round-robin over the registry. Two indices are tracked under the registry lock:
//! `lrd` ("least recently drained") advances one position per iteration, and `terminus` marks
//! where the current round stops if it completes a full cycle without dispatching anything.
//! Channels register just before `lrd`, so a fresh channel is visited last in the current round;
//! removing the channel either index points at reseats that index in the same operation.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::acl::SendCredit;
use crate::h4::{H4PacketWithH4, H4Storage};
use crate::hci::AclTransport;
use crate::l2cap::channel::{self, L2capChannelEvent, ProxyChannel};
use crate::l2cap::status::{
    DisconnectParams, L2capChannelConfigurationInfo, L2capChannelConnectionInfo, StatusTracker,
};
use crate::proxy::ProxyInner;
use crate::utils::Hex;

fn credit_index(transport: AclTransport) -> usize {
    match transport {
        AclTransport::BrEdr => 0,
        AclTransport::Le => 1,
    }
}

struct ChannelRegistry {
    list: Vec<Arc<dyn ProxyChannel>>,
    /// Index of the next channel the drain loop will visit.
    lrd: usize,
    /// Index at which the current drain round ends if nothing was dispatched.
    terminus: usize,
}

impl ChannelRegistry {
    fn advance_lrd(&mut self) {
        self.lrd = (self.lrd + 1) % self.list.len();
    }

    /// Removes the channel at `index`, reseating both round-robin indices.
    fn remove(&mut self, index: usize) {
        self.list.remove(index);
        if self.list.is_empty() {
            self.lrd = 0;
            self.terminus = 0;
            return;
        }
        for it in [&mut self.lrd, &mut self.terminus] {
            if *it > index {
                *it -= 1;
            } else if *it >= self.list.len() {
                // Removal at the index the iterator pointed to advances it implicitly; wrap if
                // that was the last element.
                *it = 0;
            }
        }
    }

    fn position(&self, channel: &Arc<dyn ProxyChannel>) -> Option<usize> {
        let target = Arc::as_ptr(channel) as *const ();
        self.list
            .iter()
            .position(|c| Arc::as_ptr(c) as *const () == target)
    }
}

struct DrainStatus {
    /// Guards against re-entering the drain loop (H4 buffer releases re-trigger draining).
    running: bool,
    /// New Tx packets or credits arrived since the last drain iteration looked.
    needed: bool,
}

/// Registry of proxy-owned channels plus Tx scheduling state.
pub(crate) struct ChannelManager {
    channels: Mutex<ChannelRegistry>,
    drain: Mutex<DrainStatus>,
    pub(crate) storage: H4Storage,
    le_acl_data_packet_length: Mutex<Option<u16>>,
    tracker: StatusTracker,
}

impl ChannelManager {
    pub fn new() -> Self {
        ChannelManager {
            channels: Mutex::new(ChannelRegistry {
                list: Vec::new(),
                lrd: 0,
                terminus: 0,
            }),
            drain: Mutex::new(DrainStatus {
                running: false,
                needed: false,
            }),
            storage: H4Storage::new(),
            le_acl_data_packet_length: Mutex::new(None),
            tracker: StatusTracker::new(),
        }
    }

    /// Starts proxying L2CAP packets addressed to `channel` and lets it queue Tx traffic.
    pub fn register_channel(&self, channel: Arc<dyn ProxyChannel>) {
        let mut reg = self.channels.lock();
        if reg.list.is_empty() {
            reg.list.push(channel);
            reg.lrd = 0;
            reg.terminus = 0;
            return;
        }
        // Insert just before `lrd` so the new channel is visited last in the current round.
        let at = reg.lrd;
        reg.list.insert(at, channel);
        if reg.terminus >= at {
            reg.terminus += 1;
        }
        reg.lrd += 1;
    }

    /// Stops proxying packets for `channel`. Safe to call for channels that are not registered.
    pub fn deregister_channel(&self, channel: &Arc<dyn ProxyChannel>) {
        let mut reg = self.channels.lock();
        if let Some(index) = reg.position(channel) {
            reg.remove(index);
        }
    }

    /// Deregisters and closes every channel, propagating `event` to their clients.
    pub fn deregister_and_close_channels(&self, event: L2capChannelEvent) {
        let channels = {
            let mut reg = self.channels.lock();
            reg.lrd = 0;
            reg.terminus = 0;
            std::mem::take(&mut reg.list)
        };
        for chan in channels {
            channel::internal_close(&*chan, event);
        }
    }

    pub fn find_channel_by_local_cid(
        &self,
        connection_handle: u16,
        local_cid: u16,
    ) -> Option<Arc<dyn ProxyChannel>> {
        self.channels
            .lock()
            .list
            .iter()
            .find(|c| {
                c.core().connection_handle() == connection_handle
                    && c.core().local_cid() == local_cid
            })
            .cloned()
    }

    pub fn find_channel_by_remote_cid(
        &self,
        connection_handle: u16,
        remote_cid: u16,
    ) -> Option<Arc<dyn ProxyChannel>> {
        self.channels
            .lock()
            .list
            .iter()
            .find(|c| {
                c.core().connection_handle() == connection_handle
                    && c.core().remote_cid() == remote_cid
            })
            .cloned()
    }

    /// Records that new Tx packets have been queued or new credits have arrived since the last
    /// drain.
    pub fn report_new_tx_packets_or_credits(&self) {
        self.drain.lock().needed = true;
    }

    /// Sends L2CAP packets queued in registered channels, interleaving channels round-robin and
    /// consuming one ACL credit per packet.
    ///
    /// Re-entrancy safe: a drain triggered while one is running (every successful send releases
    /// an H4 buffer, whose release hook re-triggers draining) just marks more work and returns.
    pub fn drain_channel_queues_if_new_tx(&self, proxy: &ProxyInner) {
        {
            let mut status = self.drain.lock();
            if status.running {
                return;
            }
            if !status.needed {
                return;
            }
            status.running = true;
            status.needed = false;
        }

        // Credits are reserved up front and survive across iterations until used, so the credit
        // lock is never taken inside the registry lock. Unused credits refund themselves when
        // this function returns.
        let mut credits: [Option<SendCredit>; 2] = [None, None];

        loop {
            for &transport in &[AclTransport::BrEdr, AclTransport::Le] {
                let slot = &mut credits[credit_index(transport)];
                if slot.is_none() {
                    *slot = proxy.acl.reserve_send_credit(transport);
                }
            }

            let mut packet: Option<H4PacketWithH4> = None;
            let mut packet_credit: Option<SendCredit> = None;
            {
                let mut reg = self.channels.lock();
                if reg.list.is_empty() {
                    let mut status = self.drain.lock();
                    status.needed = false;
                    status.running = false;
                    return;
                }

                let chan = reg.list[reg.lrd].clone();
                let slot = &mut credits[credit_index(chan.core().transport())];
                if slot.is_some() {
                    packet = chan.dequeue_packet(proxy);
                    if packet.is_some() {
                        packet_credit = slot.take();
                    }
                }

                // Always advance so the next dequeue is from the next channel.
                reg.advance_lrd();
                if packet.is_some() {
                    // There was work; the round robin continues until a full loop dispatches
                    // nothing.
                    reg.terminus = reg.lrd;
                }
            }

            if let Some(packet) = packet {
                // Send outside the registry lock with the credit claimed inside it.
                let credit = packet_credit.take().unwrap();
                if let Err(e) = proxy.acl.send_acl(packet, credit, &proxy.transport) {
                    error!("failed to send dequeued ACL packet: {:?}", e);
                }
                continue;
            }

            {
                let mut reg = self.channels.lock();
                let mut status = self.drain.lock();

                if status.needed {
                    // More packets or resources arrived; try all channels again.
                    status.needed = false;
                    reg.terminus = reg.lrd;
                    continue;
                }

                if reg.lrd != reg.terminus {
                    // Round still going.
                    continue;
                }

                status.running = false;
                return;
            }
        }
    }

    pub fn le_acl_data_packet_length(&self) -> Option<u16> {
        *self.le_acl_data_packet_length.lock()
    }

    pub fn set_le_acl_data_packet_length(&self, length: u16) {
        *self.le_acl_data_packet_length.lock() = Some(length);
    }

    /// Maximum L2CAP PDU payload the proxy can put in one ACL packet on the LE transport, or
    /// `None` if the controller's LE buffer size has not been read yet.
    ///
    /// Bounded both by the H4 buffer geometry and by the controller's LE_ACL_Data_Packet_Length
    /// (which is 0 when the controller only has shared buffers, making LE sends impossible).
    pub fn max_le_l2cap_payload_size(&self) -> Option<u16> {
        let le_acl_data_packet_length = self.le_acl_data_packet_length()?;
        let h4_based = (crate::config::H4_BUFF_SIZE
            - 1
            - crate::hci::acl::AclHeader::SIZE) as u16;
        let max_acl_data_size = h4_based.min(le_acl_data_packet_length);
        Some(max_acl_data_size.saturating_sub(crate::l2cap::BasicHeader::SIZE as u16))
    }

    // Status tracker plumbing.

    pub fn register_status_delegate(&self, delegate: Arc<dyn crate::l2cap::status::L2capStatusDelegate>) {
        self.tracker.register_delegate(delegate);
    }

    pub fn unregister_status_delegate(
        &self,
        delegate: &Arc<dyn crate::l2cap::status::L2capStatusDelegate>,
    ) {
        self.tracker.unregister_delegate(delegate);
    }

    pub fn handle_connection_complete(&self, info: L2capChannelConnectionInfo) {
        self.tracker.handle_connection_complete(info);
    }

    pub fn handle_configuration_changed(&self, info: L2capChannelConfigurationInfo) {
        self.tracker.handle_configuration_changed(info);
    }

    /// Closes every running channel on `connection_handle` and records the ACL disconnect for
    /// delegate delivery.
    pub fn handle_acl_disconnection_complete(&self, connection_handle: u16) {
        info!(
            "closing channels for disconnected ACL connection {:?}",
            Hex(connection_handle)
        );
        loop {
            let chan = {
                let mut reg = self.channels.lock();
                let index = reg.list.iter().position(|c| {
                    c.core().connection_handle() == connection_handle
                        && c.core().state() == crate::l2cap::channel::ChannelState::Running
                });
                match index {
                    Some(index) => {
                        let chan = reg.list[index].clone();
                        reg.remove(index);
                        chan
                    }
                    None => break,
                }
            };
            channel::internal_close(&*chan, L2capChannelEvent::ChannelClosedByOther);
        }

        self.tracker.handle_acl_disconnection_complete(connection_handle);
    }

    /// Closes the channel torn down by an L2CAP disconnection exchange, if the proxy owns it.
    pub fn handle_disconnection_complete(&self, params: DisconnectParams) {
        let chan = {
            let mut reg = self.channels.lock();
            let index = reg.list.iter().position(|c| {
                c.core().connection_handle() == params.connection_handle
                    && c.core().local_cid() == params.local_cid
            });
            index.map(|index| {
                let chan = reg.list[index].clone();
                reg.remove(index);
                chan
            })
        };
        if let Some(chan) = chan {
            channel::internal_close(&*chan, L2capChannelEvent::ChannelClosedByOther);
        }
        self.tracker.handle_disconnection_complete(params);
    }

    pub fn deliver_pending_events(&self) {
        self.tracker.deliver_pending_events();
    }
}
