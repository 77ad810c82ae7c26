//! The base L2CAP channel: state machine, Tx payload queue, and client callbacks.
//!
//! Concrete channels (the signaling channel and the credit-based CoC) are built from two parts:
//! a [`ChannelCore`] carrying the state every channel has, and the [`ProxyChannel`] trait, whose
//! provided methods implement the behavior shared by all channels (Rx state gating, packet
//! building from the payload queue) and whose required methods are the per-variant hooks.
//!
//! [`ChannelCore`]: struct.ChannelCore.html
//! [`ProxyChannel`]: trait.ProxyChannel.html

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::bytes::*;
use crate::config::{TX_PAYLOAD_CAPACITY, TX_QUEUE_CAPACITY};
use crate::config::H4_BUFF_SIZE;
use crate::h4::H4PacketWithH4;
use crate::hci::acl::{AclHeader, BoundaryFlag, BroadcastFlag};
use crate::hci::{AclTransport, MAX_CONNECTION_HANDLE};
use crate::l2cap::BasicHeader;
use crate::proxy::ProxyInner;
use crate::utils::Hex;
use crate::Error;

/// Lifecycle state of a proxy-owned L2CAP channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepting writes and receiving traffic.
    Running,
    /// Stopped after a protocol violation or resource failure. The L2CAP connection itself is
    /// still open; the client must close the channel.
    Stopped,
    /// Closed and deregistered. Terminal.
    Closed,
}

/// Events delivered to a channel's client through its event callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum L2capChannelEvent {
    /// The channel was closed by something other than the client: peer disconnect, ACL
    /// disconnection, or proxy shutdown.
    ChannelClosedByOther,
    /// An invalid packet was received. The channel is now `Stopped` and should be closed.
    RxInvalid,
    /// The channel's Rx buffer allocator ran out of memory. The channel is now `Stopped` and
    /// should be closed.
    RxOutOfMemory,
    /// A packet arrived while the channel was `Stopped`.
    RxWhileStopped,
    /// The proxy was reset; the channel is now `Closed`.
    Reset,
    /// Queue space is available again after a `Write` returned `Unavailable`.
    WriteAvailable,
}

/// Client callback receiving channel events.
pub type EventFn = Box<dyn FnMut(L2capChannelEvent) + Send>;

/// Client callback receiving channel payloads.
pub type ReceiveFn = Box<dyn FnMut(Box<[u8]>) + Send>;

/// Source of contiguous receive buffers for a channel.
///
/// Recombined PDUs and payloads handed to the client are copied into buffers obtained here, so
/// the client controls where Rx data lives. Returning `None` makes the proxy drop the PDU (for
/// recombination) or stop the channel with [`L2capChannelEvent::RxOutOfMemory`] (for delivery).
pub trait RxBufferAllocator: Send + Sync {
    /// Returns a buffer of exactly `size` bytes, or `None` if none is available.
    fn allocate(&self, size: usize) -> Option<Box<[u8]>>;
}

/// Returns whether an ACL connection handle and the CID pair are valid packet parameters.
pub(crate) fn are_valid_parameters(connection_handle: u16, local_cid: u16, remote_cid: u16) -> bool {
    if connection_handle > MAX_CONNECTION_HANDLE {
        error!(
            "invalid connection handle {:?}; the maximum is 0x0EFF",
            Hex(connection_handle)
        );
        return false;
    }
    if local_cid == 0 || remote_cid == 0 {
        error!("L2CAP channel identifier 0 is not valid");
        return false;
    }
    true
}

struct SendQueue {
    payloads: heapless::Deque<heapless::Vec<u8, TX_PAYLOAD_CAPACITY>, TX_QUEUE_CAPACITY>,
    /// Set when a queue attempt found no space; cleared by the next successful dequeue, which
    /// fires `WriteAvailable`.
    notify_on_dequeue: bool,
}

/// State common to every proxy-owned channel.
pub(crate) struct ChannelCore {
    proxy: Weak<ProxyInner>,
    connection_handle: u16,
    transport: AclTransport,
    local_cid: u16,
    remote_cid: u16,
    state: Mutex<ChannelState>,
    send_queue: Mutex<SendQueue>,
    event_fn: Mutex<Option<EventFn>>,
    receive_from_controller_fn: Mutex<Option<ReceiveFn>>,
    receive_from_host_fn: Mutex<Option<ReceiveFn>>,
    rx_allocator: Option<Arc<dyn RxBufferAllocator>>,
}

impl ChannelCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        proxy: Weak<ProxyInner>,
        connection_handle: u16,
        transport: AclTransport,
        local_cid: u16,
        remote_cid: u16,
        rx_allocator: Option<Arc<dyn RxBufferAllocator>>,
        receive_from_controller_fn: Option<ReceiveFn>,
        receive_from_host_fn: Option<ReceiveFn>,
        event_fn: Option<EventFn>,
    ) -> Self {
        info!(
            "channel created - transport: {:?}, handle: {:?}, local_cid: {:?}, remote_cid: {:?}",
            transport,
            Hex(connection_handle),
            Hex(local_cid),
            Hex(remote_cid)
        );
        ChannelCore {
            proxy,
            connection_handle,
            transport,
            local_cid,
            remote_cid,
            state: Mutex::new(ChannelState::Running),
            send_queue: Mutex::new(SendQueue {
                payloads: heapless::Deque::new(),
                notify_on_dequeue: false,
            }),
            event_fn: Mutex::new(event_fn),
            receive_from_controller_fn: Mutex::new(receive_from_controller_fn),
            receive_from_host_fn: Mutex::new(receive_from_host_fn),
            rx_allocator,
        }
    }

    pub fn connection_handle(&self) -> u16 {
        self.connection_handle
    }

    pub fn transport(&self) -> AclTransport {
        self.transport
    }

    pub fn local_cid(&self) -> u16 {
        self.local_cid
    }

    pub fn remote_cid(&self) -> u16 {
        self.remote_cid
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    pub fn proxy(&self) -> Option<Arc<ProxyInner>> {
        self.proxy.upgrade()
    }

    pub fn rx_allocator(&self) -> Option<&Arc<dyn RxBufferAllocator>> {
        self.rx_allocator.as_ref()
    }

    /// Copies `payload` into the Tx queue.
    ///
    /// On `Unavailable` the write-available notification is latched, so the client gets a
    /// `WriteAvailable` event once a queued payload drains.
    pub fn queue_payload(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > TX_PAYLOAD_CAPACITY {
            return Err(Error::InvalidArgument);
        }

        let mut queue = self.send_queue.lock();
        if queue.payloads.is_full() {
            queue.notify_on_dequeue = true;
            return Err(Error::Unavailable);
        }
        let mut entry = heapless::Vec::new();
        entry.extend_from_slice(payload).unwrap();
        queue.payloads.push_back(entry).ok().unwrap();
        Ok(())
    }

    /// Reports whether a `write` would currently be accepted, latching the write-available
    /// notification if not.
    pub fn is_write_available(&self) -> Result<(), Error> {
        if self.state() != ChannelState::Running {
            return Err(Error::FailedPrecondition);
        }
        let mut queue = self.send_queue.lock();
        if queue.payloads.is_full() {
            queue.notify_on_dequeue = true;
            return Err(Error::Unavailable);
        }
        queue.notify_on_dequeue = false;
        Ok(())
    }

    pub(crate) fn clear_queue(&self) {
        self.send_queue.lock().payloads.clear();
    }
}

/// A channel registered with the channel manager.
///
/// Provided methods implement the behavior every channel shares; variants override the hooks.
pub(crate) trait ProxyChannel: Send + Sync {
    fn core(&self) -> &ChannelCore;

    /// L2CAP PDU length of the packet that will carry `payload`.
    fn tx_pdu_length(&self, payload: &[u8]) -> u16 {
        payload.len() as u16
    }

    /// Writes the PDU body (everything after the basic L2CAP header) for `payload`.
    fn encode_tx_pdu(&self, payload: &[u8], writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(payload)
    }

    /// Builds and returns the channel's next Tx packet, if one is available to send.
    fn dequeue_packet(&self, proxy: &ProxyInner) -> Option<H4PacketWithH4> {
        dequeue_from_payload_queue(self, proxy)
    }

    /// Called with every complete PDU addressed to the channel's local CID. Gates on channel
    /// state; running channels dispatch to [`do_handle_pdu_from_controller`].
    ///
    /// Returns whether the PDU was consumed. Unconsumed PDUs are forwarded to the host.
    ///
    /// [`do_handle_pdu_from_controller`]: #tymethod.do_handle_pdu_from_controller
    fn handle_pdu_from_controller(&self, proxy: &ProxyInner, pdu: &[u8]) -> bool {
        match self.core().state() {
            ChannelState::Running => self.do_handle_pdu_from_controller(proxy, pdu),
            ChannelState::Stopped => {
                error!(
                    "PDU received on stopped channel - local_cid: {:?}, remote_cid: {:?}",
                    Hex(self.core().local_cid()),
                    Hex(self.core().remote_cid())
                );
                send_event(self.core(), L2capChannelEvent::RxWhileStopped);
                true
            }
            // The channel closed between lookup and dispatch; the PDU is ours, so drop it.
            ChannelState::Closed => true,
        }
    }

    /// Channel-specific Rx processing for a running channel.
    fn do_handle_pdu_from_controller(&self, proxy: &ProxyInner, pdu: &[u8]) -> bool;

    /// Called with every complete PDU addressed to the channel's remote CID.
    ///
    /// By default the payload is offered to the from-host receive callback, if the client
    /// provided one; otherwise (and for most channels, which override this to do nothing) host
    /// traffic passes through unchanged.
    fn handle_pdu_from_host(&self, proxy: &ProxyInner, pdu: &[u8]) -> bool {
        let _ = proxy;
        let mut reader = ByteReader::new(pdu);
        let header = match BasicHeader::from_bytes(&mut reader) {
            Ok(header) => header,
            Err(_) => return false,
        };
        let payload = match reader.read_slice(usize::from(header.pdu_length)) {
            Ok(payload) => payload,
            Err(_) => return false,
        };
        send_payload_from_host_to_client(self, payload)
    }

    /// Cleanup hook run when the channel closes.
    fn on_close(&self) {}

    /// Offers flow-control credits received in an `L2CAP_FLOW_CONTROL_CREDIT_IND`. Returns
    /// whether this channel consumes credit indications (only credit-based channels do).
    fn add_tx_credits(&self, credits: u16) -> bool {
        let _ = credits;
        false
    }
}

/// Builds one ACL/L2CAP packet from the next queued payload.
///
/// Returns `None` when the queue is empty, the channel is not running, or no H4 buffer is free
/// (the drain retries once a buffer is released).
pub(crate) fn dequeue_from_payload_queue<C: ProxyChannel + ?Sized>(
    chan: &C,
    proxy: &ProxyInner,
) -> Option<H4PacketWithH4> {
    let core = chan.core();
    if core.state() != ChannelState::Running {
        return None;
    }

    let (packet, should_notify) = {
        let mut queue = core.send_queue.lock();
        let payload = queue.payloads.front()?;
        let pdu_length = chan.tx_pdu_length(payload);
        let packet =
            match populate_tx_packet(core, proxy, pdu_length, |w| chan.encode_tx_pdu(payload, w)) {
                Ok(packet) => packet,
                Err(_) => return None,
            };
        let _ = queue.payloads.pop_front();
        let should_notify = queue.notify_on_dequeue;
        queue.notify_on_dequeue = false;
        (packet, should_notify)
    };

    if should_notify {
        send_event(core, L2capChannelEvent::WriteAvailable);
    }
    Some(packet)
}

/// Reserves an H4 buffer and populates the H4, ACL and basic L2CAP headers for a PDU of
/// `data_length` payload bytes addressed to the channel's remote CID, then lets `encode` fill in
/// the body.
pub(crate) fn populate_tx_packet<F>(
    core: &ChannelCore,
    proxy: &ProxyInner,
    data_length: u16,
    encode: F,
) -> Result<H4PacketWithH4, Error>
where
    F: FnOnce(&mut ByteWriter<'_>) -> Result<(), Error>,
{
    let l2cap_packet_size = BasicHeader::SIZE + usize::from(data_length);
    let h4_packet_size = 1 + AclHeader::SIZE + l2cap_packet_size;
    if h4_packet_size > H4_BUFF_SIZE {
        error!("requested packet is too large for an H4 buffer; will not send");
        return Err(Error::InvalidArgument);
    }

    let mut buf = match proxy.manager.storage.reserve() {
        Some(buf) => buf,
        None => {
            warn!("no H4 buffers available");
            return Err(Error::Unavailable);
        }
    };

    buf[0] = crate::h4::H4PacketType::AclData.into();
    let encoded = {
        let mut writer = ByteWriter::new(&mut buf[1..h4_packet_size]);
        AclHeader {
            handle: core.connection_handle(),
            boundary_flag: BoundaryFlag::FirstNonFlushable,
            broadcast_flag: BroadcastFlag::PointToPoint,
            data_total_length: l2cap_packet_size as u16,
        }
        .to_bytes(&mut writer)
        .and_then(|()| {
            BasicHeader {
                pdu_length: data_length,
                channel_id: core.remote_cid(),
            }
            .to_bytes(&mut writer)
        })
        .and_then(|()| encode(&mut writer))
    };
    if let Err(e) = encoded {
        proxy.manager.storage.release(buf);
        return Err(e);
    }

    Ok(H4PacketWithH4::with_len(
        buf,
        h4_packet_size,
        Some(proxy.release_fn.clone()),
    ))
}

/// Sends `event` to the channel's client, if an event callback was provided.
///
/// The callback is taken out of its slot for the duration of the call, so a client that closes
/// the channel from inside the callback does not deadlock; events raised during the callback are
/// dropped.
pub(crate) fn send_event(core: &ChannelCore, event: L2capChannelEvent) {
    if event != L2capChannelEvent::WriteAvailable {
        info!(
            "channel event {:?} - handle: {:?}, local_cid: {:?}, state: {:?}",
            event,
            Hex(core.connection_handle()),
            Hex(core.local_cid()),
            core.state()
        );
    }

    let callback = core.event_fn.lock().take();
    if let Some(mut callback) = callback {
        callback(event);
        let mut slot = core.event_fn.lock();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}

/// Enters `ChannelState::Stopped`: the queue is cleared, further writes are refused, and Rx
/// packets are dropped with `RxWhileStopped`.
pub(crate) fn stop(core: &ChannelCore) {
    info!(
        "channel stop - handle: {:?}, local_cid: {:?}, previous state: {:?}",
        Hex(core.connection_handle()),
        Hex(core.local_cid()),
        core.state()
    );
    core.set_state(ChannelState::Stopped);
    core.clear_queue();
}

pub(crate) fn stop_and_send_event(core: &ChannelCore, event: L2capChannelEvent) {
    stop(core);
    send_event(core, event);
}

/// Enters `ChannelState::Closed` and notifies the client with `event`. No-op on an already
/// closed channel. Does not deregister; callers that hold a registration remove it themselves.
pub(crate) fn internal_close<C: ProxyChannel + ?Sized>(chan: &C, event: L2capChannelEvent) {
    let core = chan.core();
    if core.state() == ChannelState::Closed {
        return;
    }
    info!(
        "channel close - handle: {:?}, local_cid: {:?}, remote_cid: {:?}, previous state: {:?}",
        Hex(core.connection_handle()),
        Hex(core.local_cid()),
        Hex(core.remote_cid()),
        core.state()
    );
    core.set_state(ChannelState::Closed);
    core.clear_queue();
    chan.on_close();
    send_event(core, event);
}

/// Copies `payload` into a client-provided buffer and hands it to the from-controller receive
/// callback. Returns whether the payload was consumed.
pub(crate) fn send_payload_from_controller_to_client<C: ProxyChannel + ?Sized>(
    chan: &C,
    payload: &[u8],
) -> bool {
    send_payload_to_client(chan, payload, &chan.core().receive_from_controller_fn)
}

/// Same as [`send_payload_from_controller_to_client`] for the from-host direction.
pub(crate) fn send_payload_from_host_to_client<C: ProxyChannel + ?Sized>(
    chan: &C,
    payload: &[u8],
) -> bool {
    send_payload_to_client(chan, payload, &chan.core().receive_from_host_fn)
}

fn send_payload_to_client<C: ProxyChannel + ?Sized>(
    chan: &C,
    payload: &[u8],
    callback: &Mutex<Option<ReceiveFn>>,
) -> bool {
    let core = chan.core();

    let taken = callback.lock().take();
    let mut cb = match taken {
        Some(cb) => cb,
        None => return false,
    };

    let buf = core.rx_allocator().and_then(|a| a.allocate(payload.len()));
    let mut buf = match buf {
        Some(buf) => buf,
        None => {
            error!(
                "(CID {:?}) Rx buffer allocator out of memory; stopping channel",
                Hex(core.local_cid())
            );
            *callback.lock() = Some(cb);
            stop_and_send_event(core, L2capChannelEvent::RxOutOfMemory);
            return true;
        }
    };
    buf[..payload.len()].copy_from_slice(payload);

    cb(buf);
    let mut slot = callback.lock();
    if slot.is_none() {
        *slot = Some(cb);
    }
    true
}
