//! LE credit-based connection-oriented channels (CoC).
//!
//! A CoC carries SDUs in K-frames: the first K-frame of an SDU starts with a 16-bit SDU length,
//! subsequent K-frames carry continuation bytes. Transmission is gated by credits granted by the
//! peer (one per K-frame); the proxy consumes `L2CAP_FLOW_CONTROL_CREDIT_IND` packets addressed
//! to channels it owns, so the host never observes credit traffic for proxied channels.
//!
//! Outgoing SDUs are currently limited to a single K-frame (payloads must fit in the peer's MTU
//! *and* MPS). Incoming segmented SDUs are not reassembled: the whole SDU is dropped by tracking
//! how many continuation bytes remain to ignore.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::bytes::*;
use crate::l2cap::channel::{
    self, are_valid_parameters, ChannelCore, ChannelState, EventFn, L2capChannelEvent,
    ProxyChannel, ReceiveFn, RxBufferAllocator,
};
use crate::l2cap::signaling::L2capSignalingChannel;
use crate::l2cap::BasicHeader;
use crate::proxy::ProxyInner;
use crate::utils::Hex;
use crate::Error;

/// Smallest MPS an L2CAP implementation must support on a CoC.
pub const MIN_MPS: u16 = 23;

/// Largest MPS a CoC may use.
pub const MAX_MPS: u16 = 65533;

/// A credit count beyond this total forces a disconnect of the channel.
const MAX_CREDIT_VALUE: u16 = u16::MAX;

/// Size of the SDU-length field at the start of a first K-frame.
const SDU_LENGTH_SIZE: u16 = 2;

/// Parameters for one direction of packet flow on a CoC.
///
/// For Rx, the fields are specified by the local client; for Tx, by the remote peer (typically
/// out of an `L2CAP_LE_CREDIT_BASED_CONNECTION_RSP` the host exchanged).
#[derive(Debug, Copy, Clone)]
pub struct CocConfig {
    /// Channel endpoint: local CID for Rx, remote CID for Tx.
    pub cid: u16,
    /// Maximum SDU size.
    pub mtu: u16,
    /// Maximum K-frame payload size.
    pub mps: u16,
    /// Initial credit count: apportioned to the peer for Rx, granted by the peer for Tx.
    pub credits: u16,
}

struct CocTx {
    credits: u16,
}

struct CocRx {
    /// Nonzero while dropping the continuation K-frames of a segmented SDU.
    remaining_sdu_bytes_to_ignore: u16,
    /// Credits currently apportioned to the peer.
    remaining_credits: u16,
}

/// Channel state shared between the client-facing handle and the manager registry.
pub(crate) struct CocChannel {
    core: ChannelCore,
    signaling: Mutex<Option<Arc<L2capSignalingChannel>>>,
    rx_mtu: u16,
    rx_mps: u16,
    tx_mtu: u16,
    tx_mps: u16,
    tx: Mutex<CocTx>,
    rx: Mutex<CocRx>,
}

impl CocChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        proxy: Weak<ProxyInner>,
        signaling: Arc<L2capSignalingChannel>,
        connection_handle: u16,
        transport: crate::hci::AclTransport,
        rx_config: CocConfig,
        tx_config: CocConfig,
        rx_allocator: Arc<dyn RxBufferAllocator>,
        receive_fn: Option<ReceiveFn>,
        event_fn: Option<EventFn>,
    ) -> Result<CocChannel, Error> {
        if !are_valid_parameters(connection_handle, rx_config.cid, tx_config.cid) {
            return Err(Error::InvalidArgument);
        }
        if tx_config.mps < MIN_MPS || tx_config.mps > MAX_MPS {
            error!(
                "Tx MPS {} invalid; implementations shall support MPS of 23..=65533 octets",
                tx_config.mps
            );
            return Err(Error::InvalidArgument);
        }

        Ok(CocChannel {
            core: ChannelCore::new(
                proxy,
                connection_handle,
                transport,
                rx_config.cid,
                tx_config.cid,
                Some(rx_allocator),
                receive_fn,
                None,
                event_fn,
            ),
            signaling: Mutex::new(Some(signaling)),
            rx_mtu: rx_config.mtu,
            rx_mps: rx_config.mps,
            tx_mtu: tx_config.mtu,
            tx_mps: tx_config.mps,
            tx: Mutex::new(CocTx {
                credits: tx_config.credits,
            }),
            rx: Mutex::new(CocRx {
                remaining_sdu_bytes_to_ignore: 0,
                remaining_credits: rx_config.credits,
            }),
        })
    }

    fn consume_rx_credit(&self, rx: &mut CocRx) {
        if rx.remaining_credits == 0 {
            warn!(
                "(CID {:?}) peer sent a K-frame with no Rx credits apportioned",
                Hex(self.core.local_cid())
            );
        } else {
            rx.remaining_credits -= 1;
        }
    }
}

impl ProxyChannel for CocChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn tx_pdu_length(&self, payload: &[u8]) -> u16 {
        payload.len() as u16 + SDU_LENGTH_SIZE
    }

    fn encode_tx_pdu(&self, payload: &[u8], writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(payload.len() as u16)?;
        writer.write_slice(payload)
    }

    fn dequeue_packet(&self, proxy: &ProxyInner) -> Option<crate::h4::H4PacketWithH4> {
        if self.core.state() != ChannelState::Running {
            return None;
        }

        let mut tx = self.tx.lock();
        if tx.credits == 0 {
            return None;
        }

        let packet = channel::dequeue_from_payload_queue(self, proxy)?;
        tx.credits -= 1;
        Some(packet)
    }

    fn do_handle_pdu_from_controller(&self, _proxy: &ProxyInner, pdu: &[u8]) -> bool {
        let mut reader = ByteReader::new(pdu);
        let header = match BasicHeader::from_bytes(&mut reader) {
            Ok(header) => header,
            Err(_) => {
                error!(
                    "(CID {:?}) buffer too small for L2CAP K-frame; stopping channel",
                    Hex(self.core.local_cid())
                );
                channel::stop_and_send_event(&self.core, L2capChannelEvent::RxInvalid);
                return true;
            }
        };
        let kframe_payload = match reader.read_slice(usize::from(header.pdu_length)) {
            Ok(payload) => payload,
            Err(_) => {
                error!(
                    "(CID {:?}) K-frame shorter than its PDU length; stopping channel",
                    Hex(self.core.local_cid())
                );
                channel::stop_and_send_event(&self.core, L2capChannelEvent::RxInvalid);
                return true;
            }
        };

        let mut rx = self.rx.lock();
        self.consume_rx_credit(&mut rx);

        // While `remaining_sdu_bytes_to_ignore` is nonzero we are dropping the continuation
        // K-frames of a segmented SDU.
        if rx.remaining_sdu_bytes_to_ignore > 0 {
            let payload_size = header.pdu_length;
            info!(
                "(CID {:?}) dropping PDU that is part of current segmented SDU",
                Hex(self.core.local_cid())
            );
            if payload_size > rx.remaining_sdu_bytes_to_ignore {
                // Payload sizes summing past the declared SDU length require a disconnect.
                error!(
                    "(CID {:?}) sum of K-frame payload sizes exceeds the SDU length; stopping \
                     channel",
                    Hex(self.core.local_cid())
                );
                drop(rx);
                channel::stop_and_send_event(&self.core, L2capChannelEvent::RxInvalid);
            } else {
                rx.remaining_sdu_bytes_to_ignore -= payload_size;
            }
            return true;
        }

        // First K-frame of an SDU.
        let mut kframe = ByteReader::new(kframe_payload);
        let sdu_length = match kframe.read_u16_le() {
            Ok(len) => len,
            Err(_) => {
                error!(
                    "(CID {:?}) buffer too small for first K-frame; stopping channel",
                    Hex(self.core.local_cid())
                );
                drop(rx);
                channel::stop_and_send_event(&self.core, L2capChannelEvent::RxInvalid);
                return true;
            }
        };
        let payload = kframe.read_rest();
        let payload_size = payload.len() as u16;

        // An SDU length over the receiver's MTU requires a disconnect.
        if sdu_length > self.rx_mtu {
            error!(
                "(CID {:?}) Rx K-frame SDU exceeds MTU; stopping channel",
                Hex(self.core.local_cid())
            );
            drop(rx);
            channel::stop_and_send_event(&self.core, L2capChannelEvent::RxInvalid);
            return true;
        }

        // SDU de-segmentation is not supported: ignore this PDU and all remaining PDUs of the
        // SDU, tracked by the number of continuation bytes still expected.
        if sdu_length > payload_size {
            error!(
                "(CID {:?}) encountered segmented L2CAP SDU; dropping all PDUs in SDU",
                Hex(self.core.local_cid())
            );
            rx.remaining_sdu_bytes_to_ignore = sdu_length - payload_size;
            return true;
        }

        // A K-frame payload over the receiver's MPS requires a disconnect.
        if payload_size > self.rx_mps {
            error!(
                "(CID {:?}) Rx K-frame payload exceeds MPS; stopping channel",
                Hex(self.core.local_cid())
            );
            drop(rx);
            channel::stop_and_send_event(&self.core, L2capChannelEvent::RxInvalid);
            return true;
        }

        drop(rx);
        channel::send_payload_from_controller_to_client(self, payload);
        true
    }

    fn handle_pdu_from_host(&self, _proxy: &ProxyInner, _pdu: &[u8]) -> bool {
        // Data from host to controller always passes through.
        false
    }

    fn on_close(&self) {
        *self.signaling.lock() = None;
    }

    fn add_tx_credits(&self, credits: u16) -> bool {
        if self.core.state() != ChannelState::Running {
            error!(
                "(CID {:?}) received credits on stopped CoC; ignoring",
                Hex(self.core.local_cid())
            );
            return true;
        }

        let credits_previously_zero;
        {
            let mut tx = self.tx.lock();

            // A total credit count over 65535 requires a disconnect of the channel.
            if credits > MAX_CREDIT_VALUE - tx.credits {
                drop(tx);
                channel::stop_and_send_event(&self.core, L2capChannelEvent::RxInvalid);
                return true;
            }

            credits_previously_zero = tx.credits == 0;
            tx.credits += credits;
        }

        if credits_previously_zero {
            if let Some(proxy) = self.core.proxy() {
                proxy.manager.report_new_tx_packets_or_credits();
            }
        }
        true
    }
}

/// Client handle to an LE credit-based connection-oriented channel.
///
/// Acquired from [`Proxy::acquire_l2cap_coc`]. Dropping the handle closes the channel.
///
/// [`Proxy::acquire_l2cap_coc`]: ../../proxy/struct.Proxy.html#method.acquire_l2cap_coc
pub struct L2capCoc {
    shared: Arc<CocChannel>,
}

impl L2capCoc {
    pub(crate) fn from_shared(shared: Arc<CocChannel>) -> Self {
        L2capCoc { shared }
    }

    /// Sends `payload` as a single SDU to the remote peer.
    ///
    /// The payload is queued and transmitted once an ACL credit, a peer credit and an H4 buffer
    /// line up. `Unavailable` means the queue is full; a [`WriteAvailable`] event fires when
    /// space returns.
    ///
    /// [`WriteAvailable`]: ../channel/enum.L2capChannelEvent.html#variant.WriteAvailable
    pub fn write(&self, payload: &[u8]) -> Result<(), Error> {
        let core = self.shared.core();
        if core.state() != ChannelState::Running {
            return Err(Error::FailedPrecondition);
        }
        if payload.len() > usize::from(self.shared.tx_mtu) {
            error!(
                "payload ({} bytes) exceeds MTU ({} bytes); will not process",
                payload.len(),
                self.shared.tx_mtu
            );
            return Err(Error::InvalidArgument);
        }
        // Segmentation into multiple K-frames is not supported, so the payload must also fit
        // within the peer's MPS.
        if payload.len() > usize::from(self.shared.tx_mps) {
            error!(
                "payload ({} bytes) exceeds MPS ({} bytes); will not process",
                payload.len(),
                self.shared.tx_mps
            );
            return Err(Error::InvalidArgument);
        }
        // The K-frame (payload plus SDU length field) must fit in one H4 buffer.
        if payload.len() + usize::from(SDU_LENGTH_SIZE) > crate::config::TX_PAYLOAD_CAPACITY {
            error!(
                "payload ({} bytes) does not fit in an H4 buffer; will not process",
                payload.len()
            );
            return Err(Error::InvalidArgument);
        }

        let proxy = core.proxy().ok_or(Error::FailedPrecondition)?;

        // The controller caps the L2CAP fragment size on the LE transport. A value of 0 means it
        // only has shared buffers, which leaves LE channels non-functional.
        if core.transport() == crate::hci::AclTransport::Le {
            if let Some(max) = proxy.manager.max_le_l2cap_payload_size() {
                if payload.len() + usize::from(SDU_LENGTH_SIZE) > usize::from(max) {
                    error!(
                        "payload ({} bytes) exceeds the LE ACL data packet length; will not \
                         process",
                        payload.len()
                    );
                    return Err(Error::InvalidArgument);
                }
            }
        }

        core.queue_payload(payload)?;

        proxy.manager.report_new_tx_packets_or_credits();
        proxy.drain_channel_queues_if_new_tx();
        Ok(())
    }

    /// Returns `Ok` if a `write` would currently be accepted. On `Unavailable`, a
    /// `WriteAvailable` event fires once queue space returns.
    pub fn is_write_available(&self) -> Result<(), Error> {
        self.shared.core().is_write_available()
    }

    /// Dispenses `credits` additional Rx credits to the remote peer via an
    /// `L2CAP_FLOW_CONTROL_CREDIT_IND` on this connection's signaling channel.
    pub fn send_additional_rx_credits(&self, credits: u16) -> Result<(), Error> {
        let core = self.shared.core();
        if core.state() != ChannelState::Running {
            return Err(Error::FailedPrecondition);
        }

        let signaling = self.shared.signaling.lock().clone();
        let signaling = signaling.ok_or(Error::FailedPrecondition)?;
        let proxy = core.proxy().ok_or(Error::FailedPrecondition)?;

        signaling.send_flow_control_credit_ind(&proxy, core.local_cid(), credits)?;

        let mut rx = self.shared.rx.lock();
        rx.remaining_credits = rx.remaining_credits.saturating_add(credits);
        Ok(())
    }

    pub fn state(&self) -> ChannelState {
        self.shared.core().state()
    }

    pub fn local_cid(&self) -> u16 {
        self.shared.core().local_cid()
    }

    pub fn remote_cid(&self) -> u16 {
        self.shared.core().remote_cid()
    }

    /// Deregisters the channel and closes it. Terminal; further operations fail with
    /// `FailedPrecondition`.
    pub fn close(&self) {
        if let Some(proxy) = self.shared.core().proxy() {
            let channel: Arc<dyn ProxyChannel> = self.shared.clone();
            proxy.manager.deregister_channel(&channel);
        }
        channel::internal_close(&*self.shared, L2capChannelEvent::ChannelClosedByOther);
    }
}

impl Drop for L2capCoc {
    fn drop(&mut self) {
        if self.shared.core().state() != ChannelState::Closed {
            self.close();
        }
    }
}
