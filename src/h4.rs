//! H4 transport framing and the shared Tx buffer pool.
//!
//! H4 is the UART framing for HCI: every HCI packet is preceded by a one-byte packet type
//! indicator. Two packet representations cross the proxy boundary:
//!
//! * [`H4PacketWithHci`] borrows an HCI payload buffer owned by the caller, with the H4 type kept
//!   out of band. The proxy may rewrite fields in place but never frees the buffer.
//! * [`H4PacketWithH4`] owns its buffer, which starts with the H4 type byte. Dropping the packet
//!   runs a release hook that typically returns the buffer to the pool it came from.
//!
//! [`H4PacketWithHci`]: struct.H4PacketWithHci.html
//! [`H4PacketWithH4`]: struct.H4PacketWithH4.html

use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::{H4_BUFF_SIZE, NUM_H4_BUFFS};

wire_enum! {
    /// HCI packet type indicator preceding each packet on the H4 transport.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum H4PacketType(u8) {
        /// HCI command packet (host to controller).
        Command = 0x01,
        /// ACL data packet (both directions).
        AclData = 0x02,
        /// HCI event packet (controller to host).
        Event = 0x04,
    }
}

/// An H4 packet backed by a borrowed HCI buffer.
///
/// The caller owns the buffer; the proxy may mutate it in place while handling the packet.
pub struct H4PacketWithHci<'a> {
    h4_type: H4PacketType,
    hci: &'a mut [u8],
}

impl<'a> H4PacketWithHci<'a> {
    /// Creates a packet of type `h4_type` over the HCI bytes in `hci`.
    pub fn new(h4_type: H4PacketType, hci: &'a mut [u8]) -> Self {
        H4PacketWithHci { h4_type, hci }
    }

    /// Returns the packet type indicator.
    pub fn h4_type(&self) -> H4PacketType {
        self.h4_type
    }

    /// Returns the HCI packet bytes (everything after the H4 type).
    pub fn hci_bytes(&self) -> &[u8] {
        &self.hci[..]
    }

    /// Returns the HCI packet bytes for in-place modification.
    pub fn hci_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.hci[..]
    }
}

/// Hook invoked with a packet's buffer when an [`H4PacketWithH4`] is dropped.
///
/// [`H4PacketWithH4`]: struct.H4PacketWithH4.html
pub type ReleaseFn = Arc<dyn Fn(Box<[u8]>) + Send + Sync>;

/// An H4 packet backed by an owned buffer that begins with the H4 type byte.
///
/// On drop, the buffer is passed to the release hook (if any), which returns it to its pool. The
/// buffer may be larger than the packet; only the first `len` bytes are meaningful.
pub struct H4PacketWithH4 {
    buf: Option<Box<[u8]>>,
    len: usize,
    release_fn: Option<ReleaseFn>,
}

impl H4PacketWithH4 {
    /// Creates a packet spanning all of `buf`, with an optional release hook.
    pub fn new(buf: Box<[u8]>, release_fn: Option<ReleaseFn>) -> Self {
        let len = buf.len();
        Self::with_len(buf, len, release_fn)
    }

    /// Creates a packet over the first `len` bytes of `buf`.
    pub(crate) fn with_len(buf: Box<[u8]>, len: usize, release_fn: Option<ReleaseFn>) -> Self {
        debug_assert!(len <= buf.len() && len >= 1);
        H4PacketWithH4 {
            buf: Some(buf),
            len,
            release_fn,
        }
    }

    /// Returns the packet type indicator stored in the first buffer byte.
    pub fn h4_type(&self) -> H4PacketType {
        H4PacketType::from(self.h4_bytes()[0])
    }

    /// Sets the packet type indicator.
    pub fn set_h4_type(&mut self, h4_type: H4PacketType) {
        self.h4_bytes_mut()[0] = h4_type.into();
    }

    /// Returns the full H4 packet image (type byte followed by the HCI packet).
    pub fn h4_bytes(&self) -> &[u8] {
        &self.buf.as_ref().unwrap()[..self.len]
    }

    /// Returns the full H4 packet image for modification.
    pub fn h4_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.buf.as_mut().unwrap()[..len]
    }

    /// Returns the HCI packet bytes (everything after the H4 type byte).
    pub fn hci_bytes(&self) -> &[u8] {
        &self.h4_bytes()[1..]
    }

    /// Returns the HCI packet bytes for modification.
    pub fn hci_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.h4_bytes_mut()[1..]
    }
}

impl Drop for H4PacketWithH4 {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Some(release_fn) = self.release_fn.take() {
                release_fn(buf);
            }
        }
    }
}

/// Fixed pool of equally-sized buffers backing proxy-generated [`H4PacketWithH4`]s.
///
/// Reservation is O(n) over the slot array, but n is small ([`NUM_H4_BUFFS`]). Buffers are boxed
/// once at construction; reserving and releasing moves the box in and out of its slot, so the
/// send path never allocates.
///
/// [`H4PacketWithH4`]: struct.H4PacketWithH4.html
/// [`NUM_H4_BUFFS`]: ../config/constant.NUM_H4_BUFFS.html
pub(crate) struct H4Storage {
    slots: Mutex<[Option<Box<[u8]>>; NUM_H4_BUFFS]>,
}

impl H4Storage {
    pub fn new() -> Self {
        let mut slots: [Option<Box<[u8]>>; NUM_H4_BUFFS] = Default::default();
        for slot in &mut slots {
            *slot = Some(vec![0; H4_BUFF_SIZE].into_boxed_slice());
        }
        H4Storage {
            slots: Mutex::new(slots),
        }
    }

    /// Takes a zeroed buffer out of the pool, or `None` if every buffer is in use.
    pub fn reserve(&self) -> Option<Box<[u8]>> {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if let Some(mut buf) = slot.take() {
                buf.iter_mut().for_each(|b| *b = 0);
                return Some(buf);
            }
        }
        None
    }

    /// Returns a previously reserved buffer to the pool.
    pub fn release(&self, buf: Box<[u8]>) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(buf);
                return;
            }
        }
        error!("released an H4 buffer into a full pool; dropping it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_and_release() {
        let storage = H4Storage::new();
        let mut held = Vec::new();
        for _ in 0..NUM_H4_BUFFS {
            held.push(storage.reserve().unwrap());
        }
        assert!(storage.reserve().is_none());

        storage.release(held.pop().unwrap());
        assert!(storage.reserve().is_some());
    }

    #[test]
    fn packet_release_hook_runs_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let released = Arc::new(AtomicUsize::new(0));
        let released2 = released.clone();
        let release: ReleaseFn = Arc::new(move |_| {
            released2.fetch_add(1, Ordering::SeqCst);
        });

        let mut packet = H4PacketWithH4::new(vec![0; 5].into_boxed_slice(), Some(release));
        packet.set_h4_type(H4PacketType::AclData);
        assert_eq!(packet.h4_type(), H4PacketType::AclData);
        drop(packet);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
