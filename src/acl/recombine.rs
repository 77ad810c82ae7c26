//! Recombination of L2CAP PDUs fragmented across ACL packets.
//!
//! Each ACL connection owns one `Recombiner` per direction. When a first fragment of a PDU
//! addressed to a proxy-owned channel arrives, a buffer sized to the full L2CAP frame is
//! allocated from that channel's Rx allocator and fragments are appended until the buffer is
//! exactly full; the assembled PDU is then taken out and recombination ends.
//!
//! Invariants: a buffer is present exactly while recombination is active, the write offset never
//! exceeds the buffer size, and completion means the offset equals the buffer size.

use std::sync::Arc;

use crate::l2cap::channel::RxBufferAllocator;
use crate::Error;

struct Recombination {
    /// Local CID of the channel the assembled PDU is destined for.
    local_cid: u16,
    buf: Box<[u8]>,
    offset: usize,
}

/// Per-connection, per-direction fragment recombiner.
pub(crate) struct Recombiner {
    active: Option<Recombination>,
}

impl Recombiner {
    pub fn new() -> Self {
        Recombiner { active: None }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Starts recombining a PDU of `size` total bytes for the channel with `local_cid`, using
    /// the channel's Rx allocator.
    pub fn start(
        &mut self,
        local_cid: u16,
        allocator: &Arc<dyn RxBufferAllocator>,
        size: usize,
    ) -> Result<(), Error> {
        if self.is_active() {
            return Err(Error::FailedPrecondition);
        }
        let buf = allocator.allocate(size).ok_or(Error::ResourceExhausted)?;
        self.active = Some(Recombination {
            local_cid,
            buf,
            offset: 0,
        });
        Ok(())
    }

    /// Appends one fragment. Fails if the fragment would overflow the expected PDU size; the
    /// caller then drops the whole PDU via [`end`].
    ///
    /// [`end`]: #method.end
    pub fn recombine_fragment(&mut self, data: &[u8]) -> Result<(), Error> {
        let rec = self.active.as_mut().ok_or(Error::FailedPrecondition)?;
        if rec.offset + data.len() > rec.buf.len() {
            return Err(Error::InvalidLength);
        }
        rec.buf[rec.offset..rec.offset + data.len()].copy_from_slice(data);
        rec.offset += data.len();
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        match &self.active {
            Some(rec) => rec.offset == rec.buf.len(),
            None => false,
        }
    }

    pub fn local_cid(&self) -> Option<u16> {
        self.active.as_ref().map(|rec| rec.local_cid)
    }

    /// Takes the fully assembled PDU and ends recombination.
    ///
    /// Only call when [`is_complete`] is true.
    ///
    /// [`is_complete`]: #method.is_complete
    pub fn take_and_end(&mut self) -> Box<[u8]> {
        debug_assert!(self.is_complete());
        self.active.take().unwrap().buf
    }

    /// Drops any partially recombined PDU.
    pub fn end(&mut self) {
        self.active = None;
    }
}
