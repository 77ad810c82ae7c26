//! Controller buffer credit accounting.
//!
//! The proxy reserves a slice of the controller's ACL buffers for itself by rewriting the
//! buffer-size events the host reads at initialization. Afterwards, every packet the proxy sends
//! consumes one credit until the controller acknowledges it via `NumberOfCompletedPackets`.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::hci::AclTransport;
use crate::Error;

/// Credit state for one transport.
pub(crate) struct Credits {
    /// Number of credits the proxy was configured to take for itself.
    to_reserve: u16,
    /// Credits actually reserved out of the controller's total.
    proxy_max: u16,
    /// Packets sent whose completion has not yet been observed.
    proxy_pending: u16,
    initialized: bool,
}

impl Credits {
    pub fn new(to_reserve: u16) -> Self {
        Credits {
            to_reserve,
            proxy_max: 0,
            proxy_pending: 0,
            initialized: false,
        }
    }

    pub fn reset(&mut self) {
        self.proxy_max = 0;
        self.proxy_pending = 0;
        self.initialized = false;
    }

    /// Takes the proxy's share out of `controller_max` and returns what is left for the host.
    pub fn reserve(&mut self, controller_max: u16) -> u16 {
        if self.initialized {
            warn!("credits reserved twice without a reset; re-reserving");
            self.proxy_max = 0;
        }
        self.initialized = true;

        self.proxy_max = controller_max.min(self.to_reserve);
        self.proxy_pending = self.proxy_pending.min(self.proxy_max);
        let host_max = controller_max - self.proxy_max;

        info!(
            "reserved {} ACL data credits; passed {} on to host",
            self.proxy_max, host_max
        );
        if self.proxy_max < self.to_reserve {
            error!(
                "only reserved {} of the configured {} ACL credits from the controller's {}",
                self.proxy_max, self.to_reserve, controller_max
            );
        }

        host_max
    }

    pub fn mark_pending(&mut self, num_credits: u16) -> Result<(), Error> {
        if num_credits > self.remaining() {
            return Err(Error::ResourceExhausted);
        }
        self.proxy_pending += num_credits;
        Ok(())
    }

    pub fn mark_completed(&mut self, num_credits: u16) {
        if num_credits > self.proxy_pending {
            error!("tried to mark completed more packets than were pending");
            self.proxy_pending = 0;
        } else {
            self.proxy_pending -= num_credits;
        }
    }

    /// Credits currently free for sending.
    pub fn remaining(&self) -> u16 {
        self.proxy_max - self.proxy_pending
    }

    /// Whether the proxy intends to send on this transport at all. True as soon as a reservation
    /// is configured, even before the controller's buffer sizes have been read.
    pub fn has_send_capability(&self) -> bool {
        self.to_reserve > 0
    }
}

/// Both transports' credit state, shareable with outstanding [`SendCredit`]s.
///
/// [`SendCredit`]: struct.SendCredit.html
pub(crate) struct CreditLedger {
    br_edr: Credits,
    le: Credits,
}

impl CreditLedger {
    pub fn new(br_edr_to_reserve: u16, le_to_reserve: u16) -> Self {
        CreditLedger {
            br_edr: Credits::new(br_edr_to_reserve),
            le: Credits::new(le_to_reserve),
        }
    }

    pub fn credits(&self, transport: AclTransport) -> &Credits {
        match transport {
            AclTransport::BrEdr => &self.br_edr,
            AclTransport::Le => &self.le,
        }
    }

    pub fn credits_mut(&mut self, transport: AclTransport) -> &mut Credits {
        match transport {
            AclTransport::BrEdr => &mut self.br_edr,
            AclTransport::Le => &mut self.le,
        }
    }

    pub fn reset(&mut self) {
        self.br_edr.reset();
        self.le.reset();
    }
}

/// A reserved right to send one ACL packet on a transport.
///
/// Exactly one of two things happens to a `SendCredit`: it is consumed by a successful send
/// ([`mark_used`]), or it is dropped and the reservation is refunded.
///
/// [`mark_used`]: #method.mark_used
pub struct SendCredit {
    transport: AclTransport,
    ledger: Option<Arc<Mutex<CreditLedger>>>,
}

impl SendCredit {
    pub(crate) fn new(transport: AclTransport, ledger: Arc<Mutex<CreditLedger>>) -> Self {
        SendCredit {
            transport,
            ledger: Some(ledger),
        }
    }

    pub fn transport(&self) -> AclTransport {
        self.transport
    }

    /// Consumes the credit; the packet it was reserved for was handed to the controller.
    pub(crate) fn mark_used(mut self) {
        self.ledger = None;
    }
}

impl Drop for SendCredit {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            ledger.lock().credits_mut(self.transport).mark_completed(1);
        }
    }
}
