//! Tracking of L2CAP channel connections for status delegates.
//!
//! Clients that want to know when channels on a particular PSM come and go register an
//! [`L2capStatusDelegate`]. The signaling channels feed completed connection, configuration and
//! disconnection exchanges into the [`StatusTracker`], which buffers one pending event of each
//! kind and fans them out on [`deliver_pending_events`], which the proxy calls once packet
//! processing has released its locks, so delegates are free to acquire or drop channels from
//! their callbacks.
//!
//! [`L2capStatusDelegate`]: trait.L2capStatusDelegate.html
//! [`StatusTracker`]: struct.StatusTracker.html
//! [`deliver_pending_events`]: struct.StatusTracker.html#method.deliver_pending_events

use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::MAX_TRACKED_CHANNELS;
use crate::hci::Direction;
use crate::utils::Hex;

/// A completed L2CAP channel connection, assembled from a CONNECTION_REQ/RSP exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct L2capChannelConnectionInfo {
    /// Direction the connection request traveled.
    pub direction: Direction,
    pub psm: u16,
    pub connection_handle: u16,
    pub remote_cid: u16,
    pub local_cid: u16,
}

/// A completed L2CAP channel configuration, assembled from a CONFIGURATION_REQ/RSP exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct L2capChannelConfigurationInfo {
    /// Direction the configuration request traveled.
    pub direction: Direction,
    pub connection_handle: u16,
    pub remote_cid: u16,
    pub local_cid: u16,
    /// MTU option carried in the request, if any.
    pub mtu: Option<u16>,
}

/// Identity of a channel torn down by an L2CAP DISCONNECTION_RSP.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DisconnectParams {
    pub connection_handle: u16,
    pub remote_cid: u16,
    pub local_cid: u16,
}

/// Observer of L2CAP channel connections on PSMs it elects to track.
pub trait L2capStatusDelegate: Send + Sync {
    /// Returns whether connections on `psm` interest this delegate.
    fn should_track_psm(&self, psm: u16) -> bool;

    /// A tracked channel finished connecting.
    fn handle_connection_complete(&self, info: L2capChannelConnectionInfo);

    /// A tracked channel finished (re)configuration.
    fn handle_configuration_changed(&self, info: L2capChannelConfigurationInfo) {
        let _ = info;
    }

    /// A tracked channel was disconnected.
    fn handle_disconnection_complete(&self, info: L2capChannelConnectionInfo);
}

#[derive(Default)]
struct PendingEvents {
    connection_complete: Option<L2capChannelConnectionInfo>,
    configuration_changed: Option<L2capChannelConfigurationInfo>,
    acl_disconnection_complete: Option<u16>,
    disconnection_complete: Option<DisconnectParams>,
}

struct TrackerState {
    delegates: Vec<Arc<dyn L2capStatusDelegate>>,
    /// One entry per open channel connection that some delegate tracks by PSM.
    connected: heapless::Vec<L2capChannelConnectionInfo, MAX_TRACKED_CHANNELS>,
    pending: PendingEvents,
}

/// Delegate registry and connected-channel table.
pub(crate) struct StatusTracker {
    state: Mutex<TrackerState>,
}

impl StatusTracker {
    pub fn new() -> Self {
        StatusTracker {
            state: Mutex::new(TrackerState {
                delegates: Vec::new(),
                connected: heapless::Vec::new(),
                pending: PendingEvents::default(),
            }),
        }
    }

    pub fn register_delegate(&self, delegate: Arc<dyn L2capStatusDelegate>) {
        self.state.lock().delegates.push(delegate);
    }

    pub fn unregister_delegate(&self, delegate: &Arc<dyn L2capStatusDelegate>) {
        self.state
            .lock()
            .delegates
            .retain(|d| !Arc::ptr_eq(d, delegate));
    }

    pub fn handle_connection_complete(&self, info: L2capChannelConnectionInfo) {
        let mut state = self.state.lock();
        if state.pending.connection_complete.replace(info).is_some() {
            warn!("overwrote an undelivered connection-complete event");
        }
    }

    pub fn handle_configuration_changed(&self, info: L2capChannelConfigurationInfo) {
        let mut state = self.state.lock();
        if state.pending.configuration_changed.replace(info).is_some() {
            warn!("overwrote an undelivered configuration-changed event");
        }
    }

    pub fn handle_acl_disconnection_complete(&self, connection_handle: u16) {
        let mut state = self.state.lock();
        if state
            .pending
            .acl_disconnection_complete
            .replace(connection_handle)
            .is_some()
        {
            warn!("overwrote an undelivered ACL disconnection-complete event");
        }
    }

    pub fn handle_disconnection_complete(&self, params: DisconnectParams) {
        let mut state = self.state.lock();
        if state.pending.disconnection_complete.replace(params).is_some() {
            warn!("overwrote an undelivered disconnection-complete event");
        }
    }

    /// Fans buffered events out to the registered delegates.
    ///
    /// Must be called with no packet-path locks held; delegates may call back into the proxy.
    pub fn deliver_pending_events(&self) {
        loop {
            // Snapshot one pending event and the delegates it goes to, then call out with the
            // tracker unlocked.
            let mut state = self.state.lock();
            let delegates = state.delegates.clone();

            if let Some(info) = state.pending.connection_complete.take() {
                let mut track = false;
                drop(state);
                for delegate in &delegates {
                    if delegate.should_track_psm(info.psm) {
                        track = true;
                        delegate.handle_connection_complete(info);
                    }
                }
                if track {
                    let mut state = self.state.lock();
                    if state.connected.push(info).is_err() {
                        error!(
                            "can't track channel connection on psm {:?}; disconnect event will \
                             not be delivered",
                            Hex(info.psm)
                        );
                    }
                }
                continue;
            }

            if let Some(info) = state.pending.configuration_changed.take() {
                drop(state);
                for delegate in &delegates {
                    delegate.handle_configuration_changed(info);
                }
                continue;
            }

            if let Some(connection_handle) = state.pending.acl_disconnection_complete.take() {
                let mut dropped: Vec<L2capChannelConnectionInfo> = Vec::new();
                let mut i = 0;
                while i < state.connected.len() {
                    if state.connected[i].connection_handle == connection_handle {
                        dropped.push(state.connected.swap_remove(i));
                    } else {
                        i += 1;
                    }
                }
                drop(state);
                for info in dropped {
                    for delegate in &delegates {
                        if delegate.should_track_psm(info.psm) {
                            delegate.handle_disconnection_complete(info);
                        }
                    }
                }
                continue;
            }

            if let Some(params) = state.pending.disconnection_complete.take() {
                let index = state.connected.iter().position(|i| {
                    i.connection_handle == params.connection_handle
                        && i.remote_cid == params.remote_cid
                        && i.local_cid == params.local_cid
                });
                let info = index.map(|index| state.connected.swap_remove(index));
                drop(state);
                if let Some(info) = info {
                    for delegate in &delegates {
                        if delegate.should_track_psm(info.psm) {
                            delegate.handle_disconnection_complete(info);
                        }
                    }
                }
                continue;
            }

            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDelegate {
        psm: u16,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl L2capStatusDelegate for CountingDelegate {
        fn should_track_psm(&self, psm: u16) -> bool {
            psm == self.psm
        }

        fn handle_connection_complete(&self, _info: L2capChannelConnectionInfo) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_disconnection_complete(&self, _info: L2capChannelConnectionInfo) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn info(psm: u16, handle: u16) -> L2capChannelConnectionInfo {
        L2capChannelConnectionInfo {
            direction: Direction::FromHost,
            psm,
            connection_handle: handle,
            remote_cid: 0x0041,
            local_cid: 0x0040,
        }
    }

    #[test]
    fn events_buffer_until_delivered() {
        let tracker = StatusTracker::new();
        let delegate = Arc::new(CountingDelegate {
            psm: 0x0019,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        tracker.register_delegate(delegate.clone());

        tracker.handle_connection_complete(info(0x0019, 0x0B));
        assert_eq!(delegate.connects.load(Ordering::SeqCst), 0);

        tracker.deliver_pending_events();
        assert_eq!(delegate.connects.load(Ordering::SeqCst), 1);

        tracker.handle_acl_disconnection_complete(0x0B);
        tracker.deliver_pending_events();
        assert_eq!(delegate.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn untracked_psm_is_filtered(){
        let tracker = StatusTracker::new();
        let delegate = Arc::new(CountingDelegate {
            psm: 0x0019,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        tracker.register_delegate(delegate.clone());

        tracker.handle_connection_complete(info(0x0003, 0x0B));
        tracker.deliver_pending_events();
        assert_eq!(delegate.connects.load(Ordering::SeqCst), 0);

        // Untracked connections don't occupy the connected table.
        tracker.handle_disconnection_complete(DisconnectParams {
            connection_handle: 0x0B,
            remote_cid: 0x0041,
            local_cid: 0x0040,
        });
        tracker.deliver_pending_events();
        assert_eq!(delegate.disconnects.load(Ordering::SeqCst), 0);
    }
}
