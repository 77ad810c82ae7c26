//! An intercepting proxy between a Bluetooth HCI host stack and a Bluetooth controller.
//!
//! The proxy sits in the bidirectional H4 packet path. Local clients inside the proxy can own
//! specific L2CAP channels end to end (sending, receiving, and recombining fragmented PDUs)
//! while every other packet passes through untouched. To fund its own traffic, the proxy
//! reserves a slice of the controller's ACL buffer credits by rewriting the buffer-size events
//! the host reads at initialization, and reclaims credits by rewriting
//! `NumberOfCompletedPackets` entries for its own sends.
//!
//! # Using the proxy
//!
//! The proxy is transport-agnostic: the container owning the UART (or whatever carries H4)
//! constructs a [`Proxy`] with two send callbacks and feeds it every packet from both
//! directions via [`Proxy::handle_h4_from_host`] and [`Proxy::handle_h4_from_controller`].
//! Clients acquire channels (eg. an LE credit-based channel via
//! [`Proxy::acquire_l2cap_coc`]) and exchange SDUs through them without the host stack ever
//! seeing the traffic.
//!
//! No hot path allocates: connection tables, Tx queues and the H4 buffer pool are fixed-size
//! (see [`config`]), and receive buffers come from a client-provided allocator.
//!
//! [`Proxy`]: proxy/struct.Proxy.html
//! [`Proxy::handle_h4_from_host`]: proxy/struct.Proxy.html#method.handle_h4_from_host
//! [`Proxy::handle_h4_from_controller`]: proxy/struct.Proxy.html#method.handle_h4_from_controller
//! [`Proxy::acquire_l2cap_coc`]: proxy/struct.Proxy.html#method.acquire_l2cap_coc
//! [`config`]: config/index.html

#[macro_use]
mod log;
#[macro_use]
mod utils;

pub mod acl;
pub mod bytes;
pub mod config;
mod error;
pub mod h4;
pub mod hci;
pub mod l2cap;
pub mod proxy;

pub use self::error::Error;

pub use self::h4::{H4PacketType, H4PacketWithH4, H4PacketWithHci};
pub use self::l2cap::channel::{
    ChannelState, EventFn, L2capChannelEvent, ReceiveFn, RxBufferAllocator,
};
pub use self::l2cap::coc::{CocConfig, L2capCoc};
pub use self::l2cap::status::{
    L2capChannelConfigurationInfo, L2capChannelConnectionInfo, L2capStatusDelegate,
};
pub use self::proxy::Proxy;
