//! Compile-time sizing of the proxy's fixed resources.
//!
//! None of the hot paths allocate; everything below bounds a fixed-capacity container or buffer
//! pool that is set up when the [`Proxy`] is created.
//!
//! [`Proxy`]: ../proxy/struct.Proxy.html

/// Number of buffers in the shared H4 Tx buffer pool.
///
/// This bounds the number of ACL sends that can be in flight (sent but not yet released by the
/// lower layer) at one time.
pub const NUM_H4_BUFFS: usize = 10;

/// Size in bytes of each H4 Tx buffer.
///
/// Large enough for a 3-DH5 payload plus the ACL data header and the one-byte H4 type.
pub const H4_BUFF_SIZE: usize = 1026;

/// Number of client payloads each channel can queue for transmission.
pub const TX_QUEUE_CAPACITY: usize = 5;

/// Maximum size of a single queued Tx payload.
///
/// An H4 buffer minus the H4 type byte, the ACL data header, and the L2CAP basic header.
pub const TX_PAYLOAD_CAPACITY: usize = H4_BUFF_SIZE - 1 - 4 - 4;

/// Capacity of the ACL connection table.
pub const MAX_ACL_CONNECTIONS: usize = 10;

/// Number of partially open L2CAP connections each signaling channel can track. These stay open
/// until the connection response provides the destination CID.
pub const MAX_PENDING_CONNECTIONS: usize = 10;

/// Maximum number of in-flight L2CAP configuration exchanges (inbound and outbound).
pub const MAX_PENDING_CONFIGURATIONS: usize = 2 * MAX_PENDING_CONNECTIONS;

/// Number of connected-channel records the status tracker can hold for delegate notifications.
pub const MAX_TRACKED_CHANNELS: usize = 10;
