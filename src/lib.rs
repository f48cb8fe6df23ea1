//! A reliable, connection-oriented protocol on top of UDP.
//!
//! Every datagram starts with a fixed header:
//!
//! ```ascii
//! 0: protocol version (u8, currently 1)
//! 1: short connection id of the receiving side (u16 BE), 0 while it is not known
//! 3: packet type (u8, printable ASCII)
//! 4: packet id (u16 BE)
//! ```
//!
//! If the short id is 0, the 128-bit long connection id follows the header. It is used for
//!  routing the handshake, before the peer's short id is known.
//!
//! The payload of data packets is a sequence of frames:
//!
//! ```ascii
//! 0: frame type (u8: 'D' data, 'W' close write, 'A' ack)
//! 1: frame id (u16 BE)
//! 3: data length (u16 BE)
//! 5: data
//! ```
//!
//! Reliable packets are numbered sequentially per direction, acknowledged by the receiver and
//!  retransmitted until they are acknowledged or the connection times out. The receiver
//!  delivers them to the application in order, exactly once.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod estimators;
pub mod frame;
pub mod handshake;
pub mod packet;
pub mod packet_id;
pub mod path;
pub mod probe;
pub mod receiver;
pub mod retrier;
pub mod scheduler;
pub mod sender;
pub mod service;
pub mod socket;
pub mod statistics;
pub mod transport;
pub mod util;

#[cfg(test)]
pub mod test_util;
