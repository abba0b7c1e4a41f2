//! Reliable unidirectional file transfer over UDP.
//!
//! This crate is structured around three pieces. The [`Packet`] type is the
//! wire codec: framing, endian conversion and dual CRC-32 validation. The
//! [`PacketBuffer`] is a circular buffer of packet slots addressed by the
//! protocol's 8-bit sequence numbers. On top of those sit the two transfer
//! engines: [`sender::SenderEngine`] reads a byte stream and drives the
//! sliding window (cumulative ACKs dequeue acknowledged chunks, a NACK
//! retransmits a single chunk, the third duplicate ACK fast-retransmits the
//! oldest unacknowledged one, and an expired retransmission timer falls
//! back to go-back-N), while [`receiver::ReceiverEngine`] reorders incoming
//! chunks, writes them to an output sink and advertises its remaining
//! buffer space in every acknowledgement.
//!
//! The `sender` and `receiver` binaries wire the engines to files, stdio
//! and IPv6 UDP sockets.

pub mod buffer;
pub mod crc;
pub mod net;
pub mod packet;
pub mod receiver;
pub mod sender;

pub use buffer::PacketBuffer;
pub use net::TransferError;
pub use packet::{Packet, PacketError, PacketType};

/// Maximum number of payload bytes carried by a single DATA packet.
pub const MAX_PAYLOAD: usize = 512;

/// Maximum advertisable window, as bounded by the 5-bit wire field.
pub const MAX_WINDOW: u8 = 31;

/// Fixed size of the packet header, up to and including CRC1.
pub const HEADER_LEN: usize = 12;

/// Size of the payload CRC trailing a non-empty DATA packet.
pub const FOOTER_LEN: usize = 4;

/// Largest datagram the protocol can emit.
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_PAYLOAD + FOOTER_LEN;

/// Sequence number opening every transfer.
pub const INITIAL_SEQNUM: u8 = 0;

/// Timestamp stamped on every DATA packet. The receiver echoes the last
/// value it saw, so a response carrying anything else reveals a peer that
/// mangles the field.
pub const PKT_TIMESTAMP: u32 = 0xDEAD_BEEF;
