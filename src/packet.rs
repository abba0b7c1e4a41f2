//! Wire-format packet record and codec.
//!
//! Every datagram starts with a 12-byte header whose integrity is covered
//! by CRC1; a non-empty payload is followed by its own CRC2:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Typ|T|  Window |    Seqnum     |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             CRC1                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Payload (up to 512 bytes)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  CRC2 (present iff Length > 0)                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Multi-byte fields are big-endian. CRC1 covers the eight bytes preceding
//! it with the truncation bit cleared, so a middlebox that strips a payload
//! and sets `tr` does not have to recompute it.

use thiserror::Error;

use crate::crc::PKT_CRC32;
use crate::{FOOTER_LEN, HEADER_LEN, MAX_PACKET_LEN, MAX_PAYLOAD, MAX_WINDOW};

/// Bit of the leading wire byte holding the truncation flag.
const TR_BIT: u8 = 1 << 5;

/// Packet kinds, carried in the top two bits of the first wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// A payload-bearing chunk of the transferred stream.
    Data = 1,
    /// Cumulative acknowledgement of every chunk before `seq`.
    Ack = 2,
    /// Request to retransmit exactly the chunk `seq`.
    Nack = 3,
}

impl PacketType {
    fn from_bits(bits: u8) -> Result<Self, PacketError> {
        match bits {
            1 => Ok(Self::Data),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Nack),
            v => Err(PacketError::Type(v)),
        }
    }
}

/// Validation and decode failures, mirroring the protocol status codes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("invalid packet type {0:#04x}")]
    Type(u8),

    #[error("truncation flag set on a non-DATA packet")]
    Tr,

    #[error("payload length {0} exceeds the maximum")]
    Length(usize),

    #[error("checksum mismatch [computed: {computed:#010x}, found: {found:#010x}]")]
    Crc { computed: u32, found: u32 },

    #[error("window {0} exceeds the 5-bit maximum")]
    Window(u8),

    #[error("sequence number outside the current window")]
    Seqnum,

    #[error("datagram too short to hold a header")]
    NoHeader,

    #[error("framing is inconsistent with the declared length")]
    Unconsistent,
}

/// A protocol packet in host order.
///
/// Mutators validate the protocol invariants (`window <= 31`, payloads no
/// larger than [`MAX_PAYLOAD`], `tr` only on DATA); [`Packet::encode`] and
/// [`Packet::decode`] convert to and from the wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketType,
    tr: bool,
    window: u8,
    seq: u8,
    ts: u32,
    payload: Vec<u8>,
}

impl Default for Packet {
    /// An empty DATA packet; buffer slots start out as these.
    fn default() -> Self {
        Self {
            kind: PacketType::Data,
            tr: false,
            window: 0,
            seq: 0,
            ts: 0,
            payload: Vec::new(),
        }
    }
}

impl Packet {
    /// Creates a DATA packet carrying `payload`.
    ///
    /// # Panics
    ///
    /// Panics if `payload` exceeds [`MAX_PAYLOAD`] bytes.
    pub fn data(seq: u8, ts: u32, payload: &[u8]) -> Self {
        let mut pkt = Self {
            seq,
            ts,
            ..Self::default()
        };
        pkt.set_payload(payload)
            .expect("payload exceeds MAX_PAYLOAD");
        pkt
    }

    /// Creates an ACK for `seq`, advertising `window` free receive slots.
    pub fn ack(seq: u8, window: u8, ts: u32) -> Self {
        Self::response(PacketType::Ack, seq, window, ts)
    }

    /// Creates a NACK requesting the retransmission of `seq`.
    pub fn nack(seq: u8, window: u8, ts: u32) -> Self {
        Self::response(PacketType::Nack, seq, window, ts)
    }

    fn response(kind: PacketType, seq: u8, window: u8, ts: u32) -> Self {
        debug_assert!(window <= MAX_WINDOW);
        Self {
            kind,
            tr: false,
            window,
            seq,
            ts,
            payload: Vec::new(),
        }
    }

    pub fn kind(&self) -> PacketType {
        self.kind
    }

    pub fn tr(&self) -> bool {
        self.tr
    }

    pub fn window(&self) -> u8 {
        self.window
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Payload byte count; 0 for ACK/NACK and truncated DATA.
    pub fn length(&self) -> u16 {
        self.payload.len() as u16
    }

    pub fn timestamp(&self) -> u32 {
        self.ts
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_kind(&mut self, kind: PacketType) {
        self.kind = kind;
    }

    /// Sets the truncation flag, which only DATA packets may carry.
    pub fn set_tr(&mut self, tr: bool) -> Result<(), PacketError> {
        if tr && self.kind != PacketType::Data {
            return Err(PacketError::Tr);
        }
        self.tr = tr;
        Ok(())
    }

    pub fn set_window(&mut self, window: u8) -> Result<(), PacketError> {
        if window > MAX_WINDOW {
            return Err(PacketError::Window(window));
        }
        self.window = window;
        Ok(())
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    pub fn set_timestamp(&mut self, ts: u32) {
        self.ts = ts;
    }

    pub fn set_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        if data.len() > MAX_PAYLOAD {
            return Err(PacketError::Length(data.len()));
        }
        self.payload.clear();
        self.payload.extend_from_slice(data);
        Ok(())
    }

    /// Wire size of this packet once encoded.
    pub fn wire_len(&self) -> usize {
        if self.payload.is_empty() {
            HEADER_LEN
        } else {
            HEADER_LEN + self.payload.len() + FOOTER_LEN
        }
    }

    /// Serializes the packet, computing both checksums.
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(self.wire_len());
        wire.push((self.kind as u8) << 6 | (self.tr as u8) << 5 | (self.window & 0x1F));
        wire.push(self.seq);
        wire.extend_from_slice(&self.length().to_be_bytes());
        wire.extend_from_slice(&self.ts.to_be_bytes());

        // CRC1 is computed as if tr were 0.
        let mut head = [0u8; HEADER_LEN - FOOTER_LEN];
        head.copy_from_slice(&wire[..HEADER_LEN - FOOTER_LEN]);
        head[0] &= !TR_BIT;
        wire.extend_from_slice(&PKT_CRC32.checksum(&head).to_be_bytes());

        if !self.payload.is_empty() {
            wire.extend_from_slice(&self.payload);
            wire.extend_from_slice(&PKT_CRC32.checksum(&self.payload).to_be_bytes());
        }
        wire
    }

    /// Parses and validates a received datagram.
    ///
    /// # Errors
    ///
    /// [`PacketError::NoHeader`] for datagrams shorter than a header,
    /// [`PacketError::Type`]/[`PacketError::Tr`]/[`PacketError::Length`]
    /// for invalid header fields, [`PacketError::Crc`] for either checksum
    /// failing, and [`PacketError::Unconsistent`] when the payload region
    /// does not match what the header declares.
    pub fn decode(wire: &[u8]) -> Result<Self, PacketError> {
        if wire.len() < HEADER_LEN {
            return Err(PacketError::NoHeader);
        }
        if wire.len() > MAX_PACKET_LEN {
            return Err(PacketError::Unconsistent);
        }

        let kind = PacketType::from_bits(wire[0] >> 6)?;
        let tr = wire[0] & TR_BIT != 0;
        let window = wire[0] & 0x1F;
        let seq = wire[1];
        let length = u16::from_be_bytes([wire[2], wire[3]]) as usize;
        let ts = u32::from_be_bytes([wire[4], wire[5], wire[6], wire[7]]);

        if tr && kind != PacketType::Data {
            return Err(PacketError::Tr);
        }
        if length > MAX_PAYLOAD {
            return Err(PacketError::Length(length));
        }

        let found = u32::from_be_bytes([wire[8], wire[9], wire[10], wire[11]]);
        let mut head = [0u8; HEADER_LEN - FOOTER_LEN];
        head.copy_from_slice(&wire[..HEADER_LEN - FOOTER_LEN]);
        head[0] &= !TR_BIT;
        let computed = PKT_CRC32.checksum(&head);
        if computed != found {
            return Err(PacketError::Crc { computed, found });
        }

        let trailer = &wire[HEADER_LEN..];
        let mut payload = Vec::new();
        match kind {
            PacketType::Data if tr => {
                // A truncating middlebox strips the whole payload region.
                if !trailer.is_empty() || length != 0 {
                    return Err(PacketError::Unconsistent);
                }
            }
            PacketType::Data => {
                if trailer.is_empty() {
                    if length != 0 {
                        return Err(PacketError::Unconsistent);
                    }
                } else {
                    if trailer.len() < FOOTER_LEN {
                        return Err(PacketError::Unconsistent);
                    }
                    let (body, crc2) = trailer.split_at(trailer.len() - FOOTER_LEN);
                    if body.len() != length {
                        return Err(PacketError::Unconsistent);
                    }
                    if !body.is_empty() {
                        let found = u32::from_be_bytes([crc2[0], crc2[1], crc2[2], crc2[3]]);
                        let computed = PKT_CRC32.checksum(body);
                        if computed != found {
                            return Err(PacketError::Crc { computed, found });
                        }
                        payload.extend_from_slice(body);
                    }
                }
            }
            PacketType::Ack | PacketType::Nack => {
                if !trailer.is_empty() || length != 0 {
                    return Err(PacketError::Unconsistent);
                }
            }
        }

        Ok(Self {
            kind,
            tr,
            window,
            seq,
            ts,
            payload,
        })
    }
}
