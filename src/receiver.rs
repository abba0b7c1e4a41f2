//! Receiver side of a transfer: reorders incoming chunks, writes them to
//! an output sink and acknowledges with the current buffer window.
//!
//! Out-of-order chunks are parked in the [`PacketBuffer`] at the slot
//! their sequence number maps to, with the intervening holes explicitly
//! reserved. A 32-bit bitmap tracks which slots relative to the buffer
//! head are filled; its trailing run of ones is the in-sequence data that
//! the next drain flushes to the output.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

use crate::buffer::PacketBuffer;
use crate::net::TransferError;
use crate::packet::{Packet, PacketError, PacketType};
use crate::{INITIAL_SEQNUM, MAX_PACKET_LEN, MAX_WINDOW};

/// Silence on the socket tolerated before the transfer is abandoned.
pub const IDLE_TIME: Duration = Duration::from_millis(10_000);

/// Grace period during which the final ACK is re-sent on demand.
pub const LINGER: Duration = Duration::from_millis(3000);

/// How many times the final ACK is re-sent before giving up.
pub const MAX_LINGER_RETRY: u32 = 5;

/// Datagrams inspected during the handshake before aborting.
pub const MAX_RETRIES: u32 = 5;

/// Receive buffer capacity, in slots.
pub const RECV_BUFFER_SLOTS: u32 = 32;

/// The advertisable window. The leading run of in-sequence packets is
/// about to be flushed to the output sink, so it does not count against
/// the buffer space.
fn advertised_window(max_window: u8, oos_mask: u32) -> u8 {
    max_window - oos_mask.trailing_ones() as u8
}

/// Accepts a transfer from a not-yet-known peer and writes it out.
pub struct ReceiverEngine<W> {
    socket: UdpSocket,
    output: W,
    buf: PacketBuffer,
    /// Advertised-window ceiling for this endpoint.
    max_window: u8,
    /// Next in-order sequence number.
    expected_seq: u8,
    /// Bit `k` set means the slot `k` places from the buffer head holds a
    /// decoded chunk.
    oos_mask: u32,
    /// Timestamp echoed back to the sender.
    last_ts: u32,
    need_ack: bool,
    need_nack: bool,
    /// Sequence number the next NACK asks for.
    nack_seq: u8,
    /// Length of the last chunk consumed; `Some(0)` is the
    /// end-of-transfer marker.
    last_written: Option<u16>,
}

impl<W: AsyncWrite + Unpin> ReceiverEngine<W> {
    /// Creates an engine over a bound, not yet connected socket.
    /// `max_window` is clamped to [`MAX_WINDOW`].
    pub fn new(socket: UdpSocket, output: W, max_window: u8) -> Self {
        Self {
            socket,
            output,
            buf: PacketBuffer::new(RECV_BUFFER_SLOTS),
            max_window: max_window.min(MAX_WINDOW),
            expected_seq: INITIAL_SEQNUM,
            oos_mask: 0,
            last_ts: 0,
            need_ack: false,
            need_nack: false,
            nack_seq: 0,
            last_written: None,
        }
    }

    /// Runs the transfer: handshake, receive loop, then the final-ACK
    /// linger.
    ///
    /// # Errors
    ///
    /// I/O failures on the socket or the output sink are fatal, as are a
    /// failed handshake and [`IDLE_TIME`] without any socket activity.
    pub async fn run(&mut self) -> Result<(), TransferError> {
        self.handshake().await?;
        let mut wire = [0u8; MAX_PACKET_LEN];
        loop {
            // Free up buffer space as much as possible before
            // acknowledging, so the ACK carries the updated window.
            if self.can_empty_rbuf() {
                self.empty_rbuf().await?;
            }
            if self.need_ack {
                self.send_ack().await?;
            }
            if self.need_nack {
                self.send_nack().await?;
            }
            self.need_ack = false;
            self.need_nack = false;
            if self.last_written == Some(0) && self.buf.is_empty() {
                break;
            }

            let received = match timeout(IDLE_TIME, self.socket.recv(&mut wire)).await {
                Ok(received) => received,
                Err(_) => {
                    log::error!(
                        "no I/O activity in the last {:.1}s, aborting transfer",
                        IDLE_TIME.as_secs_f64()
                    );
                    return Err(TransferError::IdleTimeout);
                }
            };
            let len = received?;
            self.handle_datagram(&wire[..len]);
            // Help the sender resync on any socket activity, unless a
            // NACK is already scheduled for this round.
            if !self.need_nack {
                self.need_ack = true;
            }
        }
        self.output.flush().await?;
        self.linger().await
    }

    /// Waits for the opening chunk and locks the socket onto its sender.
    ///
    /// Datagrams that fail to decode are dropped silently; decodable
    /// packets other than the seq-0 DATA are reported. Gives up after
    /// [`MAX_RETRIES`] datagrams.
    async fn handshake(&mut self) -> Result<(), TransferError> {
        let mut wire = [0u8; MAX_PACKET_LEN];
        log::info!("waiting for chunk #{INITIAL_SEQNUM} from a sender");
        for _ in 0..MAX_RETRIES {
            let (len, peer) = self.socket.recv_from(&mut wire).await?;
            let pkt = match Packet::decode(&wire[..len]) {
                Ok(pkt) => pkt,
                Err(err) => {
                    log::debug!("dropping datagram: {err}");
                    continue;
                }
            };
            if pkt.kind() != PacketType::Data || pkt.seq() != INITIAL_SEQNUM {
                log::error!(
                    "ignoring {:?} #{} while waiting for the initial chunk",
                    pkt.kind(),
                    pkt.seq()
                );
                continue;
            }
            log::info!("receiving from [{peer}]");
            self.socket.connect(peer).await?;
            self.register(pkt);
            self.need_ack = true;
            return Ok(());
        }
        Err(TransferError::HandshakeFailed)
    }

    /// Decodes one datagram from the connected peer and folds it into the
    /// reassembly state. Undecodable, misdirected and out-of-window
    /// packets are dropped here.
    fn handle_datagram(&mut self, wire: &[u8]) {
        if self.rbuf_full() {
            // The datagram was still read so the kernel queue cannot
            // build up; the next ACK advertises a zero window.
            log::debug!("receive buffer is full, discarding incoming data");
            return;
        }
        let win = self.window_size();
        let pkt = match Packet::decode(wire) {
            Ok(pkt) => pkt,
            Err(err) => {
                log::debug!("dropping datagram: {err}");
                return;
            }
        };
        if pkt.kind() != PacketType::Data {
            log::error!("dropping wrong packet type [{:?}]", pkt.kind());
            return;
        }
        if pkt.seq().wrapping_sub(self.expected_seq) > win {
            log::debug!(
                "dropping chunk #{} [expected: #{}, win: {win}]: {}",
                pkt.seq(),
                self.expected_seq,
                PacketError::Seqnum
            );
            return;
        }
        log::trace!("< #{}", pkt.seq());
        self.register(pkt);
    }

    /// Folds a validated DATA packet into the reassembly state.
    fn register(&mut self, pkt: Packet) {
        self.last_ts = pkt.timestamp();
        // Reserve the in-order hole first: slot offsets are measured from
        // the buffer head, which must never start beyond `expected_seq`.
        self.buf.slot_for_seq(self.expected_seq);
        let first_seq = match self.buf.first() {
            Some(first) => first.seq(),
            None => unreachable!(),
        };
        // Chunks ahead of the in-order point that are still awaiting
        // their flush.
        let distance = if self.oos_mask & 1 == 1 {
            self.expected_seq.wrapping_sub(first_seq).wrapping_sub(1)
        } else {
            0
        };
        let seq = pkt.seq();
        let gap = seq.wrapping_sub(self.expected_seq);
        if pkt.tr() {
            log::info!("chunk #{} is truncated", pkt.seq());
            self.need_nack = true;
            self.nack_seq = pkt.seq();
            return;
        }
        self.oos_mask |= 1 << u32::from(distance.wrapping_add(gap));
        if gap > 0 {
            log::info!(
                "received an out-of-sequence chunk [#{}, expected: #{}]",
                seq,
                self.expected_seq
            );
            *self.buf.slot_for_seq(seq) = pkt;
        } else {
            *self.buf.slot_for_seq(seq) = pkt;
            // Collapse the run of previously out-of-order chunks that the
            // gap fill has put in sequence.
            self.expected_seq = self
                .expected_seq
                .wrapping_add(self.max_window - self.window_size());
        }
        log::debug!(
            "new expected seq: #{}, oos_mask: {:#b}",
            self.expected_seq,
            self.oos_mask
        );
    }

    /// Flushes the leading run of in-sequence chunks to the output.
    ///
    /// A zero-length chunk marks the end of the transfer and is consumed
    /// without writing.
    async fn empty_rbuf(&mut self) -> Result<(), TransferError> {
        while self.oos_mask & 1 == 1 {
            let pkt = self.buf.dequeue();
            self.last_written = Some(pkt.length());
            if pkt.length() > 0 {
                self.output.write_all(pkt.payload()).await?;
                log::debug!("wrote chunk #{} [{}b]", pkt.seq(), pkt.length());
            } else {
                log::info!("chunk #{} marks the end of the transfer", pkt.seq());
            }
            self.oos_mask >>= 1;
        }
        Ok(())
    }

    /// After the final chunk, keep answering retransmissions with the
    /// last ACK for a grace period. Exits successfully either way.
    async fn linger(&mut self) -> Result<(), TransferError> {
        log::info!("sending last ACK #{}", self.expected_seq);
        let mut wire = [0u8; MAX_PACKET_LEN];
        let mut retry = 0;
        while retry < MAX_LINGER_RETRY {
            match timeout(LINGER, self.socket.recv(&mut wire)).await {
                Err(_) => return Ok(()),
                Ok(received) => {
                    received?;
                    self.send_ack().await?;
                    retry += 1;
                }
            }
        }
        log::error!("could not successfully deliver the final ACK after {MAX_LINGER_RETRY} tries");
        Ok(())
    }

    async fn send_ack(&mut self) -> io::Result<()> {
        let pkt = Packet::ack(self.expected_seq, self.window_size(), self.last_ts);
        self.socket.send(&pkt.encode()).await?;
        log::trace!("> ACK #{} [win: {}]", pkt.seq(), pkt.window());
        Ok(())
    }

    async fn send_nack(&mut self) -> io::Result<()> {
        let pkt = Packet::nack(self.nack_seq, self.window_size(), self.last_ts);
        self.socket.send(&pkt.encode()).await?;
        log::trace!("> NACK #{} [win: {}]", pkt.seq(), pkt.window());
        Ok(())
    }

    fn window_size(&self) -> u8 {
        advertised_window(self.max_window, self.oos_mask)
    }

    fn rbuf_full(&self) -> bool {
        self.oos_mask.count_ones() >= u32::from(self.max_window)
    }

    fn can_empty_rbuf(&self) -> bool {
        !self.buf.is_empty() && self.oos_mask & 1 == 1
    }
}
