//! Sender side of a transfer: reads a byte stream and drives the
//! sliding-window transmission pipeline.
//!
//! The engine keeps every unacknowledged chunk queued in its
//! [`PacketBuffer`]. Cumulative ACKs dequeue from the head, a NACK
//! retransmits one chunk, the third duplicate ACK fast-retransmits the
//! oldest unacknowledged chunk, and an expired retransmission timer
//! resends the whole in-flight span (go-back-N).

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio::time::{sleep, Duration};

use crate::buffer::PacketBuffer;
use crate::net::TransferError;
use crate::packet::{Packet, PacketError, PacketType};
use crate::{MAX_PACKET_LEN, MAX_PAYLOAD, PKT_TIMESTAMP};

/// Silence on the socket tolerated before the in-flight span is resent.
pub const RETRANSMISSION_DELAY: Duration = Duration::from_millis(4000);

/// Consecutive retransmission timeouts tolerated before giving up.
pub const MAX_RETRANSMISSION: u32 = 5;

/// Duplicate cumulative ACKs that trigger a fast retransmit.
pub const MAX_DUP_ACK: u8 = 3;

/// Drives one transfer from an input stream to a connected peer.
pub struct SenderEngine<R> {
    socket: UdpSocket,
    input: R,
    buf: PacketBuffer,
    /// Next expected cumulative ACK.
    last_ack: u8,
    /// Latest window advertised by the receiver.
    last_win: u8,
    /// Highest sequence number handed to the network.
    last_sent: u8,
    /// Sequence number of the last chunk read from the input.
    last_chunk_read: u8,
    /// Duplicate cumulative ACKs seen so far.
    dup_ack: u8,
    /// Consecutive retransmission-timer expirations.
    retry_count: u32,
    /// Size of the last input read; `Some(0)` is the EOF sentinel.
    last_in_read: Option<usize>,
}

impl<R: AsyncRead + Unpin> SenderEngine<R> {
    /// Creates an engine over a socket already connected to the receiver.
    pub fn new(socket: UdpSocket, input: R, buf: PacketBuffer) -> Self {
        Self {
            socket,
            input,
            buf,
            last_ack: 0,
            last_win: 1,
            last_sent: u8::MAX,
            last_chunk_read: u8::MAX,
            dup_ack: 0,
            retry_count: 0,
            last_in_read: None,
        }
    }

    /// Runs the transfer to completion.
    ///
    /// Returns once every chunk, including the terminal zero-length one,
    /// has been cumulatively acknowledged.
    ///
    /// # Errors
    ///
    /// I/O failures on the input or the socket are fatal, as is the
    /// retransmission timer expiring [`MAX_RETRANSMISSION`] times in a
    /// row.
    pub async fn run(&mut self) -> Result<(), TransferError> {
        let mut wire = [0u8; MAX_PACKET_LEN];
        let mut chunk = [0u8; MAX_PAYLOAD];
        loop {
            // Stop polling the input once EOF has been seen or the buffer
            // cannot take another chunk.
            let poll_input = self.last_in_read != Some(0) && !self.buf.is_full();
            tokio::select! {
                biased;
                // The socket comes first so the window is up to date
                // before the send burst below is sized.
                received = self.socket.recv(&mut wire) => {
                    let len = received?;
                    match Packet::decode(&wire[..len]) {
                        Ok(pkt) => self.handle_response(pkt).await?,
                        Err(err) => log::debug!("dropping response: {err}"),
                    }
                }
                read = self.input.read(&mut chunk), if poll_input => {
                    let len = read?;
                    self.queue_chunk(&chunk[..len]);
                }
                _ = sleep(RETRANSMISSION_DELAY) => {
                    if !self.buf.is_empty() {
                        self.go_back_n().await?;
                    }
                }
            }
            self.send_pending().await?;
            if self.last_in_read == Some(0) && self.buf.is_empty() {
                log::info!("transfer completed");
                return Ok(());
            }
        }
    }

    /// Sequences a freshly read chunk and queues it for transmission.
    ///
    /// A zero-length chunk is the end-of-transfer marker; it consumes a
    /// sequence number and is sent and acknowledged like any other.
    fn queue_chunk(&mut self, data: &[u8]) {
        self.last_in_read = Some(data.len());
        self.last_chunk_read = self.last_chunk_read.wrapping_add(1);
        let seq = self.last_chunk_read;
        *self.buf.enqueue() = Packet::data(seq, PKT_TIMESTAMP, data);
        log::debug!("queued chunk #{seq} [{}b]", data.len());
    }

    /// Validates and dispatches an incoming ACK or NACK.
    async fn handle_response(&mut self, pkt: Packet) -> Result<(), TransferError> {
        if !matches!(pkt.kind(), PacketType::Ack | PacketType::Nack) {
            log::error!("dropping wrong packet type [{:?}]", pkt.kind());
            return Ok(());
        }
        // Admit one more than the in-flight span, so the duplicate of the
        // last cumulative ACK is still seen.
        let win = self.last_sent.wrapping_sub(self.last_ack).wrapping_add(1);
        if pkt.seq().wrapping_sub(self.last_ack) > win {
            log::debug!(
                "dropping response #{} [expect: #{}, win: {win}]: {}",
                pkt.seq(),
                self.last_ack,
                PacketError::Seqnum
            );
            return Ok(());
        }
        // The link is alive.
        self.retry_count = 0;
        if pkt.timestamp() != PKT_TIMESTAMP {
            log::error!(
                "the receiver is corrupting the timestamp [expected: {PKT_TIMESTAMP:#010x}, received: {:#010x}]",
                pkt.timestamp()
            );
        }
        if self.last_win != pkt.window() {
            log::debug!("updating the send window: {} -> {}", self.last_win, pkt.window());
            self.last_win = pkt.window();
        }
        match pkt.kind() {
            PacketType::Nack => self.process_nack(pkt.seq()).await,
            _ if pkt.seq() == self.last_ack => self.process_dup_ack(pkt.seq()).await,
            _ => {
                self.process_ack(pkt.seq());
                Ok(())
            }
        }
    }

    /// Cumulatively acknowledges every chunk before `ack`.
    fn process_ack(&mut self, ack: u8) {
        log::debug!(
            "acknowledging {} packets [#{} -> #{}]",
            ack.wrapping_sub(self.last_ack),
            self.last_ack,
            ack
        );
        while self.last_ack != ack {
            self.buf.dequeue();
            self.last_ack = self.last_ack.wrapping_add(1);
        }
        self.dup_ack = 0;
    }

    /// Counts duplicate cumulative ACKs; the third in a row resends the
    /// oldest unacknowledged chunk.
    async fn process_dup_ack(&mut self, ack: u8) -> Result<(), TransferError> {
        self.dup_ack += 1;
        log::debug!("duplicate ACK #{ack} [{}/{MAX_DUP_ACK}]", self.dup_ack);
        if self.dup_ack == MAX_DUP_ACK {
            self.dup_ack = 0;
            log::debug!("fast retransmission for #{ack}");
            if let Some(pkt) = self.buf.first() {
                Self::send_pkt(&self.socket, pkt).await?;
            }
        }
        Ok(())
    }

    /// Retransmits exactly the chunk a NACK designates, if it is still
    /// buffered.
    async fn process_nack(&mut self, nack: u8) -> Result<(), TransferError> {
        log::debug!("received a NACK for #{nack}");
        match self.buf.iter().find(|pkt| pkt.seq() == nack) {
            Some(pkt) => Self::send_pkt(&self.socket, pkt).await?,
            None => log::debug!("no packet #{nack} left to retransmit"),
        }
        Ok(())
    }

    /// The retransmission timer expired: go-back-N over the whole
    /// in-flight span, from the cumulative ACK point to the last chunk
    /// handed to the network.
    async fn go_back_n(&mut self) -> Result<(), TransferError> {
        self.retry_count += 1;
        if self.retry_count > MAX_RETRANSMISSION {
            log::error!("too many consecutive retransmission timeouts, aborting transfer");
            return Err(TransferError::RetransmitLimit);
        }
        log::debug!(
            "retransmission timer expired, resending [#{} -> #{}]",
            self.last_ack,
            self.last_sent
        );
        let mut seq = self.last_ack;
        while seq != self.last_sent.wrapping_add(1) {
            let pkt = self.buf.slot_for_seq(seq);
            Self::send_pkt(&self.socket, pkt).await?;
            seq = seq.wrapping_add(1);
        }
        self.dup_ack = 0;
        Ok(())
    }

    /// Sends every queued chunk the advertised window has room for.
    async fn send_pending(&mut self) -> Result<(), TransferError> {
        while self.last_sent != self.last_chunk_read && self.can_send() {
            self.last_sent = self.last_sent.wrapping_add(1);
            let pkt = self.buf.slot_for_seq(self.last_sent);
            Self::send_pkt(&self.socket, pkt).await?;
        }
        Ok(())
    }

    /// Whether the receiver's window admits one more in-flight chunk.
    fn can_send(&self) -> bool {
        !self.buf.is_empty()
            && self.last_sent.wrapping_add(1).wrapping_sub(self.last_ack) < self.last_win
    }

    async fn send_pkt(socket: &UdpSocket, pkt: &Packet) -> io::Result<()> {
        socket.send(&pkt.encode()).await?;
        log::trace!("> #{}", pkt.seq());
        Ok(())
    }
}
