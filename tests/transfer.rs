//! End-to-end transfers over loopback sockets, including lossy and
//! truncating middleboxes.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

use trtp::buffer::PacketBuffer;
use trtp::receiver::ReceiverEngine;
use trtp::sender::SenderEngine;
use trtp::{Packet, PacketType, TransferError, MAX_PACKET_LEN, MAX_WINDOW, PKT_TIMESTAMP};

/// Patterned test payload; long enough to exercise several chunks when
/// asked for.
fn stream(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Runs a complete transfer over a direct loopback path.
async fn transfer(data: &[u8], buf_slots: u32, max_window: u8) -> Vec<u8> {
    let recv_socket = UdpSocket::bind("[::1]:0").await.unwrap();
    let recv_addr = recv_socket.local_addr().unwrap();
    let send_socket = UdpSocket::bind("[::1]:0").await.unwrap();
    send_socket.connect(recv_addr).await.unwrap();

    let mut sender = SenderEngine::new(
        send_socket,
        Cursor::new(data.to_vec()),
        PacketBuffer::new(buf_slots),
    );
    let mut output = Cursor::new(Vec::new());
    let mut receiver = ReceiverEngine::new(recv_socket, &mut output, max_window);

    let (sent, received) = timeout(Duration::from_secs(60), async {
        tokio::join!(sender.run(), receiver.run())
    })
    .await
    .expect("transfer timed out");
    sent.unwrap();
    received.unwrap();

    drop(receiver);
    output.into_inner()
}

/// Datagram filter applied by the proxy. `upstream` is true for
/// sender-to-receiver traffic. Returning `None` drops the datagram.
type Mangle = Box<dyn FnMut(bool, &[u8]) -> Option<Vec<u8>> + Send>;

/// Runs a complete transfer through a mangling middlebox.
async fn transfer_through_proxy(data: &[u8], mut mangle: Mangle) -> Vec<u8> {
    let recv_socket = UdpSocket::bind("[::1]:0").await.unwrap();
    let recv_addr = recv_socket.local_addr().unwrap();

    let facing_sender = UdpSocket::bind("[::1]:0").await.unwrap();
    let proxy_addr = facing_sender.local_addr().unwrap();
    let facing_receiver = UdpSocket::bind("[::1]:0").await.unwrap();
    facing_receiver.connect(recv_addr).await.unwrap();

    let proxy = tokio::spawn(async move {
        let mut sender_addr = None;
        let mut up = [0u8; MAX_PACKET_LEN];
        let mut down = [0u8; MAX_PACKET_LEN];
        loop {
            tokio::select! {
                received = facing_sender.recv_from(&mut up) => {
                    let (len, addr) = received.unwrap();
                    sender_addr = Some(addr);
                    if let Some(bytes) = mangle(true, &up[..len]) {
                        facing_receiver.send(&bytes).await.unwrap();
                    }
                }
                received = facing_receiver.recv(&mut down) => {
                    let len = received.unwrap();
                    if let (Some(addr), Some(bytes)) = (sender_addr, mangle(false, &down[..len])) {
                        facing_sender.send_to(&bytes, addr).await.unwrap();
                    }
                }
            }
        }
    });

    let send_socket = UdpSocket::bind("[::1]:0").await.unwrap();
    send_socket.connect(proxy_addr).await.unwrap();

    let mut sender = SenderEngine::new(
        send_socket,
        Cursor::new(data.to_vec()),
        PacketBuffer::new(32),
    );
    let mut output = Cursor::new(Vec::new());
    let mut receiver = ReceiverEngine::new(recv_socket, &mut output, MAX_WINDOW);

    let (sent, received) = timeout(Duration::from_secs(60), async {
        tokio::join!(sender.run(), receiver.run())
    })
    .await
    .expect("transfer timed out");
    sent.unwrap();
    received.unwrap();
    proxy.abort();

    drop(receiver);
    output.into_inner()
}

#[tokio::test]
async fn empty_file() {
    assert_eq!(transfer(b"", 32, MAX_WINDOW).await, b"");
}

#[tokio::test]
async fn single_chunk() {
    let data = stream(100);
    assert_eq!(transfer(&data, 32, MAX_WINDOW).await, data);
}

#[tokio::test]
async fn chunk_sized_file() {
    // Exactly one full chunk; the terminal packet still follows.
    let data = stream(512);
    assert_eq!(transfer(&data, 32, MAX_WINDOW).await, data);
}

#[tokio::test]
async fn multi_chunk_file() {
    let data = stream(8000);
    assert_eq!(transfer(&data, 32, MAX_WINDOW).await, data);
}

#[tokio::test]
async fn tiny_receive_window() {
    let data = stream(5000);
    assert_eq!(transfer(&data, 32, 2).await, data);
}

#[tokio::test]
async fn tiny_send_buffer() {
    let data = stream(5000);
    assert_eq!(transfer(&data, 4, MAX_WINDOW).await, data);
}

#[tokio::test]
async fn recovers_from_lost_chunks_and_acks() {
    let data = stream(8000);
    let mut lost_chunks: HashSet<u8> = [2u8, 5, 9].into_iter().collect();
    let mut lost_ack = false;
    let mangle: Mangle = Box::new(move |upstream, bytes| {
        if upstream {
            if let Ok(pkt) = Packet::decode(bytes) {
                if pkt.kind() == PacketType::Data && lost_chunks.remove(&pkt.seq()) {
                    return None;
                }
            }
        } else if !lost_ack {
            lost_ack = true;
            return None;
        }
        Some(bytes.to_vec())
    });
    assert_eq!(transfer_through_proxy(&data, mangle).await, data);
}

#[tokio::test]
async fn recovers_from_a_truncating_middlebox() {
    let data = stream(4000);
    let truncated = Arc::new(AtomicBool::new(false));
    let flag = truncated.clone();
    let mangle: Mangle = Box::new(move |upstream, bytes| {
        if upstream {
            if let Ok(pkt) = Packet::decode(bytes) {
                if pkt.kind() == PacketType::Data
                    && pkt.seq() == 3
                    && pkt.length() > 0
                    && !flag.swap(true, Ordering::Relaxed)
                {
                    let mut stripped = Packet::data(pkt.seq(), pkt.timestamp(), &[]);
                    stripped.set_tr(true).unwrap();
                    return Some(stripped.encode());
                }
            }
        }
        Some(bytes.to_vec())
    });
    assert_eq!(transfer_through_proxy(&data, mangle).await, data);
    assert!(truncated.load(Ordering::Relaxed));
}

#[tokio::test]
async fn survives_a_randomly_lossy_channel() {
    let data = stream(3000);
    let mut rng = StdRng::seed_from_u64(0x1341);
    // Each distinct datagram can be lost once, so retransmissions always
    // get through and the transfer is guaranteed to converge.
    let mut already_lost: HashSet<Vec<u8>> = HashSet::new();
    let mangle: Mangle = Box::new(move |_, bytes| {
        if rng.gen_bool(0.2) && already_lost.insert(bytes.to_vec()) {
            return None;
        }
        Some(bytes.to_vec())
    });
    assert_eq!(transfer_through_proxy(&data, mangle).await, data);
}

#[tokio::test]
async fn fast_retransmit_skips_the_timeout() {
    let data = stream(8000);
    let resent = Arc::new(AtomicUsize::new(0));
    let counter = resent.clone();
    let mut seen: HashSet<u8> = HashSet::new();
    let mangle: Mangle = Box::new(move |upstream, bytes| {
        if upstream {
            if let Ok(pkt) = Packet::decode(bytes) {
                if pkt.kind() == PacketType::Data {
                    if !seen.insert(pkt.seq()) {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    if pkt.seq() == 4 && seen.len() == 5 {
                        // First transmission of chunk 4 vanishes.
                        return None;
                    }
                }
            }
        }
        Some(bytes.to_vec())
    });
    let started = std::time::Instant::now();
    assert_eq!(transfer_through_proxy(&data, mangle).await, data);
    // Duplicate ACKs for the lost chunk must have triggered a fast
    // retransmit before the 4s retransmission timer; the bound leaves
    // room for the receiver's 3s linger.
    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(resent.load(Ordering::Relaxed) >= 1);
}

#[tokio::test(start_paused = true)]
async fn sender_gives_up_on_a_silent_peer() {
    let blackhole = UdpSocket::bind("[::1]:0").await.unwrap();
    let socket = UdpSocket::bind("[::1]:0").await.unwrap();
    socket.connect(blackhole.local_addr().unwrap()).await.unwrap();

    let mut sender = SenderEngine::new(socket, Cursor::new(stream(100)), PacketBuffer::new(8));
    assert!(matches!(
        sender.run().await,
        Err(TransferError::RetransmitLimit)
    ));
}

#[tokio::test(start_paused = true)]
async fn receiver_gives_up_on_a_vanished_sender() {
    let socket = UdpSocket::bind("[::1]:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let peer = UdpSocket::bind("[::1]:0").await.unwrap();
    peer.send_to(&Packet::data(0, PKT_TIMESTAMP, b"hello").encode(), addr)
        .await
        .unwrap();

    let mut output = Cursor::new(Vec::new());
    let mut receiver = ReceiverEngine::new(socket, &mut output, MAX_WINDOW);
    assert!(matches!(
        receiver.run().await,
        Err(TransferError::IdleTimeout)
    ));
    drop(receiver);
    // The chunk was still delivered before the abort.
    assert_eq!(output.into_inner(), b"hello");
}

#[tokio::test]
async fn linger_reanswers_the_final_ack() {
    let socket = UdpSocket::bind("[::1]:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let peer = UdpSocket::bind("[::1]:0").await.unwrap();

    let mut output = Cursor::new(Vec::new());
    let mut receiver = ReceiverEngine::new(socket, &mut output, MAX_WINDOW);

    let terminal = Packet::data(0, PKT_TIMESTAMP, &[]).encode();
    let script = async {
        let mut wire = [0u8; MAX_PACKET_LEN];
        peer.send_to(&terminal, addr).await.unwrap();
        let (len, _) = peer.recv_from(&mut wire).await.unwrap();
        let ack = Packet::decode(&wire[..len]).unwrap();
        assert_eq!(ack.kind(), PacketType::Ack);
        assert_eq!(ack.seq(), 1);

        // The ACK "was lost": the sender tries again and must get the
        // same answer from the lingering receiver.
        peer.send_to(&terminal, addr).await.unwrap();
        let (len, _) = peer.recv_from(&mut wire).await.unwrap();
        let ack = Packet::decode(&wire[..len]).unwrap();
        assert_eq!(ack.kind(), PacketType::Ack);
        assert_eq!(ack.seq(), 1);
    };

    let (received, ()) = timeout(Duration::from_secs(30), async {
        tokio::join!(receiver.run(), script)
    })
    .await
    .expect("linger test timed out");
    received.unwrap();
}
