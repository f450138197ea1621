// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Per-call RTP plumbing: a receiver task that feeds caller audio into the
//! realtime session and a paced sender task that plays assistant audio back
//! to the PBX at the 20 ms ulaw cadence.

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const RTP_HEADER_LEN: usize = 12;
/// 160 ulaw samples per packet, 20 ms at 8 kHz
const SAMPLES_PER_PACKET: usize = 160;
const PACKET_INTERVAL: Duration = Duration::from_millis(20);

/// Upper bound on queued packets (60 s of audio); overflow drops oldest
const MAX_QUEUE_PACKETS: usize = 3000;
const MAX_SEND_ERROR_STREAK: u32 = 10;

/// Per-call UDP listener for the PBX's external media leg
///
/// Strips the 12-byte RTP header off every datagram and forwards the ulaw
/// payload into the session's caller-audio sink. The first datagram pins the
/// remote address the sender replies to.
pub struct RtpReceiver {
    port: u16,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RtpReceiver {
    /// Bind 127.0.0.1:`port` and start the receive task
    ///
    /// Returns the receiver and a watch with the learned remote address.
    pub async fn spawn(
        port: u16,
        sink: mpsc::UnboundedSender<Bytes>,
    ) -> Result<(Self, watch::Receiver<Option<SocketAddr>>)> {
        let socket = UdpSocket::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to bind RTP receiver on 127.0.0.1:{port}"))?;

        let port = socket.local_addr()?.port();

        let (source_tx, source_rx) = watch::channel(None);

        let task = tokio::spawn(recv_loop(socket, port, sink, source_tx));

        Ok((
            Self {
                port,
                task: Mutex::new(Some(task)),
            },
            source_rx,
        ))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the receive task and close the socket, idempotent
    pub async fn close(&self) {
        let task = self.task.lock().take();

        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn recv_loop(
    socket: UdpSocket,
    port: u16,
    sink: mpsc::UnboundedSender<Bytes>,
    source_tx: watch::Sender<Option<SocketAddr>>,
) {
    let mut buf = [0u8; 2048];
    let mut source_known = false;

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                if !source_known {
                    source_known = true;
                    log::debug!("first RTP datagram on port {port} from {addr}");
                    let _ = source_tx.send(Some(addr));
                }

                if len < RTP_HEADER_LEN {
                    continue;
                }

                // Header extensions are not parsed, the PBX sends plain headers
                if sink
                    .send(Bytes::copy_from_slice(&buf[RTP_HEADER_LEN..len]))
                    .is_err()
                {
                    // Session is gone, keep draining the socket until close
                    continue;
                }
            }
            Err(e) => {
                log::error!("RTP receive error on port {port}: {e}");
                break;
            }
        }
    }
}

struct SenderQueue {
    /// Ready-to-send 160 byte packets
    packets: VecDeque<Bytes>,
    /// Partial packet carried over until the next push
    remainder: Vec<u8>,
    /// Set on push, cleared when the drain edge fires
    had_audio: bool,
    overflow_warned: bool,
}

struct SenderShared {
    call_id: String,
    queue: Mutex<SenderQueue>,
    drained: Notify,
    drain_edges: AtomicU64,
    ended: AtomicBool,
}

/// Per-call paced RTP sender towards the PBX's external media leg
///
/// Accepts ulaw audio of any length, packetizes it and emits one packet per
/// 20 ms tick. Supports barge-in flush and notifies waiters once per drain
/// edge (queue transitioned from non-empty to empty).
pub struct RtpSender {
    shared: Arc<SenderShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RtpSender {
    /// Bind an ephemeral socket and start the pacing task
    ///
    /// `remote` carries the address learned by the call's [`RtpReceiver`];
    /// no packet leaves before it is known.
    pub async fn spawn(
        call_id: String,
        remote: watch::Receiver<Option<SocketAddr>>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0))
            .await
            .context("failed to bind RTP sender socket")?;

        let shared = Arc::new(SenderShared {
            call_id,
            queue: Mutex::new(SenderQueue {
                packets: VecDeque::new(),
                remainder: Vec::new(),
                had_audio: false,
                overflow_warned: false,
            }),
            drained: Notify::new(),
            drain_edges: AtomicU64::new(0),
            ended: AtomicBool::new(false),
        });

        let task = tokio::spawn(pace_loop(socket, shared.clone(), remote));

        Ok(Self {
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    /// Queue ulaw audio for playback, splitting it into 160 byte packets
    pub fn push(&self, audio: &[u8]) {
        if audio.is_empty() || self.shared.ended.load(Ordering::Acquire) {
            return;
        }

        let mut guard = self.shared.queue.lock();
        let queue = &mut *guard;

        queue.remainder.extend_from_slice(audio);

        let full = queue.remainder.len() - queue.remainder.len() % SAMPLES_PER_PACKET;
        for chunk in queue.remainder[..full].chunks_exact(SAMPLES_PER_PACKET) {
            queue.packets.push_back(Bytes::copy_from_slice(chunk));
        }
        queue.remainder.drain(..full);

        queue.had_audio = true;

        if queue.packets.len() > MAX_QUEUE_PACKETS {
            let excess = queue.packets.len() - MAX_QUEUE_PACKETS;
            queue.packets.drain(..excess);

            if !queue.overflow_warned {
                queue.overflow_warned = true;
                log::warn!(
                    "call {}: RTP send queue overflow, dropped {excess} oldest packets",
                    self.shared.call_id
                );
            }
        } else {
            queue.overflow_warned = false;
        }
    }

    /// Barge-in: drop everything that is queued but not yet sent
    pub fn stop_playback(&self) {
        let mut queue = self.shared.queue.lock();

        let dropped = queue.packets.len() * SAMPLES_PER_PACKET + queue.remainder.len();
        queue.packets.clear();
        queue.remainder.clear();

        if dropped > 0 {
            log::debug!(
                "call {}: barge-in, dropped {dropped} queued ulaw bytes",
                self.shared.call_id
            );
        }
    }

    /// Stop pacing and drop any queued audio, idempotent
    pub fn end(&self) {
        if self.shared.ended.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut queue = self.shared.queue.lock();
        queue.packets.clear();
        queue.remainder.clear();

        log::debug!("call {}: RTP sender ended", self.shared.call_id);
    }

    /// True when neither packets nor a partial packet are queued
    pub fn is_idle(&self) -> bool {
        let queue = self.shared.queue.lock();
        queue.packets.is_empty() && queue.remainder.is_empty()
    }

    pub fn drain_edges(&self) -> u64 {
        self.shared.drain_edges.load(Ordering::Acquire)
    }

    /// Wait until playback has drained
    ///
    /// Returns immediately when the queues are already empty.
    pub async fn wait_drained(&self) {
        let notified = self.shared.drained.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_idle() {
            return;
        }

        notified.await;
    }

    /// End pacing and close the socket
    pub async fn close(&self) {
        self.end();

        let task = self.task.lock().take();

        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn pace_loop(
    socket: UdpSocket,
    shared: Arc<SenderShared>,
    remote: watch::Receiver<Option<SocketAddr>>,
) {
    // Burst catch-up keeps the long-run rate at exactly one packet per 20 ms,
    // the next tick is computed from the target wall time, not `now + 20`
    let mut interval = tokio::time::interval(PACKET_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

    let (ssrc, mut sequence, mut timestamp): (u32, u16, u32) = {
        let mut rng = rand::thread_rng();
        (rng.gen(), rng.gen(), rng.gen())
    };
    let mut error_streak: u32 = 0;

    let mut packet = [0u8; RTP_HEADER_LEN + SAMPLES_PER_PACKET];
    packet[0] = 0x80; // V=2, no padding, no extension, no CSRC
    packet[1] = 0x00; // marker 0, payload type 0 (PCMU)
    packet[8..12].copy_from_slice(&ssrc.to_be_bytes());

    loop {
        interval.tick().await;

        if shared.ended.load(Ordering::Acquire) {
            break;
        }

        // Hold playback until the first inbound datagram has pinned the
        // PBX's address, guessing a destination would only feed the void
        let Some(remote_addr) = *remote.borrow() else {
            continue;
        };

        let payload = {
            let mut queue = shared.queue.lock();

            match queue.packets.pop_front() {
                Some(payload) => Some(payload),
                None => {
                    if queue.remainder.is_empty() && queue.had_audio {
                        queue.had_audio = false;
                        shared.drain_edges.fetch_add(1, Ordering::Release);
                        shared.drained.notify_waiters();
                        log::debug!("call {}: playback drained", shared.call_id);
                    }
                    None
                }
            }
        };

        let Some(payload) = payload else {
            continue;
        };

        packet[2..4].copy_from_slice(&sequence.to_be_bytes());
        packet[4..8].copy_from_slice(&timestamp.to_be_bytes());
        packet[RTP_HEADER_LEN..].copy_from_slice(&payload);

        sequence = sequence.wrapping_add(1);
        timestamp = timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);

        match socket.send_to(&packet, remote_addr).await {
            Ok(_) => error_streak = 0,
            Err(e) => {
                error_streak += 1;
                log::warn!("call {}: RTP send failed: {e}", shared.call_id);

                if error_streak >= MAX_SEND_ERROR_STREAK {
                    log::error!(
                        "call {}: closing RTP sender after {error_streak} consecutive send errors",
                        shared.call_id
                    );
                    shared.ended.store(true, Ordering::Release);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::time::timeout;

    fn rtp_datagram(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0u8; RTP_HEADER_LEN];
        datagram[0] = 0x80;
        datagram[1] = 0x00;
        datagram[2..4].copy_from_slice(&seq.to_be_bytes());
        datagram[4..8].copy_from_slice(&(u32::from(seq) * 160).to_be_bytes());
        datagram[8..12].copy_from_slice(&0x1234_5678u32.to_be_bytes());
        datagram.extend_from_slice(payload);
        datagram
    }

    #[tokio::test]
    async fn receiver_strips_header_and_learns_source() {
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let (receiver, mut source_rx) = RtpReceiver::spawn(0, sink_tx).await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = ("127.0.0.1", receiver.port());

        // Too short, must be dropped silently
        peer.send_to(&[0x80, 0x00, 0x01], target).await.unwrap();
        // Valid packet
        peer.send_to(&rtp_datagram(7, &[0x11, 0x22, 0x33]), target)
            .await
            .unwrap();

        let payload = timeout(Duration::from_secs(2), sink_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], &[0x11, 0x22, 0x33]);

        timeout(Duration::from_secs(2), source_rx.changed())
            .await
            .unwrap()
            .unwrap();
        let learned = source_rx.borrow().unwrap();
        assert_eq!(learned, peer.local_addr().unwrap());

        receiver.close().await;
        receiver.close().await;
    }

    #[tokio::test]
    async fn sender_paces_sequential_packets() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (remote_tx, remote_rx) = watch::channel(Some(peer.local_addr().unwrap()));

        let sender = RtpSender::spawn("test".into(), remote_rx).await.unwrap();

        let audio: Vec<u8> = (0..480).map(|i| (i % 251) as u8).collect();
        sender.push(&audio);

        let mut buf = [0u8; 2048];
        let mut last_seq = None;
        let mut last_ts = None;
        let mut last_ssrc = None;

        for i in 0..3 {
            let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();

            assert_eq!(len, RTP_HEADER_LEN + SAMPLES_PER_PACKET);
            assert_eq!(buf[0] >> 6, 2, "RTP version");
            assert_eq!(buf[1] & 0x7f, 0, "payload type PCMU");

            let seq = u16::from_be_bytes([buf[2], buf[3]]);
            let ts = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

            if let Some(prev) = last_seq {
                assert_eq!(seq, u16::wrapping_add(prev, 1));
            }
            if let Some(prev) = last_ts {
                assert_eq!(ts, u32::wrapping_add(prev, 160));
            }
            if let Some(prev) = last_ssrc {
                assert_eq!(ssrc, prev);
            }

            last_seq = Some(seq);
            last_ts = Some(ts);
            last_ssrc = Some(ssrc);

            assert_eq!(&buf[12..len], &audio[i * 160..(i + 1) * 160]);
        }

        drop(remote_tx);
        sender.close().await;
    }

    #[tokio::test]
    async fn sender_emits_drain_edge_once() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (_remote_tx, remote_rx) = watch::channel(Some(peer.local_addr().unwrap()));

        let sender = RtpSender::spawn("test".into(), remote_rx).await.unwrap();
        assert_eq!(sender.drain_edges(), 0);

        sender.push(&[0u8; 320]);
        timeout(Duration::from_secs(2), sender.wait_drained())
            .await
            .unwrap();

        // Give the pacer a few idle ticks, the edge must not re-fire
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sender.drain_edges(), 1);

        sender.push(&[0u8; 160]);
        timeout(Duration::from_secs(2), sender.wait_drained())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sender.drain_edges(), 2);

        sender.close().await;
    }

    #[tokio::test]
    async fn barge_in_flushes_queue_and_remainder() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (_remote_tx, remote_rx) = watch::channel(Some(peer.local_addr().unwrap()));

        let sender = RtpSender::spawn("test".into(), remote_rx).await.unwrap();

        // ~10 s of audio plus a partial packet
        sender.push(&vec![0u8; 80_000]);
        sender.push(&[0u8; 100]);
        assert!(!sender.is_idle());

        sender.stop_playback();
        assert!(sender.is_idle());

        // The flush is also a drain edge once the pacer ticks
        timeout(Duration::from_secs(2), sender.wait_drained())
            .await
            .unwrap();

        sender.close().await;
    }

    #[tokio::test]
    async fn leftover_bytes_wait_for_next_push() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (_remote_tx, remote_rx) = watch::channel(Some(peer.local_addr().unwrap()));

        let sender = RtpSender::spawn("test".into(), remote_rx).await.unwrap();

        sender.push(&[1u8; 100]);
        assert!(!sender.is_idle());

        // Completing the packet makes exactly one datagram
        sender.push(&[2u8; 60]);

        let mut buf = [0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(len, RTP_HEADER_LEN + SAMPLES_PER_PACKET);
        assert_eq!(&buf[12..112], &[1u8; 100][..]);
        assert_eq!(&buf[112..172], &[2u8; 60][..]);

        sender.close().await;
    }
}
