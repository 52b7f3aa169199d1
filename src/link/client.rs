//! Display-side link endpoint.
//!
//! Mirror of [`LinkServer`](crate::link::server::LinkServer) with the
//! client-side protocol obligations:
//!
//! - a connection only counts once `SystemInfo` has arrived; until then
//!   the client refuses to emit anything but `Ping`;
//! - every received frame stamps `last_frame_ms`; 30 s of silence on a
//!   live transport reports the link dead so the owner tears down and
//!   re-scans;
//! - `Tare` is never queued — it always goes out as a distinct frame.

use log::{info, warn};

use crate::config::LINK_IDLE_TIMEOUT_MS;
use crate::error::{LinkError, ProtoError};
use crate::link::codec::{encode_frame, DecodeEvent, FrameDecoder, MAX_FRAME_LEN};
use crate::link::messages::{Message, MessageType, SystemInfo};
use crate::link::queue::CoalescingQueue;
use crate::link::transport::LinkTransport;

/// Frames drained from the outbound queue per poll.
const DRAIN_BUDGET: usize = 4;

/// Events surfaced to the display supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Transport came up; handshake pending.
    Connected,
    /// Handshake complete; control traffic may start.
    Ready(SystemInfo),
    /// A decoded inbound message.
    Message(Message),
    /// One discarded inbound frame.
    Protocol(ProtoError),
    /// 30 s of silence on a live transport; owner should re-scan.
    LinkDead,
    /// Transport went down.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Idle,
    AwaitingInfo,
    Ready,
}

pub struct LinkClient<T: LinkTransport> {
    transport: T,
    decoder: FrameDecoder,
    queue: CoalescingQueue<Message>,
    seq: u16,
    state: HandshakeState,
    peer_was_connected: bool,
    last_frame_ms: u64,
    link_dead_reported: bool,
}

impl<T: LinkTransport> LinkClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(),
            queue: CoalescingQueue::new(),
            seq: 0,
            state: HandshakeState::Idle,
            peer_was_connected: false,
            last_frame_ms: 0,
            link_dead_reported: false,
        }
    }

    pub fn connected(&self) -> bool {
        self.transport.connected()
    }

    /// Handshake complete: `SystemInfo` received on this connection.
    pub fn ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// Poll the transport: connection edges, inbound decode, liveness
    /// check, outbound drain.
    pub fn poll(&mut self, now_ms: u64) -> Vec<ClientEvent> {
        let mut events = Vec::new();

        let connected = self.transport.connected();
        if connected && !self.peer_was_connected {
            info!("link: connected, awaiting system info");
            self.decoder.reset();
            self.queue.clear();
            self.state = HandshakeState::AwaitingInfo;
            self.last_frame_ms = now_ms;
            self.link_dead_reported = false;
            events.push(ClientEvent::Connected);
        } else if !connected && self.peer_was_connected {
            info!("link: disconnected");
            self.decoder.reset();
            self.queue.clear();
            self.state = HandshakeState::Idle;
            events.push(ClientEvent::Disconnected);
        }
        self.peer_was_connected = connected;

        if connected {
            self.read_inbound(now_ms, &mut events);

            if !self.link_dead_reported
                && now_ms.saturating_sub(self.last_frame_ms) > LINK_IDLE_TIMEOUT_MS
            {
                warn!("link: no frames for {LINK_IDLE_TIMEOUT_MS} ms, reporting dead link");
                self.link_dead_reported = true;
                events.push(ClientEvent::LinkDead);
            }

            if self.ready() {
                self.drain_outbound();
            }
        }

        events
    }

    /// Send a ping. The only message allowed before the handshake
    /// completes.
    pub fn ping(&mut self) -> Result<(), LinkError> {
        self.send_raw(&Message::Ping)
    }

    /// Send a message immediately, bypassing the queue. `Tare` must use
    /// this path — it is never coalesced.
    pub fn send_now(&mut self, msg: &Message) -> Result<(), LinkError> {
        if !self.ready() {
            return Err(LinkError::NotConnected);
        }
        self.send_raw(msg)
    }

    /// Queue a message, coalescing by type. Refused before the handshake.
    pub fn enqueue(&mut self, msg: Message) -> Result<(), LinkError> {
        if !self.ready() {
            return Err(LinkError::NotConnected);
        }
        debug_assert!(
            msg.message_type() != MessageType::Tare,
            "tare is never coalesced"
        );
        let ty = msg.message_type();
        if self.queue.upsert(ty, ty.priority(), msg) {
            Ok(())
        } else {
            Err(LinkError::QueueFull)
        }
    }

    // ── Internal ──────────────────────────────────────────────

    fn send_raw(&mut self, msg: &Message) -> Result<(), LinkError> {
        if !self.transport.connected() {
            return Err(LinkError::NotConnected);
        }
        let mut buf = [0u8; MAX_FRAME_LEN];
        self.seq = self.seq.wrapping_add(1);
        let n = encode_frame(msg, self.seq, &mut buf).map_err(LinkError::Proto)?;
        self.transport.send(&buf[..n]).map_err(|_| LinkError::SendFailed)
    }

    fn read_inbound(&mut self, now_ms: u64, events: &mut Vec<ClientEvent>) {
        let mut buf = [0u8; 64];
        loop {
            let n = self.transport.recv(&mut buf);
            if n == 0 {
                break;
            }
            self.last_frame_ms = now_ms;
            self.link_dead_reported = false;

            let mut decoded: Vec<Result<Message, ProtoError>> = Vec::new();
            self.decoder.feed(&buf[..n], |ev| match ev {
                DecodeEvent::Frame { ty, payload, .. } => {
                    decoded.push(Message::decode_payload(ty, payload));
                }
                DecodeEvent::Error(e) => decoded.push(Err(e)),
            });
            for item in decoded {
                match item {
                    Ok(Message::SystemInfo(si)) => {
                        info!(
                            "link: system info: {} {} (dimming={}, pressure={})",
                            si.hardware, si.version, si.capabilities.dimming,
                            si.capabilities.pressure
                        );
                        self.state = HandshakeState::Ready;
                        events.push(ClientEvent::Ready(si));
                    }
                    Ok(msg) => events.push(ClientEvent::Message(msg)),
                    Err(e) => {
                        warn!("link: inbound frame discarded: {e}");
                        events.push(ClientEvent::Protocol(e));
                    }
                }
            }
        }
    }

    fn drain_outbound(&mut self) {
        for _ in 0..DRAIN_BUDGET {
            let Some(entry) = self.queue.pop() else {
                break;
            };
            if let Err(e) = self.send_raw(&entry.payload) {
                warn!("link: outbound {:?} dropped: {e}", entry.key);
                break;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
