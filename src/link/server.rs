//! Machine-side link endpoint.
//!
//! Owns the transport, the streaming decoder and the outbound coalescing
//! queue. The supervisor polls it once per tick; decoded messages come
//! back as events, and the queue is drained towards the peer within a
//! small per-poll budget so a slow transport coalesces instead of
//! backlogging.
//!
//! The server also owns two pieces of protocol state:
//! - the `SystemInfo` handshake — sent exactly once, immediately after a
//!   client connects (well inside the 500 ms contract);
//! - the ping record — every received `Ping` stamps `last_ping_ms`, which
//!   the supervisor samples for its watchdog.

use log::{debug, info, warn};

use crate::config::PROTO_ERR_RECONNECT_PER_S;
use crate::error::{ErrorCode, LinkError, ProtoError};
use crate::link::codec::{encode_frame, DecodeEvent, FrameDecoder, MAX_FRAME_LEN};
use crate::link::messages::{Message, SystemInfo};
use crate::link::queue::CoalescingQueue;
use crate::link::transport::LinkTransport;

/// Frames drained from the outbound queue per poll.
const DRAIN_BUDGET: usize = 4;

/// Events surfaced to the machine supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A client connected; `SystemInfo` has been sent.
    Connected,
    /// The client went away.
    Disconnected,
    /// A decoded inbound message (pings are handled internally).
    Message(Message),
    /// One discarded inbound frame.
    Protocol(ProtoError),
    /// Protocol-error rate exceeded; the owner should reset the link.
    ResetRequested,
}

pub struct LinkServer<T: LinkTransport> {
    transport: T,
    decoder: FrameDecoder,
    queue: CoalescingQueue<Message>,
    seq: u16,
    system_info: SystemInfo,
    peer_was_connected: bool,
    last_ping_ms: Option<u64>,
    err_window_start_ms: u64,
    errs_in_window: u32,
}

impl<T: LinkTransport> LinkServer<T> {
    pub fn new(transport: T, system_info: SystemInfo) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(),
            queue: CoalescingQueue::new(),
            seq: 0,
            system_info,
            peer_was_connected: false,
            last_ping_ms: None,
            err_window_start_ms: 0,
            errs_in_window: 0,
        }
    }

    pub fn connected(&self) -> bool {
        self.transport.connected()
    }

    /// Milliseconds since the last received ping, if any client has ever
    /// pinged this connection.
    pub fn ping_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_ping_ms.map(|t| now_ms.saturating_sub(t))
    }

    /// Poll the transport: handle connection edges, decode inbound bytes
    /// and drain the outbound queue.
    pub fn poll(&mut self, now_ms: u64) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        let connected = self.transport.connected();
        if connected && !self.peer_was_connected {
            info!("link: client connected");
            self.decoder.reset();
            self.queue.clear();
            // The client may not ping until it has seen SystemInfo; start
            // the watchdog clock at the connection instant.
            self.last_ping_ms = Some(now_ms);
            if let Err(e) = self.send_now(&Message::SystemInfo(self.system_info.clone())) {
                warn!("link: system info send failed: {e}");
            }
            events.push(ServerEvent::Connected);
        } else if !connected && self.peer_was_connected {
            info!("link: client disconnected");
            self.decoder.reset();
            self.queue.clear();
            events.push(ServerEvent::Disconnected);
        }
        self.peer_was_connected = connected;

        if connected {
            self.read_inbound(now_ms, &mut events);
            self.drain_outbound();
        }

        events
    }

    /// Send a message immediately, bypassing the queue. Used for frames
    /// that must never coalesce (`SystemInfo`, `Error`, `AutotuneResult`).
    pub fn send_now(&mut self, msg: &Message) -> Result<(), LinkError> {
        if !self.transport.connected() {
            return Err(LinkError::NotConnected);
        }
        let mut buf = [0u8; MAX_FRAME_LEN];
        self.seq = self.seq.wrapping_add(1);
        let n = encode_frame(msg, self.seq, &mut buf).map_err(LinkError::Proto)?;
        self.transport.send(&buf[..n]).map_err(|_| {
            warn!("link: send failed ({})", ErrorCode::CommSend);
            LinkError::SendFailed
        })
    }

    /// Queue a message, coalescing with any queued message of the same
    /// type. Returns `false` when the queue is full and the type absent.
    pub fn enqueue(&mut self, msg: Message) -> bool {
        let ty = msg.message_type();
        self.queue.upsert(ty, ty.priority(), msg)
    }

    // ── Internal ──────────────────────────────────────────────

    fn read_inbound(&mut self, now_ms: u64, events: &mut Vec<ServerEvent>) {
        let mut buf = [0u8; 64];
        loop {
            let n = self.transport.recv(&mut buf);
            if n == 0 {
                break;
            }
            let mut ping_seen = false;
            let mut decoded: Vec<Result<Message, ProtoError>> = Vec::new();
            self.decoder.feed(&buf[..n], |ev| match ev {
                DecodeEvent::Frame { ty, payload, .. } => {
                    decoded.push(Message::decode_payload(ty, payload));
                }
                DecodeEvent::Error(e) => decoded.push(Err(e)),
            });
            for item in decoded {
                match item {
                    Ok(Message::Ping) => {
                        debug!("link: ping");
                        ping_seen = true;
                    }
                    Ok(msg) => events.push(ServerEvent::Message(msg)),
                    Err(e) => {
                        warn!("link: inbound frame discarded: {e}");
                        if self.note_proto_error(now_ms) {
                            events.push(ServerEvent::ResetRequested);
                        }
                        events.push(ServerEvent::Protocol(e));
                    }
                }
            }
            if ping_seen {
                self.last_ping_ms = Some(now_ms);
            }
        }
    }

    fn drain_outbound(&mut self) {
        for _ in 0..DRAIN_BUDGET {
            let Some(entry) = self.queue.pop() else {
                break;
            };
            if let Err(e) = self.send_now(&entry.payload) {
                warn!("link: outbound {:?} dropped: {e}", entry.key);
                break;
            }
        }
    }

    /// Track the protocol-error rate; true when it crossed the
    /// reconnect threshold this second.
    fn note_proto_error(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.err_window_start_ms) >= 1_000 {
            self.err_window_start_ms = now_ms;
            self.errs_in_window = 0;
        }
        self.errs_in_window += 1;
        self.errs_in_window == PROTO_ERR_RECONNECT_PER_S + 1
    }
}

// ── Tests ────────────────────────────────────────────────────
