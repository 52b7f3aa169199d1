//! Transport abstraction — any ordered byte channel.
//!
//! The source hardware speaks BLE GATT (notify + write); the core only
//! needs an ordered, reliable-while-connected byte stream with an MTU of
//! at least 256 bytes. Wire technology stays outside the crate; the
//! endpoints are generic over `LinkTransport`, so swapping BLE for serial
//! or TCP touches zero protocol logic.
//!
//! `MemoryLink` provides a lossless in-memory duplex pair for the
//! simulator and tests, including mid-stream disconnects.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::LinkError;

/// Ordered byte-stream channel between the two nodes.
pub trait LinkTransport {
    /// Queue `data` for the peer. Fails when disconnected or the
    /// transport rejects the write.
    fn send(&mut self, data: &[u8]) -> Result<(), LinkError>;

    /// Non-blocking read of up to `buf.len()` bytes. Returns the number
    /// of bytes read; 0 when nothing is pending.
    fn recv(&mut self, buf: &mut [u8]) -> usize;

    /// Whether a peer is currently connected.
    fn connected(&self) -> bool;
}

// ── In-memory duplex pair ────────────────────────────────────

#[derive(Default)]
struct Shared {
    /// a → b byte stream.
    a_to_b: VecDeque<u8>,
    /// b → a byte stream.
    b_to_a: VecDeque<u8>,
    connected: bool,
}

/// One endpoint of an in-memory duplex link.
///
/// Cloning yields another handle to the same endpoint — tests use this
/// to inject raw bytes alongside a supervisor-owned transport.
#[derive(Clone)]
pub struct MemoryLink {
    shared: Arc<Mutex<Shared>>,
    /// True for the endpoint writing `a_to_b`.
    is_a: bool,
}

impl MemoryLink {
    /// Create a connected endpoint pair.
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let shared = Arc::new(Mutex::new(Shared {
            connected: true,
            ..Shared::default()
        }));
        (
            MemoryLink {
                shared: Arc::clone(&shared),
                is_a: true,
            },
            MemoryLink {
                shared,
                is_a: false,
            },
        )
    }

    /// Drop the connection and discard anything in flight, as a radio
    /// disconnect would.
    pub fn sever(&self) {
        let mut s = self.lock();
        s.connected = false;
        s.a_to_b.clear();
        s.b_to_a.clear();
    }

    /// Re-establish the connection.
    pub fn restore(&self) {
        self.lock().connected = true;
    }

    /// Bytes currently queued towards this endpoint's peer.
    pub fn pending_to_peer(&self) -> usize {
        let s = self.lock();
        if self.is_a {
            s.a_to_b.len()
        } else {
            s.b_to_a.len()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LinkTransport for MemoryLink {
    fn send(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let mut s = self.lock();
        if !s.connected {
            return Err(LinkError::NotConnected);
        }
        let queue = if self.is_a {
            &mut s.a_to_b
        } else {
            &mut s.b_to_a
        };
        queue.extend(data.iter().copied());
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let mut s = self.lock();
        if !s.connected {
            return 0;
        }
        let queue = if self.is_a {
            &mut s.b_to_a
        } else {
            &mut s.a_to_b
        };
        let mut n = 0;
        while n < buf.len() {
            match queue.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn connected(&self) -> bool {
        self.lock().connected
    }
}

/// A transport with no peer: writes fail, reads return nothing.
pub struct NullTransport;

impl LinkTransport for NullTransport {
    fn send(&mut self, _data: &[u8]) -> Result<(), LinkError> {
        Err(LinkError::NotConnected)
    }

    fn recv(&mut self, _buf: &mut [u8]) -> usize {
        0
    }

    fn connected(&self) -> bool {
        false
    }
}

// ── Tests ────────────────────────────────────────────────────
