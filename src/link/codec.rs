//! Length-prefix frame codec.
//!
//! Wire format (little-endian):
//! ```text
//! ┌───────────┬──────────┬──────────┬─────────────────┬──────────┐
//! │ len (2B)  │ type (1B)│ seq (2B) │ payload (len B) │ pad (2B) │
//! └───────────┴──────────┴──────────┴─────────────────┴──────────┘
//! ```
//! Total frame size is `5 + len + 2` bytes. The two trailing bytes are
//! written as zero and ignored on receive. Sequence numbers are advisory;
//! the transport is ordered, so they never gate delivery.
//!
//! The decoder is a streaming byte assembler — partial feeds are fine —
//! but carries no state across frames. A frame with a bad type or payload
//! is consumed in full (the declared length is still trusted for
//! resynchronisation) and surfaces as a `ProtoError`; only an oversized
//! length forces an immediate resync at the next byte.

use crate::error::ProtoError;
use crate::link::messages::{Message, MessageType};

/// Transport MTU. Frames above this are rejected outright.
pub const MTU: usize = 256;

/// Frame header: 2-byte length + 1-byte type + 2-byte sequence.
pub const HEADER_LEN: usize = 5;

/// Trailing pad bytes.
pub const TRAILER_LEN: usize = 2;

/// Encode buffer budget; no core message needs more.
pub const MAX_FRAME_LEN: usize = 128;

/// Largest accepted payload.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN - TRAILER_LEN;

// ── Encoder ──────────────────────────────────────────────────

/// Encode `msg` with the given sequence number into `out`.
///
/// `out` must hold at least [`MAX_FRAME_LEN`] bytes. Returns the total
/// frame length.
pub fn encode_frame(msg: &Message, seq: u16, out: &mut [u8]) -> Result<usize, ProtoError> {
    if out.len() < MAX_FRAME_LEN {
        return Err(ProtoError::EncodeOverflow);
    }

    let payload_len = {
        let payload_buf = &mut out[HEADER_LEN..HEADER_LEN + MAX_PAYLOAD_LEN];
        msg.encode_payload(payload_buf)?
    };

    out[0..2].copy_from_slice(&(payload_len as u16).to_le_bytes());
    out[2] = msg.message_type() as u8;
    out[3..5].copy_from_slice(&seq.to_le_bytes());
    out[HEADER_LEN + payload_len] = 0;
    out[HEADER_LEN + payload_len + 1] = 0;

    Ok(HEADER_LEN + payload_len + TRAILER_LEN)
}

// ── Decoder ──────────────────────────────────────────────────

/// One event produced by [`FrameDecoder::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeEvent<'a> {
    /// A complete, type-valid frame. The payload is raw; decode it with
    /// [`Message::decode_payload`].
    Frame {
        ty: MessageType,
        seq: u16,
        payload: &'a [u8],
    },
    /// One discarded frame. The stream continues at the next header.
    Error(ProtoError),
}

enum DecoderState {
    ReadingHeader {
        collected: usize,
    },
    ReadingPayload {
        expected: usize,
        collected: usize,
        ty_raw: u8,
        seq: u16,
    },
    ReadingTrailer {
        remaining: usize,
        ty_raw: u8,
        seq: u16,
        payload_len: usize,
    },
}

/// Streaming frame decoder.
pub struct FrameDecoder {
    state: DecoderState,
    header_buf: [u8; HEADER_LEN],
    payload_buf: [u8; MAX_PAYLOAD_LEN],
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::ReadingHeader { collected: 0 },
            header_buf: [0; HEADER_LEN],
            payload_buf: [0; MAX_PAYLOAD_LEN],
        }
    }

    /// Feed bytes into the decoder, invoking `on_event` for every frame
    /// or per-frame error they complete.
    pub fn feed(&mut self, data: &[u8], mut on_event: impl FnMut(DecodeEvent<'_>)) {
        let mut offset = 0;

        while offset < data.len() {
            match &mut self.state {
                DecoderState::ReadingHeader { collected } => {
                    let needed = HEADER_LEN - *collected;
                    let to_copy = needed.min(data.len() - offset);

                    self.header_buf[*collected..*collected + to_copy]
                        .copy_from_slice(&data[offset..offset + to_copy]);
                    *collected += to_copy;
                    offset += to_copy;

                    if *collected == HEADER_LEN {
                        let len =
                            u16::from_le_bytes([self.header_buf[0], self.header_buf[1]]) as usize;
                        let ty_raw = self.header_buf[2];
                        let seq = u16::from_le_bytes([self.header_buf[3], self.header_buf[4]]);

                        if len > MAX_PAYLOAD_LEN || HEADER_LEN + len + TRAILER_LEN > MTU {
                            // The length cannot be trusted, so the frame
                            // boundary is lost. Resync at the next byte.
                            self.state = DecoderState::ReadingHeader { collected: 0 };
                            on_event(DecodeEvent::Error(ProtoError::Oversize));
                            continue;
                        }

                        self.state = if len == 0 {
                            DecoderState::ReadingTrailer {
                                remaining: TRAILER_LEN,
                                ty_raw,
                                seq,
                                payload_len: 0,
                            }
                        } else {
                            DecoderState::ReadingPayload {
                                expected: len,
                                collected: 0,
                                ty_raw,
                                seq,
                            }
                        };
                    }
                }

                DecoderState::ReadingPayload {
                    expected,
                    collected,
                    ty_raw,
                    seq,
                } => {
                    let needed = *expected - *collected;
                    let to_copy = needed.min(data.len() - offset);

                    self.payload_buf[*collected..*collected + to_copy]
                        .copy_from_slice(&data[offset..offset + to_copy]);
                    *collected += to_copy;
                    offset += to_copy;

                    if *collected == *expected {
                        self.state = DecoderState::ReadingTrailer {
                            remaining: TRAILER_LEN,
                            ty_raw: *ty_raw,
                            seq: *seq,
                            payload_len: *expected,
                        };
                    }
                }

                DecoderState::ReadingTrailer {
                    remaining,
                    ty_raw,
                    seq,
                    payload_len,
                } => {
                    // Trailer bytes are consumed and ignored.
                    let to_skip = (*remaining).min(data.len() - offset);
                    *remaining -= to_skip;
                    offset += to_skip;

                    if *remaining == 0 {
                        let ty_raw = *ty_raw;
                        let seq = *seq;
                        let payload_len = *payload_len;
                        self.state = DecoderState::ReadingHeader { collected: 0 };

                        match MessageType::from_u8(ty_raw) {
                            Some(ty) => on_event(DecodeEvent::Frame {
                                ty,
                                seq,
                                payload: &self.payload_buf[..payload_len],
                            }),
                            None => on_event(DecodeEvent::Error(ProtoError::UnknownType)),
                        }
                    }
                }
            }
        }
    }

    /// Reset decoder state, e.g. after a transport reconnect.
    pub fn reset(&mut self) {
        self.state = DecoderState::ReadingHeader { collected: 0 };
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::link::messages::{OutputControl, OutputMode, PidSettings, SensorData};

    fn collect(dec: &mut FrameDecoder, data: &[u8]) -> Vec<Result<Message, ProtoError>> {
        let mut out = Vec::new();
        dec.feed(data, |ev| match ev {
            DecodeEvent::Frame { ty, payload, .. } => {
                out.push(Message::decode_payload(ty, payload));
            }
            DecodeEvent::Error(e) => out.push(Err(e)),
        });
        out
    }

    fn sample_control() -> Message {
        Message::OutputControl(OutputControl {
            mode: OutputMode::Basic,
            valve_open: true,
            boiler_setpoint_c: 93.0,
            pump_setpoint_pct: 100.0,
            advanced: None,
        })
    }

    #[test]
    fn roundtrip() {
        let msg = sample_control();
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = encode_frame(&msg, 7, &mut buf).unwrap();

        let mut dec = FrameDecoder::new();
        let mut seqs = Vec::new();
        let mut msgs = Vec::new();
        dec.feed(&buf[..n], |ev| {
            if let DecodeEvent::Frame { ty, seq, payload } = ev {
                seqs.push(seq);
                msgs.push(Message::decode_payload(ty, payload).unwrap());
            }
        });
        assert_eq!(msgs, vec![msg]);
        assert_eq!(seqs, vec![7]);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = encode_frame(&Message::Ping, 1, &mut buf).unwrap();
        assert_eq!(n, HEADER_LEN + TRAILER_LEN);

        let mut dec = FrameDecoder::new();
        assert_eq!(collect(&mut dec, &buf[..n]), vec![Ok(Message::Ping)]);
    }

    #[test]
    fn partial_feed() {
        let msg = Message::PidSettings(PidSettings {
            kp: 2.0,
            ki: 0.1,
            kd: 0.0,
        });
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = encode_frame(&msg, 3, &mut buf).unwrap();

        let mut dec = FrameDecoder::new();
        for split in 1..n - 1 {
            dec.reset();
            let mut got = Vec::new();
            dec.feed(&buf[..split], |ev| got.push(format!("{ev:?}")));
            assert!(got.is_empty(), "no event before the frame completes");
            assert_eq!(collect(&mut dec, &buf[split..n]), vec![Ok(msg.clone())]);
        }
    }

    #[test]
    fn multiple_frames_one_feed() {
        let m1 = sample_control();
        let m2 = Message::Error(ErrorCode::Runaway);
        let mut buf = [0u8; 2 * MAX_FRAME_LEN];
        let n1 = encode_frame(&m1, 1, &mut buf[..MAX_FRAME_LEN]).unwrap();
        let n2 = encode_frame(&m2, 2, &mut buf[n1..n1 + MAX_FRAME_LEN]).unwrap();

        let mut dec = FrameDecoder::new();
        assert_eq!(collect(&mut dec, &buf[..n1 + n2]), vec![Ok(m1), Ok(m2)]);
    }

    #[test]
    fn oversized_len_rejected() {
        // len = 200 exceeds the payload budget: decode error, then the
        // next valid frame is processed normally.
        let mut bad = [0u8; HEADER_LEN];
        bad[0..2].copy_from_slice(&200u16.to_le_bytes());
        bad[2] = MessageType::SensorData as u8;

        let mut dec = FrameDecoder::new();
        assert_eq!(collect(&mut dec, &bad), vec![Err(ProtoError::Oversize)]);

        let msg = Message::SensorData(SensorData::default());
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = encode_frame(&msg, 9, &mut buf).unwrap();
        assert_eq!(collect(&mut dec, &buf[..n]), vec![Ok(msg)]);
    }

    #[test]
    fn unknown_type_consumes_frame_and_keeps_sync() {
        // A frame with type 0xEE but a truthful length: the decoder must
        // skip exactly that frame and decode the following one.
        let mut bad = [0u8; HEADER_LEN + 3 + TRAILER_LEN];
        bad[0..2].copy_from_slice(&3u16.to_le_bytes());
        bad[2] = 0xEE;
        bad[5..8].copy_from_slice(&[1, 2, 3]);

        let good = Message::Ping;
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = encode_frame(&good, 4, &mut buf).unwrap();

        let mut stream = bad.to_vec();
        stream.extend_from_slice(&buf[..n]);

        let mut dec = FrameDecoder::new();
        assert_eq!(
            collect(&mut dec, &stream),
            vec![Err(ProtoError::UnknownType), Ok(Message::Ping)]
        );
    }

    #[test]
    fn truncated_payload_rejected() {
        // Declared length 5, actual postcard payload shorter: the frame is
        // consumed whole and the payload decode fails.
        let mut frame = [0u8; HEADER_LEN + 5 + TRAILER_LEN];
        frame[0..2].copy_from_slice(&5u16.to_le_bytes());
        frame[2] = MessageType::PidSettings as u8;

        let mut dec = FrameDecoder::new();
        assert_eq!(
            collect(&mut dec, &frame),
            vec![Err(ProtoError::BadPayload)]
        );
    }

    #[test]
    fn reset_clears_partial_state() {
        let mut dec = FrameDecoder::new();
        dec.feed(&[0x05, 0x00, 0x01], |_| panic!("no event expected"));
        dec.reset();

        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = encode_frame(&Message::Tare, 1, &mut buf).unwrap();
        assert_eq!(collect(&mut dec, &buf[..n]), vec![Ok(Message::Tare)]);
    }

    #[test]
    fn seq_is_carried_verbatim() {
        let mut buf = [0u8; MAX_FRAME_LEN];
        for seq in [0u16, 1, 0x1234, u16::MAX] {
            let n = encode_frame(&Message::Ping, seq, &mut buf).unwrap();
            let mut dec = FrameDecoder::new();
            let mut got = None;
            dec.feed(&buf[..n], |ev| {
                if let DecodeEvent::Frame { seq, .. } = ev {
                    got = Some(seq);
                }
            });
            assert_eq!(got, Some(seq));
        }
    }
}
