// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message schema for the gateway<->engine streaming RPC. Two long-lived
//! streams per pair (one per direction); every frame carries a per-stream
//! sequence number and the highest sequence seen on the opposite stream, so
//! a reconnecting side can resume from its watermark or be told the session
//! state is gone.

use crate::envelope::Envelope;
use crate::event::{InboundEvent, InterEngineEvent, OutboundEvent};
use crate::UnixTime;
use serde::{Deserialize, Serialize};

/// Frames larger than this are a protocol violation.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

const LENGTH_PREFIX: usize = 4;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    /// Monotonic per stream, starting at 1.
    pub seq: u64,
    /// Receiver's watermark: highest `seq` observed on the opposite stream.
    pub ack: u64,
    pub body: FrameBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FrameBody {
    /// First frame on any (re)connected stream.
    Hello {
        source: String,
        /// Highest seq this side had received before the disconnect; the
        /// server either resumes above it or answers `SessionLoss`.
        last_seen_seq: u64,
    },
    /// Resume is impossible; the peer must treat affected sessions as lost.
    SessionLoss,
    Inbound(InboundEvent),
    Outbound(OutboundEvent),
    InterEngine(InterEngineEvent),
    /// Inter-engine event sealed in an authenticated envelope. Engine
    /// peers exchange these instead of plain `InterEngine` frames, so a
    /// handoff ticket cannot be forged by whoever can reach the port.
    SealedInterEngine(Envelope),
    Ping { timestamp: UnixTime },
}

#[derive(Debug)]
pub enum FrameError {
    TooLarge(usize),
    Encode(bincode::Error),
}

/// u32-LE length prefix followed by the bincode body.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(frame).map_err(FrameError::Encode)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(LENGTH_PREFIX + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Incremental decode from a read buffer. Returns the frame and the number
/// of bytes consumed, `Ok(None)` if more bytes are needed, or an error for
/// oversized/corrupt frames (the connection should be dropped).
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    if buf.len() < LENGTH_PREFIX + len {
        return Ok(None);
    }
    let frame = bincode::deserialize(&buf[LENGTH_PREFIX..LENGTH_PREFIX + len])
        .map_err(FrameError::Encode)?;
    Ok(Some((frame, LENGTH_PREFIX + len)))
}

#[cfg(test)]
mod tests {
    use crate::event::{InboundEvent, OutboundEvent, TextKind};
    use crate::id::{LeaseId, SessionId};
    use crate::rpc::{decode_frame, encode_frame, Frame, FrameBody};

    fn session_id() -> SessionId {
        SessionId::compose(1_000, LeaseId::default(), 1).unwrap()
    }

    #[test]
    fn round_trip() {
        let frame = Frame {
            seq: 7,
            ack: 3,
            body: FrameBody::Inbound(InboundEvent::LineReceived {
                session_id: session_id(),
                line: "kill rat".to_owned(),
            }),
        };
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, consumed) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.ack, 3);
    }

    #[test]
    fn partial_input_needs_more() {
        let frame = Frame {
            seq: 1,
            ack: 0,
            body: FrameBody::Outbound(OutboundEvent::SendText {
                session_id: session_id(),
                text: "hello".to_owned(),
                kind: TextKind::Line,
            }),
        };
        let bytes = encode_frame(&frame).unwrap();
        for cut in [0, 2, bytes.len() - 1] {
            assert!(decode_frame(&bytes[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let frame = Frame {
            seq: 1,
            ack: 0,
            body: FrameBody::Ping { timestamp: 42 },
        };
        let mut bytes = encode_frame(&frame).unwrap();
        let first_len = bytes.len();
        bytes.extend(encode_frame(&frame).unwrap());
        let (_, consumed) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(consumed, first_len);
        assert!(decode_frame(&bytes[consumed..]).unwrap().is_some());
    }

    #[test]
    fn oversized_length_rejected() {
        let mut bytes = vec![0u8; 8];
        bytes[..4].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn sealed_frame_round_trips_verifiably() {
        let envelope = crate::envelope::Envelope::seal(
            "HandoffPrepare",
            "engine-1",
            5_000,
            vec![9, 9, 9],
            b"secret",
        );
        let frame = Frame {
            seq: 2,
            ack: 1,
            body: FrameBody::SealedInterEngine(envelope),
        };
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, _) = decode_frame(&bytes).unwrap().unwrap();
        match decoded.body {
            FrameBody::SealedInterEngine(envelope) => {
                assert_eq!(envelope.open(b"secret", 5_100, 10_000).unwrap(), &[9, 9, 9]);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }
}
