//! Framing: length-prefix (4 bytes LE) + bincode payload. The bare 3-byte ack is unframed.

use crate::protocol::{Message, ACK};

const LEN_SIZE: usize = 4;
/// Radio payloads are small; anything larger is garbage.
const MAX_FRAME_LEN: u32 = 1024;

/// A received radio payload after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Ack,
    Message(Message),
}

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg: Message =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Classify a whole datagram: the ack literal, or exactly one frame.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, FrameDecodeError> {
    if bytes == &ACK[..] {
        return Ok(Payload::Ack);
    }
    let (msg, consumed) = decode_frame(bytes)?;
    if consumed != bytes.len() {
        return Err(FrameDecodeError::Trailing(bytes.len() - consumed));
    }
    Ok(Payload::Message(msg))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("{0} trailing bytes after frame")]
    Trailing(usize),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{BroadcastId, NodeAddress, SequenceNumber};

    fn sample_request() -> Message {
        Message::RouteRequest {
            source: NodeAddress::new(1, 0),
            source_seq: SequenceNumber(1),
            broadcast_id: BroadcastId(1),
            dest: NodeAddress::new(8, 0),
            dest_seq: SequenceNumber::UNKNOWN,
            distance: 1,
        }
    }

    #[test]
    fn request_survives_framing() {
        let msg = sample_request();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_request()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn ack_is_recognised_by_content() {
        assert_eq!(decode_payload(b"ack").unwrap(), Payload::Ack);
        // Same length, different bytes: too short for a frame.
        assert!(matches!(
            decode_payload(b"abc"),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn payload_rejects_trailing_garbage() {
        let mut frame = encode_frame(&sample_request()).unwrap();
        frame.push(0xff);
        assert!(matches!(
            decode_payload(&frame),
            Err(FrameDecodeError::Trailing(1))
        ));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let bytes = [0xff, 0xff, 0x00, 0x00, 0x01];
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }
}
