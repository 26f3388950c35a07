//! Framing and codec.
//!
//! Envelope bytes are bincode, then lz4 block-compressed with the uncompressed size prepended.
//! Streams carry `[u16 BE length][compressed envelope]`; datagrams carry one compressed
//! envelope with no length prefix.

use crate::protocol::Envelope;

const LEN_SIZE: usize = 2;
/// Largest compressed envelope a stream frame can carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;
/// Refuse to inflate anything claiming to be bigger than this (guards the size prefix).
pub const MAX_ENVELOPE_LEN: usize = 1024 * 1024;

/// Serialize and compress one envelope.
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let plain = bincode::serialize(env)?;
    if plain.len() > MAX_ENVELOPE_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(lz4_flex::compress_prepend_size(&plain))
}

/// Decompress and deserialize one envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, FrameDecodeError> {
    if bytes.len() < 4 {
        return Err(FrameDecodeError::Truncated);
    }
    let claimed = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if claimed > MAX_ENVELOPE_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let plain = lz4_flex::decompress_size_prepended(bytes)?;
    Ok(bincode::deserialize(&plain)?)
}

/// Encode an envelope into a stream frame: 2 bytes BE length + compressed envelope.
pub fn encode_frame(env: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let body = encode_envelope(env)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one stream frame from the front of `bytes`. Returns the envelope and bytes consumed.
/// `NeedMore` means the frame is incomplete; call again after more data arrives.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    let (body, consumed) = split_frame(bytes).ok_or(FrameDecodeError::NeedMore)?;
    let env = decode_envelope(body)?;
    Ok((env, consumed))
}

/// Encode an envelope as one datagram.
pub fn encode_datagram(env: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    encode_envelope(env)
}

/// Decode one datagram; the datagram boundary is the message boundary.
pub fn decode_datagram(bytes: &[u8]) -> Result<Envelope, FrameDecodeError> {
    decode_envelope(bytes)
}

fn split_frame(bytes: &[u8]) -> Option<(&[u8], usize)> {
    if bytes.len() < LEN_SIZE {
        return None;
    }
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if bytes.len() < LEN_SIZE + len {
        return None;
    }
    Some((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Error encoding an envelope (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Error decoding a frame or datagram.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("truncated envelope")]
    Truncated,
    #[error("envelope too large")]
    TooLarge,
    #[error("decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Incremental reassembly of length-prefixed frames read off a stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame. `Ok(None)` when more bytes are needed.
    /// A corrupt frame is consumed and reported so the caller can log it and keep reading.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>, FrameDecodeError> {
        let Some((body, consumed)) = split_frame(&self.buf) else {
            return Ok(None);
        };
        let decoded = decode_envelope(body);
        self.buf.drain(..consumed);
        decoded.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;
    use crate::protocol::{Discovery, P2pData, P2pMessage, Payload, PROTOCOL_VERSION};

    fn sample_identities() -> Envelope {
        Envelope::broadcast(
            PeerId::from("alice"),
            Payload::Discovery(Discovery::Identities {
                protocol_version: PROTOCOL_VERSION,
                ids: vec![PeerId::from("alice"), PeerId::from("alice-2")],
            }),
        )
        .with_app_id("game")
    }

    fn sample_data() -> Envelope {
        Envelope::to(
            PeerId::from("alice"),
            PeerId::from("bob"),
            Payload::P2p(P2pMessage::Data(P2pData {
                user_id: PeerId::from("alice"),
                socket_name: "lobby".into(),
                channel: 2,
                data: b"hi".to_vec(),
            })),
        )
    }

    #[test]
    fn stream_frame_roundtrip() {
        let env = sample_identities();
        let frame = encode_frame(&env).unwrap();
        let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(len + LEN_SIZE, frame.len());
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, env);
    }

    #[test]
    fn datagram_roundtrip() {
        let env = sample_data();
        let dgram = encode_datagram(&env).unwrap();
        assert_eq!(decode_datagram(&dgram).unwrap(), env);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_data()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..1]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn compression_shrinks_repetitive_payloads() {
        let env = Envelope::to(
            PeerId::from("a"),
            PeerId::from("b"),
            Payload::Stats(vec![7u8; 4096]),
        );
        let dgram = encode_datagram(&env).unwrap();
        assert!(dgram.len() < 1024);
        assert_eq!(decode_datagram(&dgram).unwrap(), env);
    }

    #[test]
    fn incompressible_payload_still_roundtrips() {
        use rand::RngCore;
        let mut body = vec![0u8; 2048];
        rand::thread_rng().fill_bytes(&mut body);
        let env = Envelope::to(PeerId::from("a"), PeerId::from("b"), Payload::Presence(body));
        let frame = encode_frame(&env).unwrap();
        assert_eq!(decode_frame(&frame).unwrap().0, env);
    }

    #[test]
    fn garbage_datagram_is_an_error() {
        assert!(decode_datagram(b"").is_err());
        assert!(decode_datagram(b"not compressed data").is_err());
        // Size prefix claiming 2 GiB must be refused before inflating.
        assert!(matches!(
            decode_datagram(&[0, 0, 0, 0x80, 1, 2, 3]),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn frame_buffer_reassembles_split_frames() {
        let a = encode_frame(&sample_identities()).unwrap();
        let b = encode_frame(&sample_data()).unwrap();
        let mut stream = Vec::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        let mut fb = FrameBuffer::new();
        let mut out = Vec::new();
        for chunk in stream.chunks(3) {
            fb.extend(chunk);
            while let Some(env) = fb.next_envelope().unwrap() {
                out.push(env);
            }
        }
        assert_eq!(out, vec![sample_identities(), sample_data()]);
        assert_eq!(fb.buffered(), 0);
    }

    #[test]
    fn frame_buffer_skips_corrupt_frame() {
        let good = encode_frame(&sample_data()).unwrap();
        let mut fb = FrameBuffer::new();
        fb.extend(&[0, 3, 0xde, 0xad, 0xbe]);
        fb.extend(&good);
        assert!(fb.next_envelope().is_err());
        assert_eq!(fb.next_envelope().unwrap(), Some(sample_data()));
    }
}
