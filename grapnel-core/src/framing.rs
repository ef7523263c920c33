use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::status::Status;

/// Every gRPC message on the wire has a five byte header: a compressed flag
/// (u8, 0/1) and a big-endian u32 length prefix for the payload that follows.
pub const FRAME_HEADER_LEN: usize = 5;

/// Default cap on a single decoded inbound message: 4 MiB.
pub const DEFAULT_MAX_RECV_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// A single decoded frame: the compressed flag and the raw payload bytes
/// (still compressed when the flag is set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub compressed: bool,
    pub payload: Bytes,
}

/// Encode one frame: flag byte, length prefix, payload.
pub fn encode_frame(payload: Bytes, compressed: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(u8::from(compressed));
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    buf.freeze()
}

#[derive(Debug, Clone, Copy)]
enum DeframeState {
    ReadHeader,
    ReadBody { compressed: bool, len: usize },
}

/// Incremental decoder for the length-prefixed message framing.
///
/// Byte chunks are pushed as they arrive from the transport; complete frames
/// are pulled with [`Deframer::next_frame`]. A partial frame stays buffered
/// until the rest of it arrives.
#[derive(Debug)]
pub struct Deframer {
    buf: BytesMut,
    state: DeframeState,
    max_message_size: usize,
}

impl Deframer {
    pub fn new(max_message_size: usize) -> Self {
        Deframer {
            buf: BytesMut::new(),
            state: DeframeState::ReadHeader,
            max_message_size,
        }
    }

    /// Buffer another chunk of bytes from the wire.
    pub fn push(&mut self, chunk: Bytes) {
        self.buf.extend_from_slice(&chunk);
    }

    /// Pull the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Status> {
        if let DeframeState::ReadHeader = self.state {
            if self.buf.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let compressed = match self.buf.get_u8() {
                0 => false,
                1 => true,
                flag => {
                    return Err(Status::internal(format!(
                        "protocol violation: invalid compression flag {flag}"
                    )));
                }
            };
            let len = self.buf.get_u32() as usize;
            if len > self.max_message_size {
                return Err(Status::resource_exhausted(format!(
                    "received message of {len} bytes exceeds the limit of {} bytes",
                    self.max_message_size
                )));
            }
            self.state = DeframeState::ReadBody { compressed, len };
        }

        if let DeframeState::ReadBody { compressed, len } = self.state {
            if self.buf.len() < len {
                return Ok(None);
            }
            let payload = self.buf.split_to(len).freeze();
            self.state = DeframeState::ReadHeader;
            return Ok(Some(Frame {
                compressed,
                payload,
            }));
        }

        Ok(None)
    }

    /// Whether a partially received frame is still buffered. Used to tell a
    /// clean end-of-stream apart from one that cut a frame short.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || matches!(self.state, DeframeState::ReadBody { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let frame = encode_frame(Bytes::from_static(b"abc"), false);
        assert_eq!(frame.as_ref(), b"\x00\x00\x00\x00\x03abc");

        let frame = encode_frame(Bytes::from_static(b"abc"), true);
        assert_eq!(frame.as_ref(), b"\x01\x00\x00\x00\x03abc");
    }

    #[test]
    fn round_trip_single_frame() {
        let mut deframer = Deframer::new(1024);
        deframer.push(encode_frame(Bytes::from_static(b"hello"), false));
        let frame = deframer.next_frame().unwrap().unwrap();
        assert!(!frame.compressed);
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert!(deframer.next_frame().unwrap().is_none());
        assert!(!deframer.has_partial());
    }

    #[test]
    fn round_trip_preserves_compressed_flag() {
        let mut deframer = Deframer::new(1024);
        deframer.push(encode_frame(Bytes::from_static(b"zzz"), true));
        let frame = deframer.next_frame().unwrap().unwrap();
        assert!(frame.compressed);
        assert_eq!(frame.payload.as_ref(), b"zzz");
    }

    #[test]
    fn partial_delivery_buffers_until_complete() {
        let encoded = encode_frame(Bytes::from_static(b"split me"), false);
        let mut deframer = Deframer::new(1024);

        deframer.push(encoded.slice(..3));
        assert!(deframer.next_frame().unwrap().is_none());
        assert!(deframer.has_partial());

        deframer.push(encoded.slice(3..7));
        assert!(deframer.next_frame().unwrap().is_none());

        deframer.push(encoded.slice(7..));
        let frame = deframer.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"split me");
        assert!(!deframer.has_partial());
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut chunk = BytesMut::new();
        chunk.extend_from_slice(&encode_frame(Bytes::from_static(b"one"), false));
        chunk.extend_from_slice(&encode_frame(Bytes::from_static(b"two"), false));

        let mut deframer = Deframer::new(1024);
        deframer.push(chunk.freeze());
        assert_eq!(
            deframer.next_frame().unwrap().unwrap().payload.as_ref(),
            b"one"
        );
        assert_eq!(
            deframer.next_frame().unwrap().unwrap().payload.as_ref(),
            b"two"
        );
        assert!(deframer.next_frame().unwrap().is_none());
    }

    #[test]
    fn invalid_flag_fails_internal() {
        let mut deframer = Deframer::new(1024);
        deframer.push(Bytes::from_static(b"\x02\x00\x00\x00\x01a"));
        let err = deframer.next_frame().unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Internal);
    }

    #[test]
    fn oversized_frame_fails_resource_exhausted() {
        let mut deframer = Deframer::new(4);
        deframer.push(encode_frame(Bytes::from_static(b"too big"), false));
        let err = deframer.next_frame().unwrap_err();
        assert_eq!(err.code(), crate::status::Code::ResourceExhausted);
    }

    #[test]
    fn empty_payload_frame() {
        let mut deframer = Deframer::new(16);
        deframer.push(encode_frame(Bytes::new(), false));
        let frame = deframer.next_frame().unwrap().unwrap();
        assert!(frame.payload.is_empty());
    }
}
