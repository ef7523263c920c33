use std::io::Write;

use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::framing::Frame;
use crate::metadata::{Metadata, GRPC_ACCEPT_ENCODING};
use crate::status::Status;

/// Message compression algorithms the runtime can apply.
///
/// `identity` is not a member; "no compression" is represented as `None`
/// wherever an `Option<CompressionEncoding>` appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionEncoding {
    Gzip,
    Deflate,
}

impl CompressionEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionEncoding::Gzip => "gzip",
            CompressionEncoding::Deflate => "deflate",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "gzip" => Some(CompressionEncoding::Gzip),
            "deflate" => Some(CompressionEncoding::Deflate),
            _ => None,
        }
    }
}

/// The `grpc-accept-encoding` value advertising the given algorithms.
pub fn accept_encoding_value(accepted: &[CompressionEncoding]) -> String {
    let mut parts: Vec<&str> = accepted.iter().map(|e| e.as_str()).collect();
    parts.push("identity");
    parts.join(",")
}

/// Pick the compression used for outbound messages: the configured encoding
/// if the peer's `grpc-accept-encoding` lists it, identity otherwise.
pub fn outbound_encoding(
    configured: Option<CompressionEncoding>,
    peer_accept: Option<&str>,
) -> Option<CompressionEncoding> {
    let configured = configured?;
    let peer_accept = peer_accept?;
    peer_accept
        .split(',')
        .map(str::trim)
        .any(|token| token == configured.as_str())
        .then_some(configured)
}

/// Resolve the declared `grpc-encoding` of an inbound stream.
///
/// The header may list several algorithms; the first one we support wins,
/// and `identity` means no compression. A list naming only unsupported
/// algorithms fails with `unimplemented`, advertising what we do support via
/// `grpc-accept-encoding` on the status.
pub fn inbound_encoding(
    declared: Option<&str>,
    accepted: &[CompressionEncoding],
) -> Result<Option<CompressionEncoding>, Status> {
    let Some(declared) = declared else {
        return Ok(None);
    };

    for token in declared.split(',').map(str::trim) {
        if token == "identity" {
            return Ok(None);
        }
        if let Some(encoding) = CompressionEncoding::from_str(token) {
            if accepted.contains(&encoding) {
                return Ok(Some(encoding));
            }
        }
    }

    let mut status = Status::unimplemented(format!(
        "compression scheme {declared:?} is not supported"
    ));
    let mut md = Metadata::new();
    md.append(GRPC_ACCEPT_ENCODING, accept_encoding_value(accepted))
        .expect("accept-encoding value is valid metadata");
    *status.metadata_mut() = md;
    Err(status)
}

/// Compress a message payload.
pub fn compress(encoding: CompressionEncoding, payload: &[u8]) -> Result<Bytes, Status> {
    let out = Vec::with_capacity(payload.len() / 2 + 16);
    let result = match encoding {
        CompressionEncoding::Gzip => {
            let mut encoder = GzEncoder::new(out, Compression::default());
            encoder.write_all(payload).and_then(|_| encoder.finish())
        }
        CompressionEncoding::Deflate => {
            let mut encoder = ZlibEncoder::new(out, Compression::default());
            encoder.write_all(payload).and_then(|_| encoder.finish())
        }
    };
    result
        .map(Bytes::from)
        .map_err(|e| Status::internal(format!("failed to compress message: {e}")))
}

/// Decompress a message payload, enforcing the inbound size limit on the
/// decompressed bytes.
pub fn decompress(
    encoding: CompressionEncoding,
    payload: &[u8],
    max_message_size: usize,
) -> Result<Bytes, Status> {
    let result = match encoding {
        CompressionEncoding::Gzip => {
            let mut decoder = GzDecoder::new(Vec::new());
            decoder.write_all(payload).and_then(|_| decoder.finish())
        }
        CompressionEncoding::Deflate => {
            let mut decoder = ZlibDecoder::new(Vec::new());
            decoder.write_all(payload).and_then(|_| decoder.finish())
        }
    };
    let out =
        result.map_err(|e| Status::internal(format!("failed to decompress message: {e}")))?;
    if out.len() > max_message_size {
        return Err(Status::resource_exhausted(format!(
            "decompressed message of {} bytes exceeds the limit of {max_message_size} bytes",
            out.len()
        )));
    }
    Ok(Bytes::from(out))
}

/// Recover the message payload from a decoded frame, applying the stream's
/// declared encoding when the compressed flag is set.
///
/// A compressed frame on a stream that declared no encoding is a protocol
/// violation.
pub fn decode_payload(
    frame: Frame,
    encoding: Option<CompressionEncoding>,
    max_message_size: usize,
) -> Result<Bytes, Status> {
    if !frame.compressed {
        return Ok(frame.payload);
    }
    match encoding {
        Some(encoding) => decompress(encoding, &frame.payload, max_message_size),
        None => Err(Status::internal(
            "protocol violation: compressed frame received without a grpc-encoding declaration",
        )),
    }
}

/// Prepare an outbound message payload: compress when an algorithm was
/// negotiated and the payload is larger than the threshold, falling back to
/// an uncompressed frame otherwise. Returns the payload and the flag value.
pub fn encode_payload(
    payload: Bytes,
    encoding: Option<CompressionEncoding>,
    threshold: usize,
) -> Result<(Bytes, bool), Status> {
    match encoding {
        Some(encoding) if payload.len() > threshold => {
            let compressed = compress(encoding, &payload)?;
            Ok((compressed, true))
        }
        _ => Ok((payload, false)),
    }
}
