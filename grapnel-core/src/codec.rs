use bytes::Bytes;

use crate::status::Status;

/// The serialization boundary for one method: a pair of plugs per message
/// direction, furnished by the caller alongside the method descriptor.
///
/// The runtime owns framing and compression; a codec only maps typed
/// messages to and from payload bytes. Failures are reported as `internal`
/// by the side whose codec failed, so implementations should return
/// [`Status::internal`] with a short description.
///
/// For any message `m`, `decode(encode(m))` must reproduce `m`.
pub trait Codec: Send + Sync + 'static {
    /// The request message type (client to server).
    type Request: Send + 'static;
    /// The response message type (server to client).
    type Response: Send + 'static;

    fn encode_request(&self, message: &Self::Request) -> Result<Bytes, Status>;
    fn decode_request(&self, payload: Bytes) -> Result<Self::Request, Status>;
    fn encode_response(&self, message: &Self::Response) -> Result<Bytes, Status>;
    fn decode_response(&self, payload: Bytes) -> Result<Self::Response, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A codec that carries UTF-8 text unchanged.
    struct TextCodec;

    impl Codec for TextCodec {
        type Request = String;
        type Response = String;

        fn encode_request(&self, message: &String) -> Result<Bytes, Status> {
            Ok(Bytes::from(message.clone().into_bytes()))
        }

        fn decode_request(&self, payload: Bytes) -> Result<String, Status> {
            String::from_utf8(payload.to_vec())
                .map_err(|e| Status::internal(format!("invalid request payload: {e}")))
        }

        fn encode_response(&self, message: &String) -> Result<Bytes, Status> {
            self.encode_request(message)
        }

        fn decode_response(&self, payload: Bytes) -> Result<String, Status> {
            self.decode_request(payload)
        }
    }

    #[test]
    fn round_trip() {
        let codec = TextCodec;
        let encoded = codec.encode_request(&"hello".to_string()).unwrap();
        assert_eq!(codec.decode_request(encoded).unwrap(), "hello");
    }

    #[test]
    fn decode_failure_is_internal() {
        let codec = TextCodec;
        let err = codec
            .decode_request(Bytes::from_static(&[0xff, 0xfe]))
            .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Internal);
    }
}
