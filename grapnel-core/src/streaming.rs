use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::deadline::Deadline;
use crate::metadata::Metadata;
use crate::parts::ResponsePart;
use crate::status::Status;

/// A pull-based sequence of serialized message payloads.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// A pull-based sequence of response parts. A non-OK terminal status may
/// arrive either as a [`ResponsePart::Status`] item or as an `Err`.
pub type PartStream = Pin<Box<dyn Stream<Item = Result<ResponsePart, Status>> + Send>>;

pub(crate) type DecodeFn<T> = Arc<dyn Fn(Bytes) -> Result<T, Status> + Send + Sync>;
pub(crate) type EncodeFn<T> = Arc<dyn Fn(&T) -> Result<Bytes, Status> + Send + Sync>;

/// A typed response carrying its surrounding metadata.
///
/// For unary-response calls `trailers` holds the trailing metadata observed
/// with the terminal status. For streaming-response calls the message is a
/// [`Streaming`] and the trailing metadata becomes available from it once
/// the stream ends.
#[derive(Debug)]
pub struct Response<T> {
    metadata: Metadata,
    message: T,
    trailers: Metadata,
}

impl<T> Response<T> {
    /// A response around a message with empty metadata.
    pub fn new(message: T) -> Self {
        Response {
            metadata: Metadata::new(),
            message,
            trailers: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_trailers(mut self, trailers: Metadata) -> Self {
        self.trailers = trailers;
        self
    }

    /// Leading metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Trailing metadata.
    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }

    pub fn get_ref(&self) -> &T {
        &self.message
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.message
    }

    pub fn into_inner(self) -> T {
        self.message
    }

    pub fn into_parts(self) -> (Metadata, T, Metadata) {
        (self.metadata, self.message, self.trailers)
    }
}

/// A consumable sequence of typed messages ending in a terminal status.
///
/// `message()` yields `Ok(Some(_))` per message, `Ok(None)` once the
/// sequence ended cleanly, and `Err(status)` when the call failed. Messages
/// delivered before a failure remain observed; after the first terminal
/// outcome every further call returns `Ok(None)`.
pub struct Streaming<T> {
    parts: PartStream,
    decode: DecodeFn<T>,
    deadline: Option<Deadline>,
    done: bool,
    status: Option<Status>,
    trailers: Option<Metadata>,
}

impl<T> Streaming<T> {
    pub(crate) fn from_parts(
        parts: PartStream,
        decode: DecodeFn<T>,
        deadline: Option<Deadline>,
    ) -> Self {
        Streaming {
            parts,
            decode,
            deadline,
            done: false,
            status: None,
            trailers: None,
        }
    }

    /// Wrap a plain payload sequence (the server-side inbound shape, which
    /// has no terminal status part).
    pub(crate) fn from_messages(messages: MessageStream, decode: DecodeFn<T>) -> Self {
        let parts = messages
            .map(|item| item.map(ResponsePart::Message))
            .boxed();
        Streaming::from_parts(parts, decode, None)
    }

    /// The next message in the sequence.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        if self.done {
            return Ok(None);
        }

        let part = match self.deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline.instant(), self.parts.next()).await {
                    Ok(part) => part,
                    Err(_) => {
                        self.done = true;
                        return Err(Status::deadline_exceeded("deadline exceeded"));
                    }
                }
            }
            None => self.parts.next().await,
        };

        match part {
            None => {
                self.done = true;
                Ok(None)
            }
            Some(Err(status)) => {
                self.done = true;
                self.status = Some(status.clone());
                Err(status)
            }
            Some(Ok(ResponsePart::Message(payload))) => match (self.decode)(payload) {
                Ok(message) => Ok(Some(message)),
                Err(status) => {
                    self.done = true;
                    self.status = Some(status.clone());
                    Err(status)
                }
            },
            Some(Ok(ResponsePart::Metadata(_))) => {
                self.done = true;
                let status = Status::internal(
                    "protocol violation: unexpected metadata block in message stream",
                );
                self.status = Some(status.clone());
                Err(status)
            }
            Some(Ok(ResponsePart::Status(status))) => {
                self.done = true;
                self.trailers = Some(status.metadata().clone());
                self.status = Some(status.clone());
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(status)
                }
            }
        }
    }

    /// The terminal status, once the sequence has ended.
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Trailing metadata, once the sequence has ended.
    pub fn trailers(&self) -> Option<&Metadata> {
        self.trailers.as_ref()
    }
}

impl<T> std::fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streaming")
            .field("done", &self.done)
            .field("status", &self.status)
            .finish()
    }
}

/// The outbound writer handed to streaming-response handlers.
///
/// Messages are serialized and queued towards the wire; sends suspend while
/// the transport's window is full. Leading metadata is sent implicitly with
/// the first message unless [`send_metadata`](ResponseSink::send_metadata)
/// was called first. Trailing metadata set via
/// [`set_trailers`](ResponseSink::set_trailers) rides with the terminal
/// status once the handler returns.
pub struct ResponseSink<T> {
    tx: mpsc::Sender<ResponsePart>,
    encode: EncodeFn<T>,
    sent_metadata: bool,
    trailers: Arc<Mutex<Metadata>>,
}

impl<T> ResponseSink<T> {
    pub(crate) fn new(
        tx: mpsc::Sender<ResponsePart>,
        encode: EncodeFn<T>,
        trailers: Arc<Mutex<Metadata>>,
    ) -> Self {
        ResponseSink {
            tx,
            encode,
            sent_metadata: false,
            trailers,
        }
    }

    /// Send the leading metadata block. May be called at most once, before
    /// the first message.
    pub async fn send_metadata(&mut self, metadata: Metadata) -> Result<(), Status> {
        if self.sent_metadata {
            return Err(Status::internal("leading metadata was already sent"));
        }
        self.sent_metadata = true;
        self.tx
            .send(ResponsePart::Metadata(metadata))
            .await
            .map_err(|_| Status::cancelled("call was cancelled"))
    }

    /// Serialize and send one response message.
    pub async fn send(&mut self, message: &T) -> Result<(), Status> {
        if !self.sent_metadata {
            self.send_metadata(Metadata::new()).await?;
        }
        let payload = (self.encode)(message)?;
        self.tx
            .send(ResponsePart::Message(payload))
            .await
            .map_err(|_| Status::cancelled("call was cancelled"))
    }

    /// Set the trailing metadata that accompanies the terminal status.
    pub fn set_trailers(&self, trailers: Metadata) {
        *self.trailers.lock().expect("trailers lock poisoned") = trailers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn text_decode() -> DecodeFn<String> {
        Arc::new(|payload: Bytes| {
            String::from_utf8(payload.to_vec())
                .map_err(|e| Status::internal(format!("bad payload: {e}")))
        })
    }

    #[tokio::test]
    async fn messages_then_ok_status() {
        let parts: PartStream = stream::iter(vec![
            Ok(ResponsePart::Message(Bytes::from_static(b"a"))),
            Ok(ResponsePart::Message(Bytes::from_static(b"b"))),
            Ok(ResponsePart::Status(Status::ok(""))),
        ])
        .boxed();
        let mut streaming = Streaming::from_parts(parts, text_decode(), None);

        assert_eq!(streaming.message().await.unwrap(), Some("a".to_string()));
        assert_eq!(streaming.message().await.unwrap(), Some("b".to_string()));
        assert_eq!(streaming.message().await.unwrap(), None);
        assert!(streaming.status().unwrap().is_ok());
        // Terminal: stays ended.
        assert_eq!(streaming.message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn error_status_surfaces_after_messages() {
        let parts: PartStream = stream::iter(vec![
            Ok(ResponsePart::Message(Bytes::from_static(b"partial"))),
            Ok(ResponsePart::Status(Status::aborted("gone"))),
        ])
        .boxed();
        let mut streaming = Streaming::from_parts(parts, text_decode(), None);

        assert_eq!(
            streaming.message().await.unwrap(),
            Some("partial".to_string())
        );
        let err = streaming.message().await.unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Aborted);
        assert_eq!(streaming.message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn metadata_mid_stream_is_a_violation() {
        let parts: PartStream =
            stream::iter(vec![Ok(ResponsePart::Metadata(Metadata::new()))]).boxed();
        let mut streaming = Streaming::from_parts(parts, text_decode(), None);
        let err = streaming.message().await.unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Internal);
    }

    #[tokio::test]
    async fn expired_deadline_fails_pending_read() {
        let parts: PartStream = stream::pending().boxed();
        let deadline = Deadline::after(std::time::Duration::from_millis(10));
        let mut streaming = Streaming::from_parts(parts, text_decode(), Some(deadline));
        let err = streaming.message().await.unwrap_err();
        assert_eq!(err.code(), crate::status::Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn sink_sends_metadata_implicitly() {
        let (tx, mut rx) = mpsc::channel(4);
        let encode: EncodeFn<String> =
            Arc::new(|m: &String| Ok(Bytes::from(m.clone().into_bytes())));
        let mut sink = ResponseSink::new(tx, encode, Arc::new(Mutex::new(Metadata::new())));

        sink.send(&"hi".to_string()).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ResponsePart::Metadata(_)
        ));
        match rx.recv().await.unwrap() {
            ResponsePart::Message(b) => assert_eq!(b.as_ref(), b"hi"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sink_rejects_second_metadata() {
        let (tx, _rx) = mpsc::channel(4);
        let encode: EncodeFn<String> =
            Arc::new(|m: &String| Ok(Bytes::from(m.clone().into_bytes())));
        let mut sink = ResponseSink::new(tx, encode, Arc::new(Mutex::new(Metadata::new())));

        sink.send_metadata(Metadata::new()).await.unwrap();
        assert!(sink.send_metadata(Metadata::new()).await.is_err());
    }

    #[tokio::test]
    async fn sink_send_fails_as_cancelled_when_call_torn_down() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let encode: EncodeFn<String> =
            Arc::new(|m: &String| Ok(Bytes::from(m.clone().into_bytes())));
        let mut sink = ResponseSink::new(tx, encode, Arc::new(Mutex::new(Metadata::new())));

        let err = sink.send(&"x".to_string()).await.unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Cancelled);
    }
}
