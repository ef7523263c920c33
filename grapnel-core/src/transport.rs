use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::metadata::Metadata;

/// What flows on one direction of an opened stream.
///
/// The transport owns HTTP/2 framing, flow control, and socket I/O; the
/// runtime sees streams of header blocks, data chunks, and trailer blocks.
/// Data chunk boundaries carry no meaning - the runtime reassembles message
/// frames itself.
#[derive(Debug, Clone)]
pub enum WireFrame {
    /// A leading header block.
    Headers(Metadata),
    /// A chunk of body bytes.
    Data(Bytes),
    /// A trailing header block. Ends the direction.
    Trailers(Metadata),
}

/// Errors surfaced by a transport stream.
#[derive(Debug)]
pub enum TransportError {
    /// The stream was closed locally; no more frames can be sent.
    Closed,
    /// The peer aborted the stream (the RST equivalent).
    Reset,
    /// The underlying connection failed.
    ConnectionLost(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "stream closed"),
            TransportError::Reset => write!(f, "stream reset by peer"),
            TransportError::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// The outbound half of a stream. Sends suspend while the transport's send
/// window is full.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Half-close: no more frames will be sent. The peer observes a clean
    /// end of stream.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Abort the stream immediately (the RST equivalent). Never blocks and
    /// discards any frames the peer has not yet consumed.
    fn abort(&mut self);
}

/// The inbound half of a stream. `Ok(None)` is a clean end of stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError>;
}

/// Both halves of one opened bidirectional stream.
pub struct StreamPair {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Client-side transport: a resolved connection that can open streams.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn open_stream(&self) -> Result<StreamPair, TransportError>;
}

/// A stream accepted by a server transport.
pub struct AcceptedStream {
    pub stream: StreamPair,
    /// Peer identity as reported by the transport (e.g. a remote address).
    pub peer: String,
}

/// Server-side transport: yields accepted streams until shut down.
#[async_trait]
pub trait ServerTransport: Send {
    /// The next accepted stream, or `None` once the transport has shut down.
    async fn accept(&mut self) -> Option<AcceptedStream>;
}

// -- In-process channel transport ---------------------------------------------

/// Reset signal shared between a sink and the peer's source.
struct ResetFlag {
    reset: AtomicBool,
    notify: Notify,
}

impl ResetFlag {
    fn new() -> Arc<Self> {
        Arc::new(ResetFlag {
            reset: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn trip(&self) {
        self.reset.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_tripped(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }
}

struct ChannelSink {
    tx: Option<mpsc::Sender<WireFrame>>,
    reset: Arc<ResetFlag>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| TransportError::ConnectionLost("peer went away".into())),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }

    fn abort(&mut self) {
        self.tx = None;
        self.reset.trip();
    }
}

struct ChannelSource {
    rx: mpsc::Receiver<WireFrame>,
    reset: Arc<ResetFlag>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        loop {
            let notified = self.reset.notify.notified();
            tokio::pin!(notified);
            // Register for the reset wakeup before re-checking the flag, so
            // a trip between the check and the select cannot be missed.
            notified.as_mut().enable();
            if self.reset.is_tripped() {
                return Err(TransportError::Reset);
            }
            tokio::select! {
                _ = notified => continue,
                frame = self.rx.recv() => return Ok(frame),
            }
        }
    }
}

/// Cross-wire two stream ends over bounded channels. The channel capacity is
/// the send window: senders suspend once the peer stops pulling.
fn channel_stream_pair(capacity: usize) -> (StreamPair, StreamPair) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let a_reset = ResetFlag::new();
    let b_reset = ResetFlag::new();

    let left = StreamPair {
        sink: Box::new(ChannelSink {
            tx: Some(a_tx),
            reset: a_reset.clone(),
        }),
        source: Box::new(ChannelSource {
            rx: b_rx,
            reset: b_reset.clone(),
        }),
    };
    let right = StreamPair {
        sink: Box::new(ChannelSink {
            tx: Some(b_tx),
            reset: b_reset,
        }),
        source: Box::new(ChannelSource {
            rx: a_rx,
            reset: a_reset,
        }),
    };
    (left, right)
}

/// Client half of the in-process transport.
#[derive(Clone)]
pub struct LocalClientTransport {
    accept_tx: mpsc::Sender<AcceptedStream>,
    capacity: usize,
}

#[async_trait]
impl ClientTransport for LocalClientTransport {
    async fn open_stream(&self) -> Result<StreamPair, TransportError> {
        let (client_end, server_end) = channel_stream_pair(self.capacity);
        self.accept_tx
            .send(AcceptedStream {
                stream: server_end,
                peer: "in-process".to_string(),
            })
            .await
            .map_err(|_| TransportError::ConnectionLost("server transport closed".into()))?;
        Ok(client_end)
    }
}

/// Server half of the in-process transport.
pub struct LocalServerTransport {
    accept_rx: mpsc::Receiver<AcceptedStream>,
}

#[async_trait]
impl ServerTransport for LocalServerTransport {
    async fn accept(&mut self) -> Option<AcceptedStream> {
        self.accept_rx.recv().await
    }
}

/// An in-process transport pair: streams opened on the client half pop out
/// of the server half's accept loop. `capacity` is the per-direction frame
/// window used for backpressure.
///
/// Used by the test suites and useful for embedding a server and client in
/// one process without sockets.
pub fn local(capacity: usize) -> (LocalClientTransport, LocalServerTransport) {
    let (accept_tx, accept_rx) = mpsc::channel(16);
    (
        LocalClientTransport {
            accept_tx,
            capacity: capacity.max(1),
        },
        LocalServerTransport { accept_rx },
    )
}
