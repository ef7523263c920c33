use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::executor::{finish_with_status, CallExecutor};
use crate::interceptor::{ServerCallTail, ServerInterceptor, ServerReply, ServerRequest};
use crate::metadata::Metadata;
use crate::method::{MethodDescriptor, RpcKind};
use crate::parts::ResponsePart;
use crate::status::Status;
use crate::streaming::{
    DecodeFn, EncodeFn, MessageStream, PartStream, Response, ResponseSink, Streaming,
};
use crate::transport::{AcceptedStream, ServerTransport};

/// One registered method: its descriptor and the erased handler tail.
pub(crate) struct Route {
    pub(crate) method: MethodDescriptor,
    pub(crate) tail: Arc<dyn ServerCallTail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownMode {
    Run,
    Graceful,
    Forced,
}

/// Requests shutdown of a running [`Server`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<ShutdownMode>>,
}

impl ShutdownHandle {
    /// Stop accepting new streams; in-flight calls run to completion.
    pub fn begin_graceful_shutdown(&self) {
        self.tx.send_replace(ShutdownMode::Graceful);
    }

    /// Stop accepting new streams and cancel in-flight calls immediately.
    pub fn force_shutdown(&self) {
        self.tx.send_replace(ShutdownMode::Forced);
    }

    /// Graceful shutdown with a patience limit: calls still running after
    /// `grace` are cancelled.
    pub async fn shutdown_with_grace(&self, grace: Duration) {
        self.begin_graceful_shutdown();
        tokio::time::sleep(grace).await;
        self.force_shutdown();
    }
}

/// A gRPC server: a routing table of method handlers, an interceptor chain,
/// and configuration, executed against a pluggable transport.
pub struct Server {
    routes: Arc<HashMap<String, Route>>,
    interceptors: Arc<[Arc<dyn ServerInterceptor>]>,
    config: Arc<ServerConfig>,
    shutdown: Arc<watch::Sender<ShutdownMode>>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            routes: HashMap::new(),
            interceptors: Vec::new(),
            config: ServerConfig::default(),
        }
    }

    /// A handle that can shut this server down from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Accept and execute streams until the transport ends or shutdown is
    /// requested. Each accepted stream runs as its own task; the server owns
    /// those tasks and drains them before returning.
    pub async fn serve(self, mut transport: impl ServerTransport) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut calls: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() != ShutdownMode::Run {
                        break;
                    }
                }
                accepted = transport.accept() => {
                    let Some(accepted) = accepted else { break };
                    while calls.try_join_next().is_some() {}
                    if let Some(max) = self.config.max_concurrent_calls {
                        if calls.len() >= max {
                            warn!(limit = max, "refusing stream: concurrent call limit reached");
                            tokio::spawn(refuse_stream(accepted));
                            continue;
                        }
                    }
                    let executor = CallExecutor {
                        routes: self.routes.clone(),
                        interceptors: self.interceptors.clone(),
                        config: self.config.clone(),
                    };
                    calls.spawn(executor.execute(accepted));
                }
            }
        }

        // Stop accepting; drain in-flight calls, honouring a forced
        // shutdown that arrives while draining.
        drop(transport);
        if *shutdown_rx.borrow() == ShutdownMode::Forced {
            calls.abort_all();
        }
        loop {
            tokio::select! {
                next = calls.join_next() => {
                    if next.is_none() {
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() == ShutdownMode::Forced {
                        calls.abort_all();
                    }
                }
            }
        }
        debug!("server stopped");
    }
}

/// Refuse an accepted stream with a trailers-only `resource-exhausted`.
async fn refuse_stream(accepted: AcceptedStream) {
    let AcceptedStream { stream, .. } = accepted;
    let mut sink = stream.sink;
    finish_with_status(
        &mut sink,
        Status::resource_exhausted("server is at its concurrent call limit"),
    )
    .await;
}

/// Builds a [`Server`]: register one handler per method, each parameterised
/// over its serializer pair, plus interceptors and configuration.
pub struct ServerBuilder {
    routes: HashMap<String, Route>,
    interceptors: Vec<Arc<dyn ServerInterceptor>>,
    config: ServerConfig,
}

impl ServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Append an interceptor; interceptors run in registration order.
    pub fn interceptor(mut self, interceptor: impl ServerInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Register a unary method handler.
    pub fn unary<C, F, Fut>(mut self, method: MethodDescriptor, codec: C, handler: F) -> Self
    where
        C: Codec,
        F: Fn(C::Request, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<C::Response>, Status>> + Send + 'static,
    {
        assert_eq!(method.kind(), RpcKind::Unary, "{method} is not unary");
        self.routes.insert(
            method.path(),
            Route {
                method: method.clone(),
                tail: Arc::new(UnaryTail {
                    codec: Arc::new(codec),
                    handler,
                }),
            },
        );
        self
    }

    /// Register a server-streaming method handler. The handler writes
    /// responses into the provided sink.
    pub fn server_streaming<C, F, Fut>(
        mut self,
        method: MethodDescriptor,
        codec: C,
        handler: F,
    ) -> Self
    where
        C: Codec,
        F: Fn(C::Request, ResponseSink<C::Response>, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        assert_eq!(
            method.kind(),
            RpcKind::ServerStreaming,
            "{method} is not server-streaming"
        );
        self.routes.insert(
            method.path(),
            Route {
                method: method.clone(),
                tail: Arc::new(ServerStreamingTail {
                    codec: Arc::new(codec),
                    handler,
                }),
            },
        );
        self
    }

    /// Register a client-streaming method handler. The handler consumes the
    /// inbound sequence and returns a single response.
    pub fn client_streaming<C, F, Fut>(
        mut self,
        method: MethodDescriptor,
        codec: C,
        handler: F,
    ) -> Self
    where
        C: Codec,
        F: Fn(Streaming<C::Request>, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<C::Response>, Status>> + Send + 'static,
    {
        assert_eq!(
            method.kind(),
            RpcKind::ClientStreaming,
            "{method} is not client-streaming"
        );
        self.routes.insert(
            method.path(),
            Route {
                method: method.clone(),
                tail: Arc::new(ClientStreamingTail {
                    codec: Arc::new(codec),
                    handler,
                }),
            },
        );
        self
    }

    /// Register a bidirectional-streaming method handler.
    pub fn bidi<C, F, Fut>(mut self, method: MethodDescriptor, codec: C, handler: F) -> Self
    where
        C: Codec,
        F: Fn(Streaming<C::Request>, ResponseSink<C::Response>, ServerContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        assert_eq!(method.kind(), RpcKind::Bidi, "{method} is not bidi");
        self.routes.insert(
            method.path(),
            Route {
                method: method.clone(),
                tail: Arc::new(BidiTail {
                    codec: Arc::new(codec),
                    handler,
                }),
            },
        );
        self
    }

    pub fn build(self) -> Server {
        let (shutdown, _) = watch::channel(ShutdownMode::Run);
        Server {
            routes: Arc::new(self.routes),
            interceptors: self.interceptors.into(),
            config: Arc::new(self.config),
            shutdown: Arc::new(shutdown),
        }
    }
}

// -- Handler tails ------------------------------------------------------------

/// Read the single request message of a unary or server-streaming call,
/// rejecting extras.
async fn read_single_request(mut messages: MessageStream) -> Result<Bytes, Status> {
    let first = match messages.next().await {
        Some(Ok(payload)) => payload,
        Some(Err(status)) => return Err(status),
        None => {
            return Err(Status::internal(
                "protocol violation: call ended before a request message",
            ))
        }
    };
    match messages.next().await {
        None => Ok(first),
        Some(Err(status)) => Err(status),
        Some(Ok(_)) => Err(Status::internal(
            "protocol violation: more than one request message for a single-request call",
        )),
    }
}

/// A reply carrying exactly one message: leading metadata, the message, and
/// an OK status with the trailing metadata.
fn single_message_reply(metadata: Metadata, payload: Bytes, trailers: Metadata) -> ServerReply {
    let status = Status::ok("").with_metadata(trailers);
    ServerReply {
        parts: stream::iter(vec![
            Ok(ResponsePart::Metadata(metadata)),
            Ok(ResponsePart::Message(payload)),
            Ok(ResponsePart::Status(status)),
        ])
        .boxed(),
    }
}

/// Reply parts for a sink-based handler: the channel drains first, then the
/// handler's outcome becomes the terminal status carrying the trailing
/// metadata it set.
fn handler_parts(
    rx: mpsc::Receiver<ResponsePart>,
    handle: JoinHandle<Result<(), Status>>,
    trailers: Arc<Mutex<Metadata>>,
) -> PartStream {
    let terminal = stream::once(async move {
        let mut status = match handle.await {
            Ok(Ok(())) => Status::ok(""),
            Ok(Err(status)) => status,
            Err(e) if e.is_panic() => Status::unknown(""),
            Err(_) => Status::cancelled("handler was cancelled"),
        };
        let trailing = std::mem::take(&mut *trailers.lock().expect("trailers lock poisoned"));
        status.metadata_mut().merge(trailing);
        Ok(ResponsePart::Status(status))
    });
    ReceiverStream::new(rx).map(Ok).chain(terminal).boxed()
}

struct UnaryTail<C, F> {
    codec: Arc<C>,
    handler: F,
}

#[async_trait]
impl<C, F, Fut> ServerCallTail for UnaryTail<C, F>
where
    C: Codec,
    F: Fn(C::Request, ServerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<C::Response>, Status>> + Send + 'static,
{
    async fn call(
        &self,
        request: ServerRequest,
        ctx: &ServerContext,
    ) -> Result<ServerReply, Status> {
        let payload = read_single_request(request.messages).await?;
        let message = self.codec.decode_request(payload)?;
        let response = (self.handler)(message, ctx.clone()).await?;
        let (metadata, message, trailers) = response.into_parts();
        let payload = self.codec.encode_response(&message)?;
        Ok(single_message_reply(metadata, payload, trailers))
    }
}

struct ServerStreamingTail<C, F> {
    codec: Arc<C>,
    handler: F,
}

#[async_trait]
impl<C, F, Fut> ServerCallTail for ServerStreamingTail<C, F>
where
    C: Codec,
    F: Fn(C::Request, ResponseSink<C::Response>, ServerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    async fn call(
        &self,
        request: ServerRequest,
        ctx: &ServerContext,
    ) -> Result<ServerReply, Status> {
        let payload = read_single_request(request.messages).await?;
        let message = self.codec.decode_request(payload)?;

        let (tx, rx) = mpsc::channel(16);
        let trailers: Arc<Mutex<Metadata>> = Arc::default();
        let codec = self.codec.clone();
        let encode: EncodeFn<C::Response> = Arc::new(move |m| codec.encode_response(m));
        let sink = ResponseSink::new(tx, encode, trailers.clone());
        let handle = tokio::spawn((self.handler)(message, sink, ctx.clone()));
        Ok(ServerReply {
            parts: handler_parts(rx, handle, trailers),
        })
    }
}

struct ClientStreamingTail<C, F> {
    codec: Arc<C>,
    handler: F,
}

#[async_trait]
impl<C, F, Fut> ServerCallTail for ClientStreamingTail<C, F>
where
    C: Codec,
    F: Fn(Streaming<C::Request>, ServerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<C::Response>, Status>> + Send + 'static,
{
    async fn call(
        &self,
        request: ServerRequest,
        ctx: &ServerContext,
    ) -> Result<ServerReply, Status> {
        let codec = self.codec.clone();
        let decode: DecodeFn<C::Request> = Arc::new(move |payload| codec.decode_request(payload));
        let streaming = Streaming::from_messages(request.messages, decode);
        let response = (self.handler)(streaming, ctx.clone()).await?;
        let (metadata, message, trailers) = response.into_parts();
        let payload = self.codec.encode_response(&message)?;
        Ok(single_message_reply(metadata, payload, trailers))
    }
}

struct BidiTail<C, F> {
    codec: Arc<C>,
    handler: F,
}

#[async_trait]
impl<C, F, Fut> ServerCallTail for BidiTail<C, F>
where
    C: Codec,
    F: Fn(Streaming<C::Request>, ResponseSink<C::Response>, ServerContext) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    async fn call(
        &self,
        request: ServerRequest,
        ctx: &ServerContext,
    ) -> Result<ServerReply, Status> {
        let codec = self.codec.clone();
        let decode: DecodeFn<C::Request> = Arc::new(move |payload| codec.decode_request(payload));
        let streaming = Streaming::from_messages(request.messages, decode);

        let (tx, rx) = mpsc::channel(16);
        let trailers: Arc<Mutex<Metadata>> = Arc::default();
        let codec = self.codec.clone();
        let encode: EncodeFn<C::Response> = Arc::new(move |m| codec.encode_response(m));
        let sink = ResponseSink::new(tx, encode, trailers.clone());
        let handle = tokio::spawn((self.handler)(streaming, sink, ctx.clone()));
        Ok(ServerReply {
            parts: handler_parts(rx, handle, trailers),
        })
    }
}
