use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::compression::{
    accept_encoding_value, decode_payload, encode_payload, CompressionEncoding,
};
use crate::config::{build_user_agent, CallOptions, ClientConfig, RetryPolicy};
use crate::deadline::{encode_timeout, Deadline};
use crate::error::RpcError;
use crate::framing::{encode_frame, Deframer};
use crate::interceptor::{
    ClientCallContext, ClientCallTail, ClientInterceptor, ClientNext, ClientReply, ClientRequest,
};
use crate::metadata::{
    Metadata, CONTENT_TYPE, CONTENT_TYPE_GRPC, GRPC_ACCEPT_ENCODING, GRPC_ENCODING, GRPC_TIMEOUT,
    PSEUDO_METHOD, PSEUDO_PATH, PSEUDO_SCHEME, TE, TE_TRAILERS, USER_AGENT,
};
use crate::method::{MethodDescriptor, RpcKind};
use crate::parts::ResponsePart;
use crate::retry::{backoff_delay, RetryThrottle};
use crate::status::Status;
use crate::streaming::{DecodeFn, MessageStream, PartStream, Response, Streaming};
use crate::transport::{ClientTransport, FrameSink, FrameSource, StreamPair, TransportError, WireFrame};

type LocalError = Arc<Mutex<Option<Status>>>;

/// The client call manager: opens a stream per call on a resolved
/// transport, runs the interceptor chain whose tail writes to the wire, and
/// presents the response as a consumable sequence ending in the terminal
/// status.
///
/// Cheap to clone; clones share the transport and the retry throttle.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn ClientTransport>,
    interceptors: Arc<[Arc<dyn ClientInterceptor>]>,
    config: Arc<ClientConfig>,
    throttle: Arc<RetryThrottle>,
}

/// Everything resolved once per call from options and configuration.
struct CallPlan {
    head: Metadata,
    ctx: ClientCallContext,
    deadline: Option<Deadline>,
    send_encoding: Option<CompressionEncoding>,
    max_recv: usize,
    max_send: Option<usize>,
    retry: Option<RetryPolicy>,
}

impl Client {
    pub fn new(
        transport: impl ClientTransport + 'static,
        interceptors: Vec<Arc<dyn ClientInterceptor>>,
        config: ClientConfig,
    ) -> Self {
        let throttle = Arc::new(RetryThrottle::new(&config.retry_throttle));
        Client {
            transport: Arc::new(transport),
            interceptors: interceptors.into(),
            config: Arc::new(config),
            throttle,
        }
    }

    /// Issue a unary call: one request message, one response message.
    ///
    /// Eligible for automatic retry under the configured policy and the
    /// shared throttle.
    pub async fn unary<C: Codec>(
        &self,
        method: &MethodDescriptor,
        codec: C,
        request: C::Request,
        options: CallOptions,
    ) -> Result<Response<C::Response>, RpcError> {
        check_kind(method, RpcKind::Unary)?;
        let codec = Arc::new(codec);
        let plan = self.plan_call(method, &options)?;
        let payload = codec.encode_request(&request).map_err(RpcError::Status)?;
        check_send_size(&payload, plan.max_send)?;

        let mut attempt = 1;
        loop {
            let result = self
                .single_response_attempt(&plan, &codec, payload.clone())
                .await;
            match result {
                Ok(response) => {
                    self.throttle.on_success();
                    return Ok(response);
                }
                Err(status) => match self.retry_delay(&plan, attempt, &status) {
                    Some(delay) => {
                        debug!(
                            method = %method,
                            code = %status.code(),
                            attempt,
                            "retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(status.into()),
                },
            }
        }
    }

    /// Issue a server-streaming call: one request message, a stream of
    /// response messages.
    ///
    /// Only failures to establish the response stream are retried; once the
    /// stream is handed out the call is committed.
    pub async fn server_streaming<C: Codec>(
        &self,
        method: &MethodDescriptor,
        codec: C,
        request: C::Request,
        options: CallOptions,
    ) -> Result<Response<Streaming<C::Response>>, RpcError> {
        check_kind(method, RpcKind::ServerStreaming)?;
        let codec = Arc::new(codec);
        let plan = self.plan_call(method, &options)?;
        let payload = codec.encode_request(&request).map_err(RpcError::Status)?;
        check_send_size(&payload, plan.max_send)?;

        let mut attempt = 1;
        loop {
            let result = self
                .run_chain(&plan, replayable_messages(vec![payload.clone()]))
                .await;
            match result {
                Ok(reply) => {
                    self.throttle.on_success();
                    let codec = codec.clone();
                    let decode: DecodeFn<C::Response> =
                        Arc::new(move |payload| codec.decode_response(payload));
                    let streaming = Streaming::from_parts(reply.parts, decode, plan.deadline);
                    return Ok(Response::new(streaming).with_metadata(reply.metadata));
                }
                Err(status) => match self.retry_delay(&plan, attempt, &status) {
                    Some(delay) => {
                        debug!(
                            method = %method,
                            code = %status.code(),
                            attempt,
                            "retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(status.into()),
                },
            }
        }
    }

    /// Issue a client-streaming call: a stream of request messages, one
    /// response message. Never retried automatically, because the request
    /// sequence cannot be replayed.
    pub async fn client_streaming<C, S>(
        &self,
        method: &MethodDescriptor,
        codec: C,
        requests: S,
        options: CallOptions,
    ) -> Result<Response<C::Response>, RpcError>
    where
        C: Codec,
        S: Stream<Item = C::Request> + Send + 'static,
    {
        check_kind(method, RpcKind::ClientStreaming)?;
        let codec = Arc::new(codec);
        let plan = self.plan_call(method, &options)?;

        let reply = self
            .run_chain(&plan, encode_requests(codec.clone(), requests))
            .await
            .map_err(RpcError::Status)?;
        let codec = codec.clone();
        let decode: DecodeFn<C::Response> = Arc::new(move |payload| codec.decode_response(payload));
        read_single_response(reply, decode, plan.deadline)
            .await
            .map_err(RpcError::Status)
    }

    /// Issue a bidirectional-streaming call: request messages are pumped
    /// concurrently while responses are consumed from the returned stream.
    /// Never retried automatically.
    pub async fn bidi<C, S>(
        &self,
        method: &MethodDescriptor,
        codec: C,
        requests: S,
        options: CallOptions,
    ) -> Result<Response<Streaming<C::Response>>, RpcError>
    where
        C: Codec,
        S: Stream<Item = C::Request> + Send + 'static,
    {
        check_kind(method, RpcKind::Bidi)?;
        let codec = Arc::new(codec);
        let plan = self.plan_call(method, &options)?;

        let reply = self
            .run_chain(&plan, encode_requests(codec.clone(), requests))
            .await
            .map_err(RpcError::Status)?;
        let decode: DecodeFn<C::Response> = {
            let codec = codec.clone();
            Arc::new(move |payload| codec.decode_response(payload))
        };
        let streaming = Streaming::from_parts(reply.parts, decode, plan.deadline);
        Ok(Response::new(streaming).with_metadata(reply.metadata))
    }

    /// One attempt of a call whose response is a single message.
    async fn single_response_attempt<C: Codec>(
        &self,
        plan: &CallPlan,
        codec: &Arc<C>,
        payload: Bytes,
    ) -> Result<Response<C::Response>, Status> {
        let reply = self
            .run_chain(plan, replayable_messages(vec![payload]))
            .await?;
        let codec = codec.clone();
        let decode: DecodeFn<C::Response> = Arc::new(move |payload| codec.decode_response(payload));
        read_single_response(reply, decode, plan.deadline).await
    }

    /// Run the interceptor chain; its tail opens the stream and performs the
    /// wire exchange.
    async fn run_chain(
        &self,
        plan: &CallPlan,
        messages: MessageStream,
    ) -> Result<ClientReply, Status> {
        let tail = TransportTail {
            transport: self.transport.clone(),
            send_encoding: plan.send_encoding,
            accept_encodings: self.config.accept_encodings.clone(),
            compression_threshold: self.config.compression_threshold,
            max_recv: plan.max_recv,
            max_send: plan.max_send,
        };
        let request = ClientRequest {
            metadata: plan.head.clone(),
            messages,
        };
        let next = ClientNext {
            chain: &self.interceptors[..],
            tail: &tail,
        };
        next.run(request, &plan.ctx).await
    }

    /// Decide whether a failed attempt is retried, and after what backoff.
    fn retry_delay(&self, plan: &CallPlan, attempt: u32, status: &Status) -> Option<Duration> {
        let policy = plan.retry.as_ref()?;
        if !policy.is_retryable(status.code()) {
            self.throttle.on_success();
            return None;
        }
        self.throttle.on_failure();
        if attempt >= policy.max_attempts {
            return None;
        }
        if !self.throttle.is_retry_allowed() {
            debug!("retry suppressed by throttle");
            return None;
        }
        if plan.deadline.map(|d| d.is_expired()).unwrap_or(false) {
            return None;
        }
        Some(backoff_delay(policy, attempt))
    }

    /// Resolve per-call parameters and assemble the leading request
    /// metadata: protocol headers first, then the caller's metadata with
    /// reserved keys stripped.
    fn plan_call(
        &self,
        method: &MethodDescriptor,
        options: &CallOptions,
    ) -> Result<CallPlan, RpcError> {
        let method_config = self.config.method_config(&method.full_name());

        let deadline = options.effective_deadline().or_else(|| {
            method_config
                .and_then(|m| m.timeout)
                .or(self.config.default_timeout)
                .map(Deadline::after)
        });
        let send_encoding = options.compression.or(self.config.send_encoding);
        let max_recv = method_config
            .and_then(|m| m.max_recv_message_size)
            .unwrap_or(self.config.max_recv_message_size);
        let max_send = method_config
            .and_then(|m| m.max_send_message_size)
            .or(self.config.max_send_message_size);
        let retry = method_config
            .and_then(|m| m.retry_policy.clone())
            .or_else(|| self.config.retry.clone());

        let mut head = Metadata::new();
        let static_header = |md: &mut Metadata, key: &str, value: String| {
            md.append(key, value)
                .expect("protocol header is valid metadata");
        };
        static_header(&mut head, PSEUDO_METHOD, "POST".to_string());
        static_header(&mut head, PSEUDO_SCHEME, "http".to_string());
        static_header(&mut head, PSEUDO_PATH, method.path());
        static_header(&mut head, TE, TE_TRAILERS.to_string());
        static_header(&mut head, CONTENT_TYPE, CONTENT_TYPE_GRPC.to_string());
        head.append(
            USER_AGENT,
            build_user_agent(self.config.user_agent.as_deref()),
        )
        .map_err(|e| RpcError::InvalidArgument(format!("invalid user-agent: {e}")))?;
        if let Some(encoding) = send_encoding {
            static_header(&mut head, GRPC_ENCODING, encoding.as_str().to_string());
        }
        static_header(
            &mut head,
            GRPC_ACCEPT_ENCODING,
            accept_encoding_value(&self.config.accept_encodings),
        );
        if let Some(deadline) = deadline {
            static_header(&mut head, GRPC_TIMEOUT, encode_timeout(deadline.remaining()));
        }
        head.merge(options.metadata.to_user_metadata());

        Ok(CallPlan {
            head,
            ctx: ClientCallContext {
                method: method.clone(),
                deadline,
            },
            deadline,
            send_encoding,
            max_recv,
            max_send,
            retry,
        })
    }
}

fn check_kind(method: &MethodDescriptor, expected: RpcKind) -> Result<(), RpcError> {
    if method.kind() != expected {
        return Err(RpcError::InvalidArgument(format!(
            "{method} is a {} method, called as {expected}",
            method.kind()
        )));
    }
    Ok(())
}

fn check_send_size(payload: &Bytes, max_send: Option<usize>) -> Result<(), RpcError> {
    if let Some(max) = max_send {
        if payload.len() > max {
            return Err(RpcError::Status(Status::resource_exhausted(format!(
                "request message of {} bytes exceeds the limit of {max} bytes",
                payload.len()
            ))));
        }
    }
    Ok(())
}

/// A replayable request sequence for single-request calls.
fn replayable_messages(payloads: Vec<Bytes>) -> MessageStream {
    stream::iter(payloads.into_iter().map(Ok)).boxed()
}

/// Lazily serialize a typed request stream.
fn encode_requests<C, S>(codec: Arc<C>, requests: S) -> MessageStream
where
    C: Codec,
    S: Stream<Item = C::Request> + Send + 'static,
{
    requests
        .map(move |message| codec.encode_request(&message))
        .boxed()
}

/// Consume a reply expected to carry exactly one message.
async fn read_single_response<T>(
    reply: ClientReply,
    decode: DecodeFn<T>,
    deadline: Option<Deadline>,
) -> Result<Response<T>, Status> {
    let mut streaming = Streaming::from_parts(reply.parts, decode, deadline);
    let Some(message) = streaming.message().await? else {
        return Err(Status::internal("missing response message"));
    };
    if streaming.message().await?.is_some() {
        return Err(Status::internal(
            "protocol violation: more than one response message for a single-response call",
        ));
    }
    let trailers = streaming.trailers().cloned().unwrap_or_default();
    Ok(Response::new(message)
        .with_metadata(reply.metadata)
        .with_trailers(trailers))
}

// -- The transport tail -------------------------------------------------------

/// The tail of the client interceptor chain: opens a stream, writes the
/// leading metadata, pumps request messages concurrently, and exposes the
/// inbound side as a pull-based part sequence.
struct TransportTail {
    transport: Arc<dyn ClientTransport>,
    send_encoding: Option<CompressionEncoding>,
    accept_encodings: Vec<CompressionEncoding>,
    compression_threshold: usize,
    max_recv: usize,
    max_send: Option<usize>,
}

#[async_trait]
impl ClientCallTail for TransportTail {
    async fn call(
        &self,
        request: ClientRequest,
        ctx: &ClientCallContext,
    ) -> Result<ClientReply, Status> {
        let StreamPair { mut sink, mut source } = self
            .transport
            .open_stream()
            .await
            .map_err(|e| Status::unavailable(format!("failed to open stream: {e}")))?;

        sink.send(WireFrame::Headers(request.metadata))
            .await
            .map_err(|e| Status::unavailable(format!("failed to send request metadata: {e}")))?;

        // Request messages flow concurrently with response reading; a local
        // failure is recorded so the response side can report its real cause.
        let local_error: LocalError = Arc::default();
        tokio::spawn(pump_requests(
            sink,
            request.messages,
            self.send_encoding,
            self.compression_threshold,
            self.max_send,
            local_error.clone(),
        ));

        // The first inbound frame decides the response shape: leading
        // metadata, or a trailers-only reply.
        let first = match ctx.deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline.instant(), source.recv()).await {
                    Ok(received) => received,
                    Err(_) => return Err(Status::deadline_exceeded("deadline exceeded")),
                }
            }
            None => source.recv().await,
        };

        match first {
            Ok(Some(WireFrame::Headers(head))) => {
                let response_encoding = match head.get(GRPC_ENCODING) {
                    Some(name) => match CompressionEncoding::from_str(name) {
                        Some(encoding) => Some(encoding),
                        None => {
                            return Err(Status::internal(format!(
                                "server responded with unsupported grpc-encoding {name:?}"
                            )));
                        }
                    },
                    None => None,
                };
                let parts =
                    response_parts(source, self.max_recv, response_encoding, local_error);
                Ok(ClientReply {
                    metadata: head.to_user_metadata(),
                    parts,
                })
            }
            Ok(Some(WireFrame::Trailers(trailers))) => {
                let status = Status::from_trailers(&trailers);
                Ok(ClientReply {
                    metadata: Metadata::new(),
                    parts: stream::iter(vec![Ok(ResponsePart::Status(status))]).boxed(),
                })
            }
            Ok(Some(WireFrame::Data(_))) => Err(Status::internal(
                "protocol violation: received message bytes before response metadata",
            )),
            Ok(None) => Err(take_local_error(&local_error).unwrap_or_else(|| {
                Status::unavailable("stream closed before response metadata")
            })),
            Err(TransportError::Reset) => Err(take_local_error(&local_error)
                .unwrap_or_else(|| Status::cancelled("stream reset by peer"))),
            Err(e) => Err(take_local_error(&local_error)
                .unwrap_or_else(|| Status::unavailable(e.to_string()))),
        }
    }
}

fn take_local_error(slot: &LocalError) -> Option<Status> {
    slot.lock().expect("local error lock poisoned").take()
}

fn set_local_error(slot: &LocalError, status: Status) {
    let mut slot = slot.lock().expect("local error lock poisoned");
    if slot.is_none() {
        *slot = Some(status);
    }
}

/// Writer task: frame and send each request payload, then half-close. Sends
/// suspend while the transport window is full. Local failures abort the
/// stream after recording their status.
async fn pump_requests(
    mut sink: Box<dyn FrameSink>,
    mut messages: MessageStream,
    encoding: Option<CompressionEncoding>,
    threshold: usize,
    max_send: Option<usize>,
    local_error: LocalError,
) {
    while let Some(item) = messages.next().await {
        let payload = match item {
            Ok(payload) => payload,
            Err(status) => {
                set_local_error(&local_error, status);
                sink.abort();
                return;
            }
        };
        if let Some(max) = max_send {
            if payload.len() > max {
                set_local_error(
                    &local_error,
                    Status::resource_exhausted(format!(
                        "request message of {} bytes exceeds the limit of {max} bytes",
                        payload.len()
                    )),
                );
                sink.abort();
                return;
            }
        }
        let (body, compressed) = match encode_payload(payload, encoding, threshold) {
            Ok(encoded) => encoded,
            Err(status) => {
                set_local_error(&local_error, status);
                sink.abort();
                return;
            }
        };
        if sink
            .send(WireFrame::Data(encode_frame(body, compressed)))
            .await
            .is_err()
        {
            // The peer tore the stream down; the response side reports why.
            return;
        }
    }
    let _ = sink.close().await;
}

struct RecvState {
    source: Box<dyn FrameSource>,
    deframer: Deframer,
    encoding: Option<CompressionEncoding>,
    max_recv: usize,
    local_error: LocalError,
    done: bool,
}

/// The response part sequence: data frames reassembled and decompressed
/// into message parts, trailers becoming the terminal status. Frames are
/// pulled from the transport on demand.
fn response_parts(
    source: Box<dyn FrameSource>,
    max_recv: usize,
    encoding: Option<CompressionEncoding>,
    local_error: LocalError,
) -> PartStream {
    let state = RecvState {
        source,
        deframer: Deframer::new(max_recv),
        encoding,
        max_recv,
        local_error,
        done: false,
    };
    stream::unfold(state, |mut s| async move {
        if s.done {
            return None;
        }
        loop {
            match s.deframer.next_frame() {
                Ok(Some(frame)) => match decode_payload(frame, s.encoding, s.max_recv) {
                    Ok(payload) => return Some((Ok(ResponsePart::Message(payload)), s)),
                    Err(status) => {
                        s.done = true;
                        return Some((Err(status), s));
                    }
                },
                Ok(None) => {}
                Err(status) => {
                    s.done = true;
                    return Some((Err(status), s));
                }
            }
            match s.source.recv().await {
                Ok(Some(WireFrame::Data(chunk))) => s.deframer.push(chunk),
                Ok(Some(WireFrame::Trailers(trailers))) => {
                    s.done = true;
                    if s.deframer.has_partial() {
                        return Some((
                            Err(Status::internal(
                                "protocol violation: trailers arrived mid-frame",
                            )),
                            s,
                        ));
                    }
                    let status = Status::from_trailers(&trailers);
                    return Some((Ok(ResponsePart::Status(status)), s));
                }
                Ok(Some(WireFrame::Headers(_))) => {
                    s.done = true;
                    return Some((
                        Err(Status::internal(
                            "protocol violation: second metadata block on response stream",
                        )),
                        s,
                    ));
                }
                Ok(None) => {
                    s.done = true;
                    let status = take_local_error(&s.local_error).unwrap_or_else(|| {
                        Status::unavailable("stream closed before trailers")
                    });
                    warn!(code = %status.code(), "response stream ended without trailers");
                    return Some((Err(status), s));
                }
                Err(TransportError::Reset) => {
                    s.done = true;
                    let status = take_local_error(&s.local_error)
                        .unwrap_or_else(|| Status::cancelled("stream reset by peer"));
                    return Some((Err(status), s));
                }
                Err(e) => {
                    s.done = true;
                    let status = take_local_error(&s.local_error)
                        .unwrap_or_else(|| Status::unavailable(e.to_string()));
                    return Some((Err(status), s));
                }
            }
        }
    })
    .boxed()
}
