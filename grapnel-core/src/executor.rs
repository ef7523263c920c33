use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{stream, StreamExt};
use tracing::{debug, warn};

use crate::cancellation::{CancelReason, CancellationToken};
use crate::compression::{
    accept_encoding_value, decode_payload, encode_payload, inbound_encoding, outbound_encoding,
    CompressionEncoding,
};
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::deadline::{earliest, parse_timeout, Deadline};
use crate::framing::{encode_frame, Deframer};
use crate::interceptor::{ServerInterceptor, ServerNext, ServerRequest};
use crate::metadata::{
    Metadata, CONTENT_TYPE, CONTENT_TYPE_GRPC, GRPC_ACCEPT_ENCODING, GRPC_ENCODING, GRPC_TIMEOUT,
    PSEUDO_PATH,
};
use crate::parts::{DirectionState, RequestPart, ResponsePart, StreamState};
use crate::server::Route;
use crate::status::Status;
use crate::streaming::MessageStream;
use crate::transport::{
    AcceptedStream, FrameSink, FrameSource, StreamPair, TransportError, WireFrame,
};

const INVALID_MESSAGE_FIRST: &str =
    "Invalid inbound server stream; received message bytes at start of stream.";
const INVALID_TRAILERS_FIRST: &str =
    "Invalid inbound server stream; received trailers at start of stream.";
const INVALID_EMPTY_STREAM: &str = "Invalid inbound server stream; stream closed before metadata.";

/// Aborts the wrapped task when dropped. Used for the deadline timer so it
/// never outlives its call.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives one accepted stream from leading metadata to terminal status.
///
/// The executor never propagates an error to the accept loop: every stream
/// it touches is terminated with exactly one written status, after which the
/// outbound side is closed.
pub(crate) struct CallExecutor {
    pub(crate) routes: Arc<HashMap<String, Route>>,
    pub(crate) interceptors: Arc<[Arc<dyn ServerInterceptor>]>,
    pub(crate) config: Arc<ServerConfig>,
}

impl CallExecutor {
    pub(crate) async fn execute(self, accepted: AcceptedStream) {
        let AcceptedStream {
            stream: StreamPair { mut sink, mut source },
            peer,
        } = accepted;

        // Step 1: exactly one leading metadata block opens the call.
        let head = match source.recv().await {
            Ok(Some(WireFrame::Headers(head))) => head,
            Ok(Some(WireFrame::Data(_))) => {
                return finish_with_status(&mut sink, Status::internal(INVALID_MESSAGE_FIRST)).await;
            }
            Ok(Some(WireFrame::Trailers(_))) => {
                return finish_with_status(&mut sink, Status::internal(INVALID_TRAILERS_FIRST))
                    .await;
            }
            Ok(None) => {
                return finish_with_status(&mut sink, Status::internal(INVALID_EMPTY_STREAM)).await;
            }
            Err(e) => {
                return finish_with_status(
                    &mut sink,
                    Status::unknown(format!("transport error while awaiting request metadata: {e}")),
                )
                .await;
            }
        };

        let content_type_ok = head
            .get(CONTENT_TYPE)
            .map(|ct| ct.starts_with(CONTENT_TYPE_GRPC))
            .unwrap_or(false);
        if !content_type_ok {
            return finish_with_status(
                &mut sink,
                Status::internal(format!(
                    "invalid content-type {:?}",
                    head.get(CONTENT_TYPE).unwrap_or("")
                )),
            )
            .await;
        }

        // Resolve the method descriptor.
        let Some(path) = head.get(PSEUDO_PATH) else {
            return finish_with_status(
                &mut sink,
                Status::internal("request metadata is missing :path"),
            )
            .await;
        };
        let Some(route) = self.routes.get(path) else {
            debug!(path, "refusing call to unknown method");
            return finish_with_status(
                &mut sink,
                Status::unimplemented(format!("unknown method {path:?}")),
            )
            .await;
        };
        let method_config = self.config.method_config(&route.method.full_name());

        let max_recv = method_config
            .and_then(|m| m.max_recv_message_size)
            .unwrap_or(self.config.max_recv_message_size);
        let max_send = method_config
            .and_then(|m| m.max_send_message_size)
            .or(self.config.max_send_message_size);

        // Step 2: the deadline is the minimum of the transport-imposed and
        // locally configured ones.
        let transport_deadline = match head.get(GRPC_TIMEOUT).map(parse_timeout) {
            Some(Ok(timeout)) => Some(Deadline::after(timeout)),
            Some(Err(status)) => return finish_with_status(&mut sink, status).await,
            None => None,
        };
        let configured_deadline = method_config
            .and_then(|m| m.timeout)
            .or(self.config.default_timeout)
            .map(Deadline::after);
        let deadline = earliest(transport_deadline, configured_deadline);

        // Compression negotiation, both directions.
        let request_encoding =
            match inbound_encoding(head.get(GRPC_ENCODING), &self.config.accept_encodings) {
                Ok(encoding) => encoding,
                Err(status) => return finish_with_status(&mut sink, status).await,
            };
        let response_encoding =
            outbound_encoding(self.config.send_encoding, head.get(GRPC_ACCEPT_ENCODING));

        let token = CancellationToken::new();
        let ctx = ServerContext::new(
            route.method.clone(),
            peer,
            deadline,
            head.to_user_metadata(),
            token.clone(),
            HashMap::new(),
        );

        // The deadline timer cancels the whole call scope through the token.
        let _deadline_timer = deadline.map(|deadline| {
            let token = token.clone();
            AbortOnDrop(tokio::spawn(async move {
                tokio::time::sleep_until(deadline.instant()).await;
                token.cancel(CancelReason::DeadlineExceeded);
            }))
        });

        let messages = inbound_messages(source, max_recv, request_encoding, token.clone());
        let request = ServerRequest {
            metadata: ctx.request_metadata().clone(),
            messages,
        };

        let mut wrote_status = false;
        let status = {
            let drive = drive_call(
                &mut sink,
                &mut wrote_status,
                &self.interceptors,
                route,
                request,
                &ctx,
                response_encoding,
                &self.config.accept_encodings,
                self.config.compression_threshold,
                max_send,
                &token,
            );
            tokio::pin!(drive);
            tokio::select! {
                reason = token.await_cancelled() => reason.to_status(),
                status = &mut drive => status,
            }
        };

        if !wrote_status {
            let _ = sink.send(WireFrame::Trailers(status.to_trailers())).await;
        }
        let _ = sink.close().await;
        debug!(
            method = %ctx.method(),
            code = %status.code(),
            "call finished"
        );
    }
}

/// Write a trailers-only response and close. Used for calls refused before
/// (or instead of) running the handler.
pub(crate) async fn finish_with_status(sink: &mut Box<dyn FrameSink>, status: Status) {
    let _ = sink.send(WireFrame::Trailers(status.to_trailers())).await;
    let _ = sink.close().await;
}

/// Run the interceptor chain (whose tail invokes the handler) and pump the
/// reply parts onto the wire. Returns the terminal status; `wrote_status`
/// reports whether it was already written as trailers.
#[allow(clippy::too_many_arguments)]
async fn drive_call(
    sink: &mut Box<dyn FrameSink>,
    wrote_status: &mut bool,
    interceptors: &[Arc<dyn ServerInterceptor>],
    route: &Route,
    request: ServerRequest,
    ctx: &ServerContext,
    response_encoding: Option<CompressionEncoding>,
    accepted_encodings: &[CompressionEncoding],
    compression_threshold: usize,
    max_send: Option<usize>,
    token: &CancellationToken,
) -> Status {
    let next = ServerNext {
        chain: interceptors,
        tail: route.tail.as_ref(),
    };
    let reply = match next.run(request, ctx).await {
        Ok(reply) => reply,
        Err(status) => return status,
    };

    let mut parts = reply.parts;
    let mut state = DirectionState::new();
    loop {
        let Some(item) = parts.next().await else {
            return Status::internal("call completed without a terminal status");
        };
        let part = match item {
            Ok(part) => part,
            Err(status) => return status,
        };
        match part {
            ResponsePart::Metadata(metadata) => {
                if let Err(status) = state.on_metadata() {
                    return status;
                }
                let headers =
                    response_headers(metadata, response_encoding, accepted_encodings);
                if sink.send(WireFrame::Headers(headers)).await.is_err() {
                    token.cancel(CancelReason::TransportLost);
                    return Status::unavailable("transport closed");
                }
            }
            ResponsePart::Message(payload) => {
                if state.state() == StreamState::Idle {
                    // Implicit empty leading metadata for replies built
                    // without one.
                    if let Err(status) = state.on_metadata() {
                        return status;
                    }
                    let headers = response_headers(
                        Metadata::new(),
                        response_encoding,
                        accepted_encodings,
                    );
                    if sink.send(WireFrame::Headers(headers)).await.is_err() {
                        token.cancel(CancelReason::TransportLost);
                        return Status::unavailable("transport closed");
                    }
                }
                if let Err(status) = state.on_message() {
                    return status;
                }
                if let Some(max) = max_send {
                    if payload.len() > max {
                        return Status::resource_exhausted(format!(
                            "response message of {} bytes exceeds the limit of {max} bytes",
                            payload.len()
                        ));
                    }
                }
                let (body, compressed) =
                    match encode_payload(payload, response_encoding, compression_threshold) {
                        Ok(encoded) => encoded,
                        Err(status) => return status,
                    };
                let frame = encode_frame(body, compressed);
                if sink.send(WireFrame::Data(frame)).await.is_err() {
                    token.cancel(CancelReason::TransportLost);
                    return Status::unavailable("transport closed");
                }
            }
            ResponsePart::Status(status) => {
                if let Err(status) = state.on_status() {
                    return status;
                }
                if sink
                    .send(WireFrame::Trailers(status.to_trailers()))
                    .await
                    .is_err()
                {
                    token.cancel(CancelReason::TransportLost);
                    return status;
                }
                *wrote_status = true;
                return status;
            }
        }
    }
}

/// Protocol headers for the response's leading metadata block, merged with
/// the handler-supplied user metadata.
fn response_headers(
    user: Metadata,
    encoding: Option<CompressionEncoding>,
    accepted: &[CompressionEncoding],
) -> Metadata {
    let mut md = Metadata::new();
    md.append(CONTENT_TYPE, CONTENT_TYPE_GRPC)
        .expect("static header is valid metadata");
    if let Some(encoding) = encoding {
        md.append(GRPC_ENCODING, encoding.as_str())
            .expect("static header is valid metadata");
    }
    md.append(GRPC_ACCEPT_ENCODING, accept_encoding_value(accepted))
        .expect("static header is valid metadata");
    md.merge(user.to_user_metadata());
    md
}

struct InboundState {
    source: Box<dyn FrameSource>,
    deframer: Deframer,
    encoding: Option<CompressionEncoding>,
    max_recv: usize,
    token: CancellationToken,
    done: bool,
}

type RequestPartStream = std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<RequestPart, Status>> + Send>>;

/// The inbound request part sequence after the leading metadata: data
/// frames reassembled into message parts, decompressed per the declared
/// request encoding. A header block showing up again is yielded as a
/// metadata part for the state machine to reject. Transport resets cancel
/// the call through the token.
fn inbound_parts(
    source: Box<dyn FrameSource>,
    max_recv: usize,
    encoding: Option<CompressionEncoding>,
    token: CancellationToken,
) -> RequestPartStream {
    let state = InboundState {
        source,
        deframer: Deframer::new(max_recv),
        encoding,
        max_recv,
        token,
        done: false,
    };
    stream::unfold(state, |mut s| async move {
        if s.done {
            return None;
        }
        loop {
            match s.deframer.next_frame() {
                Ok(Some(frame)) => match decode_payload(frame, s.encoding, s.max_recv) {
                    Ok(payload) => return Some((Ok(RequestPart::Message(payload)), s)),
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
                Ok(Some(WireFrame::Headers(metadata))) => {
                    s.done = true;
                    return Some((Ok(RequestPart::Metadata(metadata)), s));
                }
                Ok(Some(WireFrame::Trailers(_))) => {
                    s.done = true;
                    return Some((
                        Err(Status::internal(
                            "protocol violation: trailers on request stream",
                        )),
                        s,
                    ));
                }
                Ok(None) => {
                    s.done = true;
                    if s.deframer.has_partial() {
                        return Some((
                            Err(Status::internal(
                                "protocol violation: request stream ended mid-frame",
                            )),
                            s,
                        ));
                    }
                    return None;
                }
                Err(TransportError::Reset) => {
                    warn!("request stream reset by peer");
                    s.token.cancel(CancelReason::TransportLost);
                    s.done = true;
                    return Some((Err(Status::cancelled("stream reset by peer")), s));
                }
                Err(e) => {
                    warn!("request stream transport failure: {e}");
                    s.token.cancel(CancelReason::TransportLost);
                    s.done = true;
                    return Some((Err(Status::unavailable(e.to_string())), s));
                }
            }
        }
    })
    .boxed()
}

/// The typed message payload sequence fed to the handler. Any metadata
/// block after the leading one is a protocol violation.
fn inbound_messages(
    source: Box<dyn FrameSource>,
    max_recv: usize,
    encoding: Option<CompressionEncoding>,
    token: CancellationToken,
) -> MessageStream {
    inbound_parts(source, max_recv, encoding, token)
        .map(|item| match item {
            Ok(RequestPart::Message(payload)) => Ok(payload),
            Ok(RequestPart::Metadata(_)) => Err(Status::internal(
                "protocol violation: second metadata block on request stream",
            )),
            Err(status) => Err(status),
        })
        .boxed()
}
