use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ServerContext;
use crate::deadline::Deadline;
use crate::metadata::Metadata;
use crate::method::MethodDescriptor;
use crate::status::Status;
use crate::streaming::{MessageStream, PartStream};

/// Call identity visible to client interceptors.
#[derive(Debug, Clone)]
pub struct ClientCallContext {
    pub method: MethodDescriptor,
    pub deadline: Option<Deadline>,
}

/// An outbound client call: the leading request metadata and the sequence
/// of serialized request payloads.
pub struct ClientRequest {
    pub metadata: Metadata,
    pub messages: MessageStream,
}

/// The client-side view of a response: leading metadata plus the pull-based
/// sequence of message parts ending in the terminal status.
pub struct ClientReply {
    pub metadata: Metadata,
    pub parts: PartStream,
}

impl std::fmt::Debug for ClientReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientReply")
            .field("metadata", &self.metadata)
            .field("parts", &"<PartStream>")
            .finish()
    }
}

/// An accepted server call: the request's leading metadata (protocol
/// headers stripped) and the sequence of serialized request payloads.
pub struct ServerRequest {
    pub metadata: Metadata,
    pub messages: MessageStream,
}

/// The server-side response: a pull-based part sequence producing at most
/// one leading metadata block, any messages, and the terminal status.
pub struct ServerReply {
    pub parts: PartStream,
}

/// A client-side call wrapper.
///
/// Interceptors may mutate the request metadata, wrap the message
/// sequences, short-circuit by returning a reply without calling `next`, or
/// map the reply on the way out. References into the request or reply must
/// not be retained beyond the call. Errors that do not carry a status can
/// be coerced with [`Status::from_error`].
#[async_trait]
pub trait ClientInterceptor: Send + Sync {
    /// Scope predicate: when false the interceptor is skipped without
    /// observing the call.
    fn applies_to(&self, _method: &MethodDescriptor) -> bool {
        true
    }

    async fn intercept(
        &self,
        request: ClientRequest,
        ctx: &ClientCallContext,
        next: ClientNext<'_>,
    ) -> Result<ClientReply, Status>;
}

/// A server-side call wrapper; symmetric to [`ClientInterceptor`] but
/// receives the server's part types and [`ServerContext`].
#[async_trait]
pub trait ServerInterceptor: Send + Sync {
    fn applies_to(&self, _method: &MethodDescriptor) -> bool {
        true
    }

    async fn intercept(
        &self,
        request: ServerRequest,
        ctx: &ServerContext,
        next: ServerNext<'_>,
    ) -> Result<ServerReply, Status>;
}

#[async_trait]
pub(crate) trait ClientCallTail: Send + Sync {
    async fn call(
        &self,
        request: ClientRequest,
        ctx: &ClientCallContext,
    ) -> Result<ClientReply, Status>;
}

#[async_trait]
pub(crate) trait ServerCallTail: Send + Sync {
    async fn call(&self, request: ServerRequest, ctx: &ServerContext)
        -> Result<ServerReply, Status>;
}

/// The rest of a client interceptor chain. The tail of the chain writes to
/// the transport.
pub struct ClientNext<'a> {
    pub(crate) chain: &'a [Arc<dyn ClientInterceptor>],
    pub(crate) tail: &'a dyn ClientCallTail,
}

impl ClientNext<'_> {
    /// Invoke the remainder of the chain.
    pub async fn run(
        mut self,
        request: ClientRequest,
        ctx: &ClientCallContext,
    ) -> Result<ClientReply, Status> {
        while let Some((head, rest)) = self.chain.split_first() {
            self.chain = rest;
            if head.applies_to(&ctx.method) {
                return head.intercept(request, ctx, self).await;
            }
        }
        self.tail.call(request, ctx).await
    }
}

/// The rest of a server interceptor chain. The tail of the chain invokes
/// the handler.
pub struct ServerNext<'a> {
    pub(crate) chain: &'a [Arc<dyn ServerInterceptor>],
    pub(crate) tail: &'a dyn ServerCallTail,
}

impl ServerNext<'_> {
    /// Invoke the remainder of the chain.
    pub async fn run(
        mut self,
        request: ServerRequest,
        ctx: &ServerContext,
    ) -> Result<ServerReply, Status> {
        while let Some((head, rest)) = self.chain.split_first() {
            self.chain = rest;
            if head.applies_to(ctx.method()) {
                return head.intercept(request, ctx, self).await;
            }
        }
        self.tail.call(request, ctx).await
    }
}
