//! Core gRPC call runtime.
//!
//! This crate implements the per-call machinery of a gRPC implementation:
//! the length-prefixed message framing, the call state machine, metadata and
//! status handling, deadlines and cancellation, compression negotiation, an
//! interceptor chain on both sides, a server dispatch executor, and a client
//! call manager with retry throttling.
//!
//! It deliberately does not implement HTTP/2 framing, TLS, sockets, name
//! resolution, or protobuf code generation. A pluggable [`transport`]
//! delivers opened bidirectional streams, and a [`Codec`] pair supplied per
//! method maps typed messages to and from payload bytes. An in-process
//! channel transport ([`transport::local`]) connects a [`Client`] and a
//! [`Server`] without any of that machinery, which is how the test suites
//! drive the runtime end to end.

pub mod cancellation;
pub mod codec;
pub mod compression;
pub mod config;
pub mod context;
pub mod deadline;
pub mod error;
pub mod framing;
pub mod interceptor;
pub mod metadata;
pub mod method;
pub mod parts;
pub mod retry;
pub mod status;
pub mod streaming;
pub mod transport;

mod client;
mod executor;
mod server;

pub use cancellation::{CallbackId, CancelReason, CancellationToken};
pub use client::Client;
pub use codec::Codec;
pub use compression::CompressionEncoding;
pub use config::{
    CallOptions, ClientConfig, MethodConfig, RetryPolicy, RetryThrottleSettings, ServerConfig,
};
pub use context::ServerContext;
pub use deadline::Deadline;
pub use error::{Result, RpcError};
pub use interceptor::{
    ClientCallContext, ClientInterceptor, ClientNext, ClientReply, ClientRequest,
    ServerInterceptor, ServerNext, ServerReply, ServerRequest,
};
pub use metadata::{Metadata, MetadataValue};
pub use method::{MethodDescriptor, RpcKind};
pub use parts::{RequestPart, ResponsePart, StreamState};
pub use retry::RetryThrottle;
pub use server::{Server, ServerBuilder, ShutdownHandle};
pub use status::{Code, Status};
pub use streaming::{Response, ResponseSink, Streaming};
