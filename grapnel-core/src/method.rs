use std::fmt;
use std::sync::Arc;

use http::uri::PathAndQuery;

use crate::error::RpcError;

/// The four gRPC call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidi,
}

impl RpcKind {
    /// Whether the request side carries a stream of messages.
    pub fn is_client_streaming(self) -> bool {
        matches!(self, RpcKind::ClientStreaming | RpcKind::Bidi)
    }

    /// Whether the response side carries a stream of messages.
    pub fn is_server_streaming(self) -> bool {
        matches!(self, RpcKind::ServerStreaming | RpcKind::Bidi)
    }
}

impl fmt::Display for RpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcKind::Unary => "unary",
            RpcKind::ServerStreaming => "server-streaming",
            RpcKind::ClientStreaming => "client-streaming",
            RpcKind::Bidi => "bidi-streaming",
        };
        f.write_str(name)
    }
}

/// Identity of a single RPC method: fully-qualified service name, method
/// name, and call shape. Cheap to clone and shared by reference between the
/// client, server routing table, and interceptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    service: Arc<str>,
    method: Arc<str>,
    kind: RpcKind,
}

impl MethodDescriptor {
    /// Create a descriptor from a fully-qualified service name (e.g.
    /// `echo.Echo`) and a method name (e.g. `Get`).
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        kind: RpcKind,
    ) -> Result<Self, RpcError> {
        let service = service.into();
        let method = method.into();
        let path = format!("/{service}/{method}");
        path.parse::<PathAndQuery>()
            .map_err(|e| RpcError::InvalidArgument(format!("invalid method path {path:?}: {e}")))?;
        if service.is_empty() || method.is_empty() || method.contains('/') {
            return Err(RpcError::InvalidArgument(format!(
                "invalid method name {path:?}"
            )));
        }
        Ok(MethodDescriptor {
            service: service.into(),
            method: method.into(),
            kind,
        })
    }

    /// Parse a symbol in either `package.Service/Method` or
    /// `package.Service.Method` form.
    pub fn parse(symbol: &str, kind: RpcKind) -> Result<Self, RpcError> {
        let (service, method) = if let Some(slash_pos) = symbol.rfind('/') {
            (&symbol[..slash_pos], &symbol[slash_pos + 1..])
        } else if let Some(dot_pos) = symbol.rfind('.') {
            (&symbol[..dot_pos], &symbol[dot_pos + 1..])
        } else {
            return Err(RpcError::InvalidArgument(format!(
                "method name must be in the form 'Service/Method' or 'Service.Method': {symbol}"
            )));
        };
        MethodDescriptor::new(service, method, kind)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> RpcKind {
        self.kind
    }

    /// The request path: `/{service}/{method}`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    /// The fully-qualified method name without the leading slash:
    /// `{service}/{method}`. Used as the key for per-method configuration.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}
