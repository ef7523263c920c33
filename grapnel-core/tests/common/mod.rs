#![allow(dead_code)]

use bytes::Bytes;
use grapnel_core::transport::{LocalClientTransport, LocalServerTransport};
use grapnel_core::{
    Client, ClientConfig, Codec, MethodDescriptor, Response, RpcKind, Server, ServerBuilder,
    ServerConfig, ShutdownHandle, Status, Streaming,
};
use tokio::task::JoinHandle;

/// The message type of the echo test service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoText {
    pub text: String,
}

impl EchoText {
    pub fn new(text: impl Into<String>) -> Self {
        EchoText { text: text.into() }
    }
}

/// Codec carrying `EchoText` as plain UTF-8 bytes.
pub struct EchoCodec;

impl Codec for EchoCodec {
    type Request = EchoText;
    type Response = EchoText;

    fn encode_request(&self, message: &EchoText) -> Result<Bytes, Status> {
        Ok(Bytes::from(message.text.clone().into_bytes()))
    }

    fn decode_request(&self, payload: Bytes) -> Result<EchoText, Status> {
        String::from_utf8(payload.to_vec())
            .map(|text| EchoText { text })
            .map_err(|e| Status::internal(format!("invalid request payload: {e}")))
    }

    fn encode_response(&self, message: &EchoText) -> Result<Bytes, Status> {
        self.encode_request(message)
    }

    fn decode_response(&self, payload: Bytes) -> Result<EchoText, Status> {
        self.decode_request(payload)
    }
}

pub fn get_method() -> MethodDescriptor {
    MethodDescriptor::new("echo.Echo", "Get", RpcKind::Unary).expect("valid method")
}

pub fn expand_method() -> MethodDescriptor {
    MethodDescriptor::new("echo.Echo", "Expand", RpcKind::ServerStreaming).expect("valid method")
}

pub fn collect_method() -> MethodDescriptor {
    MethodDescriptor::new("echo.Echo", "Collect", RpcKind::ClientStreaming).expect("valid method")
}

pub fn update_method() -> MethodDescriptor {
    MethodDescriptor::new("echo.Echo", "Update", RpcKind::Bidi).expect("valid method")
}

/// Register the four standard echo methods: `Get` echoes its request,
/// `Expand` streams the whitespace-separated words of its request,
/// `Collect` joins all requests with spaces, and `Update` echoes each
/// request as it arrives.
pub fn echo_routes(builder: ServerBuilder) -> ServerBuilder {
    builder
        .unary(get_method(), EchoCodec, |request: EchoText, _ctx| async move {
            Ok(Response::new(request))
        })
        .server_streaming(
            expand_method(),
            EchoCodec,
            |request: EchoText, mut sink, _ctx| async move {
                for word in request.text.split_whitespace() {
                    sink.send(&EchoText::new(word)).await?;
                }
                Ok(())
            },
        )
        .client_streaming(
            collect_method(),
            EchoCodec,
            |mut requests: Streaming<EchoText>, _ctx| async move {
                let mut words: Vec<String> = Vec::new();
                while let Some(message) = requests.message().await? {
                    words.push(message.text);
                }
                Ok(Response::new(EchoText::new(words.join(" "))))
            },
        )
        .bidi(
            update_method(),
            EchoCodec,
            |mut requests: Streaming<EchoText>, mut sink, _ctx| async move {
                while let Some(message) = requests.message().await? {
                    sink.send(&message).await?;
                }
                Ok(())
            },
        )
}

/// A running in-process echo server and a client connected to it.
pub struct EchoHarness {
    pub client: Client,
    pub shutdown: ShutdownHandle,
    pub server_task: JoinHandle<()>,
}

impl EchoHarness {
    /// Start the standard echo service with the given configurations.
    pub fn start(server_config: ServerConfig, client_config: ClientConfig) -> Self {
        EchoHarness::start_with(server_config, client_config, echo_routes)
    }

    /// Start a server built by `register` (applied to a builder that
    /// already carries `server_config`).
    pub fn start_with(
        server_config: ServerConfig,
        client_config: ClientConfig,
        register: impl FnOnce(ServerBuilder) -> ServerBuilder,
    ) -> Self {
        let (client_transport, server_transport) = local_pair();
        let server = register(Server::builder().config(server_config)).build();
        let shutdown = server.shutdown_handle();
        let server_task = tokio::spawn(server.serve(server_transport));
        let client = Client::new(client_transport, Vec::new(), client_config);
        EchoHarness {
            client,
            shutdown,
            server_task,
        }
    }
}

pub fn local_pair() -> (LocalClientTransport, LocalServerTransport) {
    grapnel_core::transport::local(8)
}
