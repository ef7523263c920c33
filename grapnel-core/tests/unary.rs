mod common;

use common::{get_method, EchoCodec, EchoHarness, EchoText};
use grapnel_core::{
    CallOptions, ClientConfig, Code, Metadata, MethodDescriptor, Response, RpcKind, ServerConfig,
    Status,
};

#[tokio::test]
async fn unary_echo() {
    let harness = EchoHarness::start(ServerConfig::default(), ClientConfig::default());
    let response = harness
        .client
        .unary(
            &get_method(),
            EchoCodec,
            EchoText::new("hi"),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.get_ref(), &EchoText::new("hi"));
}

#[tokio::test]
async fn unary_metadata_round_trip() {
    let method = MethodDescriptor::new("echo.Echo", "GetTagged", RpcKind::Unary).unwrap();
    let harness = EchoHarness::start_with(
        ServerConfig::default(),
        ClientConfig::default(),
        |builder| {
            builder.unary(
                MethodDescriptor::new("echo.Echo", "GetTagged", RpcKind::Unary).unwrap(),
                EchoCodec,
                |request: EchoText, ctx| async move {
                    let tag = ctx
                        .request_metadata()
                        .get("x-request-tag")
                        .unwrap_or("missing")
                        .to_string();
                    let mut leading = Metadata::new();
                    leading.append("x-seen-tag", tag).unwrap();
                    let mut trailing = Metadata::new();
                    trailing.append("x-done", "yes").unwrap();
                    Ok(Response::new(request)
                        .with_metadata(leading)
                        .with_trailers(trailing))
                },
            )
        },
    );

    let mut metadata = Metadata::new();
    metadata.append("x-request-tag", "tag-7").unwrap();
    let response = harness
        .client
        .unary(
            &method,
            EchoCodec,
            EchoText::new("payload"),
            CallOptions {
                metadata,
                ..CallOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.metadata().get("x-seen-tag"), Some("tag-7"));
    assert_eq!(response.trailers().get("x-done"), Some("yes"));
}

#[tokio::test]
async fn binary_metadata_round_trip() {
    let method = MethodDescriptor::new("echo.Echo", "GetBin", RpcKind::Unary).unwrap();
    let harness = EchoHarness::start_with(
        ServerConfig::default(),
        ClientConfig::default(),
        |builder| {
            builder.unary(
                MethodDescriptor::new("echo.Echo", "GetBin", RpcKind::Unary).unwrap(),
                EchoCodec,
                |request: EchoText, ctx| async move {
                    let blob = ctx
                        .request_metadata()
                        .get_bin("x-blob-bin")
                        .map(|b| b.to_vec())
                        .unwrap_or_default();
                    let mut leading = Metadata::new();
                    leading.append_bin("x-echo-bin", blob).unwrap();
                    Ok(Response::new(request).with_metadata(leading))
                },
            )
        },
    );

    let mut metadata = Metadata::new();
    metadata
        .append_bin("x-blob-bin", vec![0u8, 1, 2, 255])
        .unwrap();
    let response = harness
        .client
        .unary(
            &method,
            EchoCodec,
            EchoText::new("x"),
            CallOptions {
                metadata,
                ..CallOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        response.metadata().get_bin("x-echo-bin"),
        Some([0u8, 1, 2, 255].as_slice())
    );
}

#[tokio::test]
async fn handler_status_propagates_with_trailers() {
    let method = MethodDescriptor::new("echo.Echo", "Deny", RpcKind::Unary).unwrap();
    let harness = EchoHarness::start_with(
        ServerConfig::default(),
        ClientConfig::default(),
        |builder| {
            builder.unary(
                MethodDescriptor::new("echo.Echo", "Deny", RpcKind::Unary).unwrap(),
                EchoCodec,
                |_request: EchoText, _ctx| async move {
                    let mut trailing = Metadata::new();
                    trailing.append("x-reason", "policy").unwrap();
                    Err::<Response<EchoText>, Status>(
                        Status::permission_denied("not allowed").with_metadata(trailing),
                    )
                },
            )
        },
    );

    let err = harness
        .client
        .unary(
            &method,
            EchoCodec,
            EchoText::new("x"),
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    let status = err.status().expect("terminal status");
    assert_eq!(status.code(), Code::PermissionDenied);
    assert_eq!(status.message(), "not allowed");
    assert_eq!(status.metadata().get("x-reason"), Some("policy"));
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let harness = EchoHarness::start(ServerConfig::default(), ClientConfig::default());
    let missing = MethodDescriptor::new("echo.Echo", "Nope", RpcKind::Unary).unwrap();
    let err = harness
        .client
        .unary(
            &missing,
            EchoCodec,
            EchoText::new("x"),
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.status().map(|s| s.code()),
        Some(Code::Unimplemented)
    );
}

#[tokio::test]
async fn kind_mismatch_is_rejected_locally() {
    let harness = EchoHarness::start(ServerConfig::default(), ClientConfig::default());
    let wrong = MethodDescriptor::new("echo.Echo", "Expand", RpcKind::ServerStreaming).unwrap();
    let err = harness
        .client
        .unary(
            &wrong,
            EchoCodec,
            EchoText::new("x"),
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(err.status().is_none(), "rejected before reaching the wire");
}

#[tokio::test]
async fn oversized_request_is_resource_exhausted() {
    let mut client_config = ClientConfig::default();
    client_config.max_send_message_size = Some(8);
    let harness = EchoHarness::start(ServerConfig::default(), client_config);
    let err = harness
        .client
        .unary(
            &get_method(),
            EchoCodec,
            EchoText::new("way more than eight bytes"),
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.status().map(|s| s.code()),
        Some(Code::ResourceExhausted)
    );
}

#[tokio::test]
async fn oversized_response_rejected_by_client_limit() {
    let mut client_config = ClientConfig::default();
    client_config.max_recv_message_size = 4;
    let harness = EchoHarness::start(ServerConfig::default(), client_config);
    let err = harness
        .client
        .unary(
            &get_method(),
            EchoCodec,
            EchoText::new("longer than four"),
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.status().map(|s| s.code()),
        Some(Code::ResourceExhausted)
    );
}
