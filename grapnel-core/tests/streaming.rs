mod common;

use common::{collect_method, expand_method, update_method, EchoCodec, EchoHarness, EchoText};
use grapnel_core::{
    CallOptions, ClientConfig, Code, CompressionEncoding, MethodDescriptor, RpcKind, ServerConfig,
    Status,
};

async fn drain(
    streaming: &mut grapnel_core::Streaming<EchoText>,
) -> Result<Vec<String>, Status> {
    let mut texts = Vec::new();
    while let Some(message) = streaming.message().await? {
        texts.push(message.text);
    }
    Ok(texts)
}

#[tokio::test]
async fn server_streaming_expand() {
    let harness = EchoHarness::start(ServerConfig::default(), ClientConfig::default());
    let response = harness
        .client
        .server_streaming(
            &expand_method(),
            EchoCodec,
            EchoText::new("a b c"),
            CallOptions::default(),
        )
        .await
        .unwrap();

    let mut streaming = response.into_inner();
    assert_eq!(drain(&mut streaming).await.unwrap(), ["a", "b", "c"]);
    assert!(streaming.status().unwrap().is_ok());
}

#[tokio::test]
async fn server_streaming_empty() {
    let harness = EchoHarness::start(ServerConfig::default(), ClientConfig::default());
    let response = harness
        .client
        .server_streaming(
            &expand_method(),
            EchoCodec,
            EchoText::new(""),
            CallOptions::default(),
        )
        .await
        .unwrap();

    let mut streaming = response.into_inner();
    assert!(drain(&mut streaming).await.unwrap().is_empty());
    assert!(streaming.status().unwrap().is_ok());
}

#[tokio::test]
async fn client_streaming_collect() {
    let harness = EchoHarness::start(ServerConfig::default(), ClientConfig::default());
    let requests = tokio_stream::iter(vec![
        EchoText::new("a"),
        EchoText::new("b"),
        EchoText::new("c"),
    ]);
    let response = harness
        .client
        .client_streaming(
            &collect_method(),
            EchoCodec,
            requests,
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.get_ref(), &EchoText::new("a b c"));
}

#[tokio::test]
async fn client_streaming_empty_input() {
    let harness = EchoHarness::start(ServerConfig::default(), ClientConfig::default());
    let response = harness
        .client
        .client_streaming(
            &collect_method(),
            EchoCodec,
            tokio_stream::iter(Vec::<EchoText>::new()),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.get_ref(), &EchoText::new(""));
}

#[tokio::test]
async fn bidi_echoes_in_order() {
    let harness = EchoHarness::start(ServerConfig::default(), ClientConfig::default());
    let requests = tokio_stream::iter(vec![
        EchoText::new("one"),
        EchoText::new("two"),
        EchoText::new("three"),
    ]);
    let response = harness
        .client
        .bidi(&update_method(), EchoCodec, requests, CallOptions::default())
        .await
        .unwrap();

    let mut streaming = response.into_inner();
    assert_eq!(
        drain(&mut streaming).await.unwrap(),
        ["one", "two", "three"]
    );
    assert!(streaming.status().unwrap().is_ok());
}

#[tokio::test]
async fn bidi_with_gzip_both_directions() {
    let mut server_config = ServerConfig::default();
    server_config.send_encoding = Some(CompressionEncoding::Gzip);
    let mut client_config = ClientConfig::default();
    client_config.send_encoding = Some(CompressionEncoding::Gzip);

    let harness = EchoHarness::start(server_config, client_config);
    let long = "a".repeat(4096);
    let requests = tokio_stream::iter(vec![
        EchoText::new(long.clone()),
        EchoText::new("two"),
        EchoText::new("three"),
    ]);
    let response = harness
        .client
        .bidi(&update_method(), EchoCodec, requests, CallOptions::default())
        .await
        .unwrap();

    let mut streaming = response.into_inner();
    assert_eq!(
        drain(&mut streaming).await.unwrap(),
        [long.as_str(), "two", "three"]
    );
    assert!(streaming.status().unwrap().is_ok());
}

#[tokio::test]
async fn per_call_compression_override() {
    let mut server_config = ServerConfig::default();
    server_config.send_encoding = Some(CompressionEncoding::Deflate);
    let harness = EchoHarness::start(server_config, ClientConfig::default());

    let requests = tokio_stream::iter(vec![EchoText::new("payload payload payload")]);
    let response = harness
        .client
        .bidi(
            &update_method(),
            EchoCodec,
            requests,
            CallOptions {
                compression: Some(CompressionEncoding::Deflate),
                ..CallOptions::default()
            },
        )
        .await
        .unwrap();

    let mut streaming = response.into_inner();
    assert_eq!(
        drain(&mut streaming).await.unwrap(),
        ["payload payload payload"]
    );
}

#[tokio::test]
async fn streaming_handler_failure_after_messages() {
    let method =
        MethodDescriptor::new("echo.Echo", "ExpandThenFail", RpcKind::ServerStreaming).unwrap();
    let harness = EchoHarness::start_with(
        ServerConfig::default(),
        ClientConfig::default(),
        |builder| {
            builder.server_streaming(
                MethodDescriptor::new("echo.Echo", "ExpandThenFail", RpcKind::ServerStreaming)
                    .unwrap(),
                EchoCodec,
                |_request: EchoText, mut sink, _ctx| async move {
                    sink.send(&EchoText::new("first")).await?;
                    Err(Status::data_loss("lost the rest"))
                },
            )
        },
    );

    let response = harness
        .client
        .server_streaming(
            &method,
            EchoCodec,
            EchoText::new("x"),
            CallOptions::default(),
        )
        .await
        .unwrap();

    let mut streaming = response.into_inner();
    // The message delivered before the failure stays observable.
    assert_eq!(
        streaming.message().await.unwrap(),
        Some(EchoText::new("first"))
    );
    let err = streaming.message().await.unwrap_err();
    assert_eq!(err.code(), Code::DataLoss);
    assert_eq!(err.message(), "lost the rest");
}
