mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{EchoCodec, EchoHarness, EchoText};
use grapnel_core::{
    CallOptions, CancelReason, ClientConfig, Code, MethodDescriptor, Response, RpcKind,
    ServerConfig, Status,
};

fn sleep_method() -> MethodDescriptor {
    MethodDescriptor::new("echo.Echo", "Sleep", RpcKind::Unary).unwrap()
}

/// A unary handler that sleeps for 500 ms, recording any cancellation it
/// observes while waiting.
fn sleepy_routes(
    observed: Arc<Mutex<Option<CancelReason>>>,
) -> impl FnOnce(grapnel_core::ServerBuilder) -> grapnel_core::ServerBuilder {
    move |builder| {
        builder.unary(
            sleep_method(),
            EchoCodec,
            move |request: EchoText, ctx| {
                let observed = observed.clone();
                async move {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {
                            Ok(Response::new(request))
                        }
                        reason = ctx.cancelled() => {
                            *observed.lock().unwrap() = Some(reason);
                            Err(Status::cancelled("handler observed cancellation"))
                        }
                    }
                }
            },
        )
    }
}

#[tokio::test]
async fn client_deadline_expires_and_handler_observes_cancellation() {
    let observed = Arc::new(Mutex::new(None));
    let harness = EchoHarness::start_with(
        ServerConfig::default(),
        ClientConfig::default(),
        sleepy_routes(observed.clone()),
    );

    let err = harness
        .client
        .unary(
            &sleep_method(),
            EchoCodec,
            EchoText::new("hi"),
            CallOptions {
                timeout: Some(Duration::from_millis(100)),
                ..CallOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.status().map(|s| s.code()),
        Some(Code::DeadlineExceeded)
    );

    // The server-side deadline task cancels the handler through the token.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *observed.lock().unwrap(),
        Some(CancelReason::DeadlineExceeded)
    );
}

#[tokio::test]
async fn server_default_timeout_applies_without_client_deadline() {
    let observed = Arc::new(Mutex::new(None));
    let mut server_config = ServerConfig::default();
    server_config.default_timeout = Some(Duration::from_millis(50));
    let harness = EchoHarness::start_with(
        server_config,
        ClientConfig::default(),
        sleepy_routes(observed.clone()),
    );

    let err = harness
        .client
        .unary(
            &sleep_method(),
            EchoCodec,
            EchoText::new("hi"),
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.status().map(|s| s.code()),
        Some(Code::DeadlineExceeded)
    );
}

#[tokio::test]
async fn fast_handler_beats_the_deadline() {
    let harness = EchoHarness::start(ServerConfig::default(), ClientConfig::default());
    let response = harness
        .client
        .unary(
            &common::get_method(),
            EchoCodec,
            EchoText::new("quick"),
            CallOptions {
                timeout: Some(Duration::from_secs(5)),
                ..CallOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.get_ref(), &EchoText::new("quick"));
}

#[tokio::test]
async fn cancellation_callbacks_fire_on_deadline() {
    let callback_fired = Arc::new(Mutex::new(false));
    let method = MethodDescriptor::new("echo.Echo", "SleepCb", RpcKind::Unary).unwrap();
    let callback_flag = callback_fired.clone();
    let harness = EchoHarness::start_with(
        ServerConfig::default(),
        ClientConfig::default(),
        move |builder| {
            builder.unary(
                MethodDescriptor::new("echo.Echo", "SleepCb", RpcKind::Unary).unwrap(),
                EchoCodec,
                move |request: EchoText, ctx| {
                    let flag = callback_flag.clone();
                    async move {
                        ctx.cancellation().add_callback(move |_| {
                            *flag.lock().unwrap() = true;
                        });
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(Response::new(request))
                    }
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
            CallOptions {
                timeout: Some(Duration::from_millis(50)),
                ..CallOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.status().map(|s| s.code()),
        Some(Code::DeadlineExceeded)
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(*callback_fired.lock().unwrap());
}

#[tokio::test]
async fn streaming_read_respects_deadline() {
    // A server-streaming handler that stalls after its first message.
    let method = MethodDescriptor::new("echo.Echo", "Stall", RpcKind::ServerStreaming).unwrap();
    let harness = EchoHarness::start_with(
        ServerConfig::default(),
        ClientConfig::default(),
        |builder| {
            builder.server_streaming(
                MethodDescriptor::new("echo.Echo", "Stall", RpcKind::ServerStreaming).unwrap(),
                EchoCodec,
                |_request: EchoText, mut sink, ctx| async move {
                    sink.send(&EchoText::new("first")).await?;
                    ctx.cancelled().await;
                    Err(Status::cancelled("stalled handler cancelled"))
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
            CallOptions {
                timeout: Some(Duration::from_millis(100)),
                ..CallOptions::default()
            },
        )
        .await
        .unwrap();

    let mut streaming = response.into_inner();
    assert_eq!(
        streaming.message().await.unwrap(),
        Some(EchoText::new("first"))
    );
    let err = streaming.message().await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}
