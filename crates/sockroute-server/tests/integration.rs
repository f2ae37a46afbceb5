//! End-to-end tests over a real WebSocket.

use std::time::Duration;

use axum::http::Method;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use sockroute_core::HandlerError;
use sockroute_server::{BridgeServer, RouteTable, ServerConfig, ServerHandle, handler_fn};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn routes() -> RouteTable {
    let mut routes = RouteTable::new();
    let _ = routes
        .route(
            Method::GET,
            "/ws",
            handler_fn(|ctx, reply| {
                let body: Value = ctx.json()?;
                match body["op"].as_str() {
                    Some("ping") => reply.json(&json!({"pong": true})),
                    Some("whoami") => {
                        let client = ctx
                            .request()
                            .and_then(|r| r.headers().get("x-client"))
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("unknown")
                            .to_owned();
                        reply.json(&json!({"client": client}));
                    }
                    _ => return Err(HandlerError::coded(400, "unknown op")),
                }
                Ok(())
            }),
        )
        .route(
            Method::GET,
            "/divide",
            handler_fn(|ctx, reply| {
                let body: Value = ctx.json()?;
                let a = body["a"].as_i64().unwrap_or_default();
                let b = body["b"].as_i64().unwrap_or_default();
                if b == 0 {
                    return Err(HandlerError::msg("div by zero"));
                }
                reply.json(&json!({"result": a / b}));
                Ok(())
            }),
        );
    routes
}

async fn boot() -> (BridgeServer, ServerHandle) {
    let config = ServerConfig {
        keepalive_interval_secs: 0,
        ..ServerConfig::default()
    };
    let server = BridgeServer::new(config, routes());
    let handle = server.listen().await.unwrap();
    (server, handle)
}

async fn connect(handle: &ServerHandle, path: &str) -> WsStream {
    let mut request = format!("ws://{}{path}", handle.addr())
        .into_client_request()
        .unwrap();
    let _ = request
        .headers_mut()
        .insert("x-client", "integration".parse().unwrap());
    let (ws, _) = timeout(TIMEOUT, connect_async(request))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn send(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn recv_text(ws: &mut WsStream) -> Option<String> {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.expect("recv timed out")?;
        match msg {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(_) | Err(_) => return None,
        }
    }
}

#[tokio::test]
async fn ping_round_trip_keeps_connection_open() {
    let (server, handle) = boot().await;
    let mut ws = connect(&handle, "/ws").await;

    for _ in 0..3 {
        send(&mut ws, json!({"op": "ping"})).await;
        assert_eq!(recv_text(&mut ws).await.as_deref(), Some(r#"{"pong":true}"#));
    }
    assert_eq!(server.registry().live_count(), 1);

    let closed = server.shutdown().graceful_shutdown(handle.into_handles(), Some(TIMEOUT)).await;
    assert_eq!(closed, 1);
}

#[tokio::test]
async fn upgrade_headers_reach_the_handler() {
    let (server, handle) = boot().await;
    let mut ws = connect(&handle, "/ws").await;

    send(&mut ws, json!({"op": "whoami"})).await;
    assert_eq!(
        recv_text(&mut ws).await.as_deref(),
        Some(r#"{"client":"integration"}"#)
    );

    let _ = server.shutdown().graceful_shutdown(handle.into_handles(), Some(TIMEOUT)).await;
}

#[tokio::test]
async fn handler_failure_sends_error_body_then_closes() {
    let (server, handle) = boot().await;
    let mut ws = connect(&handle, "/divide").await;

    send(&mut ws, json!({"a": 6, "b": 3})).await;
    assert_eq!(recv_text(&mut ws).await.as_deref(), Some(r#"{"result":2}"#));

    send(&mut ws, json!({"a": 1, "b": 0})).await;
    assert_eq!(
        recv_text(&mut ws).await.as_deref(),
        Some(r#"{"code":0,"message":"div by zero","data":null}"#)
    );
    assert!(recv_text(&mut ws).await.is_none());

    timeout(TIMEOUT, async {
        while server.registry().live_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection was not unregistered");

    let _ = server.shutdown().graceful_shutdown(handle.into_handles(), Some(TIMEOUT)).await;
}

#[tokio::test]
async fn coded_failure_body() {
    let (server, handle) = boot().await;
    let mut ws = connect(&handle, "/ws").await;

    send(&mut ws, json!({"op": "dance"})).await;
    assert_eq!(
        recv_text(&mut ws).await.as_deref(),
        Some(r#"{"code":400,"message":"unknown op","data":null}"#)
    );

    let _ = server.shutdown().graceful_shutdown(handle.into_handles(), Some(TIMEOUT)).await;
}

#[tokio::test]
async fn unknown_path_is_not_upgraded() {
    let (server, handle) = boot().await;
    let url = format!("ws://{}/missing", handle.addr());
    let result = timeout(TIMEOUT, connect_async(url)).await.unwrap();
    assert!(result.is_err());

    let _ = server.shutdown().graceful_shutdown(handle.into_handles(), Some(TIMEOUT)).await;
}
