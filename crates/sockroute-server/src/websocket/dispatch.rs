//! Dispatch bridge: turns one inbound frame into a synthetic HTTP request,
//! runs it through the connection's bound handler and awaits the reply.
//!
//! The handler receives a [`Responder`] and resolves it exactly once, either
//! inline or from a task it spawns. The bridge awaits the matching
//! [`PendingReply`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::{CONNECTION, CONTENT_TYPE, HeaderName, UPGRADE};
use axum::http::{HeaderMap, HeaderValue, Method, Request};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sockroute_core::{ConnectionId, HandlerError, InboundFrame, PeerKey};
use tokio::sync::oneshot;
use tracing::debug;

use crate::routes::Route;

/// Content type stamped on every synthetic request.
pub const SYNTHETIC_CONTENT_TYPE: &str = "application/json";

type ReplyResult = Result<Bytes, HandlerError>;

/// Per-connection request context, reused for every frame on the connection.
///
/// Handlers get it as `&mut` for the duration of one invocation only; the
/// current request is replaced when the next frame is dispatched. Values put
/// in the state bag survive across frames.
#[derive(Debug)]
pub struct RequestContext {
    peer: PeerKey,
    connection_id: ConnectionId,
    method: Method,
    path: String,
    headers: HeaderMap,
    request: Option<Request<Bytes>>,
    sequence: u64,
    state: HashMap<String, Value>,
}

impl RequestContext {
    /// Context for a connection upgraded against `route`.
    pub fn new(peer: PeerKey, connection_id: ConnectionId, route: &Route, headers: HeaderMap) -> Self {
        Self {
            peer,
            connection_id,
            method: route.method().clone(),
            path: route.path().to_owned(),
            headers,
            request: None,
            sequence: 0,
            state: HashMap::new(),
        }
    }

    /// Remote identity of the connection.
    pub fn peer(&self) -> &PeerKey {
        &self.peer
    }

    /// Id of the owning connection actor.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Method of the route the connection was upgraded against.
    pub fn route_method(&self) -> &Method {
        &self.method
    }

    /// Path of the route the connection was upgraded against.
    pub fn route_path(&self) -> &str {
        &self.path
    }

    /// Headers of the upgrade request.
    pub fn upgrade_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Synthetic request for the frame being handled.
    pub fn request(&self) -> Option<&Request<Bytes>> {
        self.request.as_ref()
    }

    /// Body of the current request (empty before the first frame).
    pub fn body(&self) -> &[u8] {
        self.request.as_ref().map_or(&[][..], |r| r.body().as_ref())
    }

    /// Decode the current body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(self.body())
            .map_err(|e| HandlerError::InvalidRequest(format!("body is not valid JSON: {e}")))
    }

    /// 1-based index of the frame being handled.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Read a value from the connection's state bag.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Store a value in the connection's state bag, returning the previous one.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state.insert(key.into(), value)
    }

    /// Remove a value from the connection's state bag.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.state.remove(key)
    }

    fn begin(&mut self, request: Request<Bytes>) {
        self.sequence += 1;
        self.request = Some(request);
    }
}

/// The reply-producing half handed to a handler. Consumed by the first reply.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<ReplyResult>,
}

impl Responder {
    /// Reply with raw text.
    pub fn text(self, text: impl Into<String>) {
        self.resolve(Ok(Bytes::from(text.into())));
    }

    /// Reply with a raw payload. Non UTF-8 payloads go out as binary frames.
    pub fn bytes(self, payload: impl Into<Bytes>) {
        self.resolve(Ok(payload.into()));
    }

    /// Reply with a structured map, encoded as a JSON object.
    pub fn map(self, map: Map<String, Value>) {
        self.json(&map);
    }

    /// Reply with any serializable value, encoded as JSON.
    ///
    /// An encoding failure is reported like any other handler failure.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) {
        let encoded = serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(HandlerError::from);
        self.resolve(encoded);
    }

    /// Reply with an error. Always terminal: the peer gets the mapped error
    /// body and the connection is closed.
    pub fn error(self, err: HandlerError) {
        self.resolve(Err(err));
    }

    fn resolve(self, reply: ReplyResult) {
        if self.tx.send(reply).is_err() {
            debug!("reply discarded, dispatch is no longer waiting");
        }
    }
}

/// Future side of a [`Responder`].
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<ReplyResult>,
}

impl PendingReply {
    /// Wait for the reply. `None` waits forever.
    pub async fn wait(self, timeout: Option<Duration>) -> ReplyResult {
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.rx)
                .await
                .map_err(|_| HandlerError::ReplyTimeout(limit))?,
            None => self.rx.await,
        };
        received.map_err(|_| HandlerError::NoReply)?
    }
}

/// Create a linked responder / pending reply pair.
pub fn reply_channel() -> (Responder, PendingReply) {
    let (tx, rx) = oneshot::channel();
    (Responder { tx }, PendingReply { rx })
}

/// A route handler.
///
/// Errors returned from `handle` are treated exactly like an error reply.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle the frame whose synthetic request is in `ctx`.
    async fn handle(&self, ctx: &mut RequestContext, reply: Responder) -> Result<(), HandlerError>;
}

/// Adapter turning a synchronous closure into a [`Handler`].
pub struct HandlerFn<F>(F);

/// Wrap a closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut RequestContext, Responder) -> Result<(), HandlerError> + Send + Sync,
{
    HandlerFn(f)
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(&mut RequestContext, Responder) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, ctx: &mut RequestContext, reply: Responder) -> Result<(), HandlerError> {
        (self.0)(ctx, reply)
    }
}

/// Runs frames through one bound route.
pub struct DispatchBridge {
    route: Route,
    reply_timeout: Option<Duration>,
}

impl DispatchBridge {
    /// Bridge for `route`; `reply_timeout` of `None` waits forever.
    pub fn new(route: Route, reply_timeout: Option<Duration>) -> Self {
        Self {
            route,
            reply_timeout,
        }
    }

    /// The bound route.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Build the synthetic request for a frame.
    pub fn synthesize(
        &self,
        ctx: &RequestContext,
        frame: InboundFrame,
    ) -> Result<Request<Bytes>, HandlerError> {
        let mut builder = Request::builder().method(Method::POST).uri(self.route.path());
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in ctx.upgrade_headers() {
                if !is_handshake_header(name) {
                    let _ = headers.append(name.clone(), value.clone());
                }
            }
            let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static(SYNTHETIC_CONTENT_TYPE));
        }
        builder
            .body(frame.into_payload())
            .map_err(|e| HandlerError::InvalidRequest(e.to_string()))
    }

    /// Dispatch one frame and wait for the handler's reply.
    pub async fn dispatch(
        &self,
        ctx: &mut RequestContext,
        frame: InboundFrame,
    ) -> Result<Bytes, HandlerError> {
        let request = self.synthesize(ctx, frame)?;
        ctx.begin(request);

        let (responder, pending) = reply_channel();
        self.route.handler().handle(ctx, responder).await?;
        pending.wait(self.reply_timeout).await
    }
}

fn is_handshake_header(name: &HeaderName) -> bool {
    name == CONNECTION || name == UPGRADE || name.as_str().starts_with("sec-websocket-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_for(route: &Route) -> RequestContext {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-client", HeaderValue::from_static("ios"));
        let _ = headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        let _ = headers.insert("sec-websocket-key", HeaderValue::from_static("abc"));
        RequestContext::new(PeerKey::new("peer:1"), ConnectionId::new(), route, headers)
    }

    fn echo_route() -> Route {
        Route::new(
            Method::GET,
            "/ws/echo",
            handler_fn(|ctx, reply| {
                reply.text(String::from_utf8_lossy(ctx.body()).into_owned());
                Ok(())
            }),
        )
    }

    #[test]
    fn synthetic_request_shape() {
        let route = echo_route();
        let ctx = ctx_for(&route);
        let bridge = DispatchBridge::new(route, None);

        let req = bridge
            .synthesize(&ctx, InboundFrame::text(r#"{"op":"ping"}"#))
            .unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().path(), "/ws/echo");
        assert_eq!(req.headers()[CONTENT_TYPE], SYNTHETIC_CONTENT_TYPE);
        assert_eq!(req.headers()["x-client"], "ios");
        assert!(req.headers().get(UPGRADE).is_none());
        assert!(req.headers().get("sec-websocket-key").is_none());
        assert_eq!(req.body().as_ref(), br#"{"op":"ping"}"#);
    }

    #[tokio::test]
    async fn dispatch_returns_inline_reply() {
        let route = echo_route();
        let mut ctx = ctx_for(&route);
        let bridge = DispatchBridge::new(route, None);

        let out = bridge.dispatch(&mut ctx, InboundFrame::text("hi")).await.unwrap();
        assert_eq!(out, Bytes::from("hi"));
        assert_eq!(ctx.sequence(), 1);
        assert_eq!(ctx.body(), b"hi");
    }

    #[tokio::test]
    async fn reply_from_spawned_task() {
        let route = Route::new(
            Method::GET,
            "/ws",
            handler_fn(|_ctx, reply| {
                let _ = tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    reply.json(&json!({"late": true}));
                });
                Ok(())
            }),
        );
        let mut ctx = ctx_for(&route);
        let bridge = DispatchBridge::new(route, Some(Duration::from_secs(5)));

        let out = bridge.dispatch(&mut ctx, InboundFrame::text("{}")).await.unwrap();
        assert_eq!(out, Bytes::from(r#"{"late":true}"#));
    }

    #[tokio::test]
    async fn handler_error_propagates() {
        let route = Route::new(
            Method::GET,
            "/ws",
            handler_fn(|_ctx, _reply| Err(HandlerError::coded(3, "nope"))),
        );
        let mut ctx = ctx_for(&route);
        let bridge = DispatchBridge::new(route, None);

        let err = bridge.dispatch(&mut ctx, InboundFrame::text("x")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Coded { code: 3, .. }));
    }

    #[tokio::test]
    async fn dropped_responder_is_no_reply() {
        let route = Route::new(Method::GET, "/ws", handler_fn(|_ctx, _reply| Ok(())));
        let mut ctx = ctx_for(&route);
        let bridge = DispatchBridge::new(route, None);

        let err = bridge.dispatch(&mut ctx, InboundFrame::text("x")).await.unwrap_err();
        assert!(matches!(err, HandlerError::NoReply));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_timeout_expires() {
        let route = Route::new(
            Method::GET,
            "/ws",
            handler_fn(|_ctx, reply| {
                let _ = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    reply.text("too late");
                });
                Ok(())
            }),
        );
        let mut ctx = ctx_for(&route);
        let bridge = DispatchBridge::new(route, Some(Duration::from_secs(2)));

        let err = bridge.dispatch(&mut ctx, InboundFrame::text("x")).await.unwrap_err();
        assert!(matches!(err, HandlerError::ReplyTimeout(d) if d == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn json_decode_failure_is_invalid_request() {
        let route = Route::new(
            Method::GET,
            "/ws",
            handler_fn(|ctx, reply| {
                let body: Value = ctx.json()?;
                reply.json(&body);
                Ok(())
            }),
        );
        let mut ctx = ctx_for(&route);
        let bridge = DispatchBridge::new(route, None);

        let err = bridge.dispatch(&mut ctx, InboundFrame::text("{not json")).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn reply_primitives() {
        let (responder, pending) = reply_channel();
        let Value::Object(map) = json!({"a": 1}) else {
            unreachable!()
        };
        responder.map(map);
        assert_eq!(pending.wait(None).await.unwrap(), Bytes::from(r#"{"a":1}"#));

        let (responder, pending) = reply_channel();
        responder.error(HandlerError::msg("denied"));
        assert_eq!(pending.wait(None).await.unwrap_err().to_string(), "denied");
    }

    #[test]
    fn state_bag_persists_between_requests() {
        let route = echo_route();
        let mut ctx = ctx_for(&route);
        assert!(ctx.set("user", json!("ada")).is_none());
        ctx.begin(Request::new(Bytes::from_static(b"one")));
        ctx.begin(Request::new(Bytes::from_static(b"two")));
        assert_eq!(ctx.get("user"), Some(&json!("ada")));
        assert_eq!(ctx.body(), b"two");
        assert_eq!(ctx.sequence(), 2);
        assert_eq!(ctx.remove("user"), Some(json!("ada")));
    }
}
