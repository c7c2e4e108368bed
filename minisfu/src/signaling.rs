//! JSON-RPC 2.0 signaling over WebSocket
//!
//! One WebSocket connection drives one [`Peer`]. Requests:
//!
//! - `join {sid, offer}`: join session `sid`; replies with the publish answer
//! - `offer {desc}`: participant renegotiation; replies with the answer
//! - `answer {desc}`: completes a server offer; no reply on success
//! - `trickle {candidate, target}`: remote candidate; no reply on success
//!
//! The server pushes `offer` and `trickle` notifications. The peer is
//! closed when the socket goes away.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use minisfu_sfu::{
    IceCandidate, LegKind, Peer, SessionDescription, SessionId, Sfu, SfuError, SignalEvent,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::metrics;

/// JSON-RPC error code used for SFU failures
pub const SFU_ERROR: i64 = 500;
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Outbound messages buffered per connection
const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn invalid_params(err: &serde_json::Error) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {err}"))
    }
}

impl From<SfuError> for RpcError {
    fn from(err: SfuError) -> Self {
        Self {
            code: SFU_ERROR,
            message: err.to_string(),
            data: Some(serde_json::json!({ "kind": err.kind() })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl Notification {
    fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    pub sid: SessionId,
    pub offer: SessionDescription,
}

#[derive(Debug, Deserialize)]
pub struct NegotiationParams {
    pub desc: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrickleParams {
    pub target: u8,
    pub candidate: IceCandidate,
}

/// Notification the participant receives for a peer signal event
pub fn notification_for(event: SignalEvent) -> Notification {
    match event {
        SignalEvent::Offer(offer) => Notification::new("offer", to_value(&offer)),
        SignalEvent::Trickle { candidate, target } => Notification::new(
            "trickle",
            to_value(&TrickleParams {
                target: target.into(),
                candidate,
            }),
        ),
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(&e))
}

/// Signaling state of one connection
pub struct Connection {
    peer: Arc<Peer>,
}

impl Connection {
    #[must_use]
    pub const fn new(peer: Arc<Peer>) -> Self {
        Self { peer }
    }

    #[must_use]
    pub const fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Handle one raw text frame. Returns the reply to send, if any.
    pub async fn handle_text(&self, text: &str) -> Option<Response> {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => match serde_json::from_value::<Request>(value) {
                Ok(request) => self.handle(request).await,
                Err(e) => Some(Response::error(
                    Value::Null,
                    RpcError::new(INVALID_REQUEST, format!("invalid request: {e}")),
                )),
            },
            Err(e) => Some(Response::error(
                Value::Null,
                RpcError::new(PARSE_ERROR, format!("parse error: {e}")),
            )),
        }
    }

    /// Dispatch a request. Replies only when the request carries an id.
    pub async fn handle(&self, request: Request) -> Option<Response> {
        let Request { id, method, params } = request;
        let outcome = self.dispatch(&method, params).await;

        metrics::record_request(
            &method,
            match &outcome {
                Ok(_) => "ok",
                Err(_) => "error",
            },
        );

        match outcome {
            Ok(result) => id.zip(result).map(|(id, result)| Response::result(id, result)),
            Err(error) => {
                warn!(
                    peer_id = %self.peer.id(),
                    method = %method,
                    code = error.code,
                    error = %error.message,
                    "Signaling request failed"
                );
                id.map(|id| Response::error(id, error))
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Option<Value>, RpcError> {
        match method {
            "join" => {
                let JoinParams { sid, offer } = parse_params(params)?;
                let answer = self.peer.join_with_offer(sid, offer).await?;
                Ok(Some(to_value(&answer)))
            }
            "offer" => {
                let NegotiationParams { desc } = parse_params(params)?;
                let answer = self.peer.answer(desc).await?;
                Ok(Some(to_value(&answer)))
            }
            "answer" => {
                let NegotiationParams { desc } = parse_params(params)?;
                self.peer.set_remote_description(desc).await?;
                Ok(None)
            }
            "trickle" => {
                let TrickleParams { target, candidate } = parse_params(params)?;
                let target = LegKind::try_from(target)?;
                self.peer.trickle(candidate, target).await?;
                Ok(None)
            }
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        }
    }

    pub async fn close(&self) {
        self.peer.close().await;
    }
}

/// Shared state of the signaling router
#[derive(Clone)]
pub struct SignalingState {
    pub sfu: Arc<Sfu>,
    pub max_message_size: usize,
}

/// WebSocket endpoint: one peer per connection
pub async fn websocket_handler(
    State(state): State<SignalingState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state.sfu))
}

async fn handle_socket(socket: WebSocket, sfu: Arc<Sfu>) {
    let peer = Peer::new(sfu);
    let Some(mut signals) = peer.take_signal_receiver() else {
        error!(peer_id = %peer.id(), "Signal receiver already taken");
        return;
    };
    let connection = Connection::new(Arc::clone(&peer));
    metrics::SIGNALING_CONNECTIONS.inc();
    info!(peer_id = %peer.id(), "Signaling connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    // Single writer task for replies and notifications
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let notifier = {
        let tx = tx.clone();
        let peer_id = peer.id().clone();
        tokio::spawn(async move {
            while let Some(event) = signals.recv().await {
                let Ok(text) = serde_json::to_string(&notification_for(event)) else {
                    continue;
                };
                if tx.send(text).await.is_err() {
                    debug!(peer_id = %peer_id, "Connection gone, dropping notifications");
                    break;
                }
            }
        })
    };

    while let Some(message) = ws_stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(peer_id = %peer.id(), error = %e, "WebSocket receive error");
                break;
            }
        };

        if let Some(response) = connection.handle_text(text.as_str()).await {
            match serde_json::to_string(&response) {
                Ok(reply) => {
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(error = %e, "Failed to encode reply"),
            }
        }
    }

    connection.close().await;
    notifier.abort();
    drop(tx);
    let _ = writer.await;
    metrics::SIGNALING_CONNECTIONS.dec();
    info!(peer_id = %peer.id(), "Signaling connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use minisfu_sfu::test_helpers::{next_offer, sdp_with_tracks, test_sfu};
    use minisfu_sfu::{ErrorKind, SdpType, TrackKind};
    use serde_json::json;

    fn connection() -> (Connection, mpsc::UnboundedReceiver<SignalEvent>) {
        let (sfu, _factory) = test_sfu();
        connection_on(sfu)
    }

    fn connection_on(sfu: Arc<Sfu>) -> (Connection, mpsc::UnboundedReceiver<SignalEvent>) {
        let peer = Peer::new(sfu);
        let signals = peer.take_signal_receiver().unwrap();
        (Connection::new(peer), signals)
    }

    fn request(id: Option<i64>, method: &str, params: Value) -> Request {
        Request {
            id: id.map(Value::from),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn test_join_replies_with_answer() {
        let (conn, mut signals) = connection();
        let offer = sdp_with_tracks(&[(TrackKind::Video, "s", "cam")]);
        let response = conn
            .handle(request(
                Some(1),
                "join",
                json!({ "sid": "room1", "offer": { "type": "offer", "sdp": offer } }),
            ))
            .await
            .unwrap();

        assert_eq!(response.id, json!(1));
        assert!(response.error.is_none());
        let answer: SessionDescription = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);

        // Server offer for the subscribe leg follows as a notification
        let offer = next_offer(&mut signals).await.unwrap();
        let notification = notification_for(SignalEvent::Offer(offer));
        assert_eq!(notification.method, "offer");
        assert_eq!(notification.params["type"], "offer");
        conn.close().await;
    }

    #[tokio::test]
    async fn test_rejected_join_can_be_retried() {
        let (sfu, _factory) = test_sfu();
        let (conn, mut signals) = connection_on(Arc::clone(&sfu));

        let response = conn
            .handle(request(
                Some(1),
                "join",
                json!({ "sid": "room1", "offer": { "type": "offer", "sdp": "garbage" } }),
            ))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.data.unwrap()["kind"], json!(ErrorKind::NegotiationError));
        assert_eq!(sfu.session_count(), 0);
        assert!(sfu.get_session(&SessionId::from("room1")).is_err());

        let response = conn
            .handle(request(
                Some(2),
                "join",
                json!({ "sid": "room1", "offer": { "type": "offer", "sdp": sdp_with_tracks(&[]) } }),
            ))
            .await
            .unwrap();
        assert!(response.error.is_none());
        assert_eq!(sfu.get_session(&SessionId::from("room1")).unwrap().peer_count(), 1);
        next_offer(&mut signals).await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn test_answer_and_trickle_do_not_reply_on_success() {
        let (conn, mut signals) = connection();
        conn.handle(request(
            Some(1),
            "join",
            json!({ "sid": "room1", "offer": { "type": "offer", "sdp": sdp_with_tracks(&[]) } }),
        ))
        .await
        .unwrap();
        next_offer(&mut signals).await.unwrap();

        let reply = conn
            .handle(request(
                Some(2),
                "answer",
                json!({ "desc": { "type": "answer", "sdp": sdp_with_tracks(&[]) } }),
            ))
            .await;
        assert!(reply.is_none());

        let reply = conn
            .handle(request(
                None,
                "trickle",
                json!({ "target": 1, "candidate": { "candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0 } }),
            ))
            .await;
        assert!(reply.is_none());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_errors_carry_kind() {
        let (conn, _signals) = connection();
        let response = conn
            .handle(request(
                Some(7),
                "answer",
                json!({ "desc": { "type": "answer", "sdp": "v=0" } }),
            ))
            .await
            .unwrap();

        let error = response.error.unwrap();
        assert_eq!(error.code, SFU_ERROR);
        assert_eq!(error.data.unwrap()["kind"], json!(ErrorKind::InvalidState));
    }

    #[tokio::test]
    async fn test_failed_notification_has_no_reply() {
        let (conn, _signals) = connection();
        let reply = conn
            .handle(request(
                None,
                "offer",
                json!({ "desc": { "type": "offer", "sdp": "v=0" } }),
            ))
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_invalid_trickle_target() {
        let (conn, _signals) = connection();
        let response = conn
            .handle(request(
                Some(3),
                "trickle",
                json!({ "target": 5, "candidate": { "candidate": "candidate:1" } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, SFU_ERROR);
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let (conn, _signals) = connection();

        let response = conn.handle_text("{not json").await.unwrap();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);

        let response = conn.handle_text(r#"{"id": 1}"#).await.unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);

        let response = conn
            .handle(request(Some(1), "leave", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

        let response = conn
            .handle(request(Some(2), "join", json!({ "sid": "room1" })))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn test_trickle_notification_shape() {
        let notification = notification_for(SignalEvent::Trickle {
            candidate: IceCandidate::new("candidate:9"),
            target: LegKind::Publish,
        });
        assert_eq!(notification.method, "trickle");
        assert_eq!(notification.params["target"], 0);
        assert_eq!(notification.params["candidate"]["candidate"], "candidate:9");
    }
}
