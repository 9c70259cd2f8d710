//! OCPP WebSocket listener
//!
//! Accepts charge point connections, one task per socket. Handles:
//! - WebSocket upgrade with OCPP subprotocol negotiation
//! - Charge point identity from the URL path
//! - Request/response correlation for outbound remote commands
//! - Transport-level presence tracking in the registry

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::header,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::gateway::Gateway;
use crate::ocpp::{CallError, CallResult, OcppError, OcppMessage};

/// OCPP 1.6 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Per-connection outbound queue depth
const SEND_QUEUE: usize = 64;

/// Correlates outbound CALLs with the charge point replies that arrive
/// on the connection's read loop. One instance serves every connection.
pub struct RemoteCommander {
    connections: RwLock<HashMap<String, mpsc::Sender<OcppMessage>>>,
    pending: RwLock<HashMap<String, oneshot::Sender<Result<CallResult, OcppError>>>>,
    request_timeout: Duration,
}

impl RemoteCommander {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            request_timeout,
        }
    }

    /// Attach a charge point's outbound queue. A reconnect replaces the
    /// stale sender.
    pub async fn register(&self, charger_id: &str, sender: mpsc::Sender<OcppMessage>) {
        let mut connections = self.connections.write().await;
        connections.insert(charger_id.to_string(), sender);
    }

    pub async fn unregister(&self, charger_id: &str) {
        let mut connections = self.connections.write().await;
        connections.remove(charger_id);
    }

    pub async fn is_connected(&self, charger_id: &str) -> bool {
        self.connections.read().await.contains_key(charger_id)
    }

    /// Send a CALL to a charge point and wait for its reply.
    pub async fn request(
        &self,
        charger_id: &str,
        call: crate::ocpp::Call,
    ) -> Result<CallResult, OcppError> {
        let sender = {
            let connections = self.connections.read().await;
            connections
                .get(charger_id)
                .cloned()
                .ok_or_else(|| OcppError::NotConnected(charger_id.to_string()))?
        };

        let message_id = call.message_id.clone();
        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending = self.pending.write().await;
            pending.insert(message_id.clone(), response_tx);
        }

        if sender.send(OcppMessage::Call(call)).await.is_err() {
            let mut pending = self.pending.write().await;
            pending.remove(&message_id);
            return Err(OcppError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_) => {
                let mut pending = self.pending.write().await;
                pending.remove(&message_id);
                Err(OcppError::Timeout)
            }
        }
    }

    /// Resolve a pending request from a CALLRESULT/CALLERROR that arrived
    /// on some connection's read loop.
    pub async fn complete(&self, message_id: &str, result: Result<CallResult, OcppError>) {
        let tx = {
            let mut pending = self.pending.write().await;
            pending.remove(message_id)
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                // Late reply after timeout, or an id we never issued.
                debug!(message_id, "reply with no pending request dropped");
            }
        }
    }
}

/// The WebSocket listener for charge point connections
pub struct OcppServer {
    gateway: Arc<Gateway>,
}

impl OcppServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Bind and accept until the task is dropped.
    pub async fn run(&self) -> Result<(), OcppError> {
        let addr = &self.gateway.config().listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!("listening for charge points on {}", addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                handle_connection(gateway, stream, peer).await;
            });
        }
    }
}

/// Serve one charge point connection until it closes.
async fn handle_connection(gateway: Arc<Gateway>, stream: TcpStream, peer: SocketAddr) {
    // Capture the charge point id from the URL path during the upgrade.
    let mut path = String::new();
    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        resp.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            header::HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );
        Ok(resp)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "WebSocket handshake failed: {}", e);
            return;
        }
    };

    let charger_id = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string();
    if charger_id.is_empty() {
        warn!(%peer, "connection without a charge point id in the path");
        return;
    }

    info!(charger = charger_id.as_str(), %peer, "charge point connected");
    gateway.registry().mark_connected(&charger_id).await;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (send_tx, mut send_rx) = mpsc::channel::<OcppMessage>(SEND_QUEUE);
    gateway.commander().register(&charger_id, send_tx.clone()).await;

    // Sender task: the single writer for this socket.
    let sender_handle = tokio::spawn(async move {
        while let Some(msg) = send_rx.recv().await {
            let bytes = match msg.to_bytes() {
                Ok(b) => b,
                Err(e) => {
                    error!("failed to serialize message: {}", e);
                    continue;
                }
            };

            debug!("sending: {}", String::from_utf8_lossy(&bytes));

            if let Err(e) = ws_tx
                .send(Message::Text(String::from_utf8_lossy(&bytes).into_owned().into()))
                .await
            {
                error!("failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    // Read loop.
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                debug!(charger = charger_id.as_str(), "received: {}", text);

                match OcppMessage::parse(text.as_bytes()) {
                    Ok(OcppMessage::Call(call)) => {
                        let reply = match gateway.handle_call(&charger_id, &call).await {
                            Ok(result) => OcppMessage::CallResult(result),
                            Err(err) => OcppMessage::CallError(err),
                        };
                        if send_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(OcppMessage::CallResult(result)) => {
                        let message_id = result.message_id.clone();
                        gateway.commander().complete(&message_id, Ok(result)).await;
                    }
                    Ok(OcppMessage::CallError(err)) => {
                        let message_id = err.message_id.clone();
                        gateway
                            .commander()
                            .complete(&message_id, Err(remote_error(err)))
                            .await;
                    }
                    Err(e) => {
                        warn!(charger = charger_id.as_str(), "failed to parse OCPP message: {}", e);
                    }
                }
            }
            Ok(Message::Close(_)) => {
                info!(charger = charger_id.as_str(), "WebSocket closed by charge point");
                break;
            }
            Ok(Message::Ping(_)) => {
                // Pong is sent automatically by tungstenite.
            }
            Ok(_) => {}
            Err(e) => {
                warn!(charger = charger_id.as_str(), "WebSocket error: {}", e);
                break;
            }
        }
    }

    sender_handle.abort();
    gateway.commander().unregister(&charger_id).await;
    gateway.registry().mark_disconnected(&charger_id).await;
    info!(charger = charger_id.as_str(), "charge point disconnected");
}

fn remote_error(err: CallError) -> OcppError {
    OcppError::RemoteError {
        code: err.error_code,
        description: err.error_description,
        details: err.error_details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{Action, Call};

    #[tokio::test]
    async fn test_request_without_connection() {
        let commander = RemoteCommander::new(Duration::from_millis(100));
        let call = Call::remote_stop(1).unwrap();
        let err = commander.request("CHG-1", call).await.unwrap_err();
        assert!(matches!(err, OcppError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let commander = Arc::new(RemoteCommander::new(Duration::from_secs(1)));
        let (tx, mut rx) = mpsc::channel(8);
        commander.register("CHG-1", tx).await;

        let responder = {
            let commander = commander.clone();
            tokio::spawn(async move {
                let msg = rx.recv().await.unwrap();
                let call = match msg {
                    OcppMessage::Call(c) => c,
                    other => panic!("expected Call, got {:?}", other),
                };
                let result = CallResult::new(&call.message_id, serde_json::json!({})).unwrap();
                commander.complete(&call.message_id, Ok(result)).await;
            })
        };

        let call = Call::new(Action::RemoteStopTransaction, serde_json::json!({"transactionId": 5}))
            .unwrap();
        let result = commander.request("CHG-1", call).await.unwrap();
        assert!(!result.message_id.is_empty());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out_and_clears_pending() {
        let commander = RemoteCommander::new(Duration::from_millis(20));
        let (tx, _rx) = mpsc::channel(8);
        commander.register("CHG-1", tx).await;

        let call = Call::remote_stop(1).unwrap();
        let message_id = call.message_id.clone();
        let err = commander.request("CHG-1", call).await.unwrap_err();
        assert!(matches!(err, OcppError::Timeout));

        // The slot is gone; a late reply just logs.
        commander
            .complete(&message_id, Err(OcppError::ConnectionClosed))
            .await;
        assert!(commander.pending.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_sender() {
        let commander = RemoteCommander::new(Duration::from_millis(100));
        let (old_tx, old_rx) = mpsc::channel(8);
        commander.register("CHG-1", old_tx).await;
        drop(old_rx);

        let (new_tx, mut new_rx) = mpsc::channel(8);
        commander.register("CHG-1", new_tx).await;
        assert!(commander.is_connected("CHG-1").await);

        let call = Call::remote_stop(9).unwrap();
        let handle = tokio::spawn(async move {
            // Deliverable on the new connection; let the timeout fire.
            new_rx.recv().await
        });
        let err = commander.request("CHG-1", call).await.unwrap_err();
        assert!(matches!(err, OcppError::Timeout));
        assert!(handle.await.unwrap().is_some());
    }
}
