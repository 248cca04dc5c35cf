use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientFrame, ClientRequest, ServerEvent, ServerFrame};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::SignalingChannel;
use crate::error::SignalingError;

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// JSON-over-WebSocket signaling. Requests are matched to responses by id;
/// server events are forwarded to the receiver returned from [`connect`].
///
/// [`connect`]: WebSocketSignaling::connect
pub struct WebSocketSignaling {
    sender: mpsc::Sender<Message>,
    pending: PendingRequests,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    request_timeout: Option<Duration>,
}

impl WebSocketSignaling {
    pub async fn connect(
        url: &str,
        request_timeout: Option<Duration>,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), SignalingError> {
        let (ws_stream, _) = connect_async(url).await?;
        tracing::info!("Signaling connected to {}", url);

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(100);
        let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(100);
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // Outgoing frames
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    tracing::error!("Failed to send WebSocket message");
                    break;
                }
            }
        });

        // Incoming frames
        let pending_clone = Arc::clone(&pending);
        let connected_clone = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Response { id, data }) => {
                            let waiter = pending_clone
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&id);
                            match waiter {
                                Some(waiter) => {
                                    let _ = waiter.send(data);
                                }
                                None => tracing::warn!("Response for unknown request {}", id),
                            }
                        }
                        Ok(ServerFrame::Event { event }) => {
                            if event_tx.send(event).await.is_err() {
                                tracing::debug!("Event receiver dropped, discarding event");
                            }
                        }
                        Err(e) => tracing::warn!("Ignoring malformed frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            connected_clone.store(false, Ordering::SeqCst);
            // Dropping the waiters fails every outstanding request with `Closed`
            pending_clone
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        });

        // Keepalive
        let tx_ping = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx_ping.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                sender: tx,
                pending,
                next_id: AtomicU64::new(1),
                connected,
                request_timeout,
            },
            event_rx,
        ))
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), SignalingError> {
        let json = serde_json::to_string(frame)?;
        self.sender
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| SignalingError::Closed)
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    async fn request(&self, request: ClientRequest) -> Result<Value, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        let frame = ClientFrame {
            id: Some(id),
            request,
        };
        if let Err(e) = self.send_frame(&frame).await {
            self.forget(id);
            return Err(e);
        }

        // The reader may have shut down between the check above and the insert
        if !self.is_connected() {
            self.forget(id);
            return Err(SignalingError::Closed);
        }

        match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply.map_err(|_| SignalingError::Closed),
                Err(_) => {
                    self.forget(id);
                    tracing::warn!("{} got no reply within {:?}", frame.request.method(), limit);
                    Err(SignalingError::Timeout(limit))
                }
            },
            None => rx.await.map_err(|_| SignalingError::Closed),
        }
    }

    async fn notify(&self, request: ClientRequest) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }
        self.send_frame(&ClientFrame { id: None, request }).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Relay stub: greets, answers every request with its own method name,
    /// and ignores notifications
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let greeting = json!({
                "type": "event",
                "event": { "name": "connection_success", "data": { "socketId": "s-1" } }
            });
            ws.send(Message::Text(greeting.to_string().into())).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                let frame: ClientFrame = serde_json::from_str(&text).unwrap();
                if let Some(id) = frame.id {
                    let reply = json!({
                        "type": "response",
                        "id": id,
                        "data": { "method": frame.request.method() }
                    });
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                }
            }
        });

        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_request_is_matched_to_response() {
        let url = spawn_echo_server().await;
        let (signaling, mut events) = WebSocketSignaling::connect(&url, None).await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(ServerEvent::ConnectionSuccess {
                socket_id: "s-1".to_string()
            })
        );
        assert!(signaling.is_connected());

        signaling
            .notify(ClientRequest::ConsumerResume {
                server_consumer_id: "c1".to_string(),
            })
            .await
            .unwrap();

        let reply = signaling
            .request(ClientRequest::CreateWebRtcTransport { consumer: true })
            .await
            .unwrap();
        assert_eq!(reply, json!({ "method": "createWebRtcTransport" }));

        let reply = signaling.request(ClientRequest::GetProducers).await.unwrap();
        assert_eq!(reply, json!({ "method": "getProducers" }));
    }

    #[tokio::test]
    async fn test_request_times_out_when_opted_in() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Read but never answer
            while let Some(Ok(_)) = ws.next().await {}
        });

        let limit = Duration::from_millis(50);
        let (signaling, _events) = WebSocketSignaling::connect(&format!("ws://{}", addr), Some(limit))
            .await
            .unwrap();

        let result = signaling.request(ClientRequest::GetProducers).await;
        assert!(matches!(result, Err(SignalingError::Timeout(d)) if d == limit));
    }
}
