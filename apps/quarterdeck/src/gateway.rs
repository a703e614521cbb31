//! Viewer-facing connection gateway.
//!
//! Each WebSocket connection gets a registry record, an unbounded outbound
//! channel drained by a writer task, and a read loop that dispatches
//! inbound requests. Log subscriptions are mapped onto stream sessions
//! owned by the connection; ownership drives exhaustive cleanup on
//! disconnect. Cluster events fan out to the connections subscribed to the
//! event's namespace.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use chrono::Utc;
use console_proto::{AckRequest, ClientMessage, ServerMessage};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::log_stream::{LogStreamManager, LogStreamSink};

/// State for a single connected viewer.
pub struct ClientConnection {
    pub connection_id: String,
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Stream ids this connection subscribed to; drives disconnect cleanup.
    owned_streams: Mutex<HashSet<String>>,
    /// Namespaces this connection wants cluster events for.
    namespaces: Mutex<HashSet<String>>,
}

impl ClientConnection {
    fn new(connection_id: String, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            connection_id,
            tx,
            owned_streams: Mutex::new(HashSet::new()),
            namespaces: Mutex::new(HashSet::new()),
        }
    }

    fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    fn subscribed_to(&self, namespace: &str) -> bool {
        self.namespaces.lock().unwrap().contains(namespace)
    }
}

/// Forwards one session's callbacks to its owning connection, tagged with
/// the stream id the viewer subscribed under.
struct ConnectionSink {
    stream_id: String,
    namespace: String,
    pod_name: String,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl LogStreamSink for ConnectionSink {
    fn on_line(&self, line: &str) {
        let _ = self.tx.send(ServerMessage::LogLine {
            stream_id: self.stream_id.clone(),
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
            line: line.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn on_error(&self, error: &str) {
        let _ = self.tx.send(ServerMessage::LogError {
            stream_id: self.stream_id.clone(),
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
            error: error.to_string(),
        });
    }

    fn on_end(&self) {
        let _ = self.tx.send(ServerMessage::LogEnd {
            stream_id: self.stream_id.clone(),
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
        });
    }
}

fn derive_stream_id(
    connection_id: &str,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
) -> String {
    format!(
        "{}:{}:{}:{}",
        connection_id,
        namespace,
        pod,
        container.unwrap_or("default")
    )
}

/// Connection registry plus the mapping from viewer requests onto stream
/// sessions and broadcast groups. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Gateway {
    connections: Arc<DashMap<String, Arc<ClientConnection>>>,
    streams: LogStreamManager,
}

impl Gateway {
    pub fn new(streams: LogStreamManager) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            streams,
        }
    }

    pub fn streams(&self) -> &LogStreamManager {
        &self.streams
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Register a new viewer. Returns the connection record and the
    /// receiving half of its outbound channel.
    pub fn on_connect(&self) -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<ServerMessage>) {
        let connection_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ClientConnection::new(connection_id.clone(), tx));
        self.connections.insert(connection_id, connection.clone());
        gauge!("quarterdeck_connections_active", self.connections.len() as f64);
        (connection, rx)
    }

    /// Stop every session the connection owns, then discard its record.
    /// Individual stops are independent no-ops if the session is already
    /// gone.
    pub fn on_disconnect(&self, connection: &ClientConnection) {
        let owned: Vec<String> = connection.owned_streams.lock().unwrap().drain().collect();
        for stream_id in &owned {
            self.streams.stop_session(stream_id);
        }
        self.connections.remove(&connection.connection_id);
        gauge!("quarterdeck_connections_active", self.connections.len() as f64);
        debug!(
            connection_id = %connection.connection_id,
            stopped = owned.len(),
            "connection cleaned up"
        );
    }

    pub async fn dispatch(
        &self,
        connection: &Arc<ClientConnection>,
        message: ClientMessage,
    ) -> ServerMessage {
        match message {
            ClientMessage::SubscribeLogs {
                namespace,
                pod_name,
                container,
            } => {
                self.subscribe_logs(connection, &namespace, &pod_name, container.as_deref())
                    .await
            }
            ClientMessage::UnsubscribeLogs { stream_id } => {
                self.unsubscribe_logs(connection, &stream_id)
            }
            ClientMessage::SubscribeNamespace { namespace } => {
                self.subscribe_namespace(connection, &namespace)
            }
            ClientMessage::UnsubscribeNamespace { namespace } => {
                self.unsubscribe_namespace(connection, &namespace)
            }
        }
    }

    /// Start (or replace) a log tail for this connection. Ownership is
    /// recorded only after the session is streaming; a rejected
    /// subscription leaves nothing behind to unsubscribe.
    pub async fn subscribe_logs(
        &self,
        connection: &Arc<ClientConnection>,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> ServerMessage {
        let stream_id = derive_stream_id(&connection.connection_id, namespace, pod, container);
        let sink: Arc<dyn LogStreamSink> = Arc::new(ConnectionSink {
            stream_id: stream_id.clone(),
            namespace: namespace.to_string(),
            pod_name: pod.to_string(),
            tx: connection.tx.clone(),
        });
        match self
            .streams
            .start_session(&stream_id, namespace, pod, container, sink)
            .await
        {
            Ok(()) => {
                connection
                    .owned_streams
                    .lock()
                    .unwrap()
                    .insert(stream_id.clone());
                ServerMessage::ack_stream(AckRequest::SubscribeLogs, stream_id)
            }
            Err(err) => {
                warn!(
                    connection_id = %connection.connection_id,
                    namespace, pod, error = %err,
                    "log subscription rejected"
                );
                ServerMessage::ack_failure(AckRequest::SubscribeLogs, err.to_string())
            }
        }
    }

    /// Always succeeds; unknown ids are a no-op. Only ids the connection
    /// owns can reach the session manager.
    pub fn unsubscribe_logs(&self, connection: &ClientConnection, stream_id: &str) -> ServerMessage {
        if connection.owned_streams.lock().unwrap().remove(stream_id) {
            self.streams.stop_session(stream_id);
        }
        ServerMessage::ack(AckRequest::UnsubscribeLogs)
    }

    pub fn subscribe_namespace(
        &self,
        connection: &ClientConnection,
        namespace: &str,
    ) -> ServerMessage {
        connection
            .namespaces
            .lock()
            .unwrap()
            .insert(namespace.to_string());
        ServerMessage::ack(AckRequest::SubscribeNamespace)
    }

    pub fn unsubscribe_namespace(
        &self,
        connection: &ClientConnection,
        namespace: &str,
    ) -> ServerMessage {
        connection.namespaces.lock().unwrap().remove(namespace);
        ServerMessage::ack(AckRequest::UnsubscribeNamespace)
    }

    pub fn broadcast_pod_status(&self, namespace: &str, pod_name: &str, status: &str, phase: &str) {
        self.broadcast(
            namespace,
            ServerMessage::PodStatus {
                namespace: namespace.to_string(),
                pod_name: pod_name.to_string(),
                status: status.to_string(),
                phase: phase.to_string(),
                timestamp: Utc::now(),
            },
            "pod-status",
        );
    }

    pub fn broadcast_deployment_update(
        &self,
        namespace: &str,
        deployment_name: &str,
        replicas: i32,
        ready_replicas: i32,
    ) {
        self.broadcast(
            namespace,
            ServerMessage::DeploymentUpdate {
                namespace: namespace.to_string(),
                deployment_name: deployment_name.to_string(),
                replicas,
                ready_replicas,
                timestamp: Utc::now(),
            },
            "deployment-update",
        );
    }

    pub fn broadcast_alert(
        &self,
        namespace: &str,
        alert_type: &str,
        severity: &str,
        message: &str,
    ) {
        self.broadcast(
            namespace,
            ServerMessage::AlertTriggered {
                namespace: namespace.to_string(),
                alert_type: alert_type.to_string(),
                severity: severity.to_string(),
                message: message.to_string(),
                timestamp: Utc::now(),
            },
            "alert",
        );
    }

    /// Fan out one event to every connection subscribed to `namespace`.
    fn broadcast(&self, namespace: &str, message: ServerMessage, kind: &'static str) {
        let mut recipients = 0u32;
        for connection in self.connections.iter() {
            if connection.subscribed_to(namespace) {
                recipients += 1;
                if !connection.send(message.clone()) {
                    warn!(
                        connection_id = %connection.connection_id,
                        "failed to queue broadcast event (connection closing)"
                    );
                }
            }
        }
        counter!("quarterdeck_broadcast_events_total", 1, "kind" => kind);
        debug!(namespace, kind, recipients, "broadcast event");
    }
}

/// WebSocket upgrade handler for `GET /ws`.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(gateway): State<Gateway>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Gateway) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut rx) = gateway.on_connect();

    // Drain the outbound channel into the socket.
    let writer_connection_id = connection.connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&message) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(connection_id = %writer_connection_id, "outbound writer ended");
    });

    debug!(connection_id = %connection.connection_id, "viewer connected");

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(err) => {
                error!(connection_id = %connection.connection_id, error = %err, "websocket error");
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    let response = gateway.dispatch(&connection, client_msg).await;
                    if !connection.send(response) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(
                        connection_id = %connection.connection_id,
                        error = %err,
                        "failed to parse client message"
                    );
                    let _ = connection.send(ServerMessage::Error {
                        message: format!("invalid message format: {}", err),
                    });
                }
            },
            Message::Close(_) => break,
            // Ping/Pong are answered by the protocol layer.
            _ => {}
        }
    }

    gateway.on_disconnect(&connection);
    writer.abort();
    debug!(connection_id = %connection.connection_id, "viewer disconnected");
}
