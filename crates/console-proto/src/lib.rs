//! Wire protocol for the operator console: messages exchanged between the
//! browser UI and the quarterdeck gateway over a persistent WebSocket.
//! Keeping this in a dedicated crate allows regeneration of bindings for
//! the TypeScript frontend without pulling in the server runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages sent from a viewer to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start tailing a container's log. Answered with an [`Ack`] carrying
    /// the derived stream id.
    #[serde(rename = "subscribe:logs")]
    SubscribeLogs {
        namespace: String,
        #[serde(rename = "podName")]
        pod_name: String,
        #[serde(default)]
        container: Option<String>,
    },
    /// Stop a previously started tail. Unknown ids are acknowledged as
    /// successes.
    #[serde(rename = "unsubscribe:logs")]
    UnsubscribeLogs {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    /// Join the broadcast group for a namespace's cluster events.
    #[serde(rename = "subscribe:namespace")]
    SubscribeNamespace { namespace: String },
    /// Leave a namespace's broadcast group.
    #[serde(rename = "unsubscribe:namespace")]
    UnsubscribeNamespace { namespace: String },
}

/// Request kinds echoed back in an [`ServerMessage::Ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckRequest {
    #[serde(rename = "subscribe:logs")]
    SubscribeLogs,
    #[serde(rename = "unsubscribe:logs")]
    UnsubscribeLogs,
    #[serde(rename = "subscribe:namespace")]
    SubscribeNamespace,
    #[serde(rename = "unsubscribe:namespace")]
    UnsubscribeNamespace,
}

/// Messages sent from the gateway to a viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Result of an inbound request, tagged with the request kind.
    Ack {
        request: AckRequest,
        success: bool,
        #[serde(rename = "streamId", skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// One reassembled log line from an active tail.
    #[serde(rename = "logs:line")]
    LogLine {
        #[serde(rename = "streamId")]
        stream_id: String,
        namespace: String,
        #[serde(rename = "podName")]
        pod_name: String,
        line: String,
        timestamp: DateTime<Utc>,
    },
    /// The tail failed; the session is gone and must be resubscribed.
    #[serde(rename = "logs:error")]
    LogError {
        #[serde(rename = "streamId")]
        stream_id: String,
        namespace: String,
        #[serde(rename = "podName")]
        pod_name: String,
        error: String,
    },
    /// The orchestrator reported normal end of stream.
    #[serde(rename = "logs:end")]
    LogEnd {
        #[serde(rename = "streamId")]
        stream_id: String,
        namespace: String,
        #[serde(rename = "podName")]
        pod_name: String,
    },
    /// A pod changed state in a namespace the viewer subscribed to.
    #[serde(rename = "pod:status")]
    PodStatus {
        namespace: String,
        #[serde(rename = "podName")]
        pod_name: String,
        status: String,
        phase: String,
        timestamp: DateTime<Utc>,
    },
    /// A deployment's replica counts changed.
    #[serde(rename = "deployment:update")]
    DeploymentUpdate {
        namespace: String,
        #[serde(rename = "deploymentName")]
        deployment_name: String,
        replicas: i32,
        #[serde(rename = "readyReplicas")]
        ready_replicas: i32,
        timestamp: DateTime<Utc>,
    },
    /// An alert fired in a subscribed namespace. The alert's own kind is
    /// carried as `alertType`; the envelope `type` names the message.
    #[serde(rename = "alert:triggered")]
    AlertTriggered {
        namespace: String,
        #[serde(rename = "alertType")]
        alert_type: String,
        severity: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// The inbound frame could not be parsed or processed.
    Error { message: String },
}

impl ServerMessage {
    pub fn ack(request: AckRequest) -> Self {
        ServerMessage::Ack {
            request,
            success: true,
            stream_id: None,
            error: None,
        }
    }

    pub fn ack_stream(request: AckRequest, stream_id: String) -> Self {
        ServerMessage::Ack {
            request,
            success: true,
            stream_id: Some(stream_id),
            error: None,
        }
    }

    pub fn ack_failure(request: AckRequest, error: String) -> Self {
        ServerMessage::Ack {
            request,
            success: false,
            stream_id: None,
            error: Some(error),
        }
    }
}
