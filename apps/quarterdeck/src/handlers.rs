//! HTTP surface: liveness, diagnostics, and the internal ingest endpoints
//! through which cluster watchers feed broadcast events into the gateway.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::gateway::Gateway;

#[derive(Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub active_connections: usize,
    pub active_log_sessions: usize,
}

pub async fn get_stats(State(gateway): State<Gateway>) -> Json<StatsResponse> {
    Json(StatsResponse {
        active_connections: gateway.connection_count(),
        active_log_sessions: gateway.streams().active_session_count(),
    })
}

#[derive(Debug, Deserialize)]
pub struct PodStatusEvent {
    pub namespace: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    pub status: String,
    pub phase: String,
}

#[derive(Debug, Deserialize)]
pub struct DeploymentUpdateEvent {
    pub namespace: String,
    #[serde(rename = "deploymentName")]
    pub deployment_name: String,
    pub replicas: i32,
    #[serde(rename = "readyReplicas")]
    pub ready_replicas: i32,
}

#[derive(Debug, Deserialize)]
pub struct AlertEvent {
    pub namespace: String,
    #[serde(rename = "alertType")]
    pub alert_type: String,
    pub severity: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub success: bool,
}

pub async fn ingest_pod_status(
    State(gateway): State<Gateway>,
    Json(event): Json<PodStatusEvent>,
) -> Json<IngestResponse> {
    gateway.broadcast_pod_status(&event.namespace, &event.pod_name, &event.status, &event.phase);
    Json(IngestResponse { success: true })
}

pub async fn ingest_deployment_update(
    State(gateway): State<Gateway>,
    Json(event): Json<DeploymentUpdateEvent>,
) -> Json<IngestResponse> {
    gateway.broadcast_deployment_update(
        &event.namespace,
        &event.deployment_name,
        event.replicas,
        event.ready_replicas,
    );
    Json(IngestResponse { success: true })
}

pub async fn ingest_alert(
    State(gateway): State<Gateway>,
    Json(event): Json<AlertEvent>,
) -> Json<IngestResponse> {
    gateway.broadcast_alert(
        &event.namespace,
        &event.alert_type,
        &event.severity,
        &event.message,
    );
    Json(IngestResponse { success: true })
}
