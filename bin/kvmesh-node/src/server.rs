//! HTTP server
//!
//! - `POST /v1/system`: prost [`SystemMessage`] in, [`SystemResponse`] out;
//!   the member-to-member channel
//! - `PUT|GET|DELETE /v1/dmap/{name}/{key}` and `GET /v1/dmap/{name}/scan`:
//!   the data API
//! - `GET /v1/cluster/routing-table`, `GET /health`, `GET /metrics`

use crate::node::Node;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use kvmesh_common::{Error, PartitionKind, Route};
use kvmesh_proto::messages::decode_message;
use kvmesh_proto::{SystemMessage, SystemResponse};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Error rendered as a JSON body with the matching HTTP status
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router for a node
pub fn router(node: Arc<Node>) -> Router {
    let body_limit = node.config().transport.max_message_size;
    Router::new()
        .route("/v1/system", post(system_handler))
        .route("/v1/cluster/routing-table", get(routing_table_handler))
        .route("/v1/dmap/{name}/scan", get(scan_handler))
        .route(
            "/v1/dmap/{name}/{key}",
            get(get_handler).put(put_handler).delete(delete_handler),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(node)
}

/// Serve until the node shuts down
pub async fn serve(node: Arc<Node>, listener: TcpListener) -> std::io::Result<()> {
    let stop = node.stop_token();
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(node))
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
}

async fn system_handler(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let result = match decode_message::<SystemMessage>(&body) {
        Ok(message) => node.dispatch(message).await,
        Err(e) => Err(e),
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)],
        SystemResponse::from_result(result).encode_to_vec(),
    )
        .into_response()
}

#[derive(Serialize, Deserialize)]
struct RoutingTableBody {
    version: u64,
    routes: Vec<Route>,
}

async fn routing_table_handler(State(node): State<Arc<Node>>) -> Json<RoutingTableBody> {
    let snapshot = node.routing().snapshot();
    Json(RoutingTableBody {
        version: snapshot.version(),
        routes: snapshot.routes(),
    })
}

#[derive(Deserialize)]
struct PutParams {
    /// Time to live in milliseconds
    ttl_ms: Option<u64>,
}

async fn put_handler(
    State(node): State<Arc<Node>>,
    Path((name, key)): Path<(String, String)>,
    Query(params): Query<PutParams>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let ttl = params.ttl_ms.map(Duration::from_millis);
    node.put(&name, &key, body.to_vec(), ttl).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_handler(
    State(node): State<Arc<Node>>,
    Path((name, key)): Path<(String, String)>,
) -> ApiResult<Response> {
    let entry = node.get(&name, &key).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        entry.value,
    )
        .into_response())
}

async fn delete_handler(
    State(node): State<Arc<Node>>,
    Path((name, key)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    node.delete(&name, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ScanParams {
    part_id: u64,
    #[serde(default)]
    backup: bool,
    #[serde(default)]
    cursor: u64,
    #[serde(default)]
    count: u32,
}

#[derive(Serialize, Deserialize)]
struct ScanPage {
    cursor: u64,
    keys: Vec<String>,
}

async fn scan_handler(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    Query(params): Query<ScanParams>,
) -> ApiResult<Json<ScanPage>> {
    let kind = if params.backup {
        PartitionKind::Backup
    } else {
        PartitionKind::Primary
    };
    let page = node
        .scan(&name, params.part_id, kind, params.cursor, params.count)
        .await?;
    Ok(Json(ScanPage {
        cursor: page.cursor,
        keys: page.keys,
    }))
}

async fn health_handler(State(node): State<Arc<Node>>) -> impl IntoResponse {
    if node.is_operable() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY")
    }
}

fn metric(out: &mut String, name: &str, kind: &str, help: &str, samples: &[(String, String)]) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    for (labels, value) in samples {
        let _ = writeln!(out, "{name}{{{labels}}} {value}");
    }
}

fn sample(labels: String, value: impl Display) -> (String, String) {
    (labels, value.to_string())
}

async fn metrics_handler(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let mut out = String::with_capacity(4 * 1024);
    let member = format!("member=\"{}\"", node.this());
    let routing = node.routing();
    let stats = node.balancer().stats();

    let mut fragments = [0u64; 2];
    let mut entries = [0u64; 2];
    for fragment in node.dmap().fragments().all() {
        let idx = usize::from(fragment.key().kind == PartitionKind::Backup);
        fragments[idx] += 1;
        entries[idx] += fragment.length() as u64;
    }

    let scalars: [(&str, &str, &str, u64); 13] = [
        ("kvmesh_up", "gauge", "Whether the node accepts data operations", u64::from(node.is_operable())),
        ("kvmesh_uptime_seconds", "counter", "Node uptime in seconds", node.uptime().as_secs()),
        ("kvmesh_routing_version", "gauge", "Installed routing table version", routing.version()),
        ("kvmesh_members", "gauge", "Live cluster members", routing.members().len() as u64),
        ("kvmesh_dmaps", "gauge", "Dmaps opened on this member", node.dmap().dmap_names().len() as u64),
        ("kvmesh_background_tasks", "gauge", "Running compaction tasks", node.dmap().running_tasks() as u64),
        ("kvmesh_balancer_cycles_total", "counter", "Balancer cycles started", stats.cycles()),
        ("kvmesh_balancer_skipped_total", "counter", "Balancer cycles skipped while not operable", stats.skipped()),
        ("kvmesh_balancer_moved_total", "counter", "Fragments moved to another member", stats.moved()),
        ("kvmesh_balancer_replicated_total", "counter", "Primary fragments copied to a backup owner", stats.replicated()),
        ("kvmesh_balancer_promoted_total", "counter", "Backup fragments merged into the primary copy", stats.promoted()),
        ("kvmesh_balancer_evicted_total", "counter", "Fragments dropped from this member", stats.evicted()),
        ("kvmesh_balancer_failed_total", "counter", "Fragment transfers that failed", stats.failed()),
    ];
    for (name, kind, help, value) in scalars {
        let samples = [sample(member.clone(), value)];
        metric(&mut out, name, kind, help, &samples);
    }

    for (name, help, values) in [
        ("kvmesh_fragments", "Fragments held by kind", fragments),
        ("kvmesh_entries", "Entries held by kind", entries),
    ] {
        let samples: Vec<(String, String)> = PartitionKind::ALL
            .iter()
            .zip(values)
            .map(|(kind, value)| sample(format!("{member},kind=\"{kind}\""), value))
            .collect();
        metric(&mut out, name, "gauge", help, &samples);
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
}
