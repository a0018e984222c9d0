//! HTTP admin API
//!
//! RESTful surface over the [`Pilot`] facade. Every response uses the
//! [`ApiResponse`] envelope; failures carry the error kind and whether the
//! caller may retry.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use ds_core::{Chunk, ChunkMap};

use crate::authority::BeaconPayload;
use crate::error::{ErrorKind, PilotError};
use crate::metadata::{
    BalancerSettings, ClusterStats, CollectionInfo, DatabaseInfo, ShardInfo, ShardState,
};
use crate::scheduler::{MigrationTicket, RoundReport, SplitOutcome, SplitRequest};
use crate::{Pilot, ShardCollectionOptions};

/// HTTP API service
pub struct HttpApi {
    pilot: Arc<Pilot>,
}

impl HttpApi {
    /// Create HTTP API
    pub fn new(pilot: Arc<Pilot>) -> Self {
        Self { pilot }
    }

    /// Create routes
    pub fn router(self) -> Router {
        let pilot = self.pilot;

        Router::new()
            // cluster
            .route("/api/v1/cluster/stats", get(get_cluster_stats))
            .route("/api/v1/beacon", get(get_beacon))
            .route("/api/v1/beacon/registrations", post(record_registration))
            // shards
            .route("/api/v1/shards", get(list_shards).post(add_shard))
            .route("/api/v1/shards/:shard_id/heartbeat", post(shard_heartbeat))
            // catalog
            .route("/api/v1/databases/:db/sharding", post(enable_sharding))
            .route("/api/v1/collections", post(shard_collection))
            // chunks
            .route("/api/v1/chunks", get(list_chunks))
            .route("/api/v1/routing", get(get_routing_table))
            .route("/api/v1/split", post(split_chunk))
            .route("/api/v1/move_chunk", post(move_chunk))
            // migrations
            .route("/api/v1/migrations", get(list_migrations))
            .route(
                "/api/v1/migrations/:ticket_id",
                get(get_migration).delete(cancel_migration),
            )
            // balancer
            .route("/api/v1/balancer", get(get_balancer_settings))
            .route("/api/v1/balancer/start", post(balancer_start))
            .route("/api/v1/balancer/stop", post(balancer_stop))
            .route("/api/v1/balancer/round", post(balancer_round))
            .with_state(pilot)
    }
}

// ==================== Response types ====================

/// Response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    /// Error kind, set on failure
    #[serde(default)]
    pub code: Option<ErrorKind>,
    #[serde(default)]
    pub retryable: Option<bool>,
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Reply<T> {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
                code: None,
                retryable: None,
            }),
        )
    }

    fn created(data: T) -> Reply<T> {
        (StatusCode::CREATED, Self::ok(data).1)
    }

    fn err(kind: ErrorKind, msg: impl Into<String>) -> Reply<T> {
        (
            status_for(kind),
            Json(Self {
                success: false,
                data: None,
                error: Some(msg.into()),
                code: Some(kind),
                retryable: Some(kind.is_retryable()),
            }),
        )
    }

    fn from_error(e: PilotError) -> Reply<T> {
        if e.kind() == ErrorKind::Internal {
            warn!("Request failed: {}", e);
        }
        Self::err(e.kind(), e.to_string())
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::StaleMetadata | ErrorKind::MigrationConflict => StatusCode::CONFLICT,
        ErrorKind::QuorumUnavailable | ErrorKind::ShardUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::PartialMigrationFailure | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn reply<T: Serialize>(result: Result<T, PilotError>) -> Reply<T> {
    match result {
        Ok(data) => ApiResponse::ok(data),
        Err(e) => ApiResponse::from_error(e),
    }
}

// ==================== Request types ====================

#[derive(Deserialize)]
struct NamespaceQuery {
    ns: String,
}

#[derive(Deserialize)]
struct AddShardRequest {
    id: String,
    host: String,
}

#[derive(Deserialize)]
struct ShardCollectionRequest {
    ns: String,
    /// Shard key pattern, e.g. `{"a": 1}` or `{"_id": "hashed"}`
    key: Value,
    #[serde(flatten)]
    options: ShardCollectionOptions,
}

/// `{"middle": key}`, `{"find": query}` or `{"bounds": [min, max]}`
#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum SplitSpec {
    Middle(Value),
    Find(Value),
    Bounds([Value; 2]),
}

#[derive(Deserialize)]
struct SplitChunkRequest {
    ns: String,
    #[serde(flatten)]
    spec: SplitSpec,
}

impl From<SplitSpec> for SplitRequest {
    fn from(spec: SplitSpec) -> Self {
        match spec {
            SplitSpec::Middle(key) => SplitRequest::Middle(key),
            SplitSpec::Find(query) => SplitRequest::Find(query),
            SplitSpec::Bounds([min, max]) => SplitRequest::Bounds(min, max),
        }
    }
}

#[derive(Deserialize)]
struct MoveChunkRequest {
    ns: String,
    /// Query matching a document of the chunk to move
    find: Value,
    to: String,
}

#[derive(Serialize)]
struct RegistrationCount {
    registrations: u64,
}

// ==================== Handlers ====================

// cluster
async fn get_cluster_stats(State(pilot): State<Arc<Pilot>>) -> Reply<ClusterStats> {
    ApiResponse::ok(pilot.stats().await)
}

async fn get_beacon(
    State(pilot): State<Arc<Pilot>>,
) -> Reply<BeaconPayload> {
    ApiResponse::ok(pilot.beacon().await)
}

async fn record_registration(State(pilot): State<Arc<Pilot>>) -> Reply<RegistrationCount> {
    reply(
        pilot
            .record_beacon_registration()
            .await
            .map(|registrations| RegistrationCount { registrations }),
    )
}

// shards
async fn list_shards(
    State(pilot): State<Arc<Pilot>>,
) -> Reply<Vec<ShardInfo>> {
    ApiResponse::ok(pilot.get_shards().await)
}

async fn add_shard(
    State(pilot): State<Arc<Pilot>>,
    Json(req): Json<AddShardRequest>,
) -> Reply<ShardInfo> {
    match pilot.add_shard(&req.id, &req.host).await {
        Ok(shard) => {
            info!("Shard {} added via HTTP API", shard.id);
            ApiResponse::created(shard)
        }
        Err(e) => ApiResponse::from_error(e),
    }
}

async fn shard_heartbeat(
    State(pilot): State<Arc<Pilot>>,
    Path(shard_id): Path<String>,
) -> Reply<ShardState> {
    reply(pilot.heartbeat(&shard_id).await)
}

// catalog
async fn enable_sharding(
    State(pilot): State<Arc<Pilot>>,
    Path(db): Path<String>,
) -> Reply<DatabaseInfo> {
    reply(pilot.enable_sharding(&db).await)
}

async fn shard_collection(
    State(pilot): State<Arc<Pilot>>,
    Json(req): Json<ShardCollectionRequest>,
) -> Reply<CollectionInfo> {
    match pilot.shard_collection(&req.ns, &req.key, req.options).await {
        Ok(collection) => ApiResponse::created(collection),
        Err(e) => ApiResponse::from_error(e),
    }
}

// chunks
async fn list_chunks(
    State(pilot): State<Arc<Pilot>>,
    Query(query): Query<NamespaceQuery>,
) -> Reply<Vec<Chunk>> {
    reply(pilot.get_chunks(&query.ns).await)
}

async fn get_routing_table(
    State(pilot): State<Arc<Pilot>>,
    Query(query): Query<NamespaceQuery>,
) -> Reply<ChunkMap> {
    reply(pilot.routing_table(&query.ns).await)
}

async fn split_chunk(
    State(pilot): State<Arc<Pilot>>,
    Json(req): Json<SplitChunkRequest>,
) -> Reply<SplitOutcome> {
    reply(pilot.split(&req.ns, req.spec.into()).await)
}

async fn move_chunk(
    State(pilot): State<Arc<Pilot>>,
    Json(req): Json<MoveChunkRequest>,
) -> Reply<MigrationTicket> {
    reply(pilot.move_chunk(&req.ns, &req.find, &req.to).await)
}

// migrations
async fn list_migrations(
    State(pilot): State<Arc<Pilot>>,
) -> Reply<Vec<MigrationTicket>> {
    ApiResponse::ok(pilot.list_migrations())
}

async fn get_migration(
    State(pilot): State<Arc<Pilot>>,
    Path(ticket_id): Path<String>,
) -> Reply<MigrationTicket> {
    match pilot.get_migration(&ticket_id) {
        Some(ticket) => ApiResponse::ok(ticket),
        None => ApiResponse::err(
            ErrorKind::Validation,
            format!("Migration ticket {} not found", ticket_id),
        ),
    }
}

async fn cancel_migration(
    State(pilot): State<Arc<Pilot>>,
    Path(ticket_id): Path<String>,
) -> Reply<MigrationTicket> {
    reply(pilot.cancel_migration(&ticket_id))
}

// balancer
async fn get_balancer_settings(
    State(pilot): State<Arc<Pilot>>,
) -> Reply<BalancerSettings> {
    ApiResponse::ok(pilot.balancer_settings().await)
}

async fn balancer_start(
    State(pilot): State<Arc<Pilot>>,
) -> Reply<BalancerSettings> {
    reply(pilot.balancer_start().await)
}

async fn balancer_stop(
    State(pilot): State<Arc<Pilot>>,
) -> Reply<BalancerSettings> {
    reply(pilot.balancer_stop().await)
}

async fn balancer_round(
    State(pilot): State<Arc<Pilot>>,
) -> Reply<RoundReport> {
    ApiResponse::ok(pilot.run_balancer_round().await)
}
