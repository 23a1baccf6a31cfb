//! HTTP management API
//!
//! JSON request bodies, JSON envelope responses. Mutating endpoints go through
//! the forward client first, so a follower answers with the leader's response.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, Method, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::MetaError;
use crate::forward::{ForwardDecision, RelayRequest, RelayResponse};
use crate::metadata::ShardId;
use crate::procedure::{DropTableRequest, ProcedureId, SplitRequest, TransferLeaderRequest};
use crate::MetaServer;

/// HTTP API service
pub struct HttpApi {
    server: Arc<MetaServer>,
}

impl HttpApi {
    pub fn new(server: Arc<MetaServer>) -> Self {
        Self { server }
    }

    /// Create router
    pub fn router(self) -> Router {
        Router::new()
            // Topology
            .route("/api/v1/getShardTables", post(get_shard_tables))
            .route("/api/v1/route", post(route))
            .route("/api/v1/dropTable", post(drop_table))
            .route("/api/v1/registerNode", post(register_node))
            .route("/api/v1/createTable", post(create_table))
            // Procedures
            .route("/api/v1/transferLeader", post(transfer_leader))
            .route("/api/v1/split", post(split))
            .route("/api/v1/dropTableProcedure", post(drop_table_procedure))
            .route("/api/v1/procedures", get(list_procedures))
            .route("/api/v1/procedures/:id", get(get_procedure))
            .route("/api/v1/procedures/:id/cancel", post(cancel_procedure))
            .layer(middleware::from_fn(log_request))
            .with_state(self.server)
    }
}

// ==================== Response types ====================

const STATUS_SUCCESS: &str = "success";
const STATUS_ERROR: &str = "error";

/// Response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

fn respond<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        status: STATUS_SUCCESS.to_string(),
        data: Some(data),
        error: None,
        msg: None,
    })
    .into_response()
}

fn ack() -> Response {
    Json(Envelope::<()> {
        status: STATUS_SUCCESS.to_string(),
        data: None,
        error: None,
        msg: None,
    })
    .into_response()
}

/// The leader's response, unchanged
fn forwarded(resp: RelayResponse) -> Response {
    let mut response = Response::new(Body::from(resp.body));
    *response.status_mut() = resp.status;
    *response.headers_mut() = resp.headers;
    response
}

struct ApiError {
    err: MetaError,
    msg: Option<&'static str>,
}

impl From<MetaError> for ApiError {
    fn from(err: MetaError) -> Self {
        Self { err, msg: None }
    }
}

/// Attach a context message to an error
fn fail(msg: &'static str) -> impl FnOnce(MetaError) -> ApiError {
    move |err| ApiError {
        err,
        msg: Some(msg),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.err.to_http_status();
        if status.is_server_error() {
            error!("{}: {}", self.msg.unwrap_or("request failed"), self.err);
        } else {
            warn!("{}: {}", self.msg.unwrap_or("request rejected"), self.err);
        }

        let body = Envelope::<()> {
            status: STATUS_ERROR.to_string(),
            data: None,
            error: Some(self.err.to_string()),
            msg: self.msg.map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

// ==================== Request types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetShardTablesRequest {
    cluster_name: String,
    #[serde(default)]
    node_name: String,
    #[serde(default, rename = "shardIDs")]
    shard_ids: Vec<ShardId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferLeaderBody {
    cluster_name: String,
    #[serde(rename = "shardID")]
    shard_id: ShardId,
    #[serde(alias = "OldLeaderNodeName")]
    old_leader_node_name: String,
    new_leader_node_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SplitBody {
    cluster_name: String,
    schema_name: String,
    #[serde(rename = "shardID")]
    shard_id: ShardId,
    split_tables: Vec<String>,
    node_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteBody {
    cluster_name: String,
    schema_name: String,
    #[serde(rename = "table")]
    tables: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DropTableBody {
    cluster_name: String,
    schema_name: String,
    table: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterNodeBody {
    cluster_name: String,
    node_name: String,
    addr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTableBody {
    cluster_name: String,
    schema_name: String,
    table: String,
    #[serde(default, rename = "shardID")]
    shard_id: Option<ShardId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    procedure_id: ProcedureId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SplitResponse {
    procedure_id: ProcedureId,
    new_shard_id: Option<ShardId>,
}

fn parse<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError {
        err: MetaError::ParseRequest(e.to_string()),
        msg: Some("decode request body failed"),
    })
}

/// `Some(response)` if the request was served by the leader
async fn forward_to_leader(
    server: &MetaServer,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: &Bytes,
) -> Result<Option<Response>, ApiError> {
    let path_and_query = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let req = RelayRequest {
        method,
        path_and_query,
        headers,
        body: body.clone(),
    };

    match server
        .forward()
        .decide(&req)
        .await
        .map_err(fail("forward to leader failed"))?
    {
        ForwardDecision::Local => Ok(None),
        ForwardDecision::Forwarded(resp) => Ok(Some(forwarded(resp))),
    }
}

// ==================== Handlers ====================

async fn get_shard_tables(State(server): State<Arc<MetaServer>>, body: Bytes) -> ApiResult {
    let req: GetShardTablesRequest = parse(&body)?;
    info!("get shard tables request: {:?}", req);

    let tables: BTreeMap<ShardId, Vec<String>> = server
        .clusters()
        .get_shard_tables(&req.cluster_name, &req.shard_ids, &req.node_name)
        .await
        .map_err(fail("get cluster failed"))?;
    Ok(respond(tables))
}

async fn transfer_leader(
    State(server): State<Arc<MetaServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    if let Some(resp) = forward_to_leader(&server, method, uri, headers, &body).await? {
        return Ok(resp);
    }
    let req: TransferLeaderBody = parse(&body)?;
    info!("transfer leader request: {:?}", req);

    let procedure = server
        .factory()
        .make_transfer_leader(TransferLeaderRequest {
            cluster_name: req.cluster_name,
            shard_id: req.shard_id,
            old_leader: req.old_leader_node_name,
            new_leader: req.new_leader_node_name,
        })
        .await
        .map_err(fail("create transfer leader procedure"))?;
    let procedure_id = server
        .procedures()
        .submit(Box::new(procedure))
        .await
        .map_err(fail("submit transfer leader procedure"))?;

    Ok(respond(SubmitResponse { procedure_id }))
}

async fn split(
    State(server): State<Arc<MetaServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    if let Some(resp) = forward_to_leader(&server, method, uri, headers, &body).await? {
        return Ok(resp);
    }
    let req: SplitBody = parse(&body)?;
    info!("split request: {:?}", req);

    let procedure = server
        .factory()
        .make_split(SplitRequest {
            cluster_name: req.cluster_name,
            schema_name: req.schema_name,
            shard_id: req.shard_id,
            tables: req.split_tables,
            target_node: req.node_name,
        })
        .await
        .map_err(fail("create split procedure"))?;
    let procedure_id = server
        .procedures()
        .submit(Box::new(procedure))
        .await
        .map_err(fail("submit split procedure"))?;

    // The new shard ID is known once the first step has been recorded
    let wait = server.procedures().wait_until(procedure_id, |p| p.step >= 1);
    let new_shard_id = match tokio::time::timeout(server.config().procedure.step_timeout(), wait)
        .await
    {
        Ok(record) => record
            .map_err(fail("read split procedure"))?
            .result
            .and_then(|v| v.as_u64())
            .and_then(|id| ShardId::try_from(id).ok()),
        Err(_) => None,
    };

    Ok(respond(SplitResponse {
        procedure_id,
        new_shard_id,
    }))
}

async fn route(
    State(server): State<Arc<MetaServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    if let Some(resp) = forward_to_leader(&server, method, uri, headers, &body).await? {
        return Ok(resp);
    }
    let req: RouteBody = parse(&body)?;
    info!("route request: {:?}", req);

    let result = server
        .clusters()
        .route_tables(&req.cluster_name, &req.schema_name, &req.tables)
        .await
        .map_err(fail("route tables failed"))?;
    Ok(respond(result))
}

async fn drop_table(
    State(server): State<Arc<MetaServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    if let Some(resp) = forward_to_leader(&server, method, uri, headers, &body).await? {
        return Ok(resp);
    }
    let req: DropTableBody = parse(&body)?;
    info!("drop table request: {:?}", req);

    server
        .clusters()
        .drop_table(&req.cluster_name, &req.schema_name, &req.table)
        .await
        .map_err(fail("drop table failed"))?;
    Ok(ack())
}

/// Drop a table through a procedure serialised with the table's shard
async fn drop_table_procedure(
    State(server): State<Arc<MetaServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    if let Some(resp) = forward_to_leader(&server, method, uri, headers, &body).await? {
        return Ok(resp);
    }
    let req: DropTableBody = parse(&body)?;
    info!("drop table procedure request: {:?}", req);

    let procedure = server
        .factory()
        .make_drop_table(DropTableRequest {
            cluster_name: req.cluster_name,
            schema_name: req.schema_name,
            table: req.table,
        })
        .await
        .map_err(fail("create drop table procedure"))?;
    let procedure_id = server
        .procedures()
        .submit(Box::new(procedure))
        .await
        .map_err(fail("submit drop table procedure"))?;

    Ok(respond(SubmitResponse { procedure_id }))
}

async fn register_node(
    State(server): State<Arc<MetaServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    if let Some(resp) = forward_to_leader(&server, method, uri, headers, &body).await? {
        return Ok(resp);
    }
    let req: RegisterNodeBody = parse(&body)?;
    info!("register node request: {:?}", req);

    let cluster = server
        .clusters()
        .get_cluster(&req.cluster_name)
        .await
        .map_err(fail("get cluster failed"))?;
    let node = cluster
        .register_node(&req.node_name, &req.addr)
        .await
        .map_err(fail("register node failed"))?;
    Ok(respond(node))
}

async fn create_table(
    State(server): State<Arc<MetaServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    if let Some(resp) = forward_to_leader(&server, method, uri, headers, &body).await? {
        return Ok(resp);
    }
    let req: CreateTableBody = parse(&body)?;
    info!("create table request: {:?}", req);

    let cluster = server
        .clusters()
        .get_cluster(&req.cluster_name)
        .await
        .map_err(fail("get cluster failed"))?;
    let table = cluster
        .create_table(&req.schema_name, &req.table, req.shard_id)
        .await
        .map_err(fail("create table failed"))?;
    Ok(respond(table))
}

async fn list_procedures(State(server): State<Arc<MetaServer>>) -> ApiResult {
    let records = server
        .procedures()
        .list()
        .await
        .map_err(fail("list procedures failed"))?;
    Ok(respond(records))
}

async fn get_procedure(
    State(server): State<Arc<MetaServer>>,
    Path(id): Path<ProcedureId>,
) -> ApiResult {
    let record = server.procedures().get(id).await?;
    Ok(respond(record))
}

async fn cancel_procedure(
    State(server): State<Arc<MetaServer>>,
    Path(id): Path<ProcedureId>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    if let Some(resp) = forward_to_leader(&server, method, uri, headers, &body).await? {
        return Ok(resp);
    }

    server
        .procedures()
        .cancel(id)
        .await
        .map_err(fail("cancel procedure failed"))?;
    Ok(ack())
}

// ==================== Middleware ====================

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        "http request: {} {} -> {} ({:?})",
        method,
        path,
        resp.status().as_u16(),
        start.elapsed()
    );
    resp
}
