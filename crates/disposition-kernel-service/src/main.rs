use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use disposition_kernel_api::{
    init_logging, kernel_error, AddStepRequest, CreateNodeRequest, CreateScheduleRequest,
    DispositionKernelApi, DispositionStatus, DueItem, EventRequest, ExecuteStepCommand,
    KernelConfig, LinkRecordRequest, MigrateResult, MoveNodeRequest, NodeChangeRequest,
    PlanSnapshot, RemoveStepRequest, SetPropertyRequest, UndoCutOffResult, UpdateStepRequest,
    UpdateStepResult, API_CONTRACT_VERSION,
};
use disposition_kernel_core::{
    AuditEvent, DispositionLifecycle, DispositionSchedule, FilePlanNode, KernelError, NodeId,
    PublishJob, PublishJobStatus, RecordLink, StepOutcome,
};
use disposition_kernel_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: DispositionKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

type ApiResponse<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct PublishRequest {
    #[serde(default = "default_publish_limit")]
    limit: usize,
    #[serde(with = "time::serde::rfc3339::option", default)]
    now: Option<OffsetDateTime>,
}

fn default_publish_limit() -> usize {
    25
}

#[derive(Debug, Clone, Deserialize)]
struct AsOfQuery {
    as_of: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct JobsQuery {
    status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuditQuery {
    node_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "disposition-kernel-service")]
#[command(about = "Local HTTP service for the Disposition Kernel")]
struct Args {
    /// YAML configuration file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Seconds between background publish runs; 0 disables the worker.
    #[arg(long)]
    publish_interval_secs: Option<u64>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn api_error(err: &anyhow::Error) -> ServiceError {
        let mut error = Self::error(format!("{err:#}"));
        if matches!(kernel_error(err), Some(KernelError::NotFound(_))) {
            error.status = StatusCode::NOT_FOUND;
        }
        error
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn respond<T>(result: Result<T>) -> ApiResponse<T>
where
    T: Serialize,
{
    result.map(|data| Json(envelope(data))).map_err(|err| ServiceState::api_error(&err))
}

fn parse_rfc3339(raw: Option<&str>) -> Result<Option<OffsetDateTime>, ServiceError> {
    raw.map(|raw| {
        OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
            .map_err(|err| ServiceState::error(format!("invalid RFC3339 timestamp {raw}: {err}")))
    })
    .transpose()
}

fn parse_node_id(raw: &str) -> Result<NodeId, ServiceError> {
    raw.parse::<NodeId>().map_err(|err| ServiceState::error(err.to_string()))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/plan", get(plan_show))
        .route("/v1/plan/categories", post(plan_create_category))
        .route("/v1/plan/folders", post(plan_create_folder))
        .route("/v1/plan/folders/close", post(plan_close_folder))
        .route("/v1/plan/folders/reopen", post(plan_reopen_folder))
        .route("/v1/plan/records", post(plan_file_record))
        .route("/v1/plan/records/declare", post(plan_declare_record))
        .route("/v1/plan/properties", post(plan_set_property))
        .route("/v1/plan/move", post(plan_move))
        .route("/v1/plan/link", post(plan_link))
        .route("/v1/plan/unlink", post(plan_unlink))
        .route("/v1/schedules", post(schedule_create))
        .route("/v1/schedules/steps/add", post(schedule_step_add))
        .route("/v1/schedules/steps/update", post(schedule_step_update))
        .route("/v1/schedules/steps/remove", post(schedule_step_remove))
        .route("/v1/schedules/publish", post(schedule_publish))
        .route("/v1/schedules/jobs", get(schedule_jobs))
        .route("/v1/disposition/due", get(disposition_due))
        .route("/v1/disposition/events/complete", post(disposition_event_complete))
        .route("/v1/disposition/events/undo", post(disposition_event_undo))
        .route("/v1/disposition/execute", post(disposition_execute))
        .route("/v1/disposition/undo-cut-off", post(disposition_undo_cut_off))
        .route("/v1/disposition/status/:item_id", get(disposition_status))
        .route("/v1/audit", get(audit_log))
        .with_state(state)
}

/// One publish pass on the blocking pool. Returns the number of jobs processed.
async fn run_publish_cycle(api: DispositionKernelApi, batch_size: usize) -> Result<usize> {
    let jobs = tokio::task::spawn_blocking(move || api.publish_pending(batch_size, None))
        .await
        .context("publish worker task panicked")??;
    Ok(jobs.len())
}

async fn publish_worker(api: DispositionKernelApi, interval: Duration, batch_size: usize) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match run_publish_cycle(api.clone(), batch_size).await {
            Ok(0) => {}
            Ok(processed) => tracing::info!(processed, "publish worker finished jobs"),
            Err(err) => tracing::error!(error = %format!("{err:#}"), "publish worker cycle failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = KernelConfig::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.store.db_path = db;
    }
    if let Some(bind) = args.bind {
        config.service.bind = bind.to_string();
    }
    if let Some(interval) = args.publish_interval_secs {
        config.service.publish_interval_secs = interval;
    }
    init_logging(config.logging.format, config.logging.filter.as_deref(), "info");

    let api = DispositionKernelApi::new(config.store.db_path.clone());
    if config.service.publish_interval_secs > 0 {
        tokio::spawn(publish_worker(
            api.clone(),
            Duration::from_secs(config.service.publish_interval_secs),
            config.service.publish_batch_size,
        ));
    }

    let bind: SocketAddr = config
        .service
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.service.bind))?;
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, db = %config.store.db_path.display(), "disposition kernel service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(State(state): State<ServiceState>) -> ApiResponse<SchemaStatus> {
    respond(state.api.schema_status())
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ApiResponse<MigrateResult> {
    respond(state.api.migrate(request.dry_run))
}

async fn plan_show(State(state): State<ServiceState>) -> ApiResponse<PlanSnapshot> {
    respond(state.api.file_plan())
}

async fn plan_create_category(
    State(state): State<ServiceState>,
    Json(request): Json<CreateNodeRequest>,
) -> ApiResponse<FilePlanNode> {
    respond(state.api.create_category(request))
}

async fn plan_create_folder(
    State(state): State<ServiceState>,
    Json(request): Json<CreateNodeRequest>,
) -> ApiResponse<FilePlanNode> {
    respond(state.api.create_folder(request))
}

async fn plan_close_folder(
    State(state): State<ServiceState>,
    Json(request): Json<NodeChangeRequest>,
) -> ApiResponse<FilePlanNode> {
    respond(state.api.close_folder(&request))
}

async fn plan_reopen_folder(
    State(state): State<ServiceState>,
    Json(request): Json<NodeChangeRequest>,
) -> ApiResponse<FilePlanNode> {
    respond(state.api.reopen_folder(&request))
}

async fn plan_file_record(
    State(state): State<ServiceState>,
    Json(request): Json<CreateNodeRequest>,
) -> ApiResponse<FilePlanNode> {
    respond(state.api.file_record(request))
}

async fn plan_declare_record(
    State(state): State<ServiceState>,
    Json(request): Json<NodeChangeRequest>,
) -> ApiResponse<FilePlanNode> {
    respond(state.api.declare_record(&request))
}

async fn plan_set_property(
    State(state): State<ServiceState>,
    Json(request): Json<SetPropertyRequest>,
) -> ApiResponse<FilePlanNode> {
    respond(state.api.set_property(&request))
}

async fn plan_move(
    State(state): State<ServiceState>,
    Json(request): Json<MoveNodeRequest>,
) -> ApiResponse<FilePlanNode> {
    respond(state.api.move_node(&request))
}

async fn plan_link(
    State(state): State<ServiceState>,
    Json(request): Json<LinkRecordRequest>,
) -> ApiResponse<RecordLink> {
    respond(state.api.link_record(&request))
}

async fn plan_unlink(
    State(state): State<ServiceState>,
    Json(request): Json<LinkRecordRequest>,
) -> ApiResponse<RecordLink> {
    respond(state.api.unlink_record(&request))
}

async fn schedule_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateScheduleRequest>,
) -> ApiResponse<DispositionSchedule> {
    respond(state.api.create_schedule(request))
}

async fn schedule_step_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddStepRequest>,
) -> ApiResponse<DispositionSchedule> {
    respond(state.api.add_step(request))
}

async fn schedule_step_update(
    State(state): State<ServiceState>,
    Json(request): Json<UpdateStepRequest>,
) -> ApiResponse<UpdateStepResult> {
    respond(state.api.update_step(request))
}

async fn schedule_step_remove(
    State(state): State<ServiceState>,
    Json(request): Json<RemoveStepRequest>,
) -> ApiResponse<DispositionSchedule> {
    respond(state.api.remove_step(&request))
}

async fn schedule_publish(
    State(state): State<ServiceState>,
    Json(request): Json<PublishRequest>,
) -> ApiResponse<Vec<PublishJob>> {
    respond(state.api.publish_pending(request.limit, request.now))
}

async fn schedule_jobs(
    State(state): State<ServiceState>,
    Query(query): Query<JobsQuery>,
) -> ApiResponse<Vec<PublishJob>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<PublishJobStatus>)
        .transpose()
        .map_err(|err| ServiceState::error(err.to_string()))?;
    respond(state.api.list_publish_jobs(status))
}

async fn disposition_status(
    State(state): State<ServiceState>,
    Path(item_id): Path<String>,
    Query(query): Query<AsOfQuery>,
) -> ApiResponse<DispositionStatus> {
    let item_id = parse_node_id(&item_id)?;
    let as_of = parse_rfc3339(query.as_of.as_deref())?;
    respond(state.api.disposition_status(item_id, as_of))
}

async fn disposition_due(
    State(state): State<ServiceState>,
    Query(query): Query<AsOfQuery>,
) -> ApiResponse<Vec<DueItem>> {
    let as_of = parse_rfc3339(query.as_of.as_deref())?;
    respond(state.api.list_due(as_of))
}

async fn disposition_event_complete(
    State(state): State<ServiceState>,
    Json(request): Json<EventRequest>,
) -> ApiResponse<DispositionLifecycle> {
    respond(state.api.complete_event(&request))
}

async fn disposition_event_undo(
    State(state): State<ServiceState>,
    Json(request): Json<EventRequest>,
) -> ApiResponse<DispositionLifecycle> {
    respond(state.api.undo_event(&request))
}

async fn disposition_execute(
    State(state): State<ServiceState>,
    Json(request): Json<ExecuteStepCommand>,
) -> ApiResponse<StepOutcome> {
    respond(state.api.execute_step(&request))
}

async fn disposition_undo_cut_off(
    State(state): State<ServiceState>,
    Json(request): Json<NodeChangeRequest>,
) -> ApiResponse<UndoCutOffResult> {
    respond(state.api.undo_cut_off(&request))
}

async fn audit_log(
    State(state): State<ServiceState>,
    Query(query): Query<AuditQuery>,
) -> ApiResponse<Vec<AuditEvent>> {
    let node_id = query.node_id.as_deref().map(parse_node_id).transpose()?;
    respond(state.api.audit_log(node_id))
}
