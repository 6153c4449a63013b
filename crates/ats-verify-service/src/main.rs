use std::io::Cursor;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use ats_verify_api::{AtsVerifyApi, MigrateResult, SetRiskProfileRequest, API_CONTRACT_VERSION};
use ats_verify_core::{
    AnalyticsReports, BulkLookup, IngestError, IngestionResult, LedgerLoadResult, ListUnitsQuery,
    MarketplaceDirectory, MarkUsedOutcome, Normalizer, NormalizerConfig, RiskProfile,
    RiskProfileId, UnitPage, UploadContext, UserId,
};
use ats_verify_store_sqlite::SchemaStatus;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const UPLOADER_HEADER: &str = "x-uploader-id";
const MARKETPLACE_PREFIX_HEADER: &str = "x-marketplace-prefix";

#[derive(Debug, Clone)]
struct ServiceState {
    api: AtsVerifyApi,
    max_lookup_batch: usize,
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

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct LookupRequest {
    track_numbers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MarkUsedRequest {
    track_number: String,
}

#[derive(Debug, Clone, Serialize)]
struct MarkUsedResponse {
    track_number: String,
    outcome: MarkUsedOutcome,
}

#[derive(Debug, Clone, Serialize)]
struct DeletedResponse {
    id: RiskProfileId,
    deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "ats-verify-service")]
#[command(about = "Local HTTP service for parcel verification and risk analytics")]
struct Args {
    #[arg(long, default_value = "./ats_verify.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// JSON object mapping uploader prefixes to marketplace names.
    #[arg(long)]
    marketplaces: Option<PathBuf>,
    #[arg(long, default_value_t = 32 * 1024 * 1024)]
    max_upload_bytes: usize,
    #[arg(long, default_value_t = 1000)]
    max_lookup_batch: usize,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn failure(err: &anyhow::Error) -> ServiceError {
        let status = match err.downcast_ref::<IngestError>() {
            Some(IngestError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(IngestError::NoValidRows) => StatusCode::UNPROCESSABLE_ENTITY,
            Some(_) => StatusCode::BAD_REQUEST,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %format!("{err:#}"), "request failed");
        }
        Self::error(status, format!("{err:#}"))
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

fn app(state: ServiceState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/parcels", get(parcels_list))
        .route("/v1/parcels/upload", post(parcels_upload))
        .route("/v1/parcels/lookup", post(parcels_lookup))
        .route("/v1/parcels/mark-used", post(parcels_mark_used))
        .route("/v1/risk/upload", post(risk_upload))
        .route("/v1/risk/analytics", get(risk_analytics))
        .route("/v1/risk/profiles", get(risk_profiles_list).post(risk_profiles_set))
        .route("/v1/risk/profiles/:id", delete(risk_profiles_delete))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

fn load_directory(path: Option<&std::path::Path>) -> Result<MarketplaceDirectory> {
    let Some(path) = path else {
        return Ok(MarketplaceDirectory::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read marketplace directory {}", path.display()))?;
    MarketplaceDirectory::from_json_str(&raw)
        .with_context(|| format!("failed to parse marketplace directory {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let directory = load_directory(args.marketplaces.as_deref())?;
    tracing::info!(prefixes = directory.len(), db = %args.db.display(), "starting service");

    let normalizer = Normalizer::new(NormalizerConfig::default(), directory);
    let state = ServiceState {
        api: AtsVerifyApi::new(args.db, normalizer),
        max_lookup_batch: args.max_lookup_batch,
    };
    let migrated = state.api.migrate(false)?;
    tracing::info!(
        from = migrated.current_version,
        to = ?migrated.after_version,
        "schema ready"
    );
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "listening");
    axum::serve(listener, app(state, args.max_upload_bytes)).await?;
    Ok(())
}

fn upload_context(headers: &HeaderMap) -> Result<UploadContext, ServiceError> {
    let uploader = headers
        .get(UPLOADER_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ServiceState::error(StatusCode::BAD_REQUEST, format!("missing {UPLOADER_HEADER} header"))
        })?;
    let uploader_id = UserId::parse(uploader)
        .map_err(|err| ServiceState::error(StatusCode::BAD_REQUEST, err.to_string()))?;
    let marketplace_prefix = headers
        .get(MARKETPLACE_PREFIX_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|prefix| !prefix.is_empty())
        .map(str::to_string);
    Ok(UploadContext { uploader_id, marketplace_prefix })
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(result)))
}

async fn parcels_upload(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ServiceEnvelope<IngestionResult>>, ServiceError> {
    let context = upload_context(&headers)?;
    let result = state
        .api
        .ingest_parcels(Cursor::new(body), &context)
        .map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(result)))
}

async fn parcels_list(
    State(state): State<ServiceState>,
    Query(query): Query<ListUnitsQuery>,
) -> Result<Json<ServiceEnvelope<UnitPage>>, ServiceError> {
    let page = state.api.list_units(&query).map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(page)))
}

async fn parcels_lookup(
    State(state): State<ServiceState>,
    Json(request): Json<LookupRequest>,
) -> Result<Json<ServiceEnvelope<BulkLookup>>, ServiceError> {
    if request.track_numbers.len() > state.max_lookup_batch {
        return Err(ServiceState::error(
            StatusCode::BAD_REQUEST,
            format!(
                "lookup batch of {} exceeds the limit of {}",
                request.track_numbers.len(),
                state.max_lookup_batch
            ),
        ));
    }
    let lookups =
        state.api.lookup_tracks(&request.track_numbers).map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(lookups)))
}

async fn parcels_mark_used(
    State(state): State<ServiceState>,
    Json(request): Json<MarkUsedRequest>,
) -> Result<Json<ServiceEnvelope<MarkUsedResponse>>, ServiceError> {
    let outcome =
        state.api.mark_used(&request.track_number).map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(MarkUsedResponse {
        track_number: request.track_number.trim().to_string(),
        outcome,
    })))
}

async fn risk_upload(
    State(state): State<ServiceState>,
    body: Bytes,
) -> Result<Json<ServiceEnvelope<LedgerLoadResult>>, ServiceError> {
    let result =
        state.api.ingest_risk_ledger(Cursor::new(body)).map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(result)))
}

async fn risk_analytics(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<AnalyticsReports>>, ServiceError> {
    let reports = state.api.analytics_reports().map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(reports)))
}

async fn risk_profiles_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<RiskProfile>>>, ServiceError> {
    let profiles = state.api.list_risk_profiles().map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(profiles)))
}

async fn risk_profiles_set(
    State(state): State<ServiceState>,
    Json(request): Json<SetRiskProfileRequest>,
) -> Result<Json<ServiceEnvelope<RiskProfile>>, ServiceError> {
    let profile = state.api.set_risk_profile(request).map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(profile)))
}

async fn risk_profiles_delete(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeletedResponse>>, ServiceError> {
    let id = RiskProfileId::parse(&id)
        .map_err(|err| ServiceState::error(StatusCode::BAD_REQUEST, err.to_string()))?;
    state.api.delete_risk_profile(id).map_err(|err| ServiceState::failure(&err))?;
    Ok(Json(envelope(DeletedResponse { id, deleted: true })))
}
