use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use identity_kernel_api::{ApiError, IdentityApi, MigrateResult, API_CONTRACT_VERSION};
use identity_kernel_core::IdentityView;
use identity_kernel_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityApi,
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
struct IdentifyResponse {
    contact: IdentityView,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    error: &'static str,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

#[derive(Debug, Parser)]
#[command(name = "identity-kernel-service")]
#[command(about = "HTTP service that links contact records into identity clusters")]
struct Args {
    #[arg(long, env = "IDENTITY_DB", default_value = "./identity_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "IDENTITY_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    #[arg(long, env = "IDENTITY_MAX_ATTEMPTS", default_value_t = identity_kernel_api::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
    #[arg(long, env = "IDENTITY_BUSY_TIMEOUT_MS", default_value_t = identity_kernel_api::DEFAULT_BUSY_TIMEOUT_MS)]
    busy_timeout_ms: u64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: "Bad Request", message: message.into() }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "Internal Server Error",
            message: message.into(),
        }
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Validation(err) => Self::bad_request(err.to_string()),
            ApiError::Unavailable { .. } => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                error: "Service Unavailable",
                message: err.to_string(),
            },
            ApiError::InvariantBreach(_) => Self::internal(err.to_string()),
            ApiError::Internal(err) => Self::internal(format!("{err:#}")),
        }
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

/// Run blocking store work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ServiceError::internal(format!("store task failed: {err}")))?
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/health", get(health))
        .route("/openapi", get(openapi))
        .route("/db/schema-version", post(db_schema_version))
        .route("/db/migrate", post(db_migrate))
        .route("/db/integrity-check", post(db_integrity_check))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let api = IdentityApi::new(args.db)
        .with_max_attempts(args.max_attempts)
        .with_busy_timeout(Duration::from_millis(args.busy_timeout_ms));
    let migrated = api
        .migrate(false)
        .with_context(|| format!("failed to migrate {}", api.db_path().display()))?;
    tracing::info!(
        db = %api.db_path().display(),
        schema_version = ?migrated.after_version,
        "database ready"
    );

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "identity service listening");

    axum::serve(listener, app(ServiceState { api }))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("identity service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("SIGINT received, shutting down"),
        () = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ServiceError> {
    let Json(body) = payload.map_err(|rejection| ServiceError::bad_request(rejection.body_text()))?;
    let resolution = blocking(move || Ok(state.api.identify_json(&body)?)).await?;
    Ok(Json(IdentifyResponse { contact: resolution.view() }))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "OK", timestamp: OffsetDateTime::now_utc() })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = blocking(move || {
        state.api.schema_status().map_err(|err| ServiceError::internal(format!("{err:#}")))
    })
    .await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = blocking(move || {
        state.api.migrate(request.dry_run).map_err(|err| ServiceError::internal(format!("{err:#}")))
    })
    .await?;
    Ok(Json(envelope(result)))
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = blocking(move || {
        state.api.integrity_check().map_err(|err| ServiceError::internal(format!("{err:#}")))
    })
    .await?;
    Ok(Json(envelope(report)))
}
