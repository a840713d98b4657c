use crate::error::PortError;
use crate::manager::PortManager;
use crate::prober::ReportSlot;
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tunnelport_common::{
    AllocateRequest, AllocateResponse, Allocation, CredentialsResponse, ErrorResponse,
    HeartbeatResponse, PortOwnerRequest, PortQuery, ProbeReport, Stats, UpdateCredentialsRequest,
    VerifyResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PortManager>,
    pub probe_report: ReportSlot,
}

pub struct ApiError(PortError);

impl From<PortError> for ApiError {
    fn from(err: PortError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PortError::NoCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PortError::NotFound { .. } => StatusCode::NOT_FOUND,
            PortError::OutOfRange { .. } => StatusCode::BAD_REQUEST,
            PortError::StoreUnavailable(_) | PortError::Codec(_) | PortError::Internal(_) => {
                tracing::error!(error = %self.0, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/alloc", post(allocate_port))
        .route("/release", post(release_port))
        .route("/heartbeat", post(heartbeat))
        .route("/verify", post(verify))
        .route("/credentials", get(get_credentials).post(update_credentials))
        .route("/status", get(port_status))
        .route("/list", get(list_active))
        .route("/stats", get(stats))
        .route("/probe", get(probe_report))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl AppState {
    fn check_range(&self, port: u16) -> Result<(), ApiError> {
        let range = self.manager.range();
        if range.contains(port) {
            Ok(())
        } else {
            Err(PortError::OutOfRange {
                port,
                min: range.min,
                max: range.max,
            }
            .into())
        }
    }
}

async fn allocate_port(
    State(state): State<AppState>,
    Json(payload): Json<AllocateRequest>,
) -> ApiResult<AllocateResponse> {
    let allocation = state
        .manager
        .allocate(
            &payload.owner_id,
            payload.credentials,
            payload.metadata.unwrap_or_default(),
        )
        .await?;
    Ok(Json(AllocateResponse {
        port: allocation.port,
        allocation,
    }))
}

async fn release_port(
    State(state): State<AppState>,
    Json(payload): Json<PortOwnerRequest>,
) -> Result<StatusCode, ApiError> {
    state.manager.release(payload.port, &payload.owner_id).await?;
    Ok(StatusCode::OK)
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(payload): Json<PortOwnerRequest>,
) -> ApiResult<HeartbeatResponse> {
    let outcome = state.manager.heartbeat(payload.port, &payload.owner_id).await?;
    Ok(Json(HeartbeatResponse {
        port: payload.port,
        outcome,
    }))
}

async fn verify(
    State(state): State<AppState>,
    Json(payload): Json<PortOwnerRequest>,
) -> ApiResult<VerifyResponse> {
    Ok(Json(state.manager.verify(payload.port, &payload.owner_id).await?))
}

async fn get_credentials(
    State(state): State<AppState>,
    Query(query): Query<PortQuery>,
) -> ApiResult<CredentialsResponse> {
    state.check_range(query.port)?;
    let credentials = state.manager.credentials(query.port).await?;
    Ok(Json(CredentialsResponse {
        port: query.port,
        credentials,
    }))
}

async fn update_credentials(
    State(state): State<AppState>,
    Json(payload): Json<UpdateCredentialsRequest>,
) -> Result<StatusCode, ApiError> {
    state.check_range(payload.port)?;
    state
        .manager
        .update_credentials(payload.port, payload.credentials)
        .await?;
    Ok(StatusCode::OK)
}

async fn port_status(
    State(state): State<AppState>,
    Query(query): Query<PortQuery>,
) -> ApiResult<Allocation> {
    state.check_range(query.port)?;
    Ok(Json(state.manager.status(query.port).await?))
}

async fn list_active(State(state): State<AppState>) -> ApiResult<Vec<Allocation>> {
    Ok(Json(state.manager.list_active().await?))
}

async fn stats(State(state): State<AppState>) -> ApiResult<Stats> {
    Ok(Json(state.manager.stats().await?))
}

async fn probe_report(State(state): State<AppState>) -> ApiResult<Option<ProbeReport>> {
    let report = state
        .probe_report
        .read()
        .map_err(|_| PortError::Internal("probe report lock poisoned".to_string()))?
        .clone();
    Ok(Json(report))
}
