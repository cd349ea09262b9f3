// Pulse Engine - HTTP API server
// Bearer-authenticated surface over the trust engine. Upload bodies arrive as
// already-deframed byte payloads; multipart framing is handled upstream.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use pulse_engine::{
    City, EngineConfig, EngineError, EvidenceKind, FixedProvider, Industry, PublicUser, Session,
    SmeProfile, TrustEngine, TxnDirection, TxnRecord, UserRole,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: TrustEngine,
}

// ============================================================================
// Response envelope
// ============================================================================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            EngineError::Unauthorized(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::DuplicateEvidence(_) => StatusCode::CONFLICT,
            EngineError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::InvalidFilter(_) | EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::TransientProviderFailure(_) | EngineError::TerminalProviderFailure(_) => {
                StatusCode::BAD_GATEWAY
            }
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error_code = self.0.code(), error = %self.0, "request failed");
        } else {
            tracing::debug!(error_code = self.0.code(), error = %self.0, "request rejected");
        }

        let body = Json(serde_json::json!({
            "success": false,
            "error": self.0.to_string(),
            "code": self.0.code(),
        }));
        (status, body).into_response()
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError(EngineError::InvalidCredentials))?;
    Ok(state.engine.authenticate(token)?)
}

// ============================================================================
// Request / response payloads
// ============================================================================

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
    user_type: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    user: PublicUser,
    user_type: &'static str,
}

#[derive(Deserialize)]
struct SmeRegisterRequest {
    email: String,
    password: String,
    business_name: String,
    industry: String,
    location: String,
    founded_date: Option<String>,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct LenderRegisterRequest {
    email: String,
    password: String,
    company: Option<String>,
}

#[derive(Deserialize)]
struct ConnectRequest {
    mono_token: String,
}

#[derive(Serialize)]
struct UploadResponse {
    evidence_id: String,
    kind: &'static str,
    fingerprint: String,
    outcome: &'static str,
}

// ============================================================================
// Auth handlers
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

async fn register_sme(
    State(state): State<AppState>,
    Json(req): Json<SmeRegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let industry = Industry::parse(&req.industry)
        .ok_or_else(|| EngineError::Validation(format!("unknown industry: {}", req.industry)))?;
    let location = City::parse(&req.location)
        .ok_or_else(|| EngineError::Validation(format!("unknown location: {}", req.location)))?;
    let founded_date = match &req.founded_date {
        Some(raw) => Some(NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            EngineError::Validation(format!("founded_date must be YYYY-MM-DD: {}", raw))
        })?),
        None => None,
    };

    let record = state.engine.register_sme(
        &req.email,
        &req.password,
        SmeProfile {
            name: req.business_name,
            industry,
            location,
            founded_date,
            description: req.description,
        },
    )?;

    Ok((StatusCode::CREATED, Json(ApiResponse::ok(record))))
}

async fn register_lender(
    State(state): State<AppState>,
    Json(req): Json<LenderRegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .engine
        .register_lender(&req.email, &req.password, req.company)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(user))))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let role = UserRole::parse(&req.user_type).ok_or(EngineError::InvalidCredentials)?;
    let (session, user) = state.engine.login(&req.email, &req.password, role)?;

    Ok(Json(ApiResponse::ok(LoginResponse {
        token: session.token,
        user,
        user_type: role.as_str(),
    })))
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError(EngineError::InvalidCredentials))?;

    state.engine.logout(token);
    Ok(Json(ApiResponse::ok("logged out")))
}

// ============================================================================
// SME handlers
// ============================================================================

async fn upload_cac(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    submit_upload(state, headers, EvidenceKind::IncorporationDocument, body).await
}

async fn upload_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    submit_upload(state, headers, EvidenceKind::AttestationVideo, body).await
}

async fn submit_upload(
    state: AppState,
    headers: HeaderMap,
    kind: EvidenceKind,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<UploadResponse>>), ApiError> {
    let session = authenticate(&state, &headers)?;
    let sme_id = session.user_id.clone();

    let item = state
        .engine
        .submit_evidence(&session, &sme_id, kind, &body)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(UploadResponse {
            evidence_id: item.id,
            kind: item.kind.as_str(),
            fingerprint: item.fingerprint,
            outcome: item.outcome.as_str(),
        })),
    ))
}

async fn mono_connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConnectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = authenticate(&state, &headers)?;
    let sme_id = session.user_id.clone();

    let item = state
        .engine
        .connect_linked_account(&session, &sme_id, &req.mono_token)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(UploadResponse {
            evidence_id: item.id,
            kind: item.kind.as_str(),
            fingerprint: item.fingerprint,
            outcome: item.outcome.as_str(),
        })),
    ))
}

async fn dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let session = authenticate(&state, &headers)?;
    let data = state.engine.dashboard(&session).await?;
    Ok(Json(ApiResponse::ok(data)))
}

// ============================================================================
// Lender handlers
// ============================================================================

async fn marketplace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let session = authenticate(&state, &headers)?;
    let page = state.engine.marketplace(&session, &params)?;
    Ok(Json(ApiResponse::ok(page)))
}

async fn marketplace_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sme_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = authenticate(&state, &headers)?;
    let row = state.engine.marketplace_detail(&session, &sme_id)?;
    Ok(Json(ApiResponse::ok(row)))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_engine=info,pulse_server=info".into()),
        )
        .init();

    let config = match EngineConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {}", err);
            std::process::exit(1);
        }
    };
    let addr = config.server_addr();

    // Vendor bank integrations live behind LinkedAccountProvider; the fixed
    // provider backs demo deployments with the tokens the seed command uses.
    let provider = Arc::new(
        FixedProvider::new()
            .with_history("demo-link-long", demo_history(8))
            .with_history("demo-link-short", demo_history(4)),
    );

    let engine = match TrustEngine::open(config, provider) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("Failed to open engine: {}", err);
            eprintln!("   Run: cargo run -- init");
            std::process::exit(1);
        }
    };
    engine.spawn_refresh_schedule();

    let state = AppState { engine };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/auth/sme/register", post(register_sme))
        .route("/auth/lender/register", post(register_lender))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/sme/upload/cac", post(upload_cac))
        .route("/sme/upload/video", post(upload_video))
        .route("/sme/mono/connect", post(mono_connect))
        .route("/sme/dashboard", get(dashboard))
        .route("/lender/marketplace", get(marketplace))
        .route("/lender/marketplace/:sme_id", get(marketplace_detail))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("Failed to bind {}: {}", addr, err);
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %addr, version = pulse_engine::VERSION, "pulse server listening");

    if let Err(err) = axum::serve(listener, app).await {
        eprintln!("Server error: {}", err);
        std::process::exit(1);
    }
}

/// Same deterministic feed the seed command wires up.
fn demo_history(months: u32) -> Vec<TxnRecord> {
    use chrono::{TimeZone, Utc};

    let mut records = Vec::new();
    for m in 0..months {
        let ts = Utc
            .with_ymd_and_hms(2025, 1, 15, 10, 0, 0)
            .unwrap()
            .checked_add_months(chrono::Months::new(m))
            .unwrap();
        records.push(TxnRecord {
            external_id: format!("demo-credit-{}", m),
            amount: 2200.0 + m as f64 * 120.0,
            direction: TxnDirection::Credit,
            timestamp: ts,
            category: Some("sales".to_string()),
        });
        records.push(TxnRecord {
            external_id: format!("demo-debit-{}", m),
            amount: 1300.0,
            direction: TxnDirection::Debit,
            timestamp: ts,
            category: Some("inventory".to_string()),
        });
    }
    records
}
