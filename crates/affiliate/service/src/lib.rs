#![deny(unsafe_code)]

pub mod scheduler;

use affiliate_ledger::{
    AffiliateLedger, ClickOutcome, ConversionOutcome, ConversionTarget, EnrollAffiliate,
    LedgerConfig, LedgerError, ReconciliationReport, SignupOutcome, SweepReport,
};
use affiliate_storage::memory::InMemoryAffiliateStorage;
#[cfg(feature = "postgres")]
use affiliate_storage::postgres::PostgresAffiliateStorage;
use affiliate_storage::{AffiliateStorage, QueryWindow};
use affiliate_types::{
    Affiliate, AffiliateId, ClientMetadata, CustomLink, Payout, PayoutId, PayoutPolicy, Purchase,
    PurchaseCategory, Referral, ReferralId, TrackingContext, UserId, UtmParams,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path as FsPath;
use std::sync::Arc;
use thiserror::Error;

/// Where affiliate records live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    Postgres {
        database_url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    5
}

impl StorageConfig {
    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

impl ServiceConfig {
    /// Load from a JSON file. Missing sections fall back to defaults.
    pub fn from_file(path: &FsPath) -> Result<Self, ServiceError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| ServiceError::Config(format!("invalid config {}: {e}", path.display())))
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub ledger: Arc<AffiliateLedger>,
    pub backend: &'static str,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig { storage, ledger } = config;
        let backend = storage.backend_name();
        let storage = open_storage(storage).await?;
        tracing::info!(backend, "Affiliate storage ready");
        Ok(Self {
            ledger: Arc::new(AffiliateLedger::with_config(storage, ledger)),
            backend,
        })
    }
}

async fn open_storage(config: StorageConfig) -> Result<Arc<dyn AffiliateStorage>, ServiceError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(InMemoryAffiliateStorage::new())),
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store =
                PostgresAffiliateStorage::connect_with_options(&database_url, max_connections, 5)
                    .await
                    .map_err(|e| ServiceError::Storage(e.to_string()))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(ServiceError::Config(
            "postgres storage requested but the `postgres` feature is disabled".to_string(),
        )),
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/affiliates", post(enroll_affiliate).get(list_affiliates))
        .route("/v1/affiliates/:affiliate_id", get(get_affiliate))
        .route("/v1/affiliates/:affiliate_id/links", post(add_custom_link))
        .route("/v1/affiliates/:affiliate_id/suspend", post(suspend_affiliate))
        .route("/v1/affiliates/:affiliate_id/reactivate", post(reactivate_affiliate))
        .route("/v1/affiliates/:affiliate_id/payout-policy", put(set_payout_policy))
        .route("/v1/affiliates/:affiliate_id/reconciliation", get(reconcile))
        .route(
            "/v1/affiliates/:affiliate_id/payouts",
            post(create_payout).get(list_payouts),
        )
        .route("/v1/payouts/:payout_id", get(get_payout))
        .route("/v1/clicks", post(track_click))
        .route("/v1/referrals/:referral_id", get(get_referral))
        .route("/v1/referrals/:referral_id/signup", post(track_signup))
        .route("/v1/conversions", post(track_conversion))
        .route("/v1/sweeps/clearing", post(run_clearing_sweep))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Http { status, .. } => *status,
            ApiError::Ledger(err) => match err {
                LedgerError::AffiliateNotFound(_)
                | LedgerError::ReferralNotFound(_)
                | LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
                err if err.is_operator_error() => StatusCode::UNPROCESSABLE_ENTITY,
                LedgerError::SweepAlreadyRunning
                | LedgerError::Conflict(_)
                | LedgerError::InvalidStateTransition(_) => StatusCode::CONFLICT,
                LedgerError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Http { status, .. } if *status == StatusCode::NOT_FOUND => "not_found",
            ApiError::Http { .. } => "bad_request",
            ApiError::Ledger(err) => match err {
                LedgerError::AffiliateNotFound(_) => "affiliate_not_found",
                LedgerError::ReferralNotFound(_) => "referral_not_found",
                LedgerError::CodeTaken(_) => "code_taken",
                LedgerError::InvalidCode(_) => "invalid_code",
                LedgerError::LinkExists { .. } => "link_exists",
                LedgerError::InvalidInput(_) => "invalid_input",
                LedgerError::BelowMinimum { .. } => "below_minimum",
                LedgerError::NoPayoutMethod(_) => "no_payout_method",
                LedgerError::NoClearedCommissions(_) => "no_cleared_commissions",
                LedgerError::SweepAlreadyRunning => "sweep_already_running",
                LedgerError::LockTimeout(_) => "lock_timeout",
                LedgerError::InvalidStateTransition(_) => "invalid_state_transition",
                LedgerError::NotFound(_) => "not_found",
                LedgerError::Conflict(_) => "conflict",
                LedgerError::Backend(_) => "backend",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = serde_json::json!({ "error": self.to_string(), "code": self.code() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    sweep_running: bool,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "affiliate-service",
        storage_backend: state.backend,
        sweep_running: state.ledger.sweep().is_running(),
    })
}

// ── affiliates ──────────────────────────────────────────────────────

async fn enroll_affiliate(
    State(state): State<ServiceState>,
    Json(request): Json<EnrollAffiliate>,
) -> Result<(StatusCode, Json<Affiliate>), ApiError> {
    let affiliate = state.ledger.enroll(request).await?;
    Ok((StatusCode::CREATED, Json(affiliate)))
}

#[derive(Debug, Clone, Deserialize)]
struct WindowQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

impl WindowQuery {
    fn window(&self) -> QueryWindow {
        QueryWindow {
            limit: self.limit.unwrap_or(100).min(1000),
            offset: self.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ListResponse<T> {
    returned: usize,
    items: Vec<T>,
}

impl<T> ListResponse<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            returned: items.len(),
            items,
        }
    }
}

async fn list_affiliates(
    State(state): State<ServiceState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ListResponse<Affiliate>>, ApiError> {
    let items = state.ledger.list_affiliates(query.window()).await?;
    Ok(Json(ListResponse::new(items)))
}

async fn get_affiliate(
    Path(affiliate_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Affiliate>, ApiError> {
    Ok(Json(
        state
            .ledger
            .get_affiliate(&AffiliateId::new(affiliate_id))
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct CustomLinkRequest {
    slug: String,
    name: String,
}

async fn add_custom_link(
    Path(affiliate_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<CustomLinkRequest>,
) -> Result<(StatusCode, Json<CustomLink>), ApiError> {
    let link = state
        .ledger
        .add_custom_link(&AffiliateId::new(affiliate_id), &request.slug, &request.name)
        .await?;
    Ok((StatusCode::CREATED, Json(link)))
}

async fn suspend_affiliate(
    Path(affiliate_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Affiliate>, ApiError> {
    Ok(Json(
        state.ledger.suspend(&AffiliateId::new(affiliate_id)).await?,
    ))
}

async fn reactivate_affiliate(
    Path(affiliate_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Affiliate>, ApiError> {
    Ok(Json(
        state
            .ledger
            .reactivate(&AffiliateId::new(affiliate_id))
            .await?,
    ))
}

async fn set_payout_policy(
    Path(affiliate_id): Path<String>,
    State(state): State<ServiceState>,
    Json(policy): Json<PayoutPolicy>,
) -> Result<Json<Affiliate>, ApiError> {
    Ok(Json(
        state
            .ledger
            .set_payout_policy(&AffiliateId::new(affiliate_id), policy)
            .await?,
    ))
}

async fn reconcile(
    Path(affiliate_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    Ok(Json(
        state
            .ledger
            .reconcile(&AffiliateId::new(affiliate_id))
            .await?,
    ))
}

// ── events ──────────────────────────────────────────────────────────

/// Event response: `applied` plus the flattened outcome.
#[derive(Debug, Clone, Serialize)]
struct EventResponse<T: Serialize> {
    applied: bool,
    #[serde(flatten)]
    outcome: T,
}

#[derive(Debug, Clone, Deserialize)]
struct ClickRequest {
    code: String,
    #[serde(default)]
    link_slug: Option<String>,
    #[serde(default)]
    utm: UtmParams,
    #[serde(default)]
    client: ClientMetadata,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

async fn track_click(
    State(state): State<ServiceState>,
    Json(request): Json<ClickRequest>,
) -> Result<Json<EventResponse<ClickOutcome>>, ApiError> {
    let context = TrackingContext {
        source_code: request.code.clone(),
        link_slug: request.link_slug,
        utm: request.utm,
        client: request.client,
        metadata: request.metadata,
    };
    let outcome = state.ledger.track_click(&request.code, context).await?;
    Ok(Json(EventResponse {
        applied: outcome.is_attributed(),
        outcome,
    }))
}

async fn get_referral(
    Path(referral_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Referral>, ApiError> {
    Ok(Json(
        state
            .ledger
            .get_referral(&ReferralId::new(referral_id))
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct SignupRequest {
    user_id: String,
}

async fn track_signup(
    Path(referral_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<SignupRequest>,
) -> Result<Json<EventResponse<SignupOutcome>>, ApiError> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id is required"));
    }
    let outcome = state
        .ledger
        .track_signup(&ReferralId::new(referral_id), &UserId::new(request.user_id))
        .await?;
    Ok(Json(EventResponse {
        applied: matches!(outcome, SignupOutcome::SignedUp { .. }),
        outcome,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct ConversionRequest {
    #[serde(default)]
    referral_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    affiliate_code: Option<String>,
    category: PurchaseCategory,
    amount_minor: u64,
    payment_reference: String,
}

impl ConversionRequest {
    fn target(&self) -> Result<ConversionTarget, ApiError> {
        match (&self.referral_id, &self.user_id) {
            (Some(referral_id), _) => Ok(ConversionTarget::Referral {
                referral_id: ReferralId::new(referral_id.clone()),
            }),
            (None, Some(user_id)) => Ok(ConversionTarget::User {
                user_id: UserId::new(user_id.clone()),
                affiliate_code: self.affiliate_code.clone(),
            }),
            (None, None) => Err(ApiError::bad_request(
                "either referral_id or user_id is required",
            )),
        }
    }
}

async fn track_conversion(
    State(state): State<ServiceState>,
    Json(request): Json<ConversionRequest>,
) -> Result<Json<EventResponse<ConversionOutcome>>, ApiError> {
    let target = request.target()?;
    let purchase = Purchase {
        category: request.category,
        reference_id: request.payment_reference,
        amount_minor: request.amount_minor,
    };
    let outcome = state.ledger.track_conversion(&target, purchase).await?;
    Ok(Json(EventResponse {
        applied: matches!(outcome, ConversionOutcome::Converted { .. }),
        outcome,
    }))
}

// ── clearing and payouts ────────────────────────────────────────────

async fn run_clearing_sweep(
    State(state): State<ServiceState>,
) -> Result<Json<SweepReport>, ApiError> {
    Ok(Json(state.ledger.process_cleared_commissions().await?))
}

#[derive(Debug, Clone, Deserialize)]
struct PayoutRequest {
    processed_by: String,
}

async fn create_payout(
    Path(affiliate_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<PayoutRequest>,
) -> Result<(StatusCode, Json<Payout>), ApiError> {
    if request.processed_by.trim().is_empty() {
        return Err(ApiError::bad_request("processed_by is required"));
    }
    let payout = state
        .ledger
        .create_payout(&AffiliateId::new(affiliate_id), &request.processed_by)
        .await?;
    Ok((StatusCode::CREATED, Json(payout)))
}

async fn list_payouts(
    Path(affiliate_id): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ListResponse<Payout>>, ApiError> {
    let items = state
        .ledger
        .list_payouts(&AffiliateId::new(affiliate_id), query.window())
        .await?;
    Ok(Json(ListResponse::new(items)))
}

async fn get_payout(
    Path(payout_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Payout>, ApiError> {
    state
        .ledger
        .get_payout(&PayoutId::new(payout_id.clone()))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("payout '{}' not found", payout_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> Router {
        let state = ServiceState::bootstrap(ServiceConfig::default())
            .await
            .unwrap();
        build_router(state)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn enroll(app: &Router, code: &str) -> String {
        let (status, body) = send(
            app,
            "POST",
            "/v1/affiliates",
            Some(serde_json::json!({ "code": code, "display_name": "Maria" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["affiliate_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_memory_backend() {
        let app = app().await;
        let (status, body) = send(&app, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storage_backend"], "memory");
        assert_eq!(body["sweep_running"], false);
    }

    #[tokio::test]
    async fn click_signup_conversion_flow_over_http() {
        let app = app().await;
        let affiliate_id = enroll(&app, "maria").await;

        let (status, click) = send(
            &app,
            "POST",
            "/v1/clicks",
            Some(serde_json::json!({
                "code": "MARIA",
                "utm": { "source": "newsletter" },
                "client": { "user_agent": "test" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(click["applied"], true);
        assert_eq!(click["outcome"], "attributed");
        let referral_id = click["referral_id"].as_str().unwrap().to_string();

        let (status, signup) = send(
            &app,
            "POST",
            &format!("/v1/referrals/{referral_id}/signup"),
            Some(serde_json::json!({ "user_id": "u1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(signup["applied"], true);

        let (status, referral) =
            send(&app, "GET", &format!("/v1/referrals/{referral_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(referral["status"], "signed_up");
        assert_eq!(referral["tracking"]["utm"]["source"], "newsletter");

        let conversion = serde_json::json!({
            "user_id": "u1",
            "affiliate_code": "maria",
            "category": "courses",
            "amount_minor": 10_000,
            "payment_reference": "pi_1"
        });
        let (status, converted) =
            send(&app, "POST", "/v1/conversions", Some(conversion.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(converted["applied"], true);
        assert_eq!(converted["commission_minor"], 2_000);

        let (status, replay) = send(&app, "POST", "/v1/conversions", Some(conversion)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replay["applied"], false);
        assert_eq!(replay["outcome"], "already_attributed");

        let (status, affiliate) =
            send(&app, "GET", &format!("/v1/affiliates/{affiliate_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(affiliate["balance"]["pending_minor"], 2_000);

        let (status, report) = send(
            &app,
            "GET",
            &format!("/v1/affiliates/{affiliate_id}/reconciliation"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["pending_drift_minor"], 0);
    }

    #[tokio::test]
    async fn unknown_code_click_is_not_applied() {
        let app = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/v1/clicks",
            Some(serde_json::json!({ "code": "nobody" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["applied"], false);
        assert_eq!(body["outcome"], "no_attribution");
    }

    #[tokio::test]
    async fn conversion_without_target_is_bad_request() {
        let app = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/v1/conversions",
            Some(serde_json::json!({
                "category": "courses",
                "amount_minor": 100,
                "payment_reference": "pi_1"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");
    }

    #[tokio::test]
    async fn ledger_errors_map_to_status_codes() {
        let app = app().await;
        enroll(&app, "maria").await;

        let (status, body) = send(
            &app,
            "POST",
            "/v1/affiliates",
            Some(serde_json::json!({ "code": "Maria", "display_name": "Other" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "code_taken");

        let (status, body) = send(
            &app,
            "POST",
            "/v1/affiliates",
            Some(serde_json::json!({
                "code": "forever",
                "display_name": "Forever",
                "cookie_days": u32::MAX
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "invalid_input");

        let (status, body) = send(&app, "GET", "/v1/affiliates/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "affiliate_not_found");

        let (status, body) = send(&app, "GET", "/v1/referrals/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "referral_not_found");

        let (status, _) = send(&app, "GET", "/v1/payouts/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn payout_without_method_is_unprocessable() {
        let app = app().await;
        let affiliate_id = enroll(&app, "maria").await;

        let (status, _) = send(
            &app,
            "PUT",
            &format!("/v1/affiliates/{affiliate_id}/payout-policy"),
            Some(serde_json::json!({ "method": null, "minimum_payout_minor": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/affiliates/{affiliate_id}/payouts"),
            Some(serde_json::json!({ "processed_by": "ops" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "no_payout_method");

        let (status, body) = send(
            &app,
            "GET",
            &format!("/v1/affiliates/{affiliate_id}/payouts"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["returned"], 0);
    }

    #[tokio::test]
    async fn manual_sweep_returns_report() {
        let app = app().await;
        let (status, body) = send(&app, "POST", "/v1/sweeps/clearing", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], 0);
        assert_eq!(body["cancelled"], false);
    }

    #[test]
    fn storage_config_parses_tagged_json() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{ "storage": { "kind": "postgres", "database_url": "postgres://localhost/aff" } }"#,
        )
        .unwrap();
        assert_eq!(
            config.storage,
            StorageConfig::postgres("postgres://localhost/aff", 5)
        );
        assert_eq!(config.ledger.commission.hold_days, 30);
    }
}
