use axum::{
    Extension, Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use pantau_domain::DomainResult;
use pantau_domain::cache::{CacheKeys, read_through};
use pantau_domain::error::DomainError;
use pantau_domain::issues::{Issue, IssueStatus};
use pantau_domain::otp::{OtpIssued, OtpPurpose};
use pantau_domain::reports::{Address, Category, SnapReport, SnapReportCreate};
use pantau_domain::validation::{CallbackOutcome, ValidationCallback};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{ApiError, FieldError, envelope};
use crate::middleware::{self as app_middleware, AuthContext, CorrelationId};
use crate::observability;
use crate::state::AppState;
use crate::validation;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/reports", post(create_report))
        .route("/v1/issues/:issue_id/status", patch(update_issue_status))
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/otp/request", post(request_otp))
        .route("/v1/otp/verify", post(verify_otp))
        .route("/v1/reports/:report_id", get(get_report))
        .route("/v1/issues/:issue_id", get(get_issue))
        .route("/v1/issues/:issue_id/reports", get(list_issue_reports))
        .route("/v1/webhooks/validation", post(validation_webhook))
        .merge(protected)
        .route_layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ));

    if !state.config.app_env.eq_ignore_ascii_case("test") {
        app = app.layer(app_middleware::rate_limit_layer());
    }

    app.with_state(state)
}

fn map_domain_error(err: DomainError) -> ApiError {
    ApiError::from(err)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => ApiError::Unavailable("metrics recorder not installed".into()).into_response(),
    }
}

#[derive(Debug, Deserialize, Validate)]
struct OtpRequest {
    #[validate(length(min = 3, max = 254))]
    identifier: String,
    purpose: OtpPurpose,
}

async fn request_otp(
    State(state): State<AppState>,
    payload: Result<Json<OtpRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    validation::validate(&payload)?;
    let issued: OtpIssued = state
        .otp
        .issue(payload.identifier.trim(), payload.purpose)
        .await
        .map_err(map_domain_error)?;
    Ok(envelope("verification code issued", issued))
}

#[derive(Debug, Deserialize, Validate)]
struct OtpVerifyRequest {
    #[validate(length(min = 3, max = 254))]
    identifier: String,
    purpose: OtpPurpose,
    #[validate(length(min = 1, max = 16))]
    code: String,
}

#[derive(Serialize)]
struct OtpVerifyResponse {
    verified: bool,
}

async fn verify_otp(
    State(state): State<AppState>,
    payload: Result<Json<OtpVerifyRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    validation::validate(&payload)?;
    let verified = state
        .otp
        .verify_code(payload.identifier.trim(), payload.purpose, payload.code.trim())
        .await;
    Ok(envelope("verification checked", OtpVerifyResponse { verified }))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateReportRequest {
    #[validate(length(min = 3, max = 254))]
    identifier: String,
    #[validate(length(min = 1, max = 16))]
    otp_code: String,
    #[validate(length(min = 1, max = 2048))]
    image_url: String,
    #[validate(range(min = -90.0, max = 90.0))]
    latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    longitude: f64,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    address: Option<Address>,
}

/// Accepts either the classifier label (`DefectiveManhole`) or the snake_case
/// form (`defective_manhole`).
fn parse_category(value: Option<&str>) -> Result<Option<Category>, ApiError> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    if value.eq_ignore_ascii_case(Category::NotSpecified.as_str()) {
        return Ok(Some(Category::NotSpecified));
    }
    let category = Category::RECOGNIZED
        .into_iter()
        .find(|category| {
            category.label().eq_ignore_ascii_case(value)
                || category.as_str().eq_ignore_ascii_case(value)
        })
        .ok_or_else(|| {
            ApiError::InvalidFields(vec![FieldError::new("category", "unknown category")])
        })?;
    Ok(Some(category))
}

async fn create_report(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation_id): Extension<CorrelationId>,
    payload: Result<Json<CreateReportRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload?;
    validation::validate(&payload)?;
    let actor = auth.actor()?;
    let category = parse_category(payload.category.as_deref())?;

    let input = SnapReportCreate {
        identifier: payload.identifier.trim().to_string(),
        otp_code: payload.otp_code.trim().to_string(),
        image_url: payload.image_url,
        latitude: payload.latitude,
        longitude: payload.longitude,
        category,
        address: payload.address.unwrap_or_default(),
    };

    let report = match state.reports.submit(actor, input).await {
        Ok(report) => report,
        Err(err) => {
            observability::register_report_submission("rejected");
            return Err(map_domain_error(err));
        }
    };
    observability::register_report_submission("accepted");
    tracing::info!(
        report_id = %report.report_id,
        correlation_id = %correlation_id.0,
        "report accepted"
    );

    Ok((
        StatusCode::CREATED,
        envelope("report submitted", report),
    )
        .into_response())
}

fn found<T>(result: DomainResult<T>) -> DomainResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(DomainError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

async fn get_report(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let key = CacheKeys::report_detail(&report_id);
    let report: Option<SnapReport> = read_through(state.cache.as_ref(), &key, state.cache_ttl, || {
        let reports = state.reports.clone();
        let report_id = report_id.clone();
        async move { found(reports.get(&report_id).await) }
    })
    .await
    .map_err(map_domain_error)?;

    let report = report.ok_or(ApiError::NotFound)?;
    Ok(envelope("report", report))
}

async fn get_issue(
    State(state): State<AppState>,
    Path(issue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let key = CacheKeys::issue_detail(&issue_id);
    let issue: Option<Issue> = read_through(state.cache.as_ref(), &key, state.cache_ttl, || {
        let issues = state.issues.clone();
        let issue_id = issue_id.clone();
        async move { found(issues.get(&issue_id).await) }
    })
    .await
    .map_err(map_domain_error)?;

    let issue = issue.ok_or(ApiError::NotFound)?;
    Ok(envelope("issue", issue))
}

async fn list_issue_reports(
    State(state): State<AppState>,
    Path(issue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let key = CacheKeys::issue_reports(&issue_id);
    let reports: Option<Vec<SnapReport>> =
        read_through(state.cache.as_ref(), &key, state.cache_ttl, || {
            let issues = state.issues.clone();
            let reports = state.reports.clone();
            let issue_id = issue_id.clone();
            async move {
                if found(issues.get(&issue_id).await)?.is_none() {
                    return Ok(None);
                }
                reports.list_by_issue(&issue_id).await.map(Some)
            }
        })
        .await
        .map_err(map_domain_error)?;

    let reports = reports.ok_or(ApiError::NotFound)?;
    Ok(envelope("issue reports", reports))
}

#[derive(Debug, Deserialize)]
struct IssueStatusRequest {
    status: IssueStatus,
}

async fn update_issue_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(issue_id): Path<String>,
    payload: Result<Json<IssueStatusRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let actor = auth.actor()?;
    let issue = state
        .issues
        .change_status(&issue_id, payload.status)
        .await
        .map_err(map_domain_error)?;
    tracing::info!(
        issue_id = %issue.issue_id,
        status = issue.status.as_str(),
        user_id = %actor.user_id,
        "issue status updated"
    );
    Ok(envelope("issue status updated", issue))
}

#[derive(Serialize)]
struct WebhookAck {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    issue_id: Option<String>,
}

/// Classifier callback. Anything well-formed is acknowledged with 200 so the
/// classifier stops retrying; only store outages surface as errors.
async fn validation_webhook(
    State(state): State<AppState>,
    Extension(correlation_id): Extension<CorrelationId>,
    callback: Result<Json<ValidationCallback>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(callback) = callback?;
    let outcome = state
        .correlator
        .handle(&callback)
        .await
        .map_err(map_domain_error)?;

    observability::register_validation_callback(outcome.as_str());
    tracing::info!(
        task_id = %callback.task_id,
        status = %callback.status,
        outcome = outcome.as_str(),
        correlation_id = %correlation_id.0,
        "validation callback handled"
    );

    let ack = match outcome {
        CallbackOutcome::Approved {
            report_id,
            issue_id,
            issue_created,
        } => {
            observability::register_dedup_outcome(if issue_created { "created" } else { "linked" });
            WebhookAck {
                outcome: "approved",
                report_id: Some(report_id),
                issue_id: Some(issue_id),
            }
        }
        CallbackOutcome::Declined { report_id } => WebhookAck {
            outcome: "declined",
            report_id: Some(report_id),
            issue_id: None,
        },
        other => WebhookAck {
            outcome: other.as_str(),
            report_id: None,
            issue_id: None,
        },
    };
    Ok(Json(ack))
}
