use axum::{
    body::Body,
    extract::MatchedPath,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::middleware::NoOpMiddleware;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use pantau_domain::identity::ActorIdentity;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_governor::GovernorLayer;
use tower_governor::governor::{GovernorConfig, GovernorConfigBuilder};
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{Span, info_span};
use uuid::Uuid;

use crate::error::ApiError;
use crate::observability;
use crate::state::AppState;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
const REQUEST_ID_HEADER: &str = "x-request-id";
const RATE_LIMIT_PER_SECOND: u64 = 100;
const RATE_LIMIT_BURST: u32 = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub is_authenticated: bool,
}

impl AuthContext {
    fn anonymous() -> Self {
        Self {
            user_id: None,
            is_authenticated: false,
        }
    }

    pub fn actor(&self) -> Result<ActorIdentity, ApiError> {
        match (&self.user_id, self.is_authenticated) {
            (Some(user_id), true) => Ok(ActorIdentity::with_user_id(user_id.clone())),
            _ => Err(ApiError::Unauthorized),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// uuid v7 request ids, so ids sort by arrival.
#[derive(Clone)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::now_v7().to_string())
            .ok()
            .map(RequestId::new)
    }
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, RequestSpan> {
    TraceLayer::new_for_http().make_span_with(RequestSpan)
}

#[derive(Clone, Default)]
pub(crate) struct RequestSpan;

fn header_or_dash<'a, B>(req: &'a Request<B>, name: &str) -> &'a str {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
}

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, req: &Request<B>) -> Span {
        info_span!(
            "http_request",
            method = %req.method(),
            uri = %req.uri(),
            request_id = %header_or_dash(req, REQUEST_ID_HEADER),
            correlation_id = %header_or_dash(req, CORRELATION_ID_HEADER)
        )
    }
}

pub fn set_request_id_layer() -> SetRequestIdLayer<UuidRequestId> {
    SetRequestIdLayer::x_request_id(UuidRequestId)
}

pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

pub fn timeout_layer() -> TimeoutLayer {
    TimeoutLayer::new(REQUEST_TIMEOUT)
}

pub type RateLimitLayer = GovernorLayer<PeerIpKeyExtractor, NoOpMiddleware>;

/// Per-peer-IP token bucket; needs `ConnectInfo<SocketAddr>` on the service.
pub fn rate_limit_layer() -> RateLimitLayer {
    let config = match GovernorConfigBuilder::default()
        .per_second(RATE_LIMIT_PER_SECOND)
        .burst_size(RATE_LIMIT_BURST)
        .finish()
    {
        Some(config) => config,
        None => {
            tracing::error!(
                per_second = RATE_LIMIT_PER_SECOND,
                burst = RATE_LIMIT_BURST,
                "invalid rate limit settings; falling back to governor defaults"
            );
            GovernorConfig::default()
        }
    };
    GovernorLayer {
        config: Arc::new(config),
    }
}

/// Attaches an `AuthContext` to every request. A missing or invalid bearer
/// token yields an anonymous context; only `require_auth_middleware` rejects.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let context = match bearer_token(req.headers()) {
        Some(token) => decode_token(token, &state.config.jwt_secret),
        None => AuthContext::anonymous(),
    };
    req.extensions_mut().insert(context);
    next.run(req).await
}

fn decode_token(token: &str, secret: &str) -> AuthContext {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    match decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
        Ok(data) if !data.claims.sub.trim().is_empty() => AuthContext {
            user_id: Some(data.claims.sub),
            is_authenticated: true,
        },
        Ok(_) => {
            tracing::warn!("auth token has empty subject");
            AuthContext::anonymous()
        }
        Err(err) => {
            tracing::warn!(error = %err, "invalid auth token");
            AuthContext::anonymous()
        }
    }
}

pub async fn require_auth_middleware(req: Request<Body>, next: Next) -> Response {
    let authenticated = req
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| ctx.is_authenticated)
        .unwrap_or(false);
    if authenticated {
        next.run(req).await
    } else {
        ApiError::Unauthorized.into_response()
    }
}

/// Accepts the caller's `x-correlation-id` or mints one, and mirrors it on
/// both the request (for the trace span) and the response.
pub async fn correlation_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let correlation_id = match req.headers().get(CORRELATION_ID_HEADER) {
        None => Uuid::now_v7().to_string(),
        Some(value) => match value.to_str() {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => {
                return ApiError::Validation("invalid correlation id".into()).into_response();
            }
        },
    };
    let header_value = HeaderValue::from_str(&correlation_id).ok();
    let header_name = HeaderName::from_static(CORRELATION_ID_HEADER);

    if let Some(value) = header_value.clone() {
        req.headers_mut().insert(header_name.clone(), value);
    }
    req.extensions_mut().insert(CorrelationId(correlation_id));

    let mut response = next.run(req).await;
    if let Some(value) = header_value {
        response.headers_mut().insert(header_name, value);
    }
    response
}

pub async fn metrics_layer(req: Request<Body>, next: Next) -> Response {
    let start = std::time::Instant::now();
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let response = next.run(req).await;
    observability::register_http_request(&method, &route, response.status(), start.elapsed());
    response
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?;
    let value = value.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
