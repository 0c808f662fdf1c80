use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

pub(super) const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Clone, Debug)]
pub(super) struct RequestContext {
    pub(super) request_id: String,
}

/// Attached to relay responses so the access log can say how the turn ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct TurnOutcome {
    pub(super) used_fallback: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RouteClass {
    Relay,
    Sessions,
    Ops,
    Unmatched,
}

impl RouteClass {
    fn of(route: Option<&str>) -> Self {
        match route {
            Some("/functions/v1/chat-with-mentor" | "/v1/chat") => Self::Relay,
            Some("/healthz" | "/readyz") => Self::Ops,
            Some(route) if route.starts_with("/v1/") => Self::Sessions,
            _ => Self::Unmatched,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::Sessions => "sessions",
            Self::Ops => "ops",
            Self::Unmatched => "unmatched",
        }
    }
}

/// Tags every request with an id, runs the handler inside a span carrying it
/// and writes one `mentor_http_request` line when the response is ready.
pub(super) async fn request_observability_middleware(mut req: Request, next: Next) -> Response {
    let request_id = resolve_request_id(&req);
    req.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
    });

    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string());
    let route_class = RouteClass::of(route.as_deref());
    let method = req.method().clone();
    let span = info_span!(
        "http_request",
        request_id = %request_id,
        route_class = route_class.as_str()
    );
    let started_at = Instant::now();

    let mut response = next.run(req).instrument(span.clone()).await;
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), header_value);
    }

    let status = response.status().as_u16();
    let latency_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    let route = route.as_deref().unwrap_or("-");
    let outcome = response.extensions().get::<TurnOutcome>().copied();
    span.in_scope(|| match (route_class, outcome) {
        _ if status >= 500 => warn!(
            method = %method,
            route,
            status,
            latency_ms,
            metric_name = "mentor_http_request",
            "request failed"
        ),
        (RouteClass::Relay, Some(outcome)) => info!(
            method = %method,
            route,
            status,
            latency_ms,
            used_fallback = outcome.used_fallback,
            metric_name = "mentor_http_request",
            "mentor turn served"
        ),
        (RouteClass::Ops, _) if status < 400 => {}
        _ => info!(
            method = %method,
            route,
            status,
            latency_ms,
            metric_name = "mentor_http_request",
            "request served"
        ),
    });

    response
}

fn resolve_request_id(req: &Request) -> String {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(normalize_request_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn normalize_request_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let usable = !trimmed.is_empty()
        && trimmed.len() <= MAX_REQUEST_ID_LEN
        && trimmed
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.'));
    usable.then(|| trimmed.to_string())
}
