use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use shared::llm::LlmGatewayError;
use shared::models::ErrorResponse;
use shared::relay::RelayError;
use shared::repos::StoreError;
use tracing::{error, warn};

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

fn with_retry_after(mut response: Response, retry_after_seconds: u64) -> Response {
    if let Ok(retry_after_value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, retry_after_value);
    }
    response
}

pub(super) fn bad_request_response(code: &str, message: &str) -> Response {
    error_response(StatusCode::BAD_REQUEST, code, message)
}

pub(super) fn not_found_response(message: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", message)
}

pub(super) fn service_unavailable_response(code: &str, message: &str) -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, code, message)
}

pub(super) fn json_rejection_response(rejection: JsonRejection) -> Response {
    warn!("rejected request body: {rejection}");
    bad_request_response("invalid_json", "Request body must be a JSON object")
}

pub(super) fn store_error_response(err: StoreError) -> Response {
    error!("database operation failed: {err}");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "Unexpected server error",
    )
}

pub(super) fn relay_error_response(err: RelayError) -> Response {
    match err {
        RelayError::Validation(message) => bad_request_response("invalid_request", &message),
        RelayError::Throttled(rejection) => {
            warn!(
                scope = rejection.scope.as_str(),
                retry_after_seconds = rejection.retry_after_seconds,
                "mentor turn throttled"
            );
            with_retry_after(
                error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    "Too many requests; retry later",
                ),
                rejection.retry_after_seconds,
            )
        }
        RelayError::Persistence(err) => store_error_response(err),
        RelayError::Upstream(err) => upstream_error_response(err),
    }
}

fn upstream_error_response(err: LlmGatewayError) -> Response {
    match err {
        LlmGatewayError::CircuitOpen {
            retry_after_seconds,
        } => with_retry_after(
            service_unavailable_response(
                "mentor_unavailable",
                "The mentor is temporarily unavailable",
            ),
            retry_after_seconds,
        ),
        other => {
            warn!(error_kind = other.kind(), "language model call failed: {other}");
            error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "The mentor could not respond; please try again",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{StatusCode, header};
    use shared::llm::LlmGatewayError;
    use shared::relay::{RelayError, ThrottleRejection, ThrottleScope};
    use shared::repos::StoreError;

    use super::relay_error_response;

    #[test]
    fn maps_relay_errors_to_statuses() {
        let cases = [
            (
                RelayError::Validation("message is required".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                RelayError::Persistence(StoreError::InvalidData("bad row".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                RelayError::Upstream(LlmGatewayError::Timeout),
                StatusCode::BAD_GATEWAY,
            ),
            (
                RelayError::Upstream(LlmGatewayError::ProviderFailure(
                    "status=429 code=unknown".to_string(),
                )),
                StatusCode::BAD_GATEWAY,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(relay_error_response(err).status(), expected);
        }
    }

    #[test]
    fn local_limits_carry_retry_after() {
        let limited = relay_error_response(RelayError::Throttled(ThrottleRejection {
            scope: ThrottleScope::User,
            retry_after_seconds: 12,
        }));
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            limited
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok()),
            Some("12")
        );

        let open = relay_error_response(RelayError::Upstream(LlmGatewayError::CircuitOpen {
            retry_after_seconds: 30,
        }));
        assert_eq!(open.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(open.headers().contains_key(header::RETRY_AFTER));
    }
}
