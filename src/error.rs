use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Every failure that can reach the response path.
///
/// The string carried by each variant is internal detail: it is logged with the
/// correlation id and only rendered to callers when error details are exposed.
/// `Clone` lets one coalesced upstream failure be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limit exceeded for {client}")]
    RateLimited {
        client: String,
        limit: u64,
        reset_after_ms: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::NotFound(_) => "RESOURCE_NOT_FOUND",
            GatewayError::BadGateway(_) => "BAD_GATEWAY",
            GatewayError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
        }
    }

    /// Caller-safe message, independent of the internal detail
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "Unauthorized",
            GatewayError::RateLimited { .. } => "Too many requests, please try again later.",
            GatewayError::NotFound(_) => "The requested resource was not found.",
            GatewayError::BadGateway(_) => "The upstream service is unavailable.",
            GatewayError::GatewayTimeout(_) => "The upstream service did not respond in time.",
            GatewayError::Internal(_) => "An unexpected error occurred.",
            GatewayError::Validation(_) => "The request was invalid.",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            GatewayError::Unauthorized(detail)
            | GatewayError::NotFound(detail)
            | GatewayError::BadGateway(detail)
            | GatewayError::GatewayTimeout(detail)
            | GatewayError::Internal(detail)
            | GatewayError::Validation(detail) => detail.clone(),
            GatewayError::RateLimited {
                client,
                limit,
                reset_after_ms,
            } => format!("{} exceeded {} requests, resets in {}ms", client, limit, reset_after_ms),
        }
    }

    /// Only `Internal` is unexpected; everything else is ordinary traffic
    pub fn is_internal(&self) -> bool {
        matches!(self, GatewayError::Internal(_))
    }

    /// Render the uniform error envelope, optionally including internal detail
    pub fn to_response(&self, expose_details: bool) -> Response {
        let message = self.public_message();
        let mut error = json!({
            "code": self.error_code(),
            "message": message,
        });

        if expose_details {
            error["details"] = json!(self.detail());
        }

        let body = Json(json!({
            "status": "error",
            "message": message,
            "error": error,
        }));

        (self.status_code(), body).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response(false)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[test]
    fn test_status_mapping_is_deterministic() {
        let cases = [
            (GatewayError::Unauthorized("x".into()), 401, "UNAUTHORIZED"),
            (
                GatewayError::RateLimited {
                    client: "ip:1.2.3.4".into(),
                    limit: 1,
                    reset_after_ms: 10,
                },
                429,
                "RATE_LIMIT_EXCEEDED",
            ),
            (GatewayError::NotFound("x".into()), 404, "RESOURCE_NOT_FOUND"),
            (GatewayError::BadGateway("x".into()), 502, "BAD_GATEWAY"),
            (GatewayError::GatewayTimeout("x".into()), 504, "GATEWAY_TIMEOUT"),
            (GatewayError::Internal("x".into()), 500, "INTERNAL_ERROR"),
            (GatewayError::Validation("x".into()), 400, "VALIDATION_ERROR"),
        ];

        for (error, status, code) in cases {
            assert_eq!(error.status_code().as_u16(), status);
            assert_eq!(error.error_code(), code);
        }
    }

    #[tokio::test]
    async fn test_envelope_hides_detail_by_default() {
        let error = GatewayError::BadGateway("connection refused (os error 111)".into());
        let body = body_json(error.into_response()).await;

        assert_eq!(body["status"], "error");
        assert_eq!(body["error"]["code"], "BAD_GATEWAY");
        assert!(body["error"].get("details").is_none());
        assert!(!body.to_string().contains("os error"));
    }

    #[tokio::test]
    async fn test_unauthorized_envelope_shape() {
        let error = GatewayError::Unauthorized("missing bearer token".into());
        let body = body_json(error.to_response(false)).await;

        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Unauthorized");
        assert_eq!(body["error"]["message"], "Unauthorized");
    }

    #[tokio::test]
    async fn test_envelope_exposes_detail_in_development() {
        let error = GatewayError::Internal("lock poisoned".into());
        let body = body_json(error.to_response(true)).await;

        assert_eq!(body["error"]["details"], "lock poisoned");
    }
}
