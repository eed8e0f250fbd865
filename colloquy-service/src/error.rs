use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kinds that are visible on the wire.
///
/// Each kind maps to an optional WebSocket close code (terminal) and an
/// optional in-band error envelope code (non-terminal). A kind with a close
/// code ends the transport; a kind with only an envelope code is reported
/// in-band and the connection stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthenticationRequired,
    InvalidMessageFormat,
    RateLimitExceeded,
    ConnectionLimitExceeded,
    UpstreamUnavailable,
    UpstreamThrottled,
    ServerError,
    NormalShutdown,
}

impl ErrorKind {
    /// WebSocket close code for this kind, if it terminates the transport.
    pub fn close_code(self) -> Option<u16> {
        match self {
            ErrorKind::AuthenticationRequired => Some(1008),
            ErrorKind::ConnectionLimitExceeded => Some(1008),
            ErrorKind::ServerError => Some(1011),
            ErrorKind::NormalShutdown => Some(1000),
            ErrorKind::InvalidMessageFormat
            | ErrorKind::RateLimitExceeded
            | ErrorKind::UpstreamUnavailable
            | ErrorKind::UpstreamThrottled => None,
        }
    }

    /// Numeric code carried in an `error` envelope for this kind.
    pub fn envelope_code(self) -> Option<u16> {
        match self {
            ErrorKind::AuthenticationRequired => Some(4401),
            ErrorKind::InvalidMessageFormat => Some(4001),
            ErrorKind::RateLimitExceeded => Some(4002),
            ErrorKind::ConnectionLimitExceeded => Some(4003),
            ErrorKind::UpstreamUnavailable => Some(5011),
            ErrorKind::UpstreamThrottled => Some(5012),
            ErrorKind::ServerError => Some(5000),
            ErrorKind::NormalShutdown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AuthenticationRequired => "authentication_required",
            ErrorKind::InvalidMessageFormat => "invalid_message_format",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::ConnectionLimitExceeded => "connection_limit_exceeded",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::UpstreamThrottled => "upstream_throttled",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NormalShutdown => "normal_shutdown",
        }
    }
}

/// KV store adapter errors.
///
/// `Unavailable` covers connection failures and timeouts; `TypeError` means
/// the key holds a value of the wrong type for the requested operation.
#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("kv store unavailable: {message}")]
    Unavailable { message: String },

    #[error("wrong value type at key {key}")]
    TypeError { key: String },
}

impl KvError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        KvError::Unavailable {
            message: message.into(),
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Token validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("token is malformed")]
    TokenMalformed,

    #[error("token has expired")]
    TokenExpired,

    #[error("token signature is invalid")]
    TokenInvalidSignature,

    #[error("subject does not resolve to an active user")]
    UserInactive,
}

impl AuthError {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthError::TokenMalformed => "token_malformed",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenInvalidSignature => "token_invalid_signature",
            AuthError::UserInactive => "user_inactive",
        }
    }
}

/// Upstream LLM provider errors.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("upstream provider unavailable: {message}")]
    Unavailable { message: String },

    #[error("upstream provider throttled")]
    Throttled { retry_after_secs: Option<u64> },

    #[error("invalid response from provider: {message}")]
    InvalidResponse { message: String },
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Throttled { .. } => ErrorKind::UpstreamThrottled,
            ProviderError::Unavailable { .. } | ProviderError::InvalidResponse { .. } => {
                ErrorKind::UpstreamUnavailable
            }
        }
    }
}

/// Main service error type
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// API error response body for the HTTP surface
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Auth(_) => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Kv(_) | ServiceError::Provider(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Config { .. } | ServiceError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::Kv(KvError::Unavailable { .. }) => "kv_unavailable",
            ServiceError::Kv(KvError::TypeError { .. }) => "kv_type_error",
            ServiceError::Auth(e) => e.as_str(),
            ServiceError::Provider(e) => e.kind().as_str(),
            ServiceError::Config { .. } => "config_error",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            message: self.to_string(),
            code: Some(self.error_code().to_string()),
        };

        (status, Json(response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_table() {
        assert_eq!(ErrorKind::AuthenticationRequired.close_code(), Some(1008));
        assert_eq!(ErrorKind::InvalidMessageFormat.close_code(), None);
        assert_eq!(ErrorKind::RateLimitExceeded.close_code(), None);
        assert_eq!(ErrorKind::ConnectionLimitExceeded.close_code(), Some(1008));
        assert_eq!(ErrorKind::UpstreamUnavailable.close_code(), None);
        assert_eq!(ErrorKind::UpstreamThrottled.close_code(), None);
        assert_eq!(ErrorKind::ServerError.close_code(), Some(1011));
        assert_eq!(ErrorKind::NormalShutdown.close_code(), Some(1000));
    }

    #[test]
    fn test_envelope_code_table() {
        assert_eq!(
            ErrorKind::AuthenticationRequired.envelope_code(),
            Some(4401)
        );
        assert_eq!(ErrorKind::InvalidMessageFormat.envelope_code(), Some(4001));
        assert_eq!(ErrorKind::RateLimitExceeded.envelope_code(), Some(4002));
        assert_eq!(
            ErrorKind::ConnectionLimitExceeded.envelope_code(),
            Some(4003)
        );
        assert_eq!(ErrorKind::UpstreamUnavailable.envelope_code(), Some(5011));
        assert_eq!(ErrorKind::UpstreamThrottled.envelope_code(), Some(5012));
        assert_eq!(ErrorKind::ServerError.envelope_code(), Some(5000));
        assert_eq!(ErrorKind::NormalShutdown.envelope_code(), None);
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RateLimitExceeded).unwrap();
        assert_eq!(json, r#""rate_limit_exceeded""#);

        let kind: ErrorKind = serde_json::from_str(r#""connection_limit_exceeded""#).unwrap();
        assert_eq!(kind, ErrorKind::ConnectionLimitExceeded);
    }

    #[test]
    fn test_provider_error_kinds() {
        let unavailable = ProviderError::Unavailable {
            message: "connect refused".to_string(),
        };
        assert_eq!(unavailable.kind(), ErrorKind::UpstreamUnavailable);

        let throttled = ProviderError::Throttled {
            retry_after_secs: Some(30),
        };
        assert_eq!(throttled.kind(), ErrorKind::UpstreamThrottled);
    }
}
