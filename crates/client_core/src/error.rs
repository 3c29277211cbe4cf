use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Failures surfaced by the synchronization core.
///
/// Cloneable so that a single in-flight refresh can hand the same outcome to
/// every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("session expired; sign in again")]
    SessionExpired,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("chat error: {0}")]
    Chat(String),
    #[error("server returned {status}: {message}")]
    Http {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("local storage error: {0}")]
    Storage(String),
}

impl ClientError {
    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }

    /// Builds the error for a non-2xx response, preferring the server's
    /// `ApiError` code and message over the raw body.
    pub fn from_status(status: reqwest::StatusCode, body: &[u8]) -> Self {
        let (code, message) = match serde_json::from_slice::<ApiError>(body) {
            Ok(api) => (api.code, api.message),
            Err(_) => (
                ErrorCode::Unknown,
                String::from_utf8_lossy(body).trim().to_string(),
            ),
        };
        if status == reqwest::StatusCode::NOT_FOUND {
            let what = if message.is_empty() {
                "resource".to_string()
            } else {
                message
            };
            return Self::NotFound(what);
        }
        Self::Http {
            status: status.as_u16(),
            code,
            message,
        }
    }

    /// Whether a failed `/auth/refresh` call means the refresh token itself
    /// is no longer accepted, whatever status the server chose for it.
    pub fn rejects_refresh_token(&self) -> bool {
        match self {
            Self::SessionExpired => true,
            Self::Http { status, code, .. } => {
                *status == 401
                    || *status == 403
                    || matches!(code, ErrorCode::TokenExpired | ErrorCode::Unauthorized)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {err}"))
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}
