use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("database error: {0}")]
    Database(String),

    #[error("presence store error: {0}")]
    Presence(String),
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<crate::services::presence::PresenceError> for AppError {
    fn from(e: crate::services::presence::PresenceError) -> Self {
        AppError::Presence(e.to_string())
    }
}

impl AppError {
    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Unauthorized => 401,
            AppError::Presence(_) => 503,
            AppError::Config(_) | AppError::Database(_) => 500,
        }
    }

    /// Message safe to hand to a client; storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Presence(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        if AppError::status_code(self) >= 500 {
            tracing::error!(error = %self, "request failed");
        }
        HttpResponse::build(ResponseError::status_code(self))
            .json(serde_json::json!({ "error": self.public_message() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_not_leaked_to_clients() {
        let err = AppError::Database("relation \"sessions\" does not exist".into());
        assert_eq!(err.public_message(), "internal error");
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn client_errors_keep_their_message() {
        let err = AppError::Unauthorized;
        assert_eq!(err.public_message(), "unauthorized");
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn presence_outage_is_unavailable() {
        let err = AppError::Presence("connection refused".into());
        assert_eq!(err.public_message(), "internal error");
        assert_eq!(ResponseError::status_code(&err), StatusCode::SERVICE_UNAVAILABLE);
    }
}
