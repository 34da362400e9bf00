use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    Cancelled,
    TimedOut,
    ServerError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Unauthorized => "unauthorized",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::ServerError => "server_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("invalid filter: {0}")]
    Validation(String),
    #[error("session is no longer valid: {0}")]
    Unauthorized(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("{message}")]
    Server {
        status: Option<u16>,
        message: String,
    },
    #[error("failed to save download: {0}")]
    Delivery(String),
}

pub type Result<T> = std::result::Result<T, JobError>;

pub const GENERIC_SERVER_MESSAGE: &str = "The export service could not complete the request.";

impl JobError {
    pub fn server(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::Server { .. } | Self::Delivery(_) => ErrorKind::ServerError,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Unauthorized(_) => "Your session has expired. Please sign in again.".to_string(),
            Self::Cancelled => "The operation was cancelled.".to_string(),
            Self::TimedOut(_) => {
                "The operation took too long and was stopped. Try a narrower filter.".to_string()
            }
            Self::Server { message, .. } if !message.trim().is_empty() => message.clone(),
            Self::Server { .. } => GENERIC_SERVER_MESSAGE.to_string(),
            Self::Delivery(message) => format!("The file could not be saved: {message}"),
        }
    }
}

impl From<reqwest::Error> for JobError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::TimedOut(Duration::ZERO);
        }
        let status = err.status().map(|s| s.as_u16());
        if matches!(status, Some(401) | Some(403)) {
            return Self::Unauthorized(err.to_string());
        }
        Self::server(status, err.to_string())
    }
}

pub fn server_message_from_body(status: u16, body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let candidates = [
            value.pointer("/error/message"),
            value.get("error"),
            value.get("message"),
            value.get("detail"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(text) = candidate.as_str() {
                if !text.trim().is_empty() {
                    return text.to_string();
                }
            }
        }
    } else if !trimmed.is_empty() && trimmed.len() <= 512 && !trimmed.starts_with('<') {
        return trimmed.to_string();
    }

    format!("{GENERIC_SERVER_MESSAGE} (HTTP {status})")
}
