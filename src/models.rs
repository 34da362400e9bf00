use std::{fmt, path::PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{error::ErrorKind, filter::QueryFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Export,
    Import,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::Import => "import",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCredentials {
    pub server: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ConnectionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCredentials")
            .field("server", &self.server)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Preview,
    Generate,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub credentials: ConnectionCredentials,
    pub filter: QueryFilter,
    pub mode: JobMode,
    pub force_continue: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Queried,
    Generating,
    Downloading,
    Done,
    Failed,
    Cancelled,
}

impl ProgressPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub fn from_server_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "queued" | "querying" | "query" | "counting" => Self::Queried,
            "completed" | "complete" | "done" | "ready" => Self::Done,
            "failed" | "error" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Generating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    pub percent: u8,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Rows {
        rows: Vec<Map<String, Value>>,
        matched_count: u64,
        total_count: u64,
    },
    LimitExceeded {
        total_count: u64,
        limit: u64,
        resume_token: Option<String>,
    },
    BinaryPayload {
        bytes: Bytes,
        suggested_filename: String,
        saved_path: Option<PathBuf>,
    },
    Cancelled,
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl JobResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::LimitExceeded { .. })
    }

    pub fn must_reauthenticate(&self) -> bool {
        matches!(
            self,
            Self::Failed {
                kind: ErrorKind::Unauthorized,
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct JobNotice {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub result: JobResult,
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub event: ProgressEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Previewing,
    PreviewReady,
    LimitCheck,
    AwaitingConfirmation,
    Generating,
    Downloading,
    Cancelled,
    Failed,
    ReauthRequired,
}

impl JobState {
    pub fn accepts_cancel(&self) -> bool {
        matches!(
            self,
            Self::Idle
                | Self::Previewing
                | Self::LimitCheck
                | Self::AwaitingConfirmation
                | Self::Generating
        )
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::ReauthRequired)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub server: &'a str,
    pub database: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl LoginResponse {
    pub fn expiry(&self, issued_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_at.or_else(|| {
            self.expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| issued_at + ChronoDuration::seconds(secs))
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewRequestBody<'a> {
    pub credentials: &'a ConnectionCredentials,
    pub filter: &'a QueryFilter,
    pub preview_only: bool,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequestBody<'a> {
    pub credentials: &'a ConnectionCredentials,
    pub filter: &'a QueryFilter,
    pub preview_only: bool,
    pub force_continue_despite_limit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewResponse {
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
    pub matched_count: u64,
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LimitExceededPayload {
    pub total_records: u64,
    pub limit: u64,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressSnapshot {
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub current: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl ProgressSnapshot {
    pub fn phase(&self) -> ProgressPhase {
        ProgressPhase::from_server_status(&self.status)
    }

    pub fn detail(&self) -> String {
        if let Some(message) = self.message.as_deref().filter(|m| !m.trim().is_empty()) {
            return message.to_string();
        }
        match (self.current, self.total) {
            (Some(current), Some(total)) => format!("{} {current}/{total} rows", self.status),
            _ => self.status.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupRequest<'a> {
    pub credentials: &'a ConnectionCredentials,
    pub session_id: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let creds = ConnectionCredentials {
            server: "db01".into(),
            database: "customs".into(),
            username: "analyst".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("analyst"));
    }

    #[test]
    fn server_statuses_map_to_phases() {
        assert_eq!(ProgressPhase::from_server_status("Querying"), ProgressPhase::Queried);
        assert_eq!(ProgressPhase::from_server_status("writing"), ProgressPhase::Generating);
        assert_eq!(ProgressPhase::from_server_status("completed"), ProgressPhase::Done);
        assert_eq!(ProgressPhase::from_server_status("canceled"), ProgressPhase::Cancelled);
    }

    #[test]
    fn login_expiry_prefers_absolute_timestamp() {
        let issued = Utc::now();
        let relative = LoginResponse {
            access_token: "t".into(),
            expires_at: None,
            expires_in: Some(60),
        };
        assert_eq!(relative.expiry(issued), Some(issued + ChronoDuration::seconds(60)));

        let absolute = LoginResponse {
            access_token: "t".into(),
            expires_at: Some(issued),
            expires_in: Some(60),
        };
        assert_eq!(absolute.expiry(issued), Some(issued));
    }

    #[test]
    fn limit_exceeded_is_not_terminal() {
        let pause = JobResult::LimitExceeded {
            total_count: 10,
            limit: 5,
            resume_token: None,
        };
        assert!(!pause.is_terminal());
        assert!(JobResult::Cancelled.is_terminal());
    }

    #[test]
    fn snapshot_detail_includes_row_counts() {
        let snapshot: ProgressSnapshot = serde_json::from_value(serde_json::json!({
            "percent": 40.0, "current": 400, "total": 1000, "status": "generating"
        }))
        .expect("decode snapshot");
        assert_eq!(snapshot.detail(), "generating 400/1000 rows");
        assert_eq!(snapshot.phase(), ProgressPhase::Generating);
    }
}
