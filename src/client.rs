use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{
    header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    Response, StatusCode,
};
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::{
    delivery::ResponseMetadata,
    error::{server_message_from_body, JobError, Result},
    filter::QueryFilter,
    models::{
        CleanupRequest, ConnectionCredentials, GenerateRequestBody, JobKind, LimitExceededPayload,
        LoginRequest, LoginResponse, PreviewRequestBody, PreviewResponse, ProgressSnapshot,
    },
    progress::{ProgressChannel, ProgressSource},
    session::Session,
};

pub const OPERATION_ID_HEADER: &str = "x-operation-id";

const MAX_PREALLOCATED_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct QueryServiceClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug)]
pub enum GenerateResponse {
    LimitExceeded(LimitExceededPayload),
    Payload(PayloadStream),
}

#[derive(Debug)]
pub struct PayloadStream {
    response: Response,
    metadata: ResponseMetadata,
    content_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GeneratedPayload {
    pub bytes: Bytes,
    pub metadata: ResponseMetadata,
}

impl QueryServiceClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_http(base_url, reqwest::Client::new())
    }

    pub fn with_http(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn login(&self, credentials: &ConnectionCredentials) -> Result<LoginResponse> {
        let url = self.url("/api/auth/login");
        debug!(url = %url, username = %credentials.username, "Authenticating");
        let body = LoginRequest {
            username: &credentials.username,
            password: &credentials.password,
            server: &credentials.server,
            database: &credentials.database,
        };
        let response = self.http.post(&url).json(&body).send().await?;
        let response = ensure_success(response).await?;
        response
            .json::<LoginResponse>()
            .await
            .map_err(|err| JobError::server(None, format!("Malformed login response: {err}")))
    }

    pub async fn preview(
        &self,
        session: &Session,
        kind: JobKind,
        filter: &QueryFilter,
        limit: usize,
    ) -> Result<PreviewResponse> {
        session.ensure_valid()?;
        let url = self.url(&format!("/api/{kind}/preview"));
        let body = PreviewRequestBody {
            credentials: session.credentials(),
            filter,
            preview_only: true,
            limit,
        };
        let response = session
            .authorize(self.http.post(&url).json(&body))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        response
            .json::<PreviewResponse>()
            .await
            .map_err(|err| JobError::server(None, format!("Malformed preview response: {err}")))
    }

    pub async fn generate(
        &self,
        session: &Session,
        kind: JobKind,
        filter: &QueryFilter,
        force_continue: bool,
        resume_token: Option<&str>,
    ) -> Result<GenerateResponse> {
        session.ensure_valid()?;
        let url = self.url(&format!("/api/{kind}/generate"));
        let body = GenerateRequestBody {
            credentials: session.credentials(),
            filter,
            preview_only: false,
            force_continue_despite_limit: force_continue,
            resume_token,
        };
        let response = session
            .authorize(self.http.post(&url).json(&body))
            .send()
            .await?;

        if response.status() == StatusCode::PAYLOAD_TOO_LARGE {
            let text = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<Value>(&text) {
                Ok(value) => decode_json_outcome(value).map(GenerateResponse::LimitExceeded),
                Err(_) => Err(JobError::server(
                    Some(StatusCode::PAYLOAD_TOO_LARGE.as_u16()),
                    server_message_from_body(StatusCode::PAYLOAD_TOO_LARGE.as_u16(), &text),
                )),
            };
        }

        let response = ensure_success(response).await?;
        if is_json(response.headers()) {
            let value = response.json::<Value>().await.map_err(|err| {
                JobError::server(None, format!("Malformed generation response: {err}"))
            })?;
            return decode_json_outcome(value).map(GenerateResponse::LimitExceeded);
        }

        let metadata = metadata_from_headers(response.headers());
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        debug!(
            operation_id = ?metadata.operation_id,
            content_length = ?content_length,
            "Generation response headers received"
        );
        Ok(GenerateResponse::Payload(PayloadStream {
            response,
            metadata,
            content_length,
        }))
    }

    pub async fn progress(
        &self,
        session: &Session,
        kind: JobKind,
        operation_id: &str,
    ) -> Result<ProgressSnapshot> {
        session.ensure_valid()?;
        let url = self.url(&format!("/api/{kind}/progress/{operation_id}"));
        let response = session.authorize(self.http.get(&url)).send().await?;
        let response = ensure_success(response).await?;
        response
            .json::<ProgressSnapshot>()
            .await
            .map_err(|err| JobError::server(None, format!("Malformed progress response: {err}")))
    }

    pub async fn release(&self, session: &Session) -> Result<()> {
        let url = self.url("/api/connection/cleanup");
        let body = CleanupRequest {
            credentials: session.credentials(),
            session_id: session.session_id(),
        };
        let response = session
            .authorize(self.http.post(&url).json(&body))
            .send()
            .await?;
        ensure_success(response).await.map(|_| ())
    }
}

impl PayloadStream {
    pub fn metadata(&self) -> &ResponseMetadata {
        &self.metadata
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub async fn collect(self, progress: &ProgressChannel) -> Result<GeneratedPayload> {
        let total = self.content_length;
        let capacity = total.unwrap_or(0).min(MAX_PREALLOCATED_BYTES) as usize;
        let mut buffer = BytesMut::with_capacity(capacity);
        let mut received = 0u64;
        let mut stream = self.response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);
            progress.report_transfer(received, total);
        }
        if received == 0 {
            progress.report_transfer(0, total);
        }

        Ok(GeneratedPayload {
            bytes: buffer.freeze(),
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OperationProgress {
    pub session: Arc<Session>,
    pub kind: JobKind,
}

#[async_trait]
impl ProgressSource for OperationProgress {
    async fn poll_progress(&self, operation_id: &str) -> Result<ProgressSnapshot> {
        self.session
            .client()
            .progress(&self.session, self.kind, operation_id)
            .await
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = server_message_from_body(status.as_u16(), &body);
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(JobError::Unauthorized(message));
    }
    Err(JobError::server(Some(status.as_u16()), message))
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("json"))
        .unwrap_or(false)
}

fn metadata_from_headers(headers: &HeaderMap) -> ResponseMetadata {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    ResponseMetadata {
        content_disposition: text(CONTENT_DISPOSITION.as_str()),
        content_type: text(CONTENT_TYPE.as_str()),
        operation_id: text(OPERATION_ID_HEADER),
    }
}

fn decode_json_outcome(value: Value) -> Result<LimitExceededPayload> {
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    if status == "limit_exceeded" {
        return serde_json::from_value::<LimitExceededPayload>(value).map_err(|err| {
            JobError::server(None, format!("Malformed limit notice from server: {err}"))
        });
    }

    let message = server_message_from_body(200, &value.to_string());
    Err(JobError::server(None, message))
}
