use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use reqwest::RequestBuilder;
use tracing::info;
use uuid::Uuid;

use crate::{
    client::QueryServiceClient,
    cleanup,
    error::{JobError, Result},
    models::ConnectionCredentials,
};

pub struct Session {
    client: QueryServiceClient,
    credentials: ConnectionCredentials,
    token: String,
    expires_at: Option<DateTime<Utc>>,
    session_id: String,
    invalidated: AtomicBool,
}

impl Session {
    pub async fn login(client: QueryServiceClient, credentials: ConnectionCredentials) -> Result<Self> {
        let issued_at = Utc::now();
        let response = client.login(&credentials).await?;
        let expires_at = response.expiry(issued_at);
        let session = Self::from_token(client, credentials, response.access_token, expires_at);
        info!(
            session_id = %session.session_id,
            username = %session.credentials.username,
            database = %session.credentials.database,
            expires_at = ?session.expires_at,
            "Logged in to query service"
        );
        Ok(session)
    }

    pub fn from_token(
        client: QueryServiceClient,
        credentials: ConnectionCredentials,
        token: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            client,
            credentials,
            token,
            expires_at,
            session_id: Uuid::new_v4().to_string(),
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &QueryServiceClient {
        &self.client
    }

    pub fn credentials(&self) -> &ConnectionCredentials {
        &self.credentials
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| expires_at <= Utc::now())
            .unwrap_or(false)
    }

    pub fn requires_login(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst) || self.is_expired()
    }

    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if self.requires_login() {
            return Err(JobError::Unauthorized(
                "session token expired, log in again".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    pub async fn logout(&self, cleanup_timeout: Duration) {
        cleanup::release_now(self, cleanup_timeout).await;
        self.invalidate();
        info!(session_id = %self.session_id, "Logged out");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("credentials", &self.credentials)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("session_id", &self.session_id)
            .field("invalidated", &self.invalidated.load(Ordering::SeqCst))
            .finish()
    }
}
