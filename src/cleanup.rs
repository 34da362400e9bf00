use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time};
use tracing::{info, warn};

use crate::session::Session;

pub fn release(session: Arc<Session>, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        release_now(&session, timeout).await;
    })
}

pub async fn release_now(session: &Session, timeout: Duration) {
    match time::timeout(timeout, session.client().release(session)).await {
        Ok(Ok(())) => {
            info!(session_id = %session.session_id(), "Released server connection");
        }
        Ok(Err(err)) => {
            warn!(
                session_id = %session.session_id(),
                "Connection cleanup failed: {err}"
            );
        }
        Err(_) => {
            warn!(
                session_id = %session.session_id(),
                timeout_ms = timeout.as_millis() as u64,
                "Connection cleanup timed out"
            );
        }
    }
}
