use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{JobError, Result},
    models::{ProgressEvent, ProgressPhase, ProgressSnapshot, ProgressUpdate},
};

pub const CHANNEL_CAPACITY: usize = 256;

const QUERY_BAND_END: f64 = 10.0;
const GENERATION_BAND_END: f64 = 90.0;

#[derive(Debug, Default)]
struct ClampState {
    percent: u8,
    phase: Option<ProgressPhase>,
    finished: bool,
    last: Option<ProgressEvent>,
}

#[derive(Debug)]
struct ChannelInner {
    job_id: Uuid,
    tx: broadcast::Sender<ProgressUpdate>,
    state: Mutex<ClampState>,
}

/// Progress of one job, published in non-decreasing percent order.
///
/// Events that would move backwards (late poll responses, a slower source)
/// are clamped to the highest percent and phase seen so far. Nothing is
/// published after a terminal phase.
#[derive(Debug, Clone)]
pub struct ProgressChannel {
    inner: Arc<ChannelInner>,
}

impl ProgressChannel {
    pub fn new(job_id: Uuid) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self::attached(job_id, tx)
    }

    pub fn attached(job_id: Uuid, tx: broadcast::Sender<ProgressUpdate>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                job_id,
                tx,
                state: Mutex::new(ClampState::default()),
            }),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.inner.job_id
    }

    pub fn publish(
        &self,
        phase: ProgressPhase,
        percent: f64,
        detail: impl Into<String>,
    ) -> Option<ProgressEvent> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.finished {
            return None;
        }

        let phase = match state.phase {
            Some(previous) if phase_rank(previous) > phase_rank(phase) => previous,
            _ => phase,
        };
        let requested = if phase == ProgressPhase::Done {
            100
        } else {
            to_percent(percent)
        };
        let percent = requested.max(state.percent);

        let event = ProgressEvent {
            phase,
            percent,
            detail: detail.into(),
        };
        state.percent = percent;
        state.phase = Some(phase);
        state.finished = phase.is_terminal();
        state.last = Some(event.clone());

        debug!(
            job_id = %self.inner.job_id,
            phase = ?event.phase,
            percent = event.percent,
            detail = %event.detail,
            "Job progress update"
        );
        // Sent under the lock so every subscriber sees the clamped order.
        let _ = self.inner.tx.send(ProgressUpdate {
            job_id: self.inner.job_id,
            event: event.clone(),
        });
        Some(event)
    }

    pub fn report_queried(&self, detail: impl Into<String>) -> Option<ProgressEvent> {
        self.publish(ProgressPhase::Queried, QUERY_BAND_END, detail)
    }

    pub fn report_generation(
        &self,
        server_percent: f64,
        detail: impl Into<String>,
    ) -> Option<ProgressEvent> {
        let ratio = server_percent.clamp(0.0, 100.0) / 100.0;
        let overall = QUERY_BAND_END + ratio * (GENERATION_BAND_END - QUERY_BAND_END);
        self.publish(ProgressPhase::Generating, overall, detail)
    }

    pub fn report_transfer(&self, received: u64, total: Option<u64>) -> Option<ProgressEvent> {
        let overall = match total.filter(|t| *t > 0) {
            Some(total) => {
                let ratio = (received as f64 / total as f64).min(1.0);
                GENERATION_BAND_END + ratio * (100.0 - GENERATION_BAND_END)
            }
            None => GENERATION_BAND_END,
        };
        if let Some(last) = self.latest() {
            if last.phase == ProgressPhase::Downloading && last.percent >= to_percent(overall) {
                return None;
            }
        }
        let detail = match total {
            Some(total) => format!("received {received} of {total} bytes"),
            None => format!("received {received} bytes"),
        };
        self.publish(ProgressPhase::Downloading, overall, detail)
    }

    pub fn finish(&self, phase: ProgressPhase, detail: impl Into<String>) -> Option<ProgressEvent> {
        debug_assert!(phase.is_terminal());
        self.publish(phase, 0.0, detail)
    }

    pub fn latest(&self) -> Option<ProgressEvent> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last
            .clone()
    }

    pub fn is_finished(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
    }

    pub fn subscribe<F>(&self, mut on_event: F) -> Unsubscribe
    where
        F: FnMut(ProgressEvent) + Send + 'static,
    {
        let job_id = self.inner.job_id;
        subscribe_updates(&self.inner.tx, move |update| {
            if update.job_id == job_id {
                let terminal = update.event.phase.is_terminal();
                on_event(update.event);
                if terminal {
                    return Flow::Stop;
                }
            }
            Flow::Continue
        })
    }

    pub fn stream(&self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        let job_id = self.inner.job_id;
        BroadcastStream::new(self.inner.tx.subscribe()).filter_map(move |item| match item {
            Ok(update) if update.job_id == job_id => Some(update.event),
            _ => None,
        })
    }
}

fn phase_rank(phase: ProgressPhase) -> u8 {
    match phase {
        ProgressPhase::Queried => 0,
        ProgressPhase::Generating => 1,
        ProgressPhase::Downloading => 2,
        ProgressPhase::Done | ProgressPhase::Failed | ProgressPhase::Cancelled => 3,
    }
}

fn to_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, 100.0).floor() as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[must_use = "dropping the guard ends the subscription"]
#[derive(Debug)]
pub struct Unsubscribe {
    handle: Option<JoinHandle<()>>,
}

impl Unsubscribe {
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn subscribe_updates<F>(tx: &broadcast::Sender<ProgressUpdate>, mut on_update: F) -> Unsubscribe
where
    F: FnMut(ProgressUpdate) -> Flow + Send + 'static,
{
    let mut rx = tx.subscribe();
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    if on_update(update) == Flow::Stop {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    Unsubscribe {
        handle: Some(handle),
    }
}

#[async_trait]
pub trait ProgressSource: Send + Sync + 'static {
    async fn poll_progress(&self, operation_id: &str) -> Result<ProgressSnapshot>;
}

pub fn spawn_poller<S>(
    source: S,
    channel: ProgressChannel,
    operation_id: String,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()>
where
    S: ProgressSource,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if channel.is_finished() {
                break;
            }

            let polled = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                polled = source.poll_progress(&operation_id) => polled,
            };

            match polled {
                Ok(snapshot) => {
                    let detail = snapshot.detail();
                    match snapshot.phase() {
                        ProgressPhase::Queried => {
                            channel.report_queried(detail);
                        }
                        ProgressPhase::Generating | ProgressPhase::Downloading => {
                            channel.report_generation(snapshot.percent, detail);
                        }
                        ProgressPhase::Done => {
                            channel.report_generation(100.0, detail);
                            break;
                        }
                        phase @ (ProgressPhase::Failed | ProgressPhase::Cancelled) => {
                            info!(
                                job_id = %channel.job_id(),
                                operation_id = %operation_id,
                                ?phase,
                                "Server reported operation ended"
                            );
                            break;
                        }
                    }
                }
                Err(JobError::Unauthorized(_)) | Err(JobError::Cancelled) => break,
                Err(err) => {
                    debug!(operation_id = %operation_id, "Progress poll failed: {err}");
                }
            }
        }

        debug!(job_id = %channel.job_id(), operation_id = %operation_id, "Progress poller stopped");
    })
}
