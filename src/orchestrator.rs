use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::sync::{broadcast, oneshot, watch};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cleanup,
    client::{GenerateResponse, GeneratedPayload, OperationProgress},
    config::Config,
    delivery::{fallback_filename, resolve_filename, DownloadDelivery, FileSink},
    error::{JobError, Result},
    filter::QueryFilter,
    gate::{self, GateDecision, RowCountGate},
    models::{
        JobKind, JobMode, JobNotice, JobRequest, JobResult, JobState, LimitExceededPayload,
        ProgressPhase, ProgressUpdate,
    },
    progress::{spawn_poller, subscribe_updates, Flow, ProgressChannel, Unsubscribe, CHANNEL_CAPACITY},
    request::CancellableRequest,
    session::Session,
};

const RESULT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub row_limit: u64,
    pub preview_limit: usize,
    pub preview_timeout: Duration,
    pub generate_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub poll_interval: Duration,
    pub release_delay: Duration,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            row_limit: config.row_limit,
            preview_limit: config.preview_limit,
            preview_timeout: config.preview_timeout,
            generate_timeout: config.generate_timeout,
            cleanup_timeout: config.cleanup_timeout,
            poll_interval: config.poll_interval,
            release_delay: config.release_delay,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Continue,
    Cancel,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct JobShared {
    id: Uuid,
    mode: JobMode,
    cancel: CancellationToken,
    started: AtomicBool,
    state: Mutex<JobState>,
    state_tx: watch::Sender<JobState>,
    result_tx: watch::Sender<Option<JobResult>>,
    settled_tx: watch::Sender<bool>,
    confirm: Mutex<Option<oneshot::Sender<Decision>>>,
}

impl JobShared {
    fn new(mode: JobMode) -> Arc<Self> {
        let (state_tx, _) = watch::channel(JobState::Idle);
        let (result_tx, _) = watch::channel(None);
        let (settled_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            mode,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            state: Mutex::new(JobState::Idle),
            state_tx,
            result_tx,
            settled_tx,
            confirm: Mutex::new(None),
        })
    }

    fn handle(&self, kind: JobKind) -> JobHandle {
        JobHandle {
            id: self.id,
            kind,
            state_rx: self.state_tx.subscribe(),
            result_rx: self.result_tx.subscribe(),
            settled_rx: self.settled_tx.subscribe(),
        }
    }

    fn state(&self) -> JobState {
        *lock(&self.state)
    }

    fn advance(&self, next: JobState) -> Result<()> {
        let mut state = lock(&self.state);
        if self.cancel.is_cancelled() || state.is_final() {
            return Err(JobError::Cancelled);
        }
        *state = next;
        self.started.store(true, Ordering::SeqCst);
        self.state_tx.send_replace(next);
        Ok(())
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn settle(&self, last: JobState) {
        let mut state = lock(&self.state);
        if state.is_final() {
            return;
        }
        *state = last;
        self.state_tx.send_replace(last);
    }

    fn request_cancel(&self) -> bool {
        let state = lock(&self.state);
        if !state.accepts_cancel() || self.cancel.is_cancelled() || self.result_tx.borrow().is_some()
        {
            return false;
        }
        self.cancel.cancel();
        true
    }

    // A delivered download returns the job to Idle.
    fn finish_download(&self) {
        let mut state = lock(&self.state);
        if *state == JobState::Downloading {
            *state = JobState::Idle;
            self.state_tx.send_replace(JobState::Idle);
        }
    }

    fn decide(&self, decision: Decision) -> bool {
        let state = lock(&self.state);
        if *state != JobState::AwaitingConfirmation {
            return false;
        }
        match lock(&self.confirm).take() {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    fn complete(&self, result: JobResult) -> bool {
        self.result_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }
}

#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    kind: JobKind,
    state_rx: watch::Receiver<JobState>,
    result_rx: watch::Receiver<Option<JobResult>>,
    settled_rx: watch::Receiver<bool>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        *self.state_rx.borrow()
    }

    pub fn result(&self) -> Option<JobResult> {
        self.result_rx.borrow().clone()
    }

    pub async fn wait(&self) -> JobResult {
        let mut rx = self.result_rx.clone();
        let waited = rx.wait_for(Option::is_some).await.map(|r| (*r).clone());
        match waited {
            Ok(Some(result)) => result,
            _ => rx.borrow().clone().unwrap_or(JobResult::Cancelled),
        }
    }

    pub async fn settled(&self) {
        let mut rx = self.settled_rx.clone();
        let _ = rx.wait_for(|settled| *settled).await;
    }

    pub async fn reached(&self, target: JobState) -> bool {
        let mut rx = self.state_rx.clone();
        let mut settled = self.settled_rx.clone();
        tokio::select! {
            reached = rx.wait_for(|s| *s == target) => reached.is_ok(),
            _ = settled.wait_for(|s| *s) => *self.state_rx.borrow() == target,
        }
    }
}

struct Inner {
    kind: JobKind,
    session: Arc<Session>,
    settings: OrchestratorSettings,
    gate: RowCountGate,
    sink: Arc<dyn FileSink>,
    results_tx: broadcast::Sender<JobNotice>,
    progress_tx: broadcast::Sender<ProgressUpdate>,
    active: Mutex<Option<Arc<JobShared>>>,
    known_total: Mutex<Option<(QueryFilter, u64)>>,
}

/// Runs preview and generation jobs of one kind for one session.
///
/// At most one job is active at a time. Starting a job cancels the active
/// one and waits for it to release the connection before touching the
/// server. Every job that started ends with a connection cleanup, whatever
/// its outcome. Must be used inside a tokio runtime.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        kind: JobKind,
        session: Arc<Session>,
        settings: OrchestratorSettings,
        sink: Arc<dyn FileSink>,
    ) -> Self {
        let (results_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let (progress_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                kind,
                session,
                gate: RowCountGate::new(settings.row_limit),
                settings,
                sink,
                results_tx,
                progress_tx,
                active: Mutex::new(None),
                known_total: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.inner.kind
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn gate(&self) -> RowCountGate {
        self.inner.gate
    }

    pub fn state(&self) -> JobState {
        lock(&self.inner.active)
            .as_ref()
            .map(|job| job.state())
            .unwrap_or(JobState::Idle)
    }

    pub fn active_job(&self) -> Option<Uuid> {
        lock(&self.inner.active).as_ref().map(|job| job.id)
    }

    pub fn known_total(&self, filter: &QueryFilter) -> Option<u64> {
        self.inner.known_total(&filter.normalized())
    }

    pub fn start_preview(&self, filter: QueryFilter) -> JobHandle {
        self.submit(self.request(filter, JobMode::Preview, false))
    }

    pub fn start_generation(&self, filter: QueryFilter, force_continue: bool) -> JobHandle {
        self.submit(self.request(filter, JobMode::Generate, force_continue))
    }

    pub fn submit(&self, request: JobRequest) -> JobHandle {
        let job = JobShared::new(request.mode);
        let handle = job.handle(self.inner.kind);

        let previous = lock(&self.inner.active).replace(job.clone());
        let previous_settled = previous.map(|previous| {
            if previous.request_cancel() {
                info!(
                    job_id = %previous.id,
                    superseded_by = %job.id,
                    kind = %self.inner.kind,
                    "Cancelling active job in favour of a new request"
                );
            }
            previous.settled_tx.subscribe()
        });

        info!(
            job_id = %job.id,
            kind = %self.inner.kind,
            mode = ?request.mode,
            force_continue = request.force_continue,
            "Job started"
        );
        tokio::spawn(run_job(self.inner.clone(), job, request, previous_settled));
        handle
    }

    fn request(&self, filter: QueryFilter, mode: JobMode, force_continue: bool) -> JobRequest {
        JobRequest {
            credentials: self.inner.session.credentials().clone(),
            filter,
            mode,
            force_continue,
        }
    }

    pub fn cancel(&self) -> bool {
        let active = lock(&self.inner.active).clone();
        match active {
            Some(job) => {
                let cancelled = job.request_cancel();
                if cancelled {
                    info!(job_id = %job.id, kind = %self.inner.kind, "Job cancellation requested");
                }
                cancelled
            }
            None => false,
        }
    }

    pub fn confirm_continue(&self) -> bool {
        self.decide(Decision::Continue)
    }

    pub fn cancel_awaiting_confirmation(&self) -> bool {
        self.decide(Decision::Cancel)
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<JobNotice> {
        self.inner.results_tx.subscribe()
    }

    pub fn subscribe_progress<F>(&self, mut on_update: F) -> Unsubscribe
    where
        F: FnMut(ProgressUpdate) + Send + 'static,
    {
        subscribe_updates(&self.inner.progress_tx, move |update| {
            on_update(update);
            Flow::Continue
        })
    }

    pub fn progress_stream(&self) -> impl Stream<Item = ProgressUpdate> + Send + 'static {
        BroadcastStream::new(self.inner.progress_tx.subscribe()).filter_map(|item| item.ok())
    }

    fn decide(&self, decision: Decision) -> bool {
        let active = lock(&self.inner.active).clone();
        let Some(job) = active else {
            return false;
        };
        let decided = job.decide(decision);
        if decided {
            info!(job_id = %job.id, ?decision, "Row limit decision received");
        }
        decided
    }
}

enum Generated {
    Payload(GeneratedPayload),
    LimitExceeded(LimitExceededPayload),
}

async fn run_job(
    inner: Arc<Inner>,
    job: Arc<JobShared>,
    request: JobRequest,
    previous: Option<watch::Receiver<bool>>,
) {
    if let Some(mut previous) = previous {
        let _ = previous.wait_for(|settled| *settled).await;
    }

    let progress = ProgressChannel::attached(job.id, inner.progress_tx.clone());
    let filter = request.filter.normalized();
    let force_continue = request.force_continue;
    let checked = if request.credentials == *inner.session.credentials() {
        filter.validate()
    } else {
        Err(JobError::Validation(
            "The request was prepared for a different connection.".to_string(),
        ))
    };

    let result = match checked {
        Err(err) => inner.fail(&job, &progress, err),
        Ok(()) => {
            let outcome = match job.mode {
                JobMode::Preview => inner.run_preview(&job, &progress, &filter).await,
                JobMode::Generate => {
                    inner
                        .run_generation(&job, &progress, &filter, force_continue)
                        .await
                }
            };
            outcome.unwrap_or_else(|err| inner.fail(&job, &progress, err))
        }
    };

    let cleanup = job
        .started()
        .then(|| cleanup::release(inner.session.clone(), inner.settings.cleanup_timeout));
    inner.publish_result(&job, result);
    if let Some(cleanup) = cleanup {
        if let Err(err) = cleanup.await {
            warn!(job_id = %job.id, "Cleanup task failed: {err}");
        }
    }
    inner.retire(&job);
}

impl Inner {
    fn known_total(&self, filter: &QueryFilter) -> Option<u64> {
        lock(&self.known_total)
            .as_ref()
            .filter(|(known, _)| known == filter)
            .map(|(_, total)| *total)
    }

    fn remember_total(&self, filter: &QueryFilter, total: u64) {
        *lock(&self.known_total) = Some((filter.clone(), total));
    }

    async fn run_preview(
        &self,
        job: &JobShared,
        progress: &ProgressChannel,
        filter: &QueryFilter,
    ) -> Result<JobResult> {
        job.advance(JobState::Previewing)?;
        let request = CancellableRequest::new(self.settings.preview_timeout, job.cancel.clone());
        let session = &self.session;
        let kind = self.kind;
        let limit = self.settings.preview_limit;
        let response = request
            .run(|| async move { session.client().preview(session, kind, filter, limit).await })
            .await?;

        progress.report_queried(format!(
            "{} of {} rows matched",
            response.matched_count, response.total_count
        ));
        self.remember_total(filter, response.total_count);
        job.advance(JobState::PreviewReady)?;
        progress.finish(ProgressPhase::Done, "preview ready");
        info!(
            job_id = %job.id,
            kind = %self.kind,
            rows = response.rows.len(),
            matched = response.matched_count,
            total = response.total_count,
            "Preview ready"
        );

        Ok(JobResult::Rows {
            rows: response.rows,
            matched_count: response.matched_count,
            total_count: response.total_count,
        })
    }

    async fn run_generation(
        &self,
        job: &JobShared,
        progress: &ProgressChannel,
        filter: &QueryFilter,
        force_continue: bool,
    ) -> Result<JobResult> {
        let mut force = force_continue;
        let mut resume_token: Option<String> = None;

        if !force {
            if let Some(total) = self.known_total(filter) {
                job.advance(JobState::LimitCheck)?;
                match self.gate.evaluate(total) {
                    GateDecision::Proceed => {}
                    GateDecision::WarnAndConfirm { excess } => {
                        debug!(job_id = %job.id, total, excess, "Known total exceeds row limit");
                        self.await_confirmation(job, total, self.gate.limit(), None)
                            .await?;
                        force = true;
                    }
                    GateDecision::Blocked => return Err(blocked_error()),
                }
            }
        }

        let payload = loop {
            job.advance(JobState::Generating)?;
            match self
                .generate_once(job, progress, filter, force, resume_token.as_deref())
                .await?
            {
                Generated::Payload(payload) => break payload,
                Generated::LimitExceeded(notice) => {
                    if force {
                        return Err(JobError::server(
                            None,
                            notice.message.unwrap_or_else(|| {
                                "The server refused the export despite the row limit override."
                                    .to_string()
                            }),
                        ));
                    }
                    job.advance(JobState::LimitCheck)?;
                    match gate::evaluate(notice.total_records, notice.limit) {
                        GateDecision::WarnAndConfirm { excess } => {
                            debug!(
                                job_id = %job.id,
                                total = notice.total_records,
                                limit = notice.limit,
                                excess,
                                "Server reported row limit exceeded"
                            );
                        }
                        GateDecision::Proceed => {
                            return Err(JobError::server(
                                None,
                                format!(
                                    "The server reported {} rows against a limit of {}.",
                                    notice.total_records, notice.limit
                                ),
                            ));
                        }
                        GateDecision::Blocked => return Err(blocked_error()),
                    }
                    self.remember_total(filter, notice.total_records);
                    self.await_confirmation(
                        job,
                        notice.total_records,
                        notice.limit,
                        notice.operation_id.clone(),
                    )
                    .await?;
                    force = true;
                    resume_token = notice.operation_id;
                }
            }
        };

        job.advance(JobState::Downloading)?;
        let delivery = DownloadDelivery::new(self.sink.clone(), self.settings.release_delay);
        let suggested = fallback_filename(self.kind, filter);
        let delivered = delivery
            .deliver(payload.bytes.clone(), &suggested, &payload.metadata)
            .await?;
        let (filename, saved_path) = match delivered {
            Some(delivered) => (delivered.filename, Some(delivered.path)),
            None => (resolve_filename(&payload.metadata, &suggested), None),
        };
        progress.finish(ProgressPhase::Done, format!("saved {filename}"));
        info!(
            job_id = %job.id,
            kind = %self.kind,
            file = %filename,
            size_bytes = payload.bytes.len(),
            truncated = force,
            "Generation completed"
        );

        Ok(JobResult::BinaryPayload {
            bytes: payload.bytes,
            suggested_filename: filename,
            saved_path,
        })
    }

    async fn generate_once(
        &self,
        job: &JobShared,
        progress: &ProgressChannel,
        filter: &QueryFilter,
        force: bool,
        resume_token: Option<&str>,
    ) -> Result<Generated> {
        let request = CancellableRequest::new(self.settings.generate_timeout, job.cancel.clone());
        let poll_stop = job.cancel.child_token();
        let session = &self.session;
        let kind = self.kind;
        let interval = self.settings.poll_interval;
        let poll_stop_ref = &poll_stop;

        progress.report_generation(0.0, "generating spreadsheet");
        let outcome = request
            .run(|| async move {
                match session
                    .client()
                    .generate(session, kind, filter, force, resume_token)
                    .await?
                {
                    GenerateResponse::LimitExceeded(notice) => Ok(Generated::LimitExceeded(notice)),
                    GenerateResponse::Payload(stream) => {
                        match stream.metadata().operation_id.clone() {
                            Some(operation_id) => {
                                debug!(job_id = %job.id, operation_id = %operation_id, "Polling server progress");
                                spawn_poller(
                                    OperationProgress {
                                        session: session.clone(),
                                        kind,
                                    },
                                    progress.clone(),
                                    operation_id,
                                    interval,
                                    poll_stop_ref.clone(),
                                );
                            }
                            None => {
                                debug!(job_id = %job.id, "No operation id, using transfer progress only");
                            }
                        }
                        stream.collect(progress).await.map(Generated::Payload)
                    }
                }
            })
            .await;
        poll_stop.cancel();
        outcome
    }

    async fn await_confirmation(
        &self,
        job: &JobShared,
        total_count: u64,
        limit: u64,
        resume_token: Option<String>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&job.confirm) = Some(tx);
        job.advance(JobState::AwaitingConfirmation)?;
        info!(
            job_id = %job.id,
            kind = %self.kind,
            total_count,
            limit,
            "Waiting for confirmation to export a truncated file"
        );
        self.notify(
            job.id,
            JobResult::LimitExceeded {
                total_count,
                limit,
                resume_token,
            },
        );

        let decision = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => Decision::Cancel,
            decision = rx => decision.unwrap_or(Decision::Cancel),
        };
        lock(&job.confirm).take();

        match decision {
            Decision::Continue => Ok(()),
            Decision::Cancel => Err(JobError::Cancelled),
        }
    }

    fn fail(&self, job: &JobShared, progress: &ProgressChannel, err: JobError) -> JobResult {
        let err = match err {
            JobError::Unauthorized(_) => err,
            _ if job.cancel.is_cancelled() => JobError::Cancelled,
            _ => err,
        };

        match &err {
            JobError::Cancelled => {
                job.settle(JobState::Cancelled);
                progress.finish(ProgressPhase::Cancelled, "cancelled");
                info!(job_id = %job.id, kind = %self.kind, "Job cancelled");
                return JobResult::Cancelled;
            }
            JobError::TimedOut(_) => {
                job.settle(JobState::Cancelled);
                progress.finish(ProgressPhase::Cancelled, "timed out");
                warn!(job_id = %job.id, kind = %self.kind, "Job timed out: {err}");
            }
            JobError::Unauthorized(_) => {
                self.session.invalidate();
                job.settle(JobState::ReauthRequired);
                progress.finish(ProgressPhase::Failed, "session expired");
                warn!(job_id = %job.id, kind = %self.kind, "Job stopped, login required: {err}");
            }
            JobError::Validation(_) => {
                job.settle(JobState::Failed);
                progress.finish(ProgressPhase::Failed, "invalid filter");
                info!(job_id = %job.id, kind = %self.kind, "Job rejected: {err}");
            }
            JobError::Server { .. } | JobError::Delivery(_) => {
                job.settle(JobState::Failed);
                progress.finish(ProgressPhase::Failed, "failed");
                warn!(job_id = %job.id, kind = %self.kind, "Job failed: {err}");
            }
        }

        JobResult::Failed {
            kind: err.kind(),
            message: err.user_message(),
        }
    }

    fn notify(&self, job_id: Uuid, result: JobResult) {
        let _ = self.results_tx.send(JobNotice {
            job_id,
            kind: self.kind,
            result,
        });
    }

    fn publish_result(&self, job: &JobShared, result: JobResult) {
        if job.complete(result.clone()) {
            self.notify(job.id, result);
        }
    }

    fn retire(&self, job: &JobShared) {
        {
            let mut active = lock(&self.active);
            if active.as_ref().map(|a| a.id) == Some(job.id) {
                *active = None;
            }
        }
        job.finish_download();
        job.settled_tx.send_replace(true);
        debug!(job_id = %job.id, "Job settled");
    }
}

fn blocked_error() -> JobError {
    JobError::Validation("The export target cannot hold any rows; check the row limit.".to_string())
}
