//! Client-side orchestration of large trade-data spreadsheet jobs.

pub mod cleanup;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod filter;
pub mod gate;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod request;
pub mod session;

pub use client::QueryServiceClient;
pub use config::Config;
pub use delivery::{DirectorySink, DownloadDelivery, FileSink};
pub use error::{ErrorKind, JobError};
pub use filter::QueryFilter;
pub use gate::{GateDecision, RowCountGate};
pub use models::{
    ConnectionCredentials, JobKind, JobMode, JobNotice, JobRequest, JobResult, JobState,
    ProgressEvent, ProgressPhase, ProgressUpdate,
};
pub use orchestrator::{JobHandle, JobOrchestrator, OrchestratorSettings};
pub use progress::{ProgressChannel, Unsubscribe};
pub use request::CancellableRequest;
pub use session::Session;
