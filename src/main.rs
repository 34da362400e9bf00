mod args;

use std::{
    future::Future,
    io::{self, Write},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use args::{Cli, Command};
use clap::Parser;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use trade_export_core::{
    ConnectionCredentials, Config, DirectorySink, ErrorKind, JobKind, JobNotice, JobOrchestrator,
    JobResult, OrchestratorSettings, QueryFilter, QueryServiceClient, Session,
};
use uuid::Uuid;

const EXIT_FAILURE: u8 = 1;
const EXIT_VALIDATION: u8 = 2;
const EXIT_REAUTH: u8 = 3;
const EXIT_CANCELLED: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trade_export_core=info,trade_export=info".into()),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("trade-export: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = Config::from_env();
    if let Some(url) = cli.url.clone() {
        config.base_url = url;
    }
    let credentials = resolve_credentials(&cli, &config)?;

    let client = QueryServiceClient::new(&config.base_url);
    let session = match Session::login(client, credentials).await {
        Ok(session) => Arc::new(session),
        Err(err) if err.kind() == ErrorKind::Unauthorized => {
            eprintln!("Login rejected: {}", err.user_message());
            return Ok(EXIT_REAUTH);
        }
        Err(err) => return Err(err).context("Failed to log in to the query service"),
    };

    let sink = DirectorySink::new(config.download_dir.clone());
    sink.ensure_root().await?;

    let settings = OrchestratorSettings::from(&config);
    let code = match cli.command {
        Command::Preview { kind, filter } => {
            let orchestrator =
                JobOrchestrator::new(kind.into(), session.clone(), settings, Arc::new(sink));
            preview(&orchestrator, filter.into()).await?
        }
        Command::Generate {
            kind,
            filter,
            yes,
            force,
        } => {
            let orchestrator =
                JobOrchestrator::new(kind.into(), session.clone(), settings, Arc::new(sink));
            generate(&orchestrator, filter.into(), yes, force).await
        }
    };

    if !session.requires_login() {
        session.logout(config.cleanup_timeout).await;
    }
    Ok(code)
}

fn resolve_credentials(cli: &Cli, config: &Config) -> Result<ConnectionCredentials> {
    let pick = |flag: &Option<String>, fallback: &Option<String>, name: &str| {
        flag.clone()
            .or_else(|| fallback.clone())
            .with_context(|| format!("Missing {name}; pass --{name} or set TRADE_EXPORT_{}", name.to_uppercase()))
    };
    Ok(ConnectionCredentials {
        server: pick(&cli.server, &config.server, "server")?,
        database: pick(&cli.database, &config.database, "database")?,
        username: pick(&cli.username, &config.username, "username")?,
        password: pick(&cli.password, &config.password, "password")?,
    })
}

async fn preview(orchestrator: &JobOrchestrator, filter: QueryFilter) -> Result<u8> {
    let handle = orchestrator.start_preview(filter);
    let result = handle.wait().await;
    handle.settled().await;

    if let JobResult::Rows {
        rows,
        matched_count,
        total_count,
    } = &result
    {
        println!("matched {matched_count} of {total_count} rows");
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for row in rows {
            let line = serde_json::to_string(row).context("Failed to encode row")?;
            writeln!(out, "{line}").context("Failed to write row")?;
        }
    }
    Ok(report(orchestrator.kind(), &result))
}

async fn generate(orchestrator: &JobOrchestrator, filter: QueryFilter, yes: bool, force: bool) -> u8 {
    let _progress = orchestrator.subscribe_progress(|update| {
        info!(
            job_id = %update.job_id,
            phase = ?update.event.phase,
            percent = update.event.percent,
            "{}",
            update.event.detail
        );
    });
    let notices = orchestrator.subscribe_results();
    let handle = orchestrator.start_generation(filter, force);

    let prompts = {
        let orchestrator = orchestrator.clone();
        let job_id = handle.id();
        tokio::spawn(answer_limit_notices(
            notices,
            job_id,
            move |total_count, limit| async move { yes || ask_truncate(total_count, limit).await },
            move |accepted| {
                if accepted {
                    orchestrator.confirm_continue();
                } else {
                    orchestrator.cancel_awaiting_confirmation();
                }
            },
        ))
    };

    let result = tokio::select! {
        result = handle.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling job");
            orchestrator.cancel();
            handle.wait().await
        }
    };
    handle.settled().await;
    prompts.abort();

    report(orchestrator.kind(), &result)
}

// Answers every row-limit pause of `job_id` until the job ends.
async fn answer_limit_notices<A, Fut, D>(
    mut notices: broadcast::Receiver<JobNotice>,
    job_id: Uuid,
    mut ask: A,
    mut decide: D,
) where
    A: FnMut(u64, u64) -> Fut,
    Fut: Future<Output = bool>,
    D: FnMut(bool),
{
    loop {
        let notice = match notices.recv().await {
            Ok(notice) => notice,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Job notices lagged behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if notice.job_id != job_id {
            continue;
        }
        match notice.result {
            JobResult::LimitExceeded {
                total_count, limit, ..
            } => {
                let accepted = ask(total_count, limit).await;
                decide(accepted);
            }
            _ => break,
        }
    }
}

async fn ask_truncate(total_count: u64, limit: u64) -> bool {
    print!(
        "{total_count} rows match but a spreadsheet holds {limit}. Export the first {limit} rows? [y/N] "
    );
    let _ = io::stdout().flush();
    let answer = read_answer(|answer| io::stdin().read_line(answer)).await;
    answer.as_deref().map(is_yes).unwrap_or(false)
}

// Reads on a detached thread: runtime shutdown must not wait for a pending
// terminal read after Ctrl-C.
async fn read_answer<R>(read: R) -> Option<String>
where
    R: FnOnce(&mut String) -> io::Result<usize> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut answer = String::new();
        if read(&mut answer).is_ok() {
            let _ = tx.send(answer);
        }
    });
    rx.await.ok()
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn report(kind: JobKind, result: &JobResult) -> u8 {
    match result {
        JobResult::Rows { .. } => 0,
        JobResult::BinaryPayload {
            suggested_filename,
            saved_path,
            bytes,
            ..
        } => {
            match saved_path {
                Some(path) => println!("{kind} saved to {} ({} bytes)", path.display(), bytes.len()),
                None => println!("{kind} ready as {suggested_filename} ({} bytes)", bytes.len()),
            }
            0
        }
        JobResult::Cancelled => {
            println!("{kind} cancelled");
            EXIT_CANCELLED
        }
        JobResult::Failed { kind: error, message } => {
            eprintln!("{kind} failed: {message}");
            match error {
                ErrorKind::Validation => EXIT_VALIDATION,
                ErrorKind::Unauthorized => EXIT_REAUTH,
                ErrorKind::Cancelled | ErrorKind::TimedOut => EXIT_CANCELLED,
                ErrorKind::ServerError => EXIT_FAILURE,
            }
        }
        JobResult::LimitExceeded { .. } => EXIT_FAILURE,
    }
}
