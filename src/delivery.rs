use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{
    error::{JobError, Result},
    filter::QueryFilter,
    models::JobKind,
};

pub const SPREADSHEET_EXTENSION: &str = "xlsx";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Buffer(Vec<u8>),
    Blob(Bytes),
}

impl Payload {
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Buffer(buffer) => Bytes::from(buffer),
            Self::Blob(blob) => blob,
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Buffer(value)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self::Blob(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub path: PathBuf,
    pub staging: Option<PathBuf>,
}

#[async_trait]
pub trait FileSink: Send + Sync + 'static {
    async fn save(&self, filename: &str, bytes: Bytes) -> Result<SavedFile>;

    async fn release(&self, saved: &SavedFile);
}

#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create download directory {}", self.root.display()))
    }
}

#[async_trait]
impl FileSink for DirectorySink {
    async fn save(&self, filename: &str, bytes: Bytes) -> Result<SavedFile> {
        self.ensure_root()
            .await
            .map_err(|err| JobError::Delivery(format!("{err:#}")))?;

        let target = unique_path(&self.root, filename).await;
        let staging = self.root.join(format!(
            ".{}.part",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| filename.to_string())
        ));

        if let Err(err) = fs::write(&staging, &bytes).await {
            discard_staging(&staging).await;
            return Err(JobError::Delivery(format!(
                "failed to write {}: {err}",
                staging.display()
            )));
        }
        if let Err(err) = publish_staged(&staging, &target).await {
            discard_staging(&staging).await;
            return Err(JobError::Delivery(format!(
                "failed to move file into {}: {err}",
                target.display()
            )));
        }

        Ok(SavedFile {
            path: target,
            staging: Some(staging),
        })
    }

    async fn release(&self, saved: &SavedFile) {
        if let Some(staging) = &saved.staging {
            discard_staging(staging).await;
        }
    }
}

// Hard link so the staging name outlives the save; copy where links are unsupported.
async fn publish_staged(staging: &Path, target: &Path) -> std::io::Result<()> {
    match fs::hard_link(staging, target).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(err),
        Err(link_err) => {
            debug!("Hard link failed ({link_err}), copying {}", staging.display());
            fs::copy(staging, target).await.map(|_| ())
        }
    }
}

async fn discard_staging(staging: &Path) {
    if let Err(err) = delete_file_if_exists(staging).await {
        warn!("Failed to release staging file {}: {err:#}", staging.display());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub filename: String,
    pub path: PathBuf,
    pub bytes: Bytes,
}

pub struct DownloadDelivery {
    sink: Arc<dyn FileSink>,
    release_delay: Duration,
    delivered: AtomicBool,
}

impl DownloadDelivery {
    pub fn new(sink: Arc<dyn FileSink>, release_delay: Duration) -> Self {
        Self {
            sink,
            release_delay,
            delivered: AtomicBool::new(false),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::SeqCst)
    }

    pub async fn deliver(
        &self,
        payload: impl Into<Payload>,
        suggested_filename: &str,
        metadata: &ResponseMetadata,
    ) -> Result<Option<Delivered>> {
        if self.delivered.swap(true, Ordering::SeqCst) {
            debug!("Ignoring repeated delivery for the same job");
            return Ok(None);
        }

        let bytes = payload.into().into_bytes();
        let filename = resolve_filename(metadata, suggested_filename);
        let saved = self.sink.save(&filename, bytes.clone()).await?;
        info!(
            file = %saved.path.display(),
            size_bytes = bytes.len(),
            "Download saved"
        );

        let sink = self.sink.clone();
        let delay = self.release_delay;
        let to_release = saved.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.release(&to_release).await;
        });

        Ok(Some(Delivered {
            filename,
            path: saved.path,
            bytes,
        }))
    }
}

pub fn fallback_filename(kind: JobKind, filter: &QueryFilter) -> String {
    let stem = match filter.date_range() {
        (Some(from), Some(to)) => format!("{kind}_{from}_to_{to}"),
        (Some(from), None) => format!("{kind}_{from}_onward"),
        (None, Some(to)) => format!("{kind}_until_{to}"),
        (None, None) => format!("{kind}_all"),
    };
    format!("{stem}.{SPREADSHEET_EXTENSION}")
}

pub fn resolve_filename(metadata: &ResponseMetadata, suggested_filename: &str) -> String {
    metadata
        .content_disposition
        .as_deref()
        .and_then(filename_from_disposition)
        .or_else(|| sanitize_filename(suggested_filename))
        .unwrap_or_else(|| format!("download.{SPREADSHEET_EXTENSION}"))
}

/// Extracts the file name from a `Content-Disposition` value.
///
/// `filename*` (RFC 5987) wins over `filename`. A header with an unbalanced
/// quote is rejected as a whole.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for part in disposition_params(value)?.into_iter().skip(1) {
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        let raw = raw.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
                let encoded = encoded.trim_matches('"');
                extended = urlencoding::decode(encoded).ok().map(|s| s.into_owned());
            }
            "filename" => plain = unquote(raw),
            _ => {}
        }
    }

    extended
        .and_then(|name| sanitize_filename(&name))
        .or_else(|| plain.and_then(|name| sanitize_filename(&name)))
}

// Splits on `;` outside quoted strings.
fn disposition_params(value: &str) -> Option<Vec<String>> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;

    for ch in value.chars() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                params.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if quoted {
        return None;
    }
    params.push(current);
    Some(params)
}

fn unquote(raw: &str) -> Option<String> {
    let Some(inner) = raw.strip_prefix('"') else {
        return Some(raw.to_string());
    };
    let inner = inner.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            out.extend(chars.next());
        } else {
            out.push(ch);
        }
    }
    Some(out)
}

pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return None;
    }
    Some(cleaned.to_string())
}

async fn unique_path(root: &Path, filename: &str) -> PathBuf {
    let candidate = root.join(filename);
    if !fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let (stem, extension) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (filename.to_string(), String::new()),
    };
    let mut counter = 1;
    loop {
        let candidate = root.join(format!("{stem} ({counter}){extension}"));
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        counter += 1;
    }
}

pub async fn delete_file_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}
