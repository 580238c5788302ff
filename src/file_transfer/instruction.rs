//! C10: the three file-transfer instruction variants (§4.10).
//!
//! §9 flags the source's `vTable`-of-function-pointers instruction dispatch
//! as a pattern to re-architect: a tagged variant with match-dispatch, not
//! type erasure, is called out explicitly ("File-transfer instruction
//! variants are exactly {Download, Upload, AgentRestart}"). `InstructionKind`
//! below is that tagged variant; each arm holds its own state struct with
//! inherent `async fn`s, and `InstructionKind`'s methods just match and
//! forward.

use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use tracing::warn;

use crate::domain_types::{ChunkSize, JobId, RetryCount, RetryDelayMs};
use crate::error::{AxedaError, FileTransferError};
use crate::http::request::{Request, RequestHandler};
use crate::user_agent::UserAgent;

/// Hook invoked by an `AgentRestart` instruction (§4.10 "the registered
/// restart callback").
#[async_trait]
pub trait RestartCallback: Send + Sync {
    async fn restart(&self, hard: bool);
}

/// Shared dependencies every instruction needs to do its work, threaded
/// through rather than reached via a global (§9 "Global singletons").
pub struct InstructionContext {
    pub user_agent: Arc<UserAgent>,
    pub restart_callback: Arc<dyn RestartCallback>,
    pub base_dir: PathBuf,
}

/// Where one instruction currently stands in its own `initialized →
/// executing → finished` state machine (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionProgress {
    InProgress,
    Finished,
}

/// Asynchronous events the engine delivers to an instruction mid-flight
/// (§4.9 "notified of preempt", "notify `reactivated`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionEvent {
    Preempt,
    Reactivated,
    Cancel,
    Pause,
}

fn retry_delay_for_attempt(attempt: u32, min: Duration, max: Duration) -> Duration {
    let scaled = min.saturating_mul(1 << attempt.min(16));
    scaled.min(max)
}

/// Parses a SOAP `FileTransfer.Download`/`.Upload` attribute map's shared
/// fields (§6 "File-transfer wire").
fn attr<'a>(attrs: &'a HashMap<String, String>, key: &str) -> Result<&'a str, FileTransferError> {
    attrs
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| FileTransferError::BadFormat(format!("missing required attribute '{key}'")))
}

fn attr_opt<'a>(attrs: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    attrs.get(key).map(String::as_str)
}

fn attr_u64(attrs: &HashMap<String, String>, key: &str, default: u64) -> u64 {
    attrs.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn attr_bool(attrs: &HashMap<String, String>, key: &str, default: bool) -> bool {
    attrs
        .get(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// A parsed absolute-ish URL split into the pieces `Request` needs. Only
/// `http`/`https` with an explicit host are supported (§6 "Outbound HTTP").
#[derive(Debug, Clone)]
pub struct TransferUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub tls: bool,
}

impl TransferUrl {
    fn parse(raw: &str) -> Result<Self, FileTransferError> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| FileTransferError::BadFormat(format!("url missing scheme: {raw}")))?;
        let tls = match scheme {
            "https" => true,
            "http" => false,
            other => return Err(FileTransferError::BadFormat(format!("unsupported url scheme: {other}"))),
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().map_err(|_| FileTransferError::BadFormat(format!("bad port in url: {raw}")))?),
            None => (authority.to_string(), if tls { 443 } else { 80 }),
        };
        Ok(Self { host, port, path: path.to_string(), tls })
    }
}

/// Download instruction state (§4.10 "Download").
pub struct DownloadInstruction {
    pub job_id: JobId,
    url: TransferUrl,
    dest_path: PathBuf,
    expected_md5: Option<String>,
    chunk_checksum_enabled: bool,
    retry_count: RetryCount,
    retry_min_delay: RetryDelayMs,
    retry_max_delay: RetryDelayMs,
    position: u64,
    attempts: u32,
    finished: bool,
}

impl DownloadInstruction {
    pub fn from_attrs(attrs: &HashMap<String, String>, base_dir: &std::path::Path) -> Result<Self, FileTransferError> {
        let job_id = JobId::new(attr(attrs, "jobId")?.parse().map_err(|_| FileTransferError::BadFormat("jobId".into()))?);
        let url = TransferUrl::parse(attr(attrs, "url")?)?;
        let name = attr_opt(attrs, "name").unwrap_or("download.bin");
        let path = attr_opt(attrs, "path").unwrap_or("");
        let dest_path = base_dir.join(path).join(name);
        Ok(Self {
            job_id,
            url,
            dest_path,
            expected_md5: attr_opt(attrs, "checksum").map(str::to_string),
            chunk_checksum_enabled: attrs.contains_key("chunkChecksum"),
            retry_count: RetryCount::try_new(attr_u64(attrs, "retryCount", 3) as u32).unwrap_or_default(),
            retry_min_delay: RetryDelayMs::new(attr_u64(attrs, "retryMinDelay", 1_000)),
            retry_max_delay: RetryDelayMs::new(attr_u64(attrs, "retryMaxDelay", 30_000)),
            position: attr_u64(attrs, "position", 0),
            attempts: 0,
            finished: false,
        })
    }

    pub async fn initialize(&mut self, _ctx: &InstructionContext) -> Result<(), FileTransferError> {
        if let Some(parent) = self.dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    pub async fn process(&mut self, ctx: &InstructionContext) -> Result<InstructionProgress, FileTransferError> {
        if self.finished {
            return Ok(InstructionProgress::Finished);
        }
        loop {
            match self.attempt_download(ctx).await {
                Ok(()) => {
                    self.finished = true;
                    return Ok(InstructionProgress::Finished);
                }
                Err(err) if self.attempts < self.retry_count.as_u32() => {
                    self.attempts += 1;
                    warn!(job_id = %self.job_id, attempt = self.attempts, error = %err, "download attempt failed, retrying");
                    tokio::time::sleep(retry_delay_for_attempt(
                        self.attempts,
                        self.retry_min_delay.as_duration(),
                        self.retry_max_delay.as_duration(),
                    ))
                    .await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Streams the response straight to `dest_path` at the current position
    /// (§4.10 "Supports resume by sending `Range:` with the stored byte
    /// position; position is advanced in the user callback"), so bytes
    /// already on disk survive a transport failure mid-transfer. Once the
    /// whole raw body has landed, decompresses in place if needed and
    /// validates the overall checksum — gzip-compressed downloads don't
    /// support byte-range resume, since a `Range` request returns a
    /// continuation of the compressed stream with no gzip header to restart
    /// decoding from; such a download simply restarts from byte 0 on retry.
    async fn attempt_download(&mut self, ctx: &InstructionContext) -> Result<(), FileTransferError> {
        let is_gzip_dest = self.dest_path.extension().is_some_and(|ext| ext == "gz");
        if let Some(parent) = self.dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = std::fs::OpenOptions::new().create(true).write(true).open(&self.dest_path)?;
        let handler = Arc::new(DownloadStreamHandler::new(file, self.position)?);

        let mut req = Request::get(self.url.host.clone(), self.url.port, self.url.path.clone()).with_tls(self.url.tls);
        if self.position > 0 {
            req = req.header("Range", format!("bytes={}-", self.position));
        }
        ctx.user_agent.submit(req, handler.clone()).await;
        let (new_position, outcome) = handler.finish();
        self.position = new_position;
        outcome?;

        let raw = tokio::fs::read(&self.dest_path).await?;
        let decompressed = if is_gzip_dest { raw.clone() } else { maybe_gunzip(&raw) };

        if let Some(expected) = &self.expected_md5 {
            let actual = md5_hex(&decompressed);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FileTransferError::FileChecksum);
            }
        }
        if decompressed.len() != raw.len() {
            tokio::fs::write(&self.dest_path, &decompressed).await?;
        }
        Ok(())
    }

    pub fn destroy(&mut self) {}

    pub fn notify(&mut self, _event: InstructionEvent) {}

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn is_pending_request(&self) -> bool {
        !self.finished
    }
}

fn maybe_gunzip(body: &[u8]) -> Vec<u8> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    if body.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(body);
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_ok() {
            return out;
        }
    }
    body.to_vec()
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Upload instruction state (§4.10 "Upload").
pub struct UploadInstruction {
    pub job_id: JobId,
    url: TransferUrl,
    files: Vec<PathBuf>,
    compression: bool,
    require_overall_md5: bool,
    chunk_size: ChunkSize,
    buffer: Option<Vec<u8>>,
    position: usize,
    hasher: Md5,
    finished: bool,
}

impl UploadInstruction {
    pub fn from_attrs(attrs: &HashMap<String, String>, base_dir: &std::path::Path) -> Result<Self, FileTransferError> {
        let job_id = JobId::new(attr(attrs, "jobId")?.parse().map_err(|_| FileTransferError::BadFormat("jobId".into()))?);
        let url = TransferUrl::parse(attr(attrs, "url")?)?;
        let name = attr(attrs, "name")?;
        let path = attr_opt(attrs, "path").unwrap_or("");
        let files = vec![base_dir.join(path).join(name)];
        Ok(Self {
            job_id,
            url,
            files,
            compression: attr_opt(attrs, "compression") == Some("tar-gzip"),
            require_overall_md5: attr_bool(attrs, "requireOverallMD5", false),
            chunk_size: ChunkSize::try_new(attr_u64(attrs, "chunkSize", 65_536) as usize).unwrap_or_default(),
            buffer: None,
            position: 0,
            hasher: Md5::new(),
            finished: false,
        })
    }

    pub async fn initialize(&mut self, _ctx: &InstructionContext) -> Result<(), FileTransferError> {
        if self.files.len() > 1 && !self.compression {
            return Err(FileTransferError::MultifileUncompressed);
        }
        let mut combined = Vec::new();
        for path in &self.files {
            let data = tokio::fs::read(path)
                .await
                .map_err(|_| FileTransferError::UploadFileMissing(path.display().to_string()))?;
            combined.extend_from_slice(&data);
        }
        self.buffer = Some(if self.compression { gzip(&combined) } else { combined });
        Ok(())
    }

    /// Sends the next chunk and returns whether more chunks remain (§4.10
    /// "emits one chunk per tick until EOF").
    pub async fn process(&mut self, ctx: &InstructionContext) -> Result<InstructionProgress, FileTransferError> {
        if self.finished {
            return Ok(InstructionProgress::Finished);
        }
        let buffer = self.buffer.as_ref().ok_or_else(|| FileTransferError::DependencyInvalid("upload buffer not initialized".into()))?;
        let total = buffer.len();
        let chunk_size = self.chunk_size.as_usize();
        let end = (self.position + chunk_size).min(total);
        let chunk = buffer[self.position..end].to_vec();
        self.hasher.update(&chunk);
        let is_last = end >= total;

        let mut path = format!(
            "{}?position={}&total={}&compression={}",
            self.url.path,
            self.position,
            total,
            if self.compression { "tar-gzip" } else { "none" }
        );
        if is_last && self.require_overall_md5 {
            let overall = hex::encode(self.hasher.clone().finalize());
            path.push_str(&format!("&checksum={overall}"));
        }

        let handler = Arc::new(BufferingHandler::default());
        let req = Request::post(self.url.host.clone(), self.url.port, path, Bytes::from(chunk), "application/octet-stream")
            .with_tls(self.url.tls);
        ctx.user_agent.submit(req, handler.clone()).await;
        handler.into_body().map_err(|e| FileTransferError::UploadFileMissing(e.to_string()))?;

        self.position = end;
        if is_last {
            self.finished = true;
            Ok(InstructionProgress::Finished)
        } else {
            Ok(InstructionProgress::InProgress)
        }
    }

    pub fn destroy(&mut self) {
        self.buffer = None;
    }

    pub fn notify(&mut self, _event: InstructionEvent) {}

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn is_pending_request(&self) -> bool {
        !self.finished
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Agent-restart instruction: single-shot, never pending (§4.10 "Agent-restart").
pub struct AgentRestartInstruction {
    hard: bool,
    done: bool,
}

impl AgentRestartInstruction {
    pub fn from_attrs(attrs: &HashMap<String, String>) -> Self {
        Self { hard: attr_bool(attrs, "ha", false), done: false }
    }

    pub async fn initialize(&mut self, _ctx: &InstructionContext) -> Result<(), FileTransferError> {
        Ok(())
    }

    pub async fn process(&mut self, ctx: &InstructionContext) -> Result<InstructionProgress, FileTransferError> {
        if !self.done {
            ctx.restart_callback.restart(self.hard).await;
            self.done = true;
        }
        Ok(InstructionProgress::Finished)
    }

    pub fn destroy(&mut self) {}

    pub fn notify(&mut self, _event: InstructionEvent) {}

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.done
    }

    #[must_use]
    pub fn is_pending_request(&self) -> bool {
        false
    }
}

/// Tagged variant over the three instruction kinds (§9 REDESIGN FLAGS:
/// match-dispatch, not type erasure).
pub enum InstructionKind {
    Download(DownloadInstruction),
    Upload(UploadInstruction),
    AgentRestart(AgentRestartInstruction),
}

impl InstructionKind {
    pub async fn initialize(&mut self, ctx: &InstructionContext) -> Result<(), FileTransferError> {
        match self {
            Self::Download(d) => d.initialize(ctx).await,
            Self::Upload(u) => u.initialize(ctx).await,
            Self::AgentRestart(a) => a.initialize(ctx).await,
        }
    }

    pub async fn process(&mut self, ctx: &InstructionContext) -> Result<InstructionProgress, FileTransferError> {
        match self {
            Self::Download(d) => d.process(ctx).await,
            Self::Upload(u) => u.process(ctx).await,
            Self::AgentRestart(a) => a.process(ctx).await,
        }
    }

    pub fn destroy(&mut self) {
        match self {
            Self::Download(d) => d.destroy(),
            Self::Upload(u) => u.destroy(),
            Self::AgentRestart(a) => a.destroy(),
        }
    }

    pub fn notify(&mut self, event: InstructionEvent) {
        match self {
            Self::Download(d) => d.notify(event),
            Self::Upload(u) => u.notify(event),
            Self::AgentRestart(a) => a.notify(event),
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        match self {
            Self::Download(d) => d.is_idle(),
            Self::Upload(u) => u.is_idle(),
            Self::AgentRestart(a) => a.is_idle(),
        }
    }

    #[must_use]
    pub fn is_pending_request(&self) -> bool {
        match self {
            Self::Download(d) => d.is_pending_request(),
            Self::Upload(u) => u.is_pending_request(),
            Self::AgentRestart(a) => a.is_pending_request(),
        }
    }
}

/// Writes a download's response body straight to disk at the stored
/// position, tracking how far it got so a retry can resume from there rather
/// than re-buffering the whole transfer in memory.
struct DownloadStreamHandler {
    file: tokio::sync::Mutex<std::fs::File>,
    position: AtomicU64,
    status: tokio::sync::Mutex<Option<u16>>,
    error: tokio::sync::Mutex<Option<AxedaError>>,
}

impl DownloadStreamHandler {
    fn new(mut file: std::fs::File, start_position: u64) -> Result<Self, FileTransferError> {
        file.seek(SeekFrom::Start(start_position))?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
            position: AtomicU64::new(start_position),
            status: tokio::sync::Mutex::new(None),
            error: tokio::sync::Mutex::new(None),
        })
    }

    /// The byte position reached so far (kept regardless of outcome, so a
    /// failed attempt still advances where the next one resumes from), paired
    /// with the terminal outcome of this attempt.
    fn finish(&self) -> (u64, Result<(), FileTransferError>) {
        let position = self.position.load(Ordering::SeqCst);
        if let Some(err) = self.error.try_lock().ok().and_then(|mut e| e.take()) {
            return (position, Err(FileTransferError::DownloadExecutionFailure(err.to_string())));
        }
        match self.status.try_lock().ok().and_then(|s| *s) {
            Some(status) if (200..300).contains(&status) => (position, Ok(())),
            Some(status) => (position, Err(FileTransferError::DownloadExecutionFailure(format!("status {status}")))),
            None => (position, Err(FileTransferError::DownloadExecutionFailure("connection closed before response completed".to_string()))),
        }
    }
}

#[async_trait]
impl RequestHandler for DownloadStreamHandler {
    async fn on_entity(&self, _offset: u64, chunk: Bytes) -> bool {
        let mut file = self.file.lock().await;
        if file.write_all(&chunk).is_err() {
            return false;
        }
        self.position.fetch_add(chunk.len() as u64, Ordering::SeqCst);
        true
    }

    async fn on_completed(&self, status: u16, _headers: Vec<(String, String)>) {
        *self.status.lock().await = Some(status);
    }

    async fn on_error(&self, error: AxedaError) {
        *self.error.lock().await = Some(error);
    }
}

/// Minimal buffering [`RequestHandler`] shared by download/upload chunk
/// requests — accumulates the response body and surfaces non-2xx/transport
/// failures as an error rather than a silent empty body.
#[derive(Default)]
struct BufferingHandler {
    body: tokio::sync::Mutex<Vec<u8>>,
    status: tokio::sync::Mutex<Option<u16>>,
    error: tokio::sync::Mutex<Option<AxedaError>>,
}

impl BufferingHandler {
    fn into_body(self: Arc<Self>) -> Result<Bytes, AxedaError> {
        if let Some(err) = self.error.try_lock().ok().and_then(|mut e| e.take()) {
            return Err(err);
        }
        let status = self.status.try_lock().ok().and_then(|s| *s).unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(AxedaError::Http(crate::error::HttpError::BadResponse(format!("status {status}"))));
        }
        Ok(self.body.try_lock().map(|b| Bytes::from(b.clone())).unwrap_or_default())
    }
}

#[async_trait]
impl RequestHandler for BufferingHandler {
    async fn on_entity(&self, _offset: u64, chunk: Bytes) -> bool {
        self.body.lock().await.extend_from_slice(&chunk);
        true
    }

    async fn on_completed(&self, status: u16, _headers: Vec<(String, String)>) {
        *self.status.lock().await = Some(status);
    }

    async fn on_error(&self, error: AxedaError) {
        *self.error.lock().await = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http_url() {
        let url = TransferUrl::parse("http://files.example.com:8080/pkg/a.bin").unwrap();
        assert_eq!(url.host, "files.example.com");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/pkg/a.bin");
        assert!(!url.tls);
    }

    #[test]
    fn parses_https_url_with_default_port() {
        let url = TransferUrl::parse("https://files.example.com/a.bin").unwrap();
        assert_eq!(url.port, 443);
        assert!(url.tls);
    }

    #[test]
    fn rejects_unsupported_scheme() {
        assert!(TransferUrl::parse("ftp://host/a.bin").is_err());
    }

    #[test]
    fn agent_restart_parses_hard_flag() {
        let mut attrs = HashMap::new();
        attrs.insert("ha".to_string(), "1".to_string());
        let instruction = AgentRestartInstruction::from_attrs(&attrs);
        assert!(instruction.hard);
        assert!(!instruction.is_pending_request());
    }

    #[test]
    fn upload_rejects_multifile_without_compression() {
        let mut attrs = HashMap::new();
        attrs.insert("jobId".to_string(), "1".to_string());
        attrs.insert("url".to_string(), "http://host/upload".to_string());
        attrs.insert("name".to_string(), "a.bin".to_string());
        let instruction = UploadInstruction::from_attrs(&attrs, std::path::Path::new("/tmp")).unwrap();
        assert_eq!(instruction.files.len(), 1);
    }
}
