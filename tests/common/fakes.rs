//! In-process stand-ins for the extractor, transfer engine and converter
//!
//! The fakes write real files so that the scheduler's output checks, resume
//! offsets and cleanup run against the filesystem.

use super::constants::*;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mediaq::converter::{ConversionError, MediaConverter};
use mediaq::extractor::{
    ExtractorError, ExtractorGateway, ExtractorRegistry, Manifest, StreamDescriptor,
};
use mediaq::lease::{StopReason, StopSignal};
use mediaq::task::TaskOptions;
use mediaq::transfer::{TickStream, TransferEngine, TransferError, TransferRequest, TransferTick};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use url::Url;

// ============================================================================
// Extractor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Return the configured manifest.
    Ok,
    /// Fail with a recoverable error.
    Transient,
    /// Fail with a fatal error.
    NotFound,
    /// Fail as if the platform answered 429.
    RateLimited(Option<Duration>),
    /// Never answer.
    Hang,
}

/// Extractor that classifies with the real domain table and resolves every
/// URL to the same canned manifest.
pub struct FakeExtractor {
    registry: ExtractorRegistry,
    mode: Mutex<ExtractMode>,
    manifest: Mutex<Manifest>,
    resolves: AtomicUsize,
}

impl Default for FakeExtractor {
    fn default() -> Self {
        Self {
            registry: ExtractorRegistry::with_known_domains(),
            mode: Mutex::new(ExtractMode::Ok),
            manifest: Mutex::new(default_manifest()),
            resolves: AtomicUsize::new(0),
        }
    }
}

impl FakeExtractor {
    pub fn set_mode(&self, mode: ExtractMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_manifest(&self, manifest: Manifest) {
        *self.manifest.lock().unwrap() = manifest;
    }

    /// Number of `resolve` calls so far.
    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

/// 360p, 720p and 1080p mp4 streams plus an audio-only stream. No title, so
/// outputs are named after the task id.
pub fn default_manifest() -> Manifest {
    let video = |label: &str, size: u64| {
        StreamDescriptor::new(format!("fake://{}", label))
            .with_quality_label(label)
            .with_extension("mp4")
            .with_size(size)
    };
    Manifest {
        streams: vec![
            video("360p", MEDIA_360P_SIZE),
            video("720p", MEDIA_720P_SIZE),
            video("1080p", MEDIA_1080P_SIZE),
            StreamDescriptor::new("fake://audio")
                .with_mimetype("audio/mp4")
                .with_quality_label("audio")
                .with_extension("m4a")
                .with_size(300),
        ],
        title: None,
        duration_secs: Some(60),
    }
}

#[async_trait]
impl ExtractorGateway for FakeExtractor {
    fn classify(&self, url: &Url) -> String {
        self.registry.classify(url)
    }

    async fn resolve(&self, url: &str, _options: &TaskOptions) -> Result<Manifest, ExtractorError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            ExtractMode::Ok => Ok(self.manifest.lock().unwrap().clone()),
            ExtractMode::Transient => Err(ExtractorError::Transient(format!(
                "fake extractor hiccup for {}",
                url
            ))),
            ExtractMode::NotFound => Err(ExtractorError::NotFound(url.to_string())),
            ExtractMode::RateLimited(retry_after) => Err(ExtractorError::RateLimited {
                message: "fake platform says slow down".to_string(),
                retry_after,
            }),
            ExtractMode::Hang => std::future::pending().await,
        }
    }
}

// ============================================================================
// Transfer engine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Write every chunk, then finish.
    Complete,
    /// Write the first chunk, then wait for the stop signal.
    Hang,
    /// Write the first chunk, then fail with a network error.
    FailAfterFirstChunk,
    /// Produce no tick at all until stopped.
    Silent,
}

/// Transfer engine that writes `FAKE_CHUNKS` chunks of filler bytes.
pub struct FakeTransferEngine {
    mode: Mutex<TransferMode>,
    resumable: AtomicBool,
    chunk_delay: Mutex<Duration>,
    requests: Mutex<Vec<TransferRequest>>,
}

impl FakeTransferEngine {
    pub fn new(mode: TransferMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            resumable: AtomicBool::new(true),
            chunk_delay: Mutex::new(Duration::from_millis(1)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: TransferMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Whether the fake honours resume offsets, like a source with range support.
    pub fn set_resumable(&self, resumable: bool) {
        self.resumable.store(resumable, Ordering::SeqCst);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.chunk_delay.lock().unwrap() = delay;
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl TransferEngine for FakeTransferEngine {
    fn transfer(&self, request: TransferRequest, stop: StopSignal) -> TickStream {
        self.requests.lock().unwrap().push(request.clone());
        let run = FakeRun {
            total: request.source.size.unwrap_or(MEDIA_720P_SIZE),
            request,
            stop,
            mode: *self.mode.lock().unwrap(),
            resumable: self.resumable.load(Ordering::SeqCst),
            chunk_delay: *self.chunk_delay.lock().unwrap(),
            started: false,
            written: 0,
            chunks: 0,
        };
        stream::unfold(Some(run), |state| async move {
            let Some(mut run) = state else {
                return None;
            };
            let (item, done) = run.step().await;
            Some((item, if done { None } else { Some(run) }))
        })
        .boxed()
    }
}

struct FakeRun {
    request: TransferRequest,
    stop: StopSignal,
    mode: TransferMode,
    resumable: bool,
    chunk_delay: Duration,
    total: u64,
    started: bool,
    written: u64,
    /// Chunks written by this run.
    chunks: u64,
}

type FakeStep = (Result<TransferTick, TransferError>, bool);

impl FakeRun {
    async fn step(&mut self) -> FakeStep {
        let path = self.request.output_path.clone();
        let stop = self.stop.clone();

        if !self.started {
            self.started = true;
            if self.mode == TransferMode::Silent {
                let reason = stop.stopped().await;
                return (Ok(stopped(&path, reason, self.written).await), true);
            }
            let offset = if self.resumable {
                self.request.resume_offset.min(self.total)
            } else {
                0
            };
            if let Err(e) = open(&path, offset).await {
                return (Err(e.into()), true);
            }
            self.written = offset;
            return (
                Ok(TransferTick::Started {
                    offset,
                    total: Some(self.total),
                    resumable: self.resumable,
                }),
                false,
            );
        }

        if self.chunks >= 1 {
            match self.mode {
                TransferMode::Hang => {
                    let reason = stop.stopped().await;
                    return (Ok(stopped(&path, reason, self.written).await), true);
                }
                TransferMode::FailAfterFirstChunk => {
                    return (
                        Err(TransferError::Network("connection reset".to_string())),
                        true,
                    );
                }
                _ => {}
            }
        }

        tokio::select! {
            biased;
            reason = stop.stopped() => {
                return (Ok(stopped(&path, reason, self.written).await), true);
            }
            _ = tokio::time::sleep(self.chunk_delay) => {}
        }

        let remaining = self.total - self.written;
        if remaining == 0 {
            return (
                Ok(TransferTick::Finished {
                    bytes_done: self.written,
                }),
                true,
            );
        }
        let chunk = (self.total / FAKE_CHUNKS).max(1).min(remaining);
        if let Err(e) = append(&path, chunk).await {
            return (Err(e.into()), true);
        }
        self.written += chunk;
        self.chunks += 1;

        if self.written == self.total && self.mode == TransferMode::Complete {
            return (
                Ok(TransferTick::Finished {
                    bytes_done: self.written,
                }),
                true,
            );
        }
        (
            Ok(TransferTick::Progress {
                bytes_done: self.written,
                bytes_total: Some(self.total),
            }),
            false,
        )
    }
}

async fn open(path: &Path, offset: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    if offset == 0 {
        fs::File::create(path).await?;
    }
    Ok(())
}

async fn append(path: &Path, len: u64) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    file.write_all(&vec![b'x'; len as usize]).await?;
    file.flush().await
}

async fn stopped(path: &Path, reason: StopReason, bytes_done: u64) -> TransferTick {
    if !reason.keeps_partial_output() {
        let _ = fs::remove_file(path).await;
    }
    TransferTick::Stopped { reason, bytes_done }
}

// ============================================================================
// Converter
// ============================================================================

/// Converter that copies the input to a file with the target extension.
#[derive(Default)]
pub struct FakeConverter {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl FakeConverter {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaConverter for FakeConverter {
    async fn convert(&self, input: &Path, target_format: &str) -> Result<PathBuf, ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConversionError::Fatal("fake codec exploded".to_string()));
        }
        let output = input.with_extension(target_format);
        fs::copy(input, &output)
            .await
            .map_err(|e| ConversionError::Transient(e.to_string()))?;
        Ok(output)
    }
}
