//! HTTP transfer engine with ranged resume.

use super::{TickStream, TransferEngine, TransferError, TransferRequest, TransferTick};
use crate::lease::{StopReason, StopSignal};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpTransferSettings {
    /// Emit a progress tick after this many bytes...
    pub tick_bytes: u64,
    /// ...or after this much time, whichever comes first.
    pub tick_interval: Duration,
}

impl Default for HttpTransferSettings {
    fn default() -> Self {
        Self {
            tick_bytes: 256 * 1024,
            tick_interval: Duration::from_millis(500),
        }
    }
}

/// Streams HTTP(S) sources to disk, resuming with `Range` requests when the
/// source supports them.
#[derive(Clone)]
pub struct HttpTransferEngine {
    client: Client,
    settings: HttpTransferSettings,
}

impl HttpTransferEngine {
    pub fn new(client: Client, settings: HttpTransferSettings) -> Self {
        Self { client, settings }
    }
}

impl TransferEngine for HttpTransferEngine {
    fn transfer(&self, request: TransferRequest, stop: StopSignal) -> TickStream {
        let start = Phase::Connect(Box::new(Connect {
            client: self.client.clone(),
            settings: self.settings.clone(),
            request,
            stop,
        }));
        stream::unfold(start, |phase| async move {
            match phase {
                Phase::Connect(connect) => Some(connect.run().await),
                Phase::Streaming(streaming) => Some(streaming.next_tick().await),
                Phase::Done => None,
            }
        })
        .boxed()
    }
}

enum Phase {
    Connect(Box<Connect>),
    Streaming(Box<Streaming>),
    Done,
}

type Step = (Result<TransferTick, TransferError>, Phase);

struct Connect {
    client: Client,
    settings: HttpTransferSettings,
    request: TransferRequest,
    stop: StopSignal,
}

impl Connect {
    async fn run(self) -> Step {
        let path = self.request.output_path.clone();
        let offset = self.request.resume_offset;
        let stop = self.stop.clone();
        tokio::select! {
            biased;
            reason = stop.stopped() => (Ok(stopped(&path, reason, offset).await), Phase::Done),
            result = self.open() => match result {
                Ok((tick, streaming)) => (Ok(tick), Phase::Streaming(Box::new(streaming))),
                Err(e) => (Err(e), Phase::Done),
            },
        }
    }

    async fn send(&self, offset: u64) -> Result<Response, TransferError> {
        let mut builder = self.client.get(self.request.source.url.as_str());
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", offset));
        }
        builder
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))
    }

    async fn open(self) -> Result<(TransferTick, Streaming), TransferError> {
        let requested = self.request.resume_offset;
        let mut response = self.send(requested).await?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && requested > 0 {
            warn!(
                "Task {}: source rejected range from byte {}, restarting",
                self.request.task_id, requested
            );
            response = self.send(0).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Http {
                status: status.as_u16(),
                retry_after: response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok())
                    .map(Duration::from_secs),
            });
        }

        let partial = status == StatusCode::PARTIAL_CONTENT && requested > 0;
        let offset = if partial { requested } else { 0 };
        let headers = response.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let total = if partial {
            headers
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .or(content_length.map(|len| offset + len))
        } else {
            content_length
        }
        .or(self.request.source.size);
        let resumable = partial
            || headers
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        if requested > 0 && !partial {
            debug!(
                "Task {}: source ignored range request, discarding {} bytes",
                self.request.task_id, requested
            );
        }

        let path = self.request.output_path.clone();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = if partial {
            OpenOptions::new().append(true).create(true).open(&path).await?
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .await?
        };

        let streaming = Streaming {
            body: response.bytes_stream().boxed(),
            file,
            path,
            stop: self.stop,
            bytes_done: offset,
            total,
            last_tick_bytes: offset,
            last_tick_at: Instant::now(),
            settings: self.settings,
        };
        Ok((
            TransferTick::Started {
                offset,
                total,
                resumable,
            },
            streaming,
        ))
    }
}

struct Streaming {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    file: File,
    path: PathBuf,
    stop: StopSignal,
    bytes_done: u64,
    total: Option<u64>,
    last_tick_bytes: u64,
    last_tick_at: Instant,
    settings: HttpTransferSettings,
}

impl Streaming {
    async fn next_tick(mut self) -> Step {
        match self.pump().await {
            Ok(Some(tick)) => (Ok(tick), Phase::Streaming(Box::new(self))),
            Ok(None) => {
                let tick = self.finish().await;
                (tick, Phase::Done)
            }
            Err(e) => {
                if let Err(flush_err) = self.file.flush().await {
                    warn!("Failed to flush partial file {:?}: {}", self.path, flush_err);
                }
                (Err(e), Phase::Done)
            }
        }
    }

    /// Write chunks until a progress tick is due. `Ok(None)` means the body
    /// ended or a stop was requested.
    async fn pump(&mut self) -> Result<Option<TransferTick>, TransferError> {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.stop.token().cancelled() => return Ok(None),
                chunk = self.body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(None);
            };
            let chunk = chunk.map_err(|e| TransferError::Network(e.to_string()))?;
            self.file.write_all(&chunk).await?;
            self.bytes_done += chunk.len() as u64;

            if let Some(total) = self.total {
                if self.bytes_done > total {
                    return Err(TransferError::SizeMismatch {
                        expected: total,
                        actual: self.bytes_done,
                    });
                }
            }

            let due = self.bytes_done - self.last_tick_bytes >= self.settings.tick_bytes
                || self.last_tick_at.elapsed() >= self.settings.tick_interval;
            if due {
                self.last_tick_bytes = self.bytes_done;
                self.last_tick_at = Instant::now();
                return Ok(Some(TransferTick::Progress {
                    bytes_done: self.bytes_done,
                    bytes_total: self.total,
                }));
            }
        }
    }

    async fn finish(mut self) -> Result<TransferTick, TransferError> {
        self.file.flush().await?;
        if self.stop.is_stopped() {
            let reason = self.stop.reason().unwrap_or(StopReason::Shutdown);
            drop(self.file);
            return Ok(stopped(&self.path, reason, self.bytes_done).await);
        }
        self.file.sync_all().await?;
        if let Some(total) = self.total {
            if self.bytes_done != total {
                return Err(TransferError::SizeMismatch {
                    expected: total,
                    actual: self.bytes_done,
                });
            }
        }
        Ok(TransferTick::Finished {
            bytes_done: self.bytes_done,
        })
    }
}

async fn stopped(path: &Path, reason: StopReason, bytes_done: u64) -> TransferTick {
    if !reason.keeps_partial_output() {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial file {:?}: {}", path, e);
            }
        }
    }
    TransferTick::Stopped { reason, bytes_done }
}

/// Total size from a `Content-Range: bytes 100-999/1000` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 100-999/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[tokio::test]
    async fn test_stopped_before_connect_removes_partial_on_cancel() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("partial.mp4");
        tokio::fs::write(&path, b"partial").await.unwrap();

        let engine = HttpTransferEngine::new(Client::new(), HttpTransferSettings::default());
        let stop = StopSignal::new();
        stop.stop(StopReason::Cancel);
        let request = TransferRequest {
            task_id: "t".to_string(),
            source: crate::extractor::StreamDescriptor::new("http://127.0.0.1:9/never"),
            output_path: path.clone(),
            resume_offset: 7,
        };

        let ticks: Vec<_> = engine.transfer(request, stop).collect().await;
        assert_eq!(ticks.len(), 1);
        assert!(matches!(
            ticks[0],
            Ok(TransferTick::Stopped {
                reason: StopReason::Cancel,
                bytes_done: 7
            })
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stopped_before_connect_keeps_partial_on_pause() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("partial.mp4");
        tokio::fs::write(&path, b"partial").await.unwrap();

        let engine = HttpTransferEngine::new(Client::new(), HttpTransferSettings::default());
        let stop = StopSignal::new();
        stop.stop(StopReason::Pause);
        let request = TransferRequest {
            task_id: "t".to_string(),
            source: crate::extractor::StreamDescriptor::new("http://127.0.0.1:9/never"),
            output_path: path.clone(),
            resume_offset: 7,
        };

        let ticks: Vec<_> = engine.transfer(request, stop).collect().await;
        assert_eq!(ticks.len(), 1);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_oversized_body_fails_with_written_bytes_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("partial.mp4");
        let file = File::create(&path).await.unwrap();
        let body: Vec<reqwest::Result<Bytes>> = vec![Ok(Bytes::from_static(b"0123456789"))];

        let streaming = Streaming {
            body: stream::iter(body).boxed(),
            file,
            path: path.clone(),
            stop: StopSignal::new(),
            bytes_done: 0,
            total: Some(5),
            last_tick_bytes: 0,
            last_tick_at: Instant::now(),
            settings: HttpTransferSettings::default(),
        };

        let (result, phase) = streaming.next_tick().await;
        assert!(matches!(
            result,
            Err(TransferError::SizeMismatch {
                expected: 5,
                actual: 10
            })
        ));
        assert!(matches!(phase, Phase::Done));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
    }
}
