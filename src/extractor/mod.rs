//! Extractor gateway: turns a URL into a manifest of retrievable streams.
//!
//! Platform-specific resolution lives behind [`PlatformResolver`]; the
//! scheduler only sees [`ExtractorGateway`].

mod direct;
mod registry;

pub use direct::DirectMediaResolver;
pub use registry::{ExtractorRegistry, PlatformResolver, GENERIC_PLATFORM};

use crate::task::{FailureKind, Quality, TaskOptions};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// One retrievable stream for a URL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamDescriptor {
    pub url: String,
    /// Size in bytes, if the source reports it.
    pub size: Option<u64>,
    pub mimetype: Option<String>,
    /// Label such as "720p" or "audio".
    pub quality_label: Option<String>,
    /// File extension without the dot, e.g. "mp4".
    pub extension: Option<String>,
}

impl StreamDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    pub fn with_quality_label(mut self, label: impl Into<String>) -> Self {
        self.quality_label = Some(label.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Video height parsed from the quality label.
    pub fn height(&self) -> Option<u32> {
        self.quality_label
            .as_deref()
            .and_then(Quality::height_from_label)
    }

    pub fn is_audio_only(&self) -> bool {
        let audio_mime = self
            .mimetype
            .as_deref()
            .is_some_and(|m| m.starts_with("audio/"));
        let audio_label = self
            .quality_label
            .as_deref()
            .is_some_and(|l| l.eq_ignore_ascii_case("audio"));
        audio_mime || audio_label
    }

    /// Extension to use for the output file.
    pub fn file_extension(&self) -> String {
        if let Some(ext) = &self.extension {
            return ext.trim_start_matches('.').to_ascii_lowercase();
        }
        match self.mimetype.as_deref() {
            Some("video/webm") => "webm",
            Some("video/x-matroska") => "mkv",
            Some("audio/mpeg") => "mp3",
            Some("audio/mp4") => "m4a",
            Some("audio/ogg") => "ogg",
            Some("audio/wav") | Some("audio/x-wav") => "wav",
            Some("audio/flac") => "flac",
            _ => "mp4",
        }
        .to_string()
    }
}

/// Streams and metadata resolved for a URL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    pub streams: Vec<StreamDescriptor>,
    pub title: Option<String>,
    pub duration_secs: Option<u64>,
}

impl Manifest {
    /// Pick the stream that best matches `quality`.
    ///
    /// A height limit picks the tallest stream at or under the limit and falls
    /// back to the shortest one when every stream is taller. Streams without
    /// a known height rank below any stream with one.
    pub fn select(&self, quality: Quality) -> Option<&StreamDescriptor> {
        let video: Vec<&StreamDescriptor> =
            self.streams.iter().filter(|s| !s.is_audio_only()).collect();
        let rank = |s: &&StreamDescriptor| s.height().unwrap_or(0);

        match quality {
            Quality::Best => video
                .iter()
                .copied()
                .max_by_key(rank)
                .or_else(|| self.streams.first()),
            Quality::Worst => video
                .iter()
                .copied()
                .min_by_key(rank)
                .or_else(|| self.streams.first()),
            Quality::Height(limit) => video
                .iter()
                .copied()
                .filter(|s| s.height().map_or(true, |h| h <= limit))
                .max_by_key(rank)
                .or_else(|| video.iter().copied().min_by_key(rank))
                .or_else(|| self.streams.first()),
            Quality::AudioOnly => self
                .streams
                .iter()
                .find(|s| s.is_audio_only())
                .or_else(|| self.select(Quality::Best)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("Media not found: {0}")]
    NotFound(String),

    #[error("Unsupported URL: {0}")]
    Unsupported(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Transient extractor error: {0}")]
    Transient(String),

    #[error("Extractor error: {0}")]
    Fatal(String),
}

impl ExtractorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractorError::RateLimited { .. } | ExtractorError::Transient(_) => {
                FailureKind::Recoverable
            }
            ExtractorError::NotFound(_)
            | ExtractorError::Unsupported(_)
            | ExtractorError::Fatal(_) => FailureKind::Fatal,
        }
    }
}

/// Resolves URLs into manifests.
#[async_trait]
pub trait ExtractorGateway: Send + Sync {
    /// Platform tag for `url`. Must not touch the network.
    fn classify(&self, url: &url::Url) -> String;

    /// Resolve `url` into a manifest. May be slow; callers time-box it.
    async fn resolve(&self, url: &str, options: &TaskOptions) -> Result<Manifest, ExtractorError>;
}
