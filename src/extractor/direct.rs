use super::{ExtractorError, Manifest, PlatformResolver, StreamDescriptor};
use crate::task::TaskOptions;
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "webm", "mkv", "avi", "mov", "flv", "m4v", "mp3", "m4a", "aac", "ogg", "opus", "wav",
    "flac",
];

/// Resolves URLs that point straight at a media file.
///
/// The manifest holds a single stream described by a HEAD request.
pub struct DirectMediaResolver {
    client: Client,
}

impl DirectMediaResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn media_extension(url: &Url) -> Option<String> {
        let file_name = url.path_segments()?.next_back()?;
        let (_, ext) = file_name.rsplit_once('.')?;
        let ext = ext.to_ascii_lowercase();
        MEDIA_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
    }

    fn title_for(url: &Url) -> Option<String> {
        let file_name = url.path_segments()?.next_back()?;
        let stem = file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(file_name);
        (!stem.is_empty()).then(|| stem.to_string())
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl PlatformResolver for DirectMediaResolver {
    async fn resolve(&self, url: &Url, _options: &TaskOptions) -> Result<Manifest, ExtractorError> {
        let extension = Self::media_extension(url).ok_or_else(|| {
            ExtractorError::Unsupported(format!("{} is not a direct media link", url))
        })?;

        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| ExtractorError::Transient(format!("HEAD {} failed: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ExtractorError::NotFound(url.to_string()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExtractorError::RateLimited {
                message: format!("{} answered 429", url),
                retry_after: retry_after(response.headers()),
            });
        }
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Err(ExtractorError::Transient(format!(
                "{} answered {}",
                url, status
            )));
        }
        if !status.is_success() {
            return Err(ExtractorError::Fatal(format!("{} answered {}", url, status)));
        }

        let headers = response.headers();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|size| *size > 0);
        let mimetype = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let mut stream = StreamDescriptor::new(url.as_str()).with_extension(extension);
        stream.size = size;
        stream.mimetype = mimetype;

        Ok(Manifest {
            streams: vec![stream],
            title: Self::title_for(url),
            duration_secs: None,
        })
    }
}
