//! Post-transfer conversion using ffmpeg.

use crate::task::{FailureKind, AUDIO_FORMATS, SUPPORTED_FORMATS};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Conversion interrupted: {0}")]
    Transient(String),

    #[error("Conversion failed: {0}")]
    Fatal(String),
}

impl ConversionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConversionError::Transient(_) => FailureKind::Recoverable,
            ConversionError::UnsupportedFormat(_) | ConversionError::Fatal(_) => FailureKind::Fatal,
        }
    }
}

/// Converts a finished download into another format.
#[async_trait]
pub trait MediaConverter: Send + Sync {
    /// Convert `input` to `target_format`, returning the output path.
    ///
    /// Dropping the returned future must abort the conversion.
    async fn convert(&self, input: &Path, target_format: &str) -> Result<PathBuf, ConversionError>;
}

/// Converter backed by an `ffmpeg` executable.
#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    binary: PathBuf,
}

impl FfmpegConverter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegConverter {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl MediaConverter for FfmpegConverter {
    async fn convert(&self, input: &Path, target_format: &str) -> Result<PathBuf, ConversionError> {
        let format = target_format.to_ascii_lowercase();
        if !SUPPORTED_FORMATS.contains(&format.as_str()) {
            return Err(ConversionError::UnsupportedFormat(format));
        }
        let current = input
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if current.as_deref() == Some(format.as_str()) {
            return Ok(input.to_path_buf());
        }

        let output_path = input.with_extension(&format);
        let mut command = Command::new(&self.binary);
        command
            .arg("-nostdin")
            .arg("-y")
            .arg("-i")
            .arg(input);
        if AUDIO_FORMATS.contains(&format.as_str()) {
            command.arg("-vn");
        }
        command
            .arg(&output_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Converting {:?} to {:?}", input, output_path);
        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConversionError::Fatal(format!("{:?} not found", self.binary))
            } else {
                ConversionError::Transient(e.to_string())
            }
        })?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&output_path).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().last().unwrap_or("ffmpeg exited with an error");
            return Err(ConversionError::Fatal(reason.to_string()));
        }

        Ok(output_path)
    }
}
