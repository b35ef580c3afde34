//! Shared constants for end-to-end tests

use std::time::Duration;

// ============================================================================
// Source URLs
// ============================================================================

/// Prefix for URLs the fake extractor classifies as `youtube`
pub const YOUTUBE_URL: &str = "https://www.youtube.com/watch?v=";

/// Prefix for URLs the fake extractor classifies as `vimeo`
pub const VIMEO_URL: &str = "https://vimeo.com/";

/// Prefix for URLs the fake extractor classifies as `generic`
pub const GENERIC_URL: &str = "https://media.example.com/clip-";

// ============================================================================
// Fake media
// ============================================================================

/// Size of the 720p stream served by the fake extractor
pub const MEDIA_720P_SIZE: u64 = 1000;

/// Size of the 1080p stream served by the fake extractor
pub const MEDIA_1080P_SIZE: u64 = 2000;

/// Size of the 360p stream served by the fake extractor
pub const MEDIA_360P_SIZE: u64 = 400;

/// Number of chunks the fake transfer engine splits a stream into
pub const FAKE_CHUNKS: u64 = 10;

// ============================================================================
// Timing
// ============================================================================

/// How long `wait_*` helpers poll before failing the test
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval of `wait_*` helpers
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
