//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestScheduler, TransferMode, GENERIC_URL};
//! use mediaq::task::{TaskOptions, TaskState};
//!
//! #[tokio::test]
//! async fn test_download_completes() {
//!     let harness = TestScheduler::new(TransferMode::Complete);
//!     harness.start();
//!
//!     let id = harness
//!         .scheduler
//!         .submit(&format!("{}1", GENERIC_URL), TaskOptions::default())
//!         .unwrap();
//!     harness.wait_for_state(&id, TaskState::Completed).await;
//! }
//! ```

#![allow(dead_code, unused_imports)]

mod constants;
mod fakes;
mod harness;
mod media_server;

pub use constants::*;
pub use fakes::{
    default_manifest, ExtractMode, FakeConverter, FakeExtractor, FakeTransferEngine, TransferMode,
};
pub use harness::{fast_settings, TestScheduler};
pub use media_server::{media_bytes, MediaServer, BUSY_PATH, CLIP_PATH, MISSING_PATH};
