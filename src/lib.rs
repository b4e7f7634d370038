//! # Vizzly
//!
//! A visual regression testing toolkit. Screenshots produced by external
//! test runners are compared against stored baselines with a perceptual
//! pixel kernel, either locally through a long-lived comparison server (TDD
//! mode) or by batching content-addressed uploads to a remote build API
//! (cloud mode). A bounded browser tab pool and a concurrency-limited
//! dispatcher drive the capture producers for static sites and story
//! catalogs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vizzly::{
//!     BaselineStore, ComparisonOrchestrator, Config, EventBus, ScreenshotSubmission,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = BaselineStore::new(".");
//!     store.initialize().await?;
//!     let orchestrator = Arc::new(ComparisonOrchestrator::new(
//!         store,
//!         EventBus::new(),
//!         Config::default(),
//!         None,
//!     ));
//!
//!     let record = orchestrator
//!         .process(ScreenshotSubmission {
//!             name: "home".to_string(),
//!             image: std::fs::read("home.png")?,
//!             properties: Default::default(),
//!             threshold: None,
//!             full_page: None,
//!             build_id: None,
//!         })
//!         .await?;
//!     println!("{}: {:?}", record.name, record.verdict);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! # Iterate locally against a comparison server
//! vizzly run npm test
//!
//! # Upload a directory of screenshots for team review
//! vizzly upload ./screenshots --branch main --wait
//! ```

/// Filesystem-backed baseline/current/diff store
pub mod baseline;

/// Chromium-backed implementation of the tab driver traits
pub mod browser;

/// Capture pipeline: producers, walk, frame routing
pub mod capture;

/// Pixel comparison kernel
pub mod compare;

/// Configuration and global config files
pub mod config;

/// Command-line interface implementation
pub mod cli;

/// Bounded fail-fast task dispatcher
pub mod dispatcher;

/// Error types and helpers
pub mod error;

/// Typed progress/comparison event bus
pub mod events;

/// Hotspot analysis for volatile regions
pub mod hotspot;

/// Submission validation and image input detection
pub mod input;

/// Performance metrics collection
pub mod metrics;

/// Run-mode detection (tdd / cloud / disabled)
pub mod mode;

/// Per-screenshot comparison orchestration
pub mod orchestrator;

/// Local comparison server
pub mod server;

/// Signature derivation
pub mod signature;

/// Bounded browser tab pool
pub mod tab_pool;

/// Content-addressed uploader
pub mod uploader;

#[cfg(test)]
mod tests;

pub use baseline::{ArtifactKind, BaselineStore};
pub use cli::{setup_logging, Cli, CliRunner, Commands};
pub use compare::{compare as compare_images, CompareOptions, CompareOutcome, DiffMetrics, Region};
pub use config::{Config, GlobalConfig};
pub use error::{ErrorSeverity, VizzlyError};
pub use events::{ComparisonStatus, EventBus, VizzlyEvent};
pub use hotspot::{HotspotAnalyzer, HotspotReport, RegionHotspotAnalyzer};
pub use mode::{detect_mode, RunMode, ServerSentinel};
pub use orchestrator::{ComparisonOrchestrator, ComparisonRecord, ScreenshotSubmission, Verdict};
pub use tab_pool::{TabPool, TabPoolConfig, TabPoolStats};
pub use uploader::{UploadOptions, UploadResult, UploadStats, Uploader};
