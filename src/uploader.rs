//! Content-addressed screenshot uploader
//!
//! Fingerprints every PNG under the screenshot directories by SHA-256, asks
//! the remote API which hashes it already has, streams only the new bytes
//! in sequential batches (concurrent within a batch), marks the build
//! complete, and optionally polls until server-side comparisons finish.
//! Validation problems are fatal before any network I/O; once the network
//! phase has begun, the first unrecoverable error fails the run.

use crate::error::extract_status_code;
use crate::events::{EventBus, VizzlyEvent};
use crate::metrics::Metrics;
use crate::VizzlyError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const SHA_CHECK_BATCH_SIZE: usize = 100;
const KNOWN_BROWSERS: &[&str] = &["chrome", "firefox", "safari", "edge", "webkit"];

/// Build identity sent to the remote API.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub name: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub message: Option<String>,
    pub environment: String,
    /// Shards sharing a parallel id merge into one logical build server-side
    #[serde(rename = "parallelId", skip_serializing_if = "Option::is_none")]
    pub parallel_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub screenshots_dirs: Vec<PathBuf>,
    pub api_url: String,
    pub token: String,
    pub build: BuildInfo,
    /// Files uploaded concurrently per batch; batches are sequential
    pub batch_size: usize,
    pub timeout: Duration,
    pub threshold: Option<f64>,
    pub wait: bool,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

/// One screenshot staged for upload.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub path: PathBuf,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub sha256: String,
    pub name: String,
    pub browser: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub total: usize,
    pub uploaded: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildWaitResult {
    pub status: String,
    pub comparisons: u64,
    #[serde(rename = "passedComparisons")]
    pub passed_comparisons: u64,
    #[serde(rename = "failedComparisons")]
    pub failed_comparisons: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub success: bool,
    #[serde(rename = "buildId")]
    pub build_id: String,
    pub url: String,
    pub stats: UploadStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<BuildWaitResult>,
}

#[derive(Debug, Deserialize)]
struct CreateBuildResponse {
    #[serde(rename = "buildId")]
    build_id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ShaCheckResponse {
    existing: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BuildStatusResponse {
    status: String,
    #[serde(rename = "comparisonsTotal", default)]
    comparisons_total: u64,
    #[serde(rename = "passedComparisons", default)]
    passed_comparisons: u64,
    #[serde(rename = "failedComparisons", default)]
    failed_comparisons: u64,
}

pub struct Uploader {
    client: reqwest::Client,
    options: UploadOptions,
    events: EventBus,
    metrics: Metrics,
}

impl Uploader {
    pub fn new(options: UploadOptions, events: EventBus) -> Result<Self, VizzlyError> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| VizzlyError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            options,
            events,
            metrics: Metrics::new(),
        })
    }

    /// Runs the full pipeline and returns the result record.
    pub async fn run(&self) -> Result<UploadResult, VizzlyError> {
        // Pre-flight validation, all before any network I/O.
        if self.options.token.is_empty() {
            return Err(VizzlyError::AuthRequired);
        }
        let paths = self.scan()?;
        self.events.emit(VizzlyEvent::Scanning { total: paths.len() });

        let items = self.process(paths).await?;
        let total = items.len();

        let build = self.create_build().await?;
        info!("Build {} created at {}", build.build_id, build.url);

        let (to_upload, existing) = self
            .deduplicate(&build.build_id, items)
            .await
            .map_err(normalize_upload_error)?;
        self.events.emit(VizzlyEvent::Deduplication {
            to_upload: to_upload.len(),
            existing: existing.len(),
            total,
        });

        let uploaded = match self.upload(&build.build_id, &to_upload).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                self.metrics.upload_failures.increment(1);
                return Err(normalize_upload_error(e));
            }
        };
        self.metrics.record_upload(uploaded, existing.len());
        self.complete_build(&build.build_id).await?;

        let wait = if self.options.wait {
            Some(self.wait_for_build(&build.build_id, total as u64).await?)
        } else {
            None
        };

        self.events.emit(VizzlyEvent::Completed {
            build_id: build.build_id.clone(),
            url: build.url.clone(),
        });

        Ok(UploadResult {
            success: true,
            build_id: build.build_id,
            url: build.url,
            stats: UploadStats {
                total,
                uploaded,
                skipped: existing.len(),
            },
            wait,
        })
    }

    /// Globs `**/*.png` under every configured directory.
    fn scan(&self) -> Result<Vec<PathBuf>, VizzlyError> {
        if self.options.screenshots_dirs.is_empty() {
            return Err(VizzlyError::validation(
                "screenshotsDir",
                "no screenshot directories configured",
            ));
        }
        let mut paths = Vec::new();
        for dir in &self.options.screenshots_dirs {
            if !dir.exists() {
                return Err(VizzlyError::validation(
                    "screenshotsDir",
                    format!("{} does not exist", dir.display()),
                ));
            }
            if !dir.is_dir() {
                return Err(VizzlyError::validation(
                    "screenshotsDir",
                    format!("{} is not a directory", dir.display()),
                ));
            }
            for entry in WalkDir::new(dir) {
                let entry = entry.map_err(|e| VizzlyError::Io(e.to_string()))?;
                if entry.file_type().is_file()
                    && entry.path().extension().is_some_and(|ext| ext == "png")
                {
                    paths.push(entry.into_path());
                }
            }
        }
        if paths.is_empty() {
            return Err(VizzlyError::validation(
                "screenshotsDir",
                "no screenshots found to upload",
            ));
        }
        paths.sort();
        Ok(paths)
    }

    /// Reads and fingerprints every file.
    async fn process(&self, paths: Vec<PathBuf>) -> Result<Vec<UploadItem>, VizzlyError> {
        let total = paths.len();
        let mut items = Vec::with_capacity(total);
        for (index, path) in paths.into_iter().enumerate() {
            let bytes = tokio::fs::read(&path).await?;
            items.push(build_item(path, bytes));
            self.events.emit(VizzlyEvent::Processing {
                current: index + 1,
                total,
            });
        }
        Ok(items)
    }

    async fn create_build(&self) -> Result<CreateBuildResponse, VizzlyError> {
        let url = format!("{}/api/sdk/builds", self.options.api_url.trim_end_matches('/'));
        let response = self
            .request_with_retry(|| {
                self.client
                    .post(&url)
                    .bearer_auth(&self.options.token)
                    .json(&self.options.build)
            })
            .await?;
        Ok(response.json().await?)
    }

    /// Partitions items into not-yet-known and already-known by querying the
    /// API in hash batches. The partition is lossless and disjoint.
    async fn deduplicate(
        &self,
        build_id: &str,
        items: Vec<UploadItem>,
    ) -> Result<(Vec<UploadItem>, Vec<UploadItem>), VizzlyError> {
        let url = format!(
            "{}/api/sdk/builds/{}/screenshots/check",
            self.options.api_url.trim_end_matches('/'),
            build_id
        );
        let mut known = HashSet::new();
        for batch in items.chunks(SHA_CHECK_BATCH_SIZE) {
            let shas: Vec<&str> = batch.iter().map(|i| i.sha256.as_str()).collect();
            let response = self
                .request_with_retry(|| {
                    self.client
                        .post(&url)
                        .bearer_auth(&self.options.token)
                        .json(&serde_json::json!({ "shas": shas }))
                })
                .await?;
            let parsed: ShaCheckResponse = response.json().await?;
            known.extend(parsed.existing);
        }
        Ok(partition_by_existing(items, &known))
    }

    /// Uploads in sequential batches; files within a batch go up
    /// concurrently to respect server rate budgets while keeping
    /// throughput.
    async fn upload(&self, build_id: &str, items: &[UploadItem]) -> Result<usize, VizzlyError> {
        let url = format!(
            "{}/api/sdk/builds/{}/screenshots",
            self.options.api_url.trim_end_matches('/'),
            build_id
        );
        let total = items.len();
        let mut uploaded = 0usize;
        for batch in items.chunks(self.options.batch_size.max(1)) {
            let futures: Vec<_> = batch
                .iter()
                .map(|item| self.upload_one(&url, item))
                .collect();
            for result in futures::future::join_all(futures).await {
                result?;
                uploaded += 1;
            }
            self.events.emit(VizzlyEvent::Uploading {
                current: uploaded,
                total,
            });
        }
        Ok(uploaded)
    }

    async fn upload_one(&self, url: &str, item: &UploadItem) -> Result<(), VizzlyError> {
        debug!("Uploading {} ({})", item.filename, item.sha256);
        let metadata = serde_json::json!({
            "name": item.name,
            "browser": item.browser,
            "viewport_width": item.viewport_width,
            "viewport_height": item.viewport_height,
            "sha256": item.sha256,
            "threshold": self.options.threshold,
        });
        let make_request = || {
            let part = reqwest::multipart::Part::bytes(item.bytes.clone())
                .file_name(item.filename.clone());
            let form = reqwest::multipart::Form::new()
                .part("file", part)
                .text("metadata", metadata.to_string());
            self.client
                .post(url)
                .bearer_auth(&self.options.token)
                .multipart(form)
        };
        self.request_with_retry(make_request).await?;
        Ok(())
    }

    async fn complete_build(&self, build_id: &str) -> Result<(), VizzlyError> {
        let url = format!(
            "{}/api/sdk/builds/{}/complete",
            self.options.api_url.trim_end_matches('/'),
            build_id
        );
        self.request_with_retry(|| self.client.post(&url).bearer_auth(&self.options.token))
            .await?;
        Ok(())
    }

    /// Polls build status at a fixed interval until the server has compared
    /// everything we submitted, or the wait budget runs out.
    async fn wait_for_build(
        &self,
        build_id: &str,
        submitted: u64,
    ) -> Result<BuildWaitResult, VizzlyError> {
        let url = format!(
            "{}/api/sdk/builds/{}",
            self.options.api_url.trim_end_matches('/'),
            build_id
        );
        let deadline = Instant::now() + self.options.wait_timeout;
        loop {
            let response = self
                .request_with_retry(|| self.client.get(&url).bearer_auth(&self.options.token))
                .await?;
            let status: BuildStatusResponse = response.json().await?;
            if status.comparisons_total >= submitted {
                return Ok(BuildWaitResult {
                    status: status.status,
                    comparisons: status.comparisons_total,
                    passed_comparisons: status.passed_comparisons,
                    failed_comparisons: status.failed_comparisons,
                });
            }
            if Instant::now() >= deadline {
                warn!(
                    "Build {} wait timed out with {}/{} comparisons",
                    build_id, status.comparisons_total, submitted
                );
                return Ok(BuildWaitResult {
                    status: "timeout".to_string(),
                    comparisons: status.comparisons_total,
                    passed_comparisons: status.passed_comparisons,
                    failed_comparisons: status.failed_comparisons,
                });
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Issues a request, retrying transient failures with exponential
    /// backoff before giving up with the status preserved.
    async fn request_with_retry<F>(&self, make_request: F) -> Result<reqwest::Response, VizzlyError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut delay = Duration::from_millis(200);
        let mut last_error = None;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            match make_request().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let error = VizzlyError::network(
                        status.to_string(),
                        format!("API request failed: {}", status),
                    );
                    // Client errors are not going to improve with retries.
                    if status < 500 {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
                Err(e) => {
                    let error = VizzlyError::from(e);
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            VizzlyError::network("unknown", "API request failed: unknown")
        }))
    }
}

/// Upload-phase failures carry the status code from the
/// "API request failed: <code>" message shape, "unknown" otherwise.
fn normalize_upload_error(error: VizzlyError) -> VizzlyError {
    match error {
        VizzlyError::Network { .. }
        | VizzlyError::Timeout { .. }
        | VizzlyError::AuthRequired
        | VizzlyError::AuthFailed(_) => error,
        other => VizzlyError::network(extract_status_code(&other.to_string()), other.to_string()),
    }
}

/// Splits items into (to_upload, existing) by the server's known-hash set.
pub fn partition_by_existing(
    items: Vec<UploadItem>,
    known: &HashSet<String>,
) -> (Vec<UploadItem>, Vec<UploadItem>) {
    items.into_iter().partition(|item| !known.contains(&item.sha256))
}

/// Builds an [`UploadItem`] from a path and its bytes.
pub fn build_item(path: PathBuf, bytes: Vec<u8>) -> UploadItem {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let sha256 = hex_digest(&bytes);
    let (name, browser, viewport_width, viewport_height) = parse_upload_filename(&filename);
    UploadItem {
        path,
        filename,
        bytes,
        sha256,
        name,
        browser,
        viewport_width,
        viewport_height,
    }
}

pub fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Derives `{name, browser, viewport}` from a screenshot filename.
///
/// The browser is whichever known engine name the stem mentions (chrome
/// when none); the viewport comes from a `<width>x<height>` token when
/// present, 1920x1080 otherwise.
pub fn parse_upload_filename(filename: &str) -> (String, String, u32, u32) {
    let stem = filename.strip_suffix(".png").unwrap_or(filename);
    let lower = stem.to_ascii_lowercase();

    let browser = KNOWN_BROWSERS
        .iter()
        .find(|b| lower.contains(*b))
        .map(|b| b.to_string())
        .unwrap_or_else(|| "chrome".to_string());

    let (width, height) = stem
        .split(|c: char| c == '-' || c == '_' || c == '@' || c == '.')
        .find_map(parse_dimensions)
        .unwrap_or((1920, 1080));

    (stem.to_string(), browser, width, height)
}

fn parse_dimensions(token: &str) -> Option<(u32, u32)> {
    let (w, h) = token.split_once('x')?;
    let width: u32 = w.parse().ok()?;
    let height: u32 = h.parse().ok()?;
    if (1..=10_000).contains(&width) && (1..=10_000).contains(&height) {
        Some((width, height))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dirs: Vec<PathBuf>, token: &str) -> UploadOptions {
        UploadOptions {
            screenshots_dirs: dirs,
            api_url: "http://127.0.0.1:9".to_string(),
            token: token.to_string(),
            build: BuildInfo {
                name: "test build".to_string(),
                branch: Some("main".to_string()),
                commit: None,
                message: None,
                environment: "test".to_string(),
                parallel_id: None,
            },
            batch_size: 10,
            timeout: Duration::from_millis(250),
            threshold: None,
            wait: false,
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_filename_browser_extraction() {
        let (name, browser, w, h) = parse_upload_filename("home-firefox.png");
        assert_eq!(name, "home-firefox");
        assert_eq!(browser, "firefox");
        assert_eq!((w, h), (1920, 1080));

        let (_, browser, _, _) = parse_upload_filename("checkout.png");
        assert_eq!(browser, "chrome");

        let (_, browser, _, _) = parse_upload_filename("Nav-WebKit-wide.png");
        assert_eq!(browser, "webkit");
    }

    #[test]
    fn test_filename_viewport_extraction() {
        let (_, _, w, h) = parse_upload_filename("home_375x667_chrome.png");
        assert_eq!((w, h), (375, 667));

        let (_, _, w, h) = parse_upload_filename("home@1280x720.png");
        assert_eq!((w, h), (1280, 720));

        // out-of-range token falls back to the default
        let (_, _, w, h) = parse_upload_filename("home-99999x1.png");
        assert_eq!((w, h), (1920, 1080));
    }

    #[test]
    fn test_sha256_digest() {
        // sha256 of the empty string
        assert_eq!(
            hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(hex_digest(b"a"), hex_digest(b"b"));
    }

    #[test]
    fn test_partition_is_lossless_and_disjoint() {
        let items: Vec<UploadItem> = (0..10)
            .map(|i| build_item(PathBuf::from(format!("{}.png", i)), vec![i as u8]))
            .collect();
        let known: HashSet<String> = items[..4].iter().map(|i| i.sha256.clone()).collect();

        let (to_upload, existing) = partition_by_existing(items.clone(), &known);
        assert_eq!(to_upload.len() + existing.len(), items.len());
        assert_eq!(existing.len(), 4);
        let upload_shas: HashSet<_> = to_upload.iter().map(|i| i.sha256.clone()).collect();
        let existing_shas: HashSet<_> = existing.iter().map(|i| i.sha256.clone()).collect();
        assert!(upload_shas.is_disjoint(&existing_shas));
        for item in &to_upload {
            assert!(!known.contains(&item.sha256));
        }
    }

    #[tokio::test]
    async fn test_missing_token_fatal_before_network() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.png"), b"png").unwrap();
        let uploader =
            Uploader::new(options(vec![dir.path().to_path_buf()], ""), EventBus::new()).unwrap();
        assert!(matches!(
            uploader.run().await,
            Err(VizzlyError::AuthRequired)
        ));
    }

    #[tokio::test]
    async fn test_missing_dir_fatal() {
        let uploader = Uploader::new(
            options(vec![PathBuf::from("/definitely/not/here")], "tok"),
            EventBus::new(),
        )
        .unwrap();
        assert!(matches!(
            uploader.run().await,
            Err(VizzlyError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_not_a_directory_fatal() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.png");
        std::fs::write(&file, b"png").unwrap();
        let uploader = Uploader::new(options(vec![file], "tok"), EventBus::new()).unwrap();
        assert!(matches!(
            uploader.run().await,
            Err(VizzlyError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_dir_fatal() {
        let dir = TempDir::new().unwrap();
        let uploader = Uploader::new(
            options(vec![dir.path().to_path_buf()], "tok"),
            EventBus::new(),
        )
        .unwrap();
        assert!(matches!(
            uploader.run().await,
            Err(VizzlyError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_scan_finds_nested_pngs_only() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.png"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b.png"), b"b").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let uploader = Uploader::new(
            options(vec![dir.path().to_path_buf()], "tok"),
            EventBus::new(),
        )
        .unwrap();
        let paths = uploader.scan().unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.extension().unwrap() == "png"));
    }
}
