//! Comparison orchestration
//!
//! Takes a validated submission through the full per-screenshot flow:
//! signature derivation, current persistence, baseline resolution, kernel
//! comparison, hotspot downgrade and event emission. At most one comparison
//! per signature runs at a time; a second submission for the same signature
//! waits and then observes the already-updated baseline.

use crate::baseline::{ArtifactKind, BaselineStore};
use crate::compare::{compare, CompareOptions, CompareOutcome, DiffMetrics};
use crate::events::{ComparisonStatus, EventBus, VizzlyEvent};
use crate::hotspot::HotspotAnalyzer;
use crate::input::{validate_properties, validate_screenshot_name};
use crate::metrics::Metrics;
use crate::signature::{derive_signature, signature_key};
use crate::{Config, VizzlyError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A fully resolved submission: image bytes already loaded and decoded from
/// whatever transport shape the client used.
#[derive(Debug, Clone)]
pub struct ScreenshotSubmission {
    pub name: String,
    pub image: Vec<u8>,
    pub properties: BTreeMap<String, Value>,
    pub threshold: Option<f64>,
    pub full_page: Option<bool>,
    pub build_id: Option<String>,
}

/// Outcome of one comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    /// No baseline existed; the submission became the baseline.
    New,
    Match {
        #[serde(rename = "hotspotFiltered")]
        hotspot_filtered: bool,
        /// Original metrics preserved when hotspot filtering downgraded a
        /// diff, so downstream tools can re-enable it.
        #[serde(skip_serializing_if = "Option::is_none")]
        suppressed: Option<DiffMetrics>,
    },
    Diff {
        #[serde(flatten)]
        metrics: DiffMetrics,
        #[serde(rename = "hotspotFiltered")]
        hotspot_filtered: bool,
    },
    /// Operator accepted current as the new baseline.
    BaselineUpdated,
    Error {
        reason: String,
    },
}

impl Verdict {
    pub fn status(&self) -> ComparisonStatus {
        match self {
            Verdict::New => ComparisonStatus::New,
            Verdict::Match { .. } => ComparisonStatus::Match,
            Verdict::Diff { .. } => ComparisonStatus::Diff,
            Verdict::BaselineUpdated => ComparisonStatus::BaselineUpdated,
            Verdict::Error { .. } => ComparisonStatus::Error,
        }
    }
}

/// Verdict plus the artifact paths a dashboard needs to render it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonRecord {
    pub id: String,
    pub name: String,
    pub signature: String,
    #[serde(flatten)]
    pub verdict: Verdict,
    #[serde(rename = "baselinePath")]
    pub baseline_path: PathBuf,
    #[serde(rename = "currentPath")]
    pub current_path: PathBuf,
    #[serde(rename = "diffPath")]
    pub diff_path: Option<PathBuf>,
}

pub struct ComparisonOrchestrator {
    store: BaselineStore,
    events: EventBus,
    config: Config,
    hotspot: Option<Arc<dyn HotspotAnalyzer>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    records: DashMap<String, ComparisonRecord>,
    metrics: Metrics,
}

impl ComparisonOrchestrator {
    pub fn new(
        store: BaselineStore,
        events: EventBus,
        config: Config,
        hotspot: Option<Arc<dyn HotspotAnalyzer>>,
    ) -> Self {
        Self {
            store,
            events,
            config,
            hotspot,
            locks: DashMap::new(),
            records: DashMap::new(),
            metrics: Metrics::new(),
        }
    }

    pub fn store(&self) -> &BaselineStore {
        &self.store
    }

    pub fn record(&self, id: &str) -> Option<ComparisonRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn records(&self) -> Vec<ComparisonRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    /// Runs one submission end to end and returns the verdict record.
    pub async fn process(
        &self,
        submission: ScreenshotSubmission,
    ) -> Result<ComparisonRecord, VizzlyError> {
        let name = validate_screenshot_name(&submission.name)?;
        let properties = validate_properties(&submission.properties)?;
        let signature = derive_signature(&name, &properties, &self.config.signature_properties);
        let key = signature_key(&signature);

        // Fine-grained keyed mutex: grab the signature's lock handle, drop
        // the map ref, then await the lock.
        let lock = {
            let entry = self
                .locks
                .entry(signature.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            entry.clone()
        };
        let _guard = lock.lock().await;

        let started = std::time::Instant::now();
        let current_path = self
            .store
            .save(ArtifactKind::Current, &key, &submission.image)
            .await?;
        let baseline_path = self.store.artifact_path(ArtifactKind::Baseline, &key)?;

        let verdict = if !self.store.exists(ArtifactKind::Baseline, &key).await? {
            self.store
                .save(ArtifactKind::Baseline, &key, &submission.image)
                .await?;
            info!("New baseline for {}", name);
            self.metrics.record_baseline_created();
            Verdict::New
        } else {
            let baseline = self.store.read(ArtifactKind::Baseline, &key).await?;
            let verdict = self
                .classify(&key, baseline, submission.image.clone(), submission.threshold)
                .await?;
            self.metrics.record_comparison(
                started.elapsed(),
                matches!(verdict, Verdict::Match { .. }),
            );
            verdict
        };

        let diff_path = match &verdict {
            Verdict::Diff { .. } => Some(self.store.artifact_path(ArtifactKind::Diff, &key)?),
            _ => None,
        };

        let record = ComparisonRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            signature,
            verdict,
            baseline_path,
            current_path,
            diff_path,
        };

        self.records.insert(record.id.clone(), record.clone());
        self.emit_record(&record);
        Ok(record)
    }

    async fn classify(
        &self,
        key: &str,
        baseline: Vec<u8>,
        current: Vec<u8>,
        threshold: Option<f64>,
    ) -> Result<Verdict, VizzlyError> {
        let options = CompareOptions {
            threshold: threshold.unwrap_or(self.config.comparison.threshold),
            min_cluster_size: self.config.comparison.min_cluster_size,
            ignore_antialiasing: self.config.comparison.ignore_antialiasing,
            ignore_regions: Vec::new(),
        };

        // The kernel is CPU-bound; keep it off the request path's executor.
        let outcome = tokio::task::spawn_blocking(move || compare(&baseline, &current, &options))
            .await
            .map_err(|e| VizzlyError::Io(format!("comparison task: {}", e)))??;

        match outcome {
            CompareOutcome::Match { .. } => {
                self.store.remove(ArtifactKind::Diff, key).await?;
                Ok(Verdict::Match {
                    hotspot_filtered: false,
                    suppressed: None,
                })
            }
            CompareOutcome::DimensionMismatch { baseline, current } => {
                // Surfaced as a verdict, never raised.
                Ok(Verdict::Error {
                    reason: format!(
                        "Dimension mismatch: baseline is {}x{}, current is {}x{}. \
                         Recapture at a matching viewport or accept the current image as the new baseline.",
                        baseline.0, baseline.1, current.0, current.1
                    ),
                })
            }
            CompareOutcome::Diff {
                metrics,
                diff_image,
            } => {
                self.store
                    .save(ArtifactKind::Diff, key, &diff_image)
                    .await?;
                if let Some(analyzer) = &self.hotspot {
                    let report = analyzer.analyze(&metrics.clusters);
                    if report.warrants_downgrade() {
                        warn!(
                            "Hotspot filter suppressed diff for {} (coverage {:.0}%)",
                            key,
                            report.coverage * 100.0
                        );
                        self.store.remove(ArtifactKind::Diff, key).await?;
                        return Ok(Verdict::Match {
                            hotspot_filtered: true,
                            suppressed: Some(metrics),
                        });
                    }
                }
                Ok(Verdict::Diff {
                    metrics,
                    hotspot_filtered: false,
                })
            }
        }
    }

    /// Promotes the comparison's current image to the baseline slot and
    /// rewrites the record as `BaselineUpdated`.
    pub async fn accept(&self, id: &str) -> Result<ComparisonRecord, VizzlyError> {
        let record = self
            .record(id)
            .ok_or_else(|| VizzlyError::validation("id", format!("unknown comparison: {}", id)))?;

        let key = signature_key(&record.signature);
        let lock = {
            let entry = self
                .locks
                .entry(record.signature.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            entry.clone()
        };
        let _guard = lock.lock().await;

        self.store.promote(&key).await?;
        self.store.remove(ArtifactKind::Diff, &key).await?;

        let updated = ComparisonRecord {
            verdict: Verdict::BaselineUpdated,
            diff_path: None,
            ..record
        };
        self.records.insert(updated.id.clone(), updated.clone());
        self.emit_record(&updated);
        Ok(updated)
    }

    /// Deletes all stored baseline/current/diff artifacts.
    pub async fn clear_baseline_data(&self) -> Result<(), VizzlyError> {
        self.records.clear();
        self.store.clear().await
    }

    fn emit_record(&self, record: &ComparisonRecord) {
        let metrics = match &record.verdict {
            Verdict::Diff { metrics, .. } => Some(metrics.clone()),
            Verdict::Match {
                suppressed: Some(metrics),
                ..
            } => Some(metrics.clone()),
            _ => None,
        };
        self.events.emit(VizzlyEvent::Comparison {
            id: record.id.clone(),
            name: record.name.clone(),
            status: record.verdict.status(),
            metrics,
        });
    }
}
