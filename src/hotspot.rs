//! Hotspot analysis
//!
//! A hotspot is a region known to change for non-semantic reasons (clocks,
//! animations, ad slots). When enough of a comparison's clustered
//! differences fall inside hotspots with high confidence, the orchestrator
//! downgrades the verdict to a match while preserving the original metrics.

use crate::compare::{ClusterMetrics, Region};
use serde::{Deserialize, Serialize};

/// Confidence the analyzer assigns to its coverage estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HotspotConfidence {
    Low,
    Medium,
    High,
}

/// Result of analyzing one comparison's clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotspotReport {
    /// Fraction of clusters overlapping a hotspot, in [0, 1]
    pub coverage: f64,
    pub confidence: HotspotConfidence,
}

impl HotspotReport {
    /// Coverage at or above this fraction, with high confidence, downgrades
    /// a diff to a match.
    pub const DOWNGRADE_COVERAGE: f64 = 0.8;

    pub fn warrants_downgrade(&self) -> bool {
        self.coverage >= Self::DOWNGRADE_COVERAGE && self.confidence == HotspotConfidence::High
    }
}

/// Pluggable analyzer seam; the orchestrator runs whichever implementation
/// it was handed.
pub trait HotspotAnalyzer: Send + Sync {
    fn analyze(&self, clusters: &[ClusterMetrics]) -> HotspotReport;
}

/// Analyzer backed by a fixed list of known-volatile regions.
pub struct RegionHotspotAnalyzer {
    regions: Vec<Region>,
}

impl RegionHotspotAnalyzer {
    pub fn new(regions: Vec<Region>) -> Self {
        Self { regions }
    }
}

impl HotspotAnalyzer for RegionHotspotAnalyzer {
    fn analyze(&self, clusters: &[ClusterMetrics]) -> HotspotReport {
        if clusters.is_empty() || self.regions.is_empty() {
            return HotspotReport {
                coverage: 0.0,
                confidence: HotspotConfidence::Low,
            };
        }

        let mut overlapping = 0usize;
        let mut fully_contained = 0usize;
        for cluster in clusters {
            let bb = &cluster.bounding_box;
            if self.regions.iter().any(|r| r.intersects(bb)) {
                overlapping += 1;
                if self.regions.iter().any(|r| contains_region(r, bb)) {
                    fully_contained += 1;
                }
            }
        }

        let coverage = overlapping as f64 / clusters.len() as f64;
        // Containment drives confidence: a cluster spilling past its
        // hotspot may be a real regression bleeding into a volatile area.
        let confidence = if overlapping == 0 {
            HotspotConfidence::Low
        } else if fully_contained == overlapping {
            HotspotConfidence::High
        } else {
            HotspotConfidence::Medium
        };

        HotspotReport {
            coverage,
            confidence,
        }
    }
}

fn contains_region(outer: &Region, inner: &Region) -> bool {
    inner.x >= outer.x
        && inner.y >= outer.y
        && inner.x + inner.width <= outer.x + outer.width
        && inner.y + inner.height <= outer.y + outer.height
}
