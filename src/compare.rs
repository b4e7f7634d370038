//! Pixel comparison kernel
//!
//! Compares two PNG byte arrays with a perceptual (CIEDE2000) color
//! distance, suppresses antialiasing artifacts via a local gradient
//! heuristic, groups the remaining differences into connected clusters and
//! renders a diff visualization. Dimension mismatch is a tagged outcome,
//! not an error.

use crate::VizzlyError;
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// An axis-aligned rectangle; bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x
            && y >= self.y
            && x <= self.x.saturating_add(self.width.saturating_sub(1))
            && y <= self.y.saturating_add(self.height.saturating_sub(1))
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.x <= other.x + other.width.saturating_sub(1)
            && other.x <= self.x + self.width.saturating_sub(1)
            && self.y <= other.y + other.height.saturating_sub(1)
            && other.y <= self.y + self.height.saturating_sub(1)
    }
}

/// Options for one comparison run.
#[derive(Debug, Clone)]
pub struct CompareOptions {
    /// ΔE at or below this value counts as matching
    pub threshold: f64,
    /// Clusters with fewer pixels than this are discarded
    pub min_cluster_size: usize,
    /// Exclude pixels flagged as antialiasing artifacts
    pub ignore_antialiasing: bool,
    /// Rectangles excluded from consideration entirely
    pub ignore_regions: Vec<Region>,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            threshold: 2.0,
            min_cluster_size: 2,
            ignore_antialiasing: true,
            ignore_regions: Vec::new(),
        }
    }
}

/// A connected component of changed pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetrics {
    #[serde(rename = "pixelCount")]
    pub pixel_count: u64,
    #[serde(rename = "boundingBox")]
    pub bounding_box: Region,
}

/// Metrics for a comparison that found differences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffMetrics {
    #[serde(rename = "diffPercentage")]
    pub diff_percentage: f64,
    #[serde(rename = "diffPixels")]
    pub diff_pixels: u64,
    #[serde(rename = "totalPixels")]
    pub total_pixels: u64,
    #[serde(rename = "boundingBox")]
    pub bounding_box: Region,
    pub clusters: Vec<ClusterMetrics>,
    #[serde(rename = "aaPixelsIgnored")]
    pub aa_pixels_ignored: u64,
}

/// Outcome of one kernel invocation.
#[derive(Debug, Clone)]
pub enum CompareOutcome {
    Match {
        aa_pixels_ignored: u64,
    },
    DimensionMismatch {
        baseline: (u32, u32),
        current: (u32, u32),
    },
    Diff {
        metrics: DiffMetrics,
        diff_image: Vec<u8>,
    },
}

/// Rejects anything that is not a PNG before decode work starts.
pub fn validate_png(bytes: &[u8]) -> Result<(), VizzlyError> {
    if bytes.len() < PNG_SIGNATURE.len() || bytes[..8] != PNG_SIGNATURE {
        return Err(VizzlyError::validation(
            "image",
            "not a valid PNG (bad signature)",
        ));
    }
    Ok(())
}

/// Compares baseline and current PNG bytes.
pub fn compare(
    baseline: &[u8],
    current: &[u8],
    options: &CompareOptions,
) -> Result<CompareOutcome, VizzlyError> {
    validate_png(baseline)?;
    validate_png(current)?;

    let baseline_img = decode(baseline, "baseline")?;
    let current_img = decode(current, "current")?;

    if baseline_img.dimensions() != current_img.dimensions() {
        return Ok(CompareOutcome::DimensionMismatch {
            baseline: baseline_img.dimensions(),
            current: current_img.dimensions(),
        });
    }

    let (width, height) = baseline_img.dimensions();
    let total_pixels = width as u64 * height as u64;
    let mut mask = vec![false; (width * height) as usize];
    let mut aa_pixels_ignored = 0u64;

    for y in 0..height {
        for x in 0..width {
            if options.ignore_regions.iter().any(|r| r.contains(x, y)) {
                continue;
            }
            let bp = baseline_img.get_pixel(x, y);
            let cp = current_img.get_pixel(x, y);
            if bp == cp {
                continue;
            }
            if delta_e(bp, cp) <= options.threshold {
                continue;
            }
            if options.ignore_antialiasing
                && (is_antialiased(&baseline_img, x, y) || is_antialiased(&current_img, x, y))
            {
                aa_pixels_ignored += 1;
                continue;
            }
            mask[(y * width + x) as usize] = true;
        }
    }

    let clusters = find_clusters(&mask, width, height, options.min_cluster_size);
    if clusters.is_empty() {
        return Ok(CompareOutcome::Match { aa_pixels_ignored });
    }

    // Rebuild the mask from surviving clusters only so discarded specks
    // neither count nor render.
    let mut retained = vec![false; mask.len()];
    let mut diff_pixels = 0u64;
    for cluster in &clusters {
        for &idx in &cluster.pixel_indices {
            retained[idx] = true;
        }
        diff_pixels += cluster.pixel_indices.len() as u64;
    }

    let bounding_box = clusters
        .iter()
        .map(|c| c.bounding_box)
        .reduce(merge_regions)
        .unwrap_or(Region::new(0, 0, 0, 0));

    let diff_image = render_diff(&current_img, &retained, width, height)?;

    Ok(CompareOutcome::Diff {
        metrics: DiffMetrics {
            diff_percentage: diff_pixels as f64 / total_pixels as f64 * 100.0,
            diff_pixels,
            total_pixels,
            bounding_box,
            clusters: clusters
                .into_iter()
                .map(|c| ClusterMetrics {
                    pixel_count: c.pixel_indices.len() as u64,
                    bounding_box: c.bounding_box,
                })
                .collect(),
            aa_pixels_ignored,
        },
        diff_image,
    })
}

fn decode(bytes: &[u8], which: &str) -> Result<RgbaImage, VizzlyError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| VizzlyError::validation("image", format!("cannot decode {}: {}", which, e)))
}

fn merge_regions(a: Region, b: Region) -> Region {
    let x0 = a.x.min(b.x);
    let y0 = a.y.min(b.y);
    let x1 = (a.x + a.width).max(b.x + b.width);
    let y1 = (a.y + a.height).max(b.y + b.height);
    Region::new(x0, y0, x1 - x0, y1 - y0)
}

struct Cluster {
    pixel_indices: Vec<usize>,
    bounding_box: Region,
}

/// Connected components (8-connectivity) over the diff mask; components
/// smaller than `min_size` are dropped.
fn find_clusters(mask: &[bool], width: u32, height: u32, min_size: usize) -> Vec<Cluster> {
    let mut visited = vec![false; mask.len()];
    let mut clusters = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        let mut pixels = Vec::new();
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        visited[start] = true;
        stack.push(start);

        while let Some(idx) = stack.pop() {
            pixels.push(idx);
            let x = idx as u32 % width;
            let y = idx as u32 / width;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    let nidx = (ny as u32 * width + nx as u32) as usize;
                    if mask[nidx] && !visited[nidx] {
                        visited[nidx] = true;
                        stack.push(nidx);
                    }
                }
            }
        }

        if pixels.len() >= min_size {
            clusters.push(Cluster {
                pixel_indices: pixels,
                bounding_box: Region::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1),
            });
        }
    }
    clusters
}

/// Diff visualization: changed pixels in red over a dimmed current frame.
fn render_diff(
    current: &RgbaImage,
    retained: &[bool],
    width: u32,
    height: u32,
) -> Result<Vec<u8>, VizzlyError> {
    let mut diff_img = RgbaImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let px = current.get_pixel(x, y);
            let out = if retained[(y * width + x) as usize] {
                Rgba([255, px[1] / 3, px[2] / 3, 255])
            } else {
                Rgba([px[0] / 2, px[1] / 2, px[2] / 2, px[3]])
            };
            diff_img.put_pixel(x, y, out);
        }
    }
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgba8(diff_img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| VizzlyError::Io(format!("diff image encode: {}", e)))?;
    Ok(buf)
}

// --- perceptual distance ---

fn blend_on_white(px: &Rgba<u8>) -> (f64, f64, f64) {
    let a = px[3] as f64 / 255.0;
    let blend = |c: u8| (c as f64 * a + 255.0 * (1.0 - a)) / 255.0;
    (blend(px[0]), blend(px[1]), blend(px[2]))
}

fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn rgb_to_lab(px: &Rgba<u8>) -> (f64, f64, f64) {
    let (r, g, b) = blend_on_white(px);
    let (r, g, b) = (srgb_to_linear(r), srgb_to_linear(g), srgb_to_linear(b));

    // sRGB to XYZ, D65 white point
    let x = (r * 0.4124564 + g * 0.3575761 + b * 0.1804375) / 0.95047;
    let y = r * 0.2126729 + g * 0.7151522 + b * 0.0721750;
    let z = (r * 0.0193339 + g * 0.1191920 + b * 0.9503041) / 1.08883;

    let f = |t: f64| {
        if t > 0.008856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    };
    let (fx, fy, fz) = (f(x), f(y), f(z));
    (116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
}

/// CIEDE2000 color difference between two pixels.
pub fn delta_e(p1: &Rgba<u8>, p2: &Rgba<u8>) -> f64 {
    let (l1, a1, b1) = rgb_to_lab(p1);
    let (l2, a2, b2) = rgb_to_lab(p2);

    let c1 = (a1 * a1 + b1 * b1).sqrt();
    let c2 = (a2 * a2 + b2 * b2).sqrt();
    let c_bar = (c1 + c2) / 2.0;
    let c_bar7 = c_bar.powi(7);
    let pow25_7 = 25.0f64.powi(7);
    let g = 0.5 * (1.0 - (c_bar7 / (c_bar7 + pow25_7)).sqrt());

    let ap1 = (1.0 + g) * a1;
    let ap2 = (1.0 + g) * a2;
    let cp1 = (ap1 * ap1 + b1 * b1).sqrt();
    let cp2 = (ap2 * ap2 + b2 * b2).sqrt();

    let hp = |ap: f64, b: f64| {
        if ap == 0.0 && b == 0.0 {
            0.0
        } else {
            b.atan2(ap).to_degrees().rem_euclid(360.0)
        }
    };
    let hp1 = hp(ap1, b1);
    let hp2 = hp(ap2, b2);

    let dl = l2 - l1;
    let dc = cp2 - cp1;
    let dhp = if cp1 * cp2 == 0.0 {
        0.0
    } else {
        let mut d = hp2 - hp1;
        if d > 180.0 {
            d -= 360.0;
        } else if d < -180.0 {
            d += 360.0;
        }
        d
    };
    let dh = 2.0 * (cp1 * cp2).sqrt() * (dhp.to_radians() / 2.0).sin();

    let l_bar = (l1 + l2) / 2.0;
    let cp_bar = (cp1 + cp2) / 2.0;
    let hp_bar = if cp1 * cp2 == 0.0 {
        hp1 + hp2
    } else {
        let sum = hp1 + hp2;
        if (hp1 - hp2).abs() <= 180.0 {
            sum / 2.0
        } else if sum < 360.0 {
            (sum + 360.0) / 2.0
        } else {
            (sum - 360.0) / 2.0
        }
    };

    let t = 1.0 - 0.17 * (hp_bar - 30.0).to_radians().cos()
        + 0.24 * (2.0 * hp_bar).to_radians().cos()
        + 0.32 * (3.0 * hp_bar + 6.0).to_radians().cos()
        - 0.20 * (4.0 * hp_bar - 63.0).to_radians().cos();

    let d_theta = 30.0 * (-((hp_bar - 275.0) / 25.0).powi(2)).exp();
    let cp_bar7 = cp_bar.powi(7);
    let rc = 2.0 * (cp_bar7 / (cp_bar7 + pow25_7)).sqrt();
    let sl = 1.0 + (0.015 * (l_bar - 50.0).powi(2)) / (20.0 + (l_bar - 50.0).powi(2)).sqrt();
    let sc = 1.0 + 0.045 * cp_bar;
    let sh = 1.0 + 0.015 * cp_bar * t;
    let rt = -((2.0 * d_theta).to_radians()).sin() * rc;

    ((dl / sl).powi(2) + (dc / sc).powi(2) + (dh / sh).powi(2) + rt * (dc / sc) * (dh / sh)).sqrt()
}

// --- antialiasing heuristic ---

fn luma(px: &Rgba<u8>) -> f64 {
    let (r, g, b) = blend_on_white(px);
    0.299 * r + 0.587 * g + 0.114 * b
}

/// A pixel counts as an antialiasing artifact when it sits on a luminance
/// edge: among its neighbors there is both a clearly darker and a clearly
/// brighter pixel, and at most two neighbors share its own luminance.
fn is_antialiased(img: &RgbaImage, x: u32, y: u32) -> bool {
    let (width, height) = img.dimensions();
    let center = luma(img.get_pixel(x, y));
    let mut darker = 0u32;
    let mut brighter = 0u32;
    let mut equal = 0u32;

    for dy in -1i64..=1 {
        for dx in -1i64..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = x as i64 + dx;
            let ny = y as i64 + dy;
            if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                continue;
            }
            let neighbor = luma(img.get_pixel(nx as u32, ny as u32));
            let delta = neighbor - center;
            if delta.abs() < 0.016 {
                equal += 1;
            } else if delta < 0.0 {
                darker += 1;
            } else {
                brighter += 1;
            }
        }
    }

    darker > 0 && brighter > 0 && equal <= 2
}
