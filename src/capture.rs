//! Capture pipeline
//!
//! Two producers share one skeleton: the static-site producer discovers
//! pages in a built HTML tree (sitemap or directory walk), the story
//! producer reads a story index. Discovered items are crossed with
//! viewports and walked through the tab pool at bounded concurrency; each
//! captured frame is routed by the run mode to the local comparison server,
//! the upload staging directory, or nowhere.

use crate::dispatcher::dispatch_bounded;
use crate::input::sanitize_derived_name;
use crate::mode::RunMode;
use crate::tab_pool::{CaptureParams, TabPool};
use crate::VizzlyError;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl Default for ViewportSpec {
    fn default() -> Self {
        Self {
            name: "desktop".to_string(),
            width: 1920,
            height: 1080,
        }
    }
}

/// One discovered capture target before the viewport cross product.
#[derive(Debug, Clone)]
pub struct CaptureTarget {
    /// Navigable URL (file:// for static sites, http:// for story hosts)
    pub url: String,
    /// Derived screenshot name (pre-sanitized)
    pub name: String,
    /// Per-item viewport override; empty means use the pipeline defaults
    pub viewports: Vec<ViewportSpec>,
    /// JS snippet run after navigation, before capture
    pub before_screenshot: Option<String>,
    pub capture: CaptureParams,
    pub skip: bool,
}

// --- static site producer ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StaticSiteOptions {
    #[serde(rename = "useSitemap")]
    pub use_sitemap: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    #[serde(rename = "fullPage")]
    pub full_page: bool,
}

/// Enumerates pages in a built HTML tree.
///
/// `index.html` maps to `/`, a nested `index.html` to its parent path.
/// Anything whose real path escapes the build root (symlinks out of the
/// tree) is dropped.
pub fn discover_static_site(
    build_dir: &Path,
    options: &StaticSiteOptions,
) -> Result<Vec<CaptureTarget>, VizzlyError> {
    if !build_dir.is_dir() {
        return Err(VizzlyError::validation(
            "buildDir",
            format!("{} is not a directory", build_dir.display()),
        ));
    }
    let root = build_dir
        .canonicalize()
        .map_err(|e| VizzlyError::Io(format!("{}: {}", build_dir.display(), e)))?;

    let url_paths = if options.use_sitemap {
        sitemap_paths(&root)?
    } else {
        walk_html_paths(&root)
    };

    let include = compile_patterns(&options.include, "include")?;
    let exclude = compile_patterns(&options.exclude, "exclude")?;

    let mut targets = Vec::new();
    for url_path in url_paths {
        if !include.is_empty() && !include.iter().any(|p| p.matches(&url_path)) {
            continue;
        }
        if exclude.iter().any(|p| p.matches(&url_path)) {
            debug!("Excluded page {}", url_path);
            continue;
        }
        let file = page_file(&root, &url_path);
        // Symlink targets outside the build root are rejected; a traversal
        // component in a literal name is fine as long as it resolves inside.
        match file.canonicalize() {
            Ok(real) if real.starts_with(&root) => {
                targets.push(CaptureTarget {
                    url: format!("file://{}", real.display()),
                    name: page_name(&url_path),
                    viewports: Vec::new(),
                    before_screenshot: None,
                    capture: CaptureParams {
                        full_page: options.full_page,
                        omit_background: false,
                    },
                    skip: false,
                });
            }
            Ok(real) => {
                warn!(
                    "Dropping {} (resolves outside build root: {})",
                    url_path,
                    real.display()
                );
            }
            Err(e) => {
                warn!("Dropping {}: {}", url_path, e);
            }
        }
    }
    info!("Discovered {} static pages", targets.len());
    Ok(targets)
}

fn compile_patterns(globs: &[String], field: &str) -> Result<Vec<Pattern>, VizzlyError> {
    globs
        .iter()
        .map(|g| {
            Pattern::new(g)
                .map_err(|e| VizzlyError::validation(field, format!("bad glob {:?}: {}", g, e)))
        })
        .collect()
}

fn walk_html_paths(root: &Path) -> Vec<String> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        if !entry.path().extension().is_some_and(|ext| ext == "html") {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        paths.push(relative_to_url_path(rel));
    }
    paths.sort();
    paths
}

fn relative_to_url_path(rel: &Path) -> String {
    let rel = rel.to_string_lossy().replace('\\', "/");
    if rel == "index.html" {
        return "/".to_string();
    }
    if let Some(parent) = rel.strip_suffix("/index.html") {
        return format!("/{}", parent);
    }
    format!("/{}", rel)
}

fn page_file(root: &Path, url_path: &str) -> PathBuf {
    let trimmed = url_path.trim_start_matches('/');
    if trimmed.is_empty() {
        root.join("index.html")
    } else if trimmed.ends_with(".html") {
        root.join(trimmed)
    } else {
        root.join(trimmed).join("index.html")
    }
}

/// Screenshot name for a URL path: separators become `-`, the root becomes
/// `index`, and the result goes through the sanitizer.
pub fn page_name(url_path: &str) -> String {
    let trimmed = url_path.trim_matches('/');
    if trimmed.is_empty() {
        return "index".to_string();
    }
    sanitize_derived_name(&trimmed.replace('/', "-").replace(".html", ""))
}

fn sitemap_paths(root: &Path) -> Result<Vec<String>, VizzlyError> {
    let sitemap = root.join("sitemap.xml");
    let content = std::fs::read_to_string(&sitemap)
        .map_err(|e| VizzlyError::Io(format!("{}: {}", sitemap.display(), e)))?;
    let mut paths = Vec::new();
    let mut rest = content.as_str();
    while let Some(start) = rest.find("<loc>") {
        let after = &rest[start + 5..];
        let Some(end) = after.find("</loc>") else {
            break;
        };
        let loc = after[..end].trim();
        let path = match url::Url::parse(loc) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => loc.to_string(),
        };
        paths.push(if path.is_empty() { "/".to_string() } else { path });
        rest = &after[end..];
    }
    Ok(paths)
}

// --- story catalog producer ---

#[derive(Debug, Clone, Deserialize)]
pub struct StoryIndex {
    pub stories: Vec<StoryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoryEntry {
    pub component: String,
    pub story: String,
    /// Story id used in the host URL; derived from component/story if absent
    pub id: Option<String>,
    #[serde(default)]
    pub vizzly: StoryOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoryOverrides {
    pub viewports: Vec<ViewportSpec>,
    #[serde(rename = "beforeScreenshot")]
    pub before_screenshot: Option<String>,
    pub skip: bool,
    pub screenshot: StoryScreenshot,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoryScreenshot {
    #[serde(rename = "fullPage")]
    pub full_page: bool,
    #[serde(rename = "omitBackground")]
    pub omit_background: bool,
}

/// Reads a story index file and maps each entry to a capture target on the
/// story host.
pub fn discover_stories(
    index_path: &Path,
    host_url: &str,
) -> Result<Vec<CaptureTarget>, VizzlyError> {
    let content = std::fs::read_to_string(index_path)
        .map_err(|e| VizzlyError::Io(format!("{}: {}", index_path.display(), e)))?;
    let index: StoryIndex = serde_json::from_str(&content)
        .map_err(|e| VizzlyError::validation("storyIndex", e.to_string()))?;

    let targets = index
        .stories
        .into_iter()
        .map(|entry| {
            let id = entry.id.unwrap_or_else(|| {
                format!(
                    "{}--{}",
                    slugify(&entry.component),
                    slugify(&entry.story)
                )
            });
            CaptureTarget {
                url: format!("{}/iframe.html?id={}", host_url.trim_end_matches('/'), id),
                name: sanitize_derived_name(&format!("{}/{}", entry.component, entry.story)),
                viewports: entry.vizzly.viewports,
                before_screenshot: entry.vizzly.before_screenshot,
                capture: CaptureParams {
                    full_page: entry.vizzly.screenshot.full_page,
                    omit_background: entry.vizzly.screenshot.omit_background,
                },
                skip: entry.vizzly.skip,
            }
        })
        .collect();
    Ok(targets)
}

fn slugify(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

// --- walk ---

/// Where captured frames go; decided once per run.
#[async_trait::async_trait]
pub trait FrameSink: Send + Sync {
    async fn submit(
        &self,
        name: &str,
        image: Vec<u8>,
        properties: BTreeMap<String, Value>,
    ) -> Result<(), VizzlyError>;
}

/// Sink routing per [`RunMode`]: POST to the local server, stage under the
/// screenshots directory, or drop.
pub struct ModeSink {
    mode: RunMode,
    client: reqwest::Client,
    staging_dir: PathBuf,
}

impl ModeSink {
    pub fn new(mode: RunMode, staging_dir: PathBuf) -> Self {
        Self {
            mode,
            client: reqwest::Client::new(),
            staging_dir,
        }
    }
}

#[async_trait::async_trait]
impl FrameSink for ModeSink {
    async fn submit(
        &self,
        name: &str,
        image: Vec<u8>,
        properties: BTreeMap<String, Value>,
    ) -> Result<(), VizzlyError> {
        match &self.mode {
            RunMode::Tdd { server_url } => {
                use base64::Engine;
                let body = serde_json::json!({
                    "name": name,
                    "image": base64::engine::general_purpose::STANDARD.encode(&image),
                    "type": "base64",
                    "properties": properties,
                });
                let response = self
                    .client
                    .post(format!("{}/screenshot", server_url.trim_end_matches('/')))
                    .json(&body)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(VizzlyError::network(
                        response.status().as_u16().to_string(),
                        format!("screenshot submission for {} rejected", name),
                    ));
                }
                Ok(())
            }
            RunMode::Cloud { .. } => {
                tokio::fs::create_dir_all(&self.staging_dir).await?;
                let path = self.staging_dir.join(format!("{}.png", name));
                tokio::fs::write(&path, &image).await?;
                debug!("Staged {} for upload", path.display());
                Ok(())
            }
            RunMode::Disabled => Ok(()),
        }
    }
}

/// A global interaction hook applied to targets whose name matches the
/// pattern; a per-item hook wins over these.
#[derive(Debug, Clone)]
pub struct GlobalHook {
    pub pattern: Pattern,
    pub script: String,
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub viewports: Vec<ViewportSpec>,
    pub concurrency: usize,
    pub hooks: Vec<GlobalHook>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            viewports: vec![ViewportSpec::default()],
            concurrency: 4,
            hooks: Vec::new(),
        }
    }
}

/// Per-item result of a walk.
#[derive(Debug)]
pub struct CapturedItem {
    pub name: String,
    pub result: Result<(), VizzlyError>,
}

#[derive(Debug)]
pub struct WalkSummary {
    pub total: usize,
    pub failures: Vec<(String, VizzlyError)>,
}

impl WalkSummary {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Walks `targets × viewports` through the pool and submits every frame.
///
/// A capture failure fails that item but the walk keeps going; the summary
/// reports success iff all items succeeded.
pub async fn walk_targets(
    pool: Arc<TabPool>,
    sink: Arc<dyn FrameSink>,
    targets: Vec<CaptureTarget>,
    options: WalkOptions,
) -> Result<WalkSummary, VizzlyError> {
    let mut items = Vec::new();
    for target in targets {
        if target.skip {
            debug!("Skipping {}", target.name);
            continue;
        }
        let viewports = if target.viewports.is_empty() {
            options.viewports.clone()
        } else {
            target.viewports.clone()
        };
        for viewport in viewports {
            items.push((target.clone(), viewport));
        }
    }
    let total = items.len();
    let hooks = Arc::new(options.hooks);

    let captured = dispatch_bounded(items, options.concurrency, move |(target, viewport)| {
        let pool = pool.clone();
        let sink = sink.clone();
        let hooks = hooks.clone();
        async move {
            let name = frame_name(&target.name, &viewport);
            let result = capture_one(&pool, sink.as_ref(), &target, &viewport, &hooks).await;
            if let Err(e) = &result {
                warn!("Capture failed for {}: {}", name, e);
            }
            Ok(CapturedItem { name, result })
        }
    })
    .await?;

    let failures = captured
        .into_iter()
        .filter_map(|item| item.result.err().map(|e| (item.name, e)))
        .collect();
    Ok(WalkSummary { total, failures })
}

fn frame_name(base: &str, viewport: &ViewportSpec) -> String {
    format!("{}@{}", base, viewport.name)
}

async fn capture_one(
    pool: &TabPool,
    sink: &dyn FrameSink,
    target: &CaptureTarget,
    viewport: &ViewportSpec,
    hooks: &[GlobalHook],
) -> Result<(), VizzlyError> {
    let tab = pool.acquire().await?;
    let result = async {
        let page = tab.page();
        page.set_viewport(viewport.width, viewport.height).await?;
        page.navigate(&target.url).await?;

        if let Some(script) = &target.before_screenshot {
            page.run_script(script).await?;
        } else if let Some(hook) = hooks.iter().find(|h| h.pattern.matches(&target.name)) {
            page.run_script(&hook.script).await?;
        }

        let image = page.capture(&target.capture).await?;
        let mut properties = BTreeMap::new();
        properties.insert("viewport".to_string(), Value::from(viewport.name.clone()));
        properties.insert("viewportWidth".to_string(), Value::from(viewport.width));
        properties.insert("viewportHeight".to_string(), Value::from(viewport.height));
        properties.insert("browser".to_string(), Value::from("chrome"));
        sink.submit(&frame_name(&target.name, viewport), image, properties)
            .await
    }
    .await;
    pool.release(tab).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_walk_discovers_html_tree() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "index.html", "<html/>");
        write(dir.path(), "about/index.html", "<html/>");
        write(dir.path(), "pricing.html", "<html/>");
        write(dir.path(), "styles/site.css", "body{}");

        let targets = discover_static_site(dir.path(), &StaticSiteOptions::default()).unwrap();
        let names: Vec<_> = targets.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["index", "about", "pricing"]);
    }

    #[test]
    fn test_index_html_maps_to_root() {
        assert_eq!(relative_to_url_path(Path::new("index.html")), "/");
        assert_eq!(relative_to_url_path(Path::new("about/index.html")), "/about");
        assert_eq!(relative_to_url_path(Path::new("pricing.html")), "/pricing.html");
    }

    #[test]
    fn test_page_name_derivation() {
        assert_eq!(page_name("/"), "index");
        assert_eq!(page_name("/about/team"), "about-team");
        assert_eq!(page_name("/pricing.html"), "pricing");
    }

    #[test]
    fn test_include_exclude_globs() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "index.html", "<html/>");
        write(dir.path(), "blog/post-1/index.html", "<html/>");
        write(dir.path(), "blog/post-2/index.html", "<html/>");
        write(dir.path(), "admin/index.html", "<html/>");

        let options = StaticSiteOptions {
            include: vec!["/blog/*".to_string()],
            ..Default::default()
        };
        let targets = discover_static_site(dir.path(), &options).unwrap();
        assert_eq!(targets.len(), 2);

        let options = StaticSiteOptions {
            exclude: vec!["/admin*".to_string()],
            ..Default::default()
        };
        let targets = discover_static_site(dir.path(), &options).unwrap();
        assert!(targets.iter().all(|t| !t.name.contains("admin")));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_outside_root_dropped() {
        let outside = TempDir::new().unwrap();
        write(outside.path(), "secret/index.html", "<html/>");
        let dir = TempDir::new().unwrap();
        write(dir.path(), "index.html", "<html/>");
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("leak"))
            .unwrap();

        let targets = discover_static_site(dir.path(), &StaticSiteOptions::default()).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "index");
    }

    #[test]
    fn test_sitemap_discovery() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "index.html", "<html/>");
        write(dir.path(), "features/index.html", "<html/>");
        write(
            dir.path(),
            "sitemap.xml",
            r#"<?xml version="1.0"?>
            <urlset>
              <url><loc>https://site.test/</loc></url>
              <url><loc>https://site.test/features</loc></url>
            </urlset>"#,
        );
        let options = StaticSiteOptions {
            use_sitemap: true,
            ..Default::default()
        };
        let targets = discover_static_site(dir.path(), &options).unwrap();
        let names: Vec<_> = targets.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["index", "features"]);
    }

    #[test]
    fn test_story_index_parsing() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "index.json",
            r#"{
              "stories": [
                {"component": "Button", "story": "Primary"},
                {"component": "Button", "story": "Disabled",
                 "vizzly": {"skip": true}},
                {"component": "Card", "story": "Wide",
                 "vizzly": {"viewports": [{"name": "mobile", "width": 375, "height": 667}],
                            "beforeScreenshot": "window.scrollTo(0,0)",
                            "screenshot": {"fullPage": true}}}
              ]
            }"#,
        );
        let targets =
            discover_stories(&dir.path().join("index.json"), "http://localhost:6006").unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].name, "Button_Primary");
        assert_eq!(
            targets[0].url,
            "http://localhost:6006/iframe.html?id=button--primary"
        );
        assert!(targets[1].skip);
        assert_eq!(targets[2].viewports.len(), 1);
        assert!(targets[2].capture.full_page);
        assert_eq!(
            targets[2].before_screenshot.as_deref(),
            Some("window.scrollTo(0,0)")
        );
    }

    struct RecordingSink {
        frames: StdMutex<Vec<(String, BTreeMap<String, Value>)>>,
    }

    #[async_trait::async_trait]
    impl FrameSink for RecordingSink {
        async fn submit(
            &self,
            name: &str,
            _image: Vec<u8>,
            properties: BTreeMap<String, Value>,
        ) -> Result<(), VizzlyError> {
            self.frames
                .lock()
                .unwrap()
                .push((name.to_string(), properties));
            Ok(())
        }
    }

    mod walk {
        use super::*;
        use crate::tab_pool::{
            BrowserDriver, TabContext, TabPage, TabPool, TabPoolConfig,
        };
        use async_trait::async_trait;

        struct StubPage {
            fail_url: Option<String>,
            visited: Arc<StdMutex<Vec<String>>>,
        }

        #[async_trait]
        impl TabPage for StubPage {
            async fn set_viewport(&self, _w: u32, _h: u32) -> Result<(), VizzlyError> {
                Ok(())
            }
            async fn navigate(&self, url: &str) -> Result<(), VizzlyError> {
                if self.fail_url.as_deref() == Some(url) {
                    return Err(VizzlyError::Page(format!("cannot load {}", url)));
                }
                self.visited.lock().unwrap().push(url.to_string());
                Ok(())
            }
            async fn run_script(&self, _script: &str) -> Result<(), VizzlyError> {
                Ok(())
            }
            async fn capture(&self, _params: &CaptureParams) -> Result<Vec<u8>, VizzlyError> {
                Ok(vec![0u8; 8])
            }
        }

        struct StubContext {
            page: Arc<StubPage>,
        }

        #[async_trait]
        impl TabContext for StubContext {
            fn page(&self) -> Arc<dyn TabPage> {
                self.page.clone()
            }
            async fn close(&mut self) -> Result<(), VizzlyError> {
                Ok(())
            }
        }

        struct StubDriver {
            fail_url: Option<String>,
            visited: Arc<StdMutex<Vec<String>>>,
        }

        #[async_trait]
        impl BrowserDriver for StubDriver {
            async fn new_context(&self) -> Result<Box<dyn TabContext>, VizzlyError> {
                Ok(Box::new(StubContext {
                    page: Arc::new(StubPage {
                        fail_url: self.fail_url.clone(),
                        visited: self.visited.clone(),
                    }),
                }))
            }
        }

        fn target(name: &str) -> CaptureTarget {
            CaptureTarget {
                url: format!("file:///site/{}.html", name),
                name: name.to_string(),
                viewports: Vec::new(),
                before_screenshot: None,
                capture: CaptureParams::default(),
                skip: false,
            }
        }

        #[tokio::test]
        async fn test_walk_crosses_viewports_and_submits() {
            let visited = Arc::new(StdMutex::new(Vec::new()));
            let driver = Arc::new(StubDriver {
                fail_url: None,
                visited: visited.clone(),
            });
            let pool = Arc::new(TabPool::new(driver, TabPoolConfig::default()));
            let sink = Arc::new(RecordingSink {
                frames: StdMutex::new(Vec::new()),
            });

            let options = WalkOptions {
                viewports: vec![
                    ViewportSpec {
                        name: "desktop".to_string(),
                        width: 1920,
                        height: 1080,
                    },
                    ViewportSpec {
                        name: "mobile".to_string(),
                        width: 375,
                        height: 667,
                    },
                ],
                concurrency: 2,
                hooks: Vec::new(),
            };
            let summary = walk_targets(
                pool,
                sink.clone(),
                vec![target("home"), target("about")],
                options,
            )
            .await
            .unwrap();

            assert_eq!(summary.total, 4);
            assert!(summary.success());
            let frames = sink.frames.lock().unwrap();
            assert_eq!(frames.len(), 4);
            let names: Vec<_> = frames.iter().map(|(n, _)| n.clone()).collect();
            assert!(names.contains(&"home@desktop".to_string()));
            assert!(names.contains(&"home@mobile".to_string()));
            let (_, props) = frames
                .iter()
                .find(|(n, _)| n == "home@mobile")
                .unwrap();
            assert_eq!(props["viewportWidth"], Value::from(375));
            assert_eq!(props["browser"], Value::from("chrome"));
        }

        #[tokio::test]
        async fn test_walk_records_failures_and_continues() {
            let visited = Arc::new(StdMutex::new(Vec::new()));
            let driver = Arc::new(StubDriver {
                fail_url: Some("file:///site/broken.html".to_string()),
                visited,
            });
            let pool = Arc::new(TabPool::new(driver, TabPoolConfig::default()));
            let sink = Arc::new(RecordingSink {
                frames: StdMutex::new(Vec::new()),
            });

            let summary = walk_targets(
                pool,
                sink.clone(),
                vec![target("home"), target("broken"), target("about")],
                WalkOptions {
                    concurrency: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

            assert_eq!(summary.total, 3);
            assert!(!summary.success());
            assert_eq!(summary.failures.len(), 1);
            assert_eq!(summary.failures[0].0, "broken@desktop");
            assert_eq!(sink.frames.lock().unwrap().len(), 2);
        }

        #[tokio::test]
        async fn test_per_item_viewport_override_wins() {
            let visited = Arc::new(StdMutex::new(Vec::new()));
            let driver = Arc::new(StubDriver {
                fail_url: None,
                visited,
            });
            let pool = Arc::new(TabPool::new(driver, TabPoolConfig::default()));
            let sink = Arc::new(RecordingSink {
                frames: StdMutex::new(Vec::new()),
            });

            let mut t = target("wide");
            t.viewports = vec![ViewportSpec {
                name: "ultrawide".to_string(),
                width: 3440,
                height: 1440,
            }];
            let summary = walk_targets(pool, sink.clone(), vec![t], WalkOptions::default())
                .await
                .unwrap();
            assert_eq!(summary.total, 1);
            let frames = sink.frames.lock().unwrap();
            assert_eq!(frames[0].0, "wide@ultrawide");
        }

        #[tokio::test]
        async fn test_skip_flag_drops_target() {
            let visited = Arc::new(StdMutex::new(Vec::new()));
            let driver = Arc::new(StubDriver {
                fail_url: None,
                visited,
            });
            let pool = Arc::new(TabPool::new(driver, TabPoolConfig::default()));
            let sink = Arc::new(RecordingSink {
                frames: StdMutex::new(Vec::new()),
            });

            let mut t = target("hidden");
            t.skip = true;
            let summary = walk_targets(pool, sink.clone(), vec![t], WalkOptions::default())
                .await
                .unwrap();
            assert_eq!(summary.total, 0);
            assert!(sink.frames.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_disabled_sink_drops_frames() {
        let dir = TempDir::new().unwrap();
        let sink = ModeSink::new(RunMode::Disabled, dir.path().join("staging"));
        sink.submit("home", vec![1, 2, 3], BTreeMap::new())
            .await
            .unwrap();
        assert!(!dir.path().join("staging").exists());
    }

    #[tokio::test]
    async fn test_cloud_sink_stages_file() {
        let dir = TempDir::new().unwrap();
        let sink = ModeSink::new(
            RunMode::Cloud {
                token: "tok".to_string(),
            },
            dir.path().join("staging"),
        );
        sink.submit("home@desktop", vec![9, 9], BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("staging/home@desktop.png")).unwrap(),
            vec![9, 9]
        );
    }
}
