#[cfg(test)]
mod integration_tests {
    use crate::baseline::BaselineStore;
    use crate::capture::{walk_targets, CaptureTarget, FrameSink, WalkOptions};
    use crate::config::ComparisonConfig;
    use crate::events::ComparisonStatus;
    use crate::mode::{detect_mode, write_sentinel, RunMode, ServerSentinel};
    use crate::orchestrator::{ComparisonOrchestrator, ScreenshotSubmission, Verdict};
    use crate::tab_pool::{
        BrowserDriver, CaptureParams, TabContext, TabPage, TabPool, TabPoolConfig,
    };
    use crate::{Config, EventBus, VizzlyError};
    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn png(color: [u8; 4]) -> Vec<u8> {
        let mut img = RgbaImage::new(12, 12);
        for px in img.pixels_mut() {
            *px = Rgba(color);
        }
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    async fn orchestrator_with(
        dir: &TempDir,
        signature_properties: Vec<String>,
    ) -> Arc<ComparisonOrchestrator> {
        let store = BaselineStore::new(dir.path());
        store.initialize().await.unwrap();
        let config = Config {
            signature_properties,
            comparison: ComparisonConfig {
                ignore_antialiasing: false,
                min_cluster_size: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        Arc::new(ComparisonOrchestrator::new(
            store,
            EventBus::new(),
            config,
            None,
        ))
    }

    fn submission(name: &str, image: Vec<u8>, props: &[(&str, &str)]) -> ScreenshotSubmission {
        ScreenshotSubmission {
            name: name.to_string(),
            image,
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), Value::from(*v)))
                .collect(),
            threshold: None,
            full_page: None,
            build_id: None,
        }
    }

    #[tokio::test]
    async fn test_signature_properties_split_variants() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator_with(
            &dir,
            vec!["viewport".to_string(), "browser".to_string()],
        )
        .await;

        let white = png([255, 255, 255, 255]);
        let r1 = orch
            .process(submission(
                "x",
                white.clone(),
                &[("browser", "chrome"), ("viewport", "1920"), ("extra", "a")],
            ))
            .await
            .unwrap();
        assert!(matches!(r1.verdict, Verdict::New));

        // same signature keys, different unrelated property: same variant
        let r2 = orch
            .process(submission(
                "x",
                white.clone(),
                &[("browser", "chrome"), ("viewport", "1920"), ("extra", "b")],
            ))
            .await
            .unwrap();
        assert_eq!(r2.signature, r1.signature);
        assert!(matches!(r2.verdict, Verdict::Match { .. }));

        // changed browser: distinct signature, fresh baseline
        let r3 = orch
            .process(submission(
                "x",
                white,
                &[("browser", "firefox"), ("viewport", "1920")],
            ))
            .await
            .unwrap();
        assert_ne!(r3.signature, r1.signature);
        assert!(matches!(r3.verdict, Verdict::New));
    }

    #[tokio::test]
    async fn test_tdd_loop_new_diff_accept_match() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator_with(&dir, Vec::new()).await;

        let first = orch
            .process(submission("home", png([250, 250, 250, 255]), &[]))
            .await
            .unwrap();
        assert!(matches!(first.verdict, Verdict::New));

        let changed = png([20, 20, 20, 255]);
        let second = orch
            .process(submission("home", changed.clone(), &[]))
            .await
            .unwrap();
        assert!(matches!(second.verdict, Verdict::Diff { .. }));
        assert!(dir.path().join(".vizzly/diffs/home.png").exists());

        let accepted = orch.accept(&second.id).await.unwrap();
        assert!(matches!(accepted.verdict, Verdict::BaselineUpdated));
        assert!(!dir.path().join(".vizzly/diffs/home.png").exists());

        let third = orch.process(submission("home", changed, &[])).await.unwrap();
        assert!(matches!(third.verdict, Verdict::Match { .. }));
    }

    #[tokio::test]
    async fn test_comparison_event_stream_ordering() {
        let dir = TempDir::new().unwrap();
        let store = BaselineStore::new(dir.path());
        store.initialize().await.unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let orch = ComparisonOrchestrator::new(store, events, Config::default(), None);

        orch.process(submission("a", png([1, 1, 1, 255]), &[]))
            .await
            .unwrap();
        orch.process(submission("a", png([1, 1, 1, 255]), &[]))
            .await
            .unwrap();

        let statuses: Vec<ComparisonStatus> = vec![
            match rx.recv().await.unwrap() {
                crate::VizzlyEvent::Comparison { status, .. } => status,
                other => panic!("unexpected {:?}", other),
            },
            match rx.recv().await.unwrap() {
                crate::VizzlyEvent::Comparison { status, .. } => status,
                other => panic!("unexpected {:?}", other),
            },
        ];
        assert_eq!(
            statuses,
            vec![ComparisonStatus::New, ComparisonStatus::Match]
        );
    }

    // Capture walk wired straight into the orchestrator, the way tdd mode
    // composes them once the HTTP hop is stripped away.
    struct OrchestratorSink {
        orchestrator: Arc<ComparisonOrchestrator>,
    }

    #[async_trait]
    impl FrameSink for OrchestratorSink {
        async fn submit(
            &self,
            name: &str,
            image: Vec<u8>,
            properties: BTreeMap<String, Value>,
        ) -> Result<(), VizzlyError> {
            self.orchestrator
                .process(ScreenshotSubmission {
                    name: name.to_string(),
                    image,
                    properties,
                    threshold: None,
                    full_page: None,
                    build_id: None,
                })
                .await
                .map(|_| ())
        }
    }

    struct SolidPage;

    #[async_trait]
    impl TabPage for SolidPage {
        async fn set_viewport(&self, _w: u32, _h: u32) -> Result<(), VizzlyError> {
            Ok(())
        }
        async fn navigate(&self, _url: &str) -> Result<(), VizzlyError> {
            Ok(())
        }
        async fn run_script(&self, _script: &str) -> Result<(), VizzlyError> {
            Ok(())
        }
        async fn capture(&self, _params: &CaptureParams) -> Result<Vec<u8>, VizzlyError> {
            Ok(png([80, 90, 100, 255]))
        }
    }

    struct SolidContext;

    #[async_trait]
    impl TabContext for SolidContext {
        fn page(&self) -> Arc<dyn TabPage> {
            Arc::new(SolidPage)
        }
        async fn close(&mut self) -> Result<(), VizzlyError> {
            Ok(())
        }
    }

    struct SolidDriver;

    #[async_trait]
    impl BrowserDriver for SolidDriver {
        async fn new_context(&self) -> Result<Box<dyn TabContext>, VizzlyError> {
            Ok(Box::new(SolidContext))
        }
    }

    #[tokio::test]
    async fn test_walk_feeds_orchestrator_and_baselines_appear() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator_with(&dir, Vec::new()).await;
        let pool = Arc::new(TabPool::new(
            Arc::new(SolidDriver),
            TabPoolConfig {
                size: 2,
                recycle_after: 10,
            },
        ));
        let sink = Arc::new(OrchestratorSink {
            orchestrator: orch.clone(),
        });

        let targets = vec![
            CaptureTarget {
                url: "file:///site/index.html".to_string(),
                name: "index".to_string(),
                viewports: Vec::new(),
                before_screenshot: None,
                capture: CaptureParams::default(),
                skip: false,
            },
            CaptureTarget {
                url: "file:///site/about.html".to_string(),
                name: "about".to_string(),
                viewports: Vec::new(),
                before_screenshot: None,
                capture: CaptureParams::default(),
                skip: false,
            },
        ];
        let summary = walk_targets(pool, sink, targets, WalkOptions::default())
            .await
            .unwrap();
        assert!(summary.success());

        for name in ["index@desktop", "about@desktop"] {
            assert!(
                dir.path()
                    .join(format!(".vizzly/baselines/{}.png", name))
                    .exists(),
                "missing baseline for {}",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_mode_detection_prefers_sentinel_within_run() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            detect_mode(dir.path(), Some("token")),
            RunMode::Cloud { .. }
        ));

        write_sentinel(
            dir.path(),
            &ServerSentinel {
                url: "http://127.0.0.1:47392".to_string(),
                pid: std::process::id(),
                port: 47392,
            },
        )
        .unwrap();
        assert!(matches!(
            detect_mode(dir.path(), Some("token")),
            RunMode::Tdd { .. }
        ));
    }
}
