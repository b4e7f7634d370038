use crate::browser::{BrowserOptions, CdpBrowser};
use crate::capture::{
    discover_static_site, discover_stories, walk_targets, ModeSink, StaticSiteOptions,
    WalkOptions,
};
use crate::events::{EventBus, VizzlyEvent};
use crate::mode::{detect_mode, read_sentinel, resolve_token, RunMode};
use crate::orchestrator::ComparisonOrchestrator;
use crate::server::{serve, ServerState};
use crate::tab_pool::{TabPool, TabPoolConfig};
use crate::uploader::{BuildInfo, UploadOptions, Uploader};
use crate::{BaselineStore, Config, VizzlyError};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "vizzly")]
#[command(about = "Visual regression testing toolkit")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (default: ./vizzly.config.json)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Workspace directory (default: current directory)")]
    pub workspace: Option<PathBuf>,

    #[arg(long, help = "API token (overrides VIZZLY_TOKEN)")]
    pub token: Option<String>,

    #[arg(long, help = "Emit machine-readable JSON lines")]
    pub json: bool,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Spawn the comparison server, run a test command against it, shut down
    Run {
        #[arg(
            trailing_var_arg = true,
            allow_hyphen_values = true,
            required = true,
            help = "Test command to execute"
        )]
        command: Vec<String>,
    },

    /// Manage the local comparison server
    Tdd {
        #[command(subcommand)]
        action: TddAction,
    },

    /// Upload a directory of screenshots to the remote API
    Upload {
        #[arg(help = "Directory of screenshots (default: configured screenshotsDir)")]
        dir: Option<PathBuf>,

        #[arg(long, help = "Build display name")]
        build_name: Option<String>,

        #[arg(long, help = "Git branch recorded on the build")]
        branch: Option<String>,

        #[arg(long, help = "Git commit recorded on the build")]
        commit: Option<String>,

        #[arg(long, help = "Commit message recorded on the build")]
        message: Option<String>,

        #[arg(long, help = "Environment label")]
        environment: Option<String>,

        #[arg(long, help = "Comparison threshold forwarded to the API")]
        threshold: Option<f64>,

        #[arg(long, help = "Wait for server-side comparisons to finish")]
        wait: bool,

        #[arg(long, help = "Wait timeout in seconds")]
        timeout: Option<u64>,

        #[arg(long, help = "Parallel shard identifier")]
        parallel_id: Option<String>,

        #[arg(long, default_value = "https://api.vizzly.dev", help = "API base URL")]
        api_url: String,
    },

    /// Capture screenshots from a producer and submit or stage them
    Capture {
        #[command(subcommand)]
        producer: CaptureProducer,
    },
}

#[derive(Subcommand)]
pub enum TddAction {
    /// Start the comparison server in the foreground
    Start {
        #[arg(long, help = "Override the configured port")]
        port: Option<u16>,

        #[arg(long, help = "Clear stored baseline data before serving")]
        reset: bool,
    },
    /// Stop a running server in this workspace
    Stop,
    /// Show whether a server is running in this workspace
    Status,
}

#[derive(Subcommand)]
pub enum CaptureProducer {
    /// Walk a built static site
    StaticSite {
        #[arg(help = "Directory of built HTML")]
        dir: PathBuf,

        #[arg(long, help = "Discover pages from sitemap.xml")]
        sitemap: bool,

        #[arg(long, default_value = "4", help = "Capture concurrency")]
        concurrency: usize,

        #[arg(long, help = "Capture full-page screenshots")]
        full_page: bool,
    },
    /// Walk a story catalog index
    Storybook {
        #[arg(help = "Path to the story index JSON")]
        index: PathBuf,

        #[arg(
            long,
            default_value = "http://localhost:6006",
            help = "Story host URL"
        )]
        host_url: String,

        #[arg(long, default_value = "4", help = "Capture concurrency")]
        concurrency: usize,
    },
}

pub struct CliRunner {
    pub config: Config,
    pub workspace: PathBuf,
    pub events: EventBus,
    token: Option<String>,
    json: bool,
}

impl CliRunner {
    pub fn new(args: &Cli) -> Result<Self, VizzlyError> {
        let workspace = match &args.workspace {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| workspace.join("vizzly.config.json"));
        let config = Config::load(&config_path)?;

        Ok(Self {
            config,
            workspace,
            events: EventBus::new(),
            token: args.token.clone(),
            json: args.json,
        })
    }

    pub async fn run(&self, command: Commands) -> Result<(), VizzlyError> {
        match command {
            Commands::Run { command } => self.run_with_server(command).await,
            Commands::Tdd { action } => self.run_tdd(action).await,
            Commands::Upload {
                dir,
                build_name,
                branch,
                commit,
                message,
                environment,
                threshold,
                wait,
                timeout,
                parallel_id,
                api_url,
            } => {
                self.run_upload(UploadArgs {
                    dir,
                    build_name,
                    branch,
                    commit,
                    message,
                    environment,
                    threshold,
                    wait,
                    timeout,
                    parallel_id,
                    api_url,
                })
                .await
            }
            Commands::Capture { producer } => self.run_capture(producer).await,
        }
    }

    fn server_state(&self) -> Arc<ServerState> {
        let store = BaselineStore::new(&self.workspace);
        let orchestrator = Arc::new(ComparisonOrchestrator::new(
            store,
            self.events.clone(),
            self.config.clone(),
            None,
        ));
        Arc::new(ServerState::new(
            orchestrator,
            self.events.clone(),
            self.config.clone(),
        ))
    }

    /// `run <cmd>`: bring the server up, execute the test command with the
    /// server URL in its environment, then shut the server down. The exit
    /// code follows the test command.
    async fn run_with_server(&self, command: Vec<String>) -> Result<(), VizzlyError> {
        let state = self.server_state();
        state.orchestrator.store().initialize().await?;
        let port = self.config.server.port;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server_task = tokio::spawn(serve(state, async {
            let _ = shutdown_rx.await;
        }));

        // Give the listener a beat to bind before the runner starts.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let server_url = format!("http://127.0.0.1:{}", port);

        let (program, rest) = command
            .split_first()
            .ok_or_else(|| VizzlyError::validation("command", "no test command given"))?;
        info!("Running `{}` against {}", command.join(" "), server_url);

        let status = tokio::process::Command::new(program)
            .args(rest)
            .env("VIZZLY_SERVER_URL", &server_url)
            .status()
            .await
            .map_err(|e| VizzlyError::Io(format!("cannot spawn {}: {}", program, e)))?;

        let _ = shutdown_tx.send(());
        match server_task.await {
            Ok(result) => result?,
            Err(e) => return Err(VizzlyError::Io(format!("server task: {}", e))),
        }

        if !status.success() {
            return Err(VizzlyError::validation(
                "command",
                format!("test command exited with {}", status),
            ));
        }
        Ok(())
    }

    async fn run_tdd(&self, action: TddAction) -> Result<(), VizzlyError> {
        match action {
            TddAction::Start { port, reset } => {
                let mut config = self.config.clone();
                if let Some(port) = port {
                    config.server.port = port;
                }
                let store = BaselineStore::new(&self.workspace);
                store.initialize().await?;
                let orchestrator = Arc::new(ComparisonOrchestrator::new(
                    store,
                    self.events.clone(),
                    config.clone(),
                    None,
                ));
                if reset {
                    info!("Clearing stored baseline data");
                    orchestrator.clear_baseline_data().await?;
                }
                let state = Arc::new(ServerState::new(
                    orchestrator,
                    self.events.clone(),
                    config.clone(),
                ));
                if config.tdd.open_report {
                    let url = format!("http://127.0.0.1:{}", config.server.port);
                    info!("Dashboard available at {}", url);
                }
                serve(state, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await
            }
            TddAction::Stop => match read_sentinel(&self.workspace) {
                Some(sentinel) => {
                    info!("Stopping server pid {}", sentinel.pid);
                    let status = tokio::process::Command::new("kill")
                        .arg(sentinel.pid.to_string())
                        .status()
                        .await
                        .map_err(|e| VizzlyError::Io(e.to_string()))?;
                    if !status.success() {
                        return Err(VizzlyError::Io(format!(
                            "could not signal pid {}",
                            sentinel.pid
                        )));
                    }
                    Ok(())
                }
                None => {
                    warn!("No running server in this workspace");
                    Ok(())
                }
            },
            TddAction::Status => {
                match read_sentinel(&self.workspace) {
                    Some(sentinel) => {
                        println!(
                            "Server running at {} (pid {}, port {})",
                            sentinel.url, sentinel.pid, sentinel.port
                        );
                    }
                    None => println!("No server running"),
                }
                Ok(())
            }
        }
    }

    async fn run_upload(&self, args: UploadArgs) -> Result<(), VizzlyError> {
        let token = resolve_token(self.token.as_deref(), &self.workspace)
            .ok_or(VizzlyError::AuthRequired)?;

        let dirs = match args.dir {
            Some(dir) => vec![dir],
            None => self.config.upload.screenshots_dir.as_paths(),
        };

        let mut build = BuildInfo {
            name: self.config.build.resolved_name(),
            branch: args.branch,
            commit: args.commit,
            message: args.message,
            environment: args
                .environment
                .unwrap_or_else(|| self.config.build.environment.clone()),
            parallel_id: args.parallel_id,
        };
        if let Some(name) = args.build_name {
            build.name = name;
        }

        let wait_timeout = args
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));
        let options = UploadOptions {
            screenshots_dirs: dirs,
            api_url: args.api_url,
            token,
            build,
            batch_size: self.config.upload.batch_size,
            timeout: Duration::from_millis(self.config.upload.timeout),
            threshold: args.threshold,
            wait: args.wait,
            wait_timeout,
            poll_interval: Duration::from_secs(2),
        };

        let renderer = self.spawn_event_renderer();
        let uploader = Uploader::new(options, self.events.clone())?;
        let result = uploader.run().await;
        renderer.abort();

        match result {
            Ok(result) => {
                self.print_line(
                    "result",
                    &format!(
                        "Uploaded {} screenshots ({} deduplicated) to build {}: {}",
                        result.stats.uploaded, result.stats.skipped, result.build_id, result.url
                    ),
                );
                if let Some(wait) = &result.wait {
                    self.print_line(
                        "result",
                        &format!(
                            "Build {}: {} comparisons, {} passed, {} failed",
                            wait.status,
                            wait.comparisons,
                            wait.passed_comparisons,
                            wait.failed_comparisons
                        ),
                    );
                    if wait.failed_comparisons > 0 || wait.status == "timeout" {
                        return Err(VizzlyError::validation(
                            "build",
                            format!("build finished with status {}", wait.status),
                        ));
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.print_line("error", &e.to_string());
                Err(e)
            }
        }
    }

    async fn run_capture(&self, producer: CaptureProducer) -> Result<(), VizzlyError> {
        let mode = detect_mode(&self.workspace, self.token.as_deref());
        if let RunMode::Tdd { server_url } = &mode {
            info!("Submitting frames to local server at {}", server_url);
        }
        let staging_dir = self
            .config
            .upload
            .screenshots_dir
            .as_paths()
            .into_iter()
            .next()
            .unwrap_or_else(|| PathBuf::from("./screenshots"));
        let sink = Arc::new(ModeSink::new(mode, staging_dir));

        let (targets, concurrency) = match producer {
            CaptureProducer::StaticSite {
                dir,
                sitemap,
                concurrency,
                full_page,
            } => {
                let mut options: StaticSiteOptions = self
                    .config
                    .plugin_config
                    .get("staticSite")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| VizzlyError::Configuration(format!("staticSite: {}", e)))?
                    .unwrap_or_default();
                options.use_sitemap |= sitemap;
                options.full_page |= full_page;
                (discover_static_site(&dir, &options)?, concurrency)
            }
            CaptureProducer::Storybook {
                index,
                host_url,
                concurrency,
            } => (discover_stories(&index, &host_url)?, concurrency),
        };

        if targets.is_empty() {
            warn!("Nothing to capture");
            return Ok(());
        }

        let browser = CdpBrowser::launch(&BrowserOptions::default()).await?;
        let browser = Arc::new(browser);
        let pool = Arc::new(TabPool::new(browser.clone(), TabPoolConfig::default()));

        let summary = walk_targets(
            pool.clone(),
            sink,
            targets,
            WalkOptions {
                concurrency,
                ..Default::default()
            },
        )
        .await;

        pool.drain().await;
        browser.shutdown().await;

        let summary = summary?;
        for (name, error) in &summary.failures {
            error!("{}: {}", name, error);
        }
        if !summary.success() {
            return Err(VizzlyError::CaptureFailed(format!(
                "{} of {} captures failed",
                summary.failures.len(),
                summary.total
            )));
        }
        info!("Captured {} frames", summary.total);
        Ok(())
    }

    /// Bridges bus events to stdout, as human-readable lines or JSON lines
    /// (`{status, message, timestamp}`).
    fn spawn_event_renderer(&self) -> tokio::task::JoinHandle<()> {
        let mut receiver = self.events.subscribe();
        let json = self.json;
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => render_event(&event, json),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn print_line(&self, status: &str, message: &str) {
        if self.json {
            println!(
                "{}",
                serde_json::json!({
                    "status": status,
                    "message": message,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                })
            );
        } else {
            println!("{}", message);
        }
    }
}

fn render_event(event: &VizzlyEvent, json: bool) {
    if json {
        let status = match event {
            VizzlyEvent::Error { .. } => "error",
            VizzlyEvent::Completed { .. } => "result",
            _ => "progress",
        };
        println!(
            "{}",
            serde_json::json!({
                "status": status,
                "message": event_message(event),
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "event": event,
            })
        );
    } else {
        println!("{}", event_message(event));
    }
}

fn event_message(event: &VizzlyEvent) -> String {
    match event {
        VizzlyEvent::Scanning { total } => format!("Found {} screenshots", total),
        VizzlyEvent::Processing { current, total } => {
            format!("Processing {}/{}", current, total)
        }
        VizzlyEvent::Deduplication {
            to_upload,
            existing,
            total,
        } => format!(
            "{} of {} screenshots already known, uploading {}",
            existing, total, to_upload
        ),
        VizzlyEvent::Uploading { current, total } => format!("Uploading {}/{}", current, total),
        VizzlyEvent::Completed { build_id, url } => {
            format!("Build {} complete: {}", build_id, url)
        }
        VizzlyEvent::Comparison { name, status, .. } => {
            format!("{}: {:?}", name, status)
        }
        VizzlyEvent::Error { message, .. } => message.clone(),
    }
}

struct UploadArgs {
    dir: Option<PathBuf>,
    build_name: Option<String>,
    branch: Option<String>,
    commit: Option<String>,
    message: Option<String>,
    environment: Option<String>,
    threshold: Option<f64>,
    wait: bool,
    timeout: Option<u64>,
    parallel_id: Option<String>,
    api_url: String,
}

pub fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}
