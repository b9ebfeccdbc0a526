use crate::utils::{format_bytes, format_duration};
use crate::{
    build_state, CacheStore, CaptureCoordinator, ChromiumRenderer, Config, CoordinatorSettings,
    ObjectStore, PageRenderer, RetentionManager, S3ObjectStore, SafetyGate, ScreenshotParams,
    StatsCollector,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "screenshot-api")]
#[command(about = "Screenshot rendering and caching service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Listen port")]
    pub port: Option<u16>,

    #[arg(long, global = true, help = "Browser pool size")]
    pub pool_size: Option<usize>,

    #[arg(long, global = true, help = "Maximum concurrent renders")]
    pub max_concurrent: Option<usize>,

    #[arg(long, global = true, help = "Render timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Screenshot cache directory")]
    pub cache_dir: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long, help = "Bind address")]
        bind: Option<String>,
    },

    /// Capture a single URL through the cache and write the result to disk
    Capture {
        #[arg(short, long, help = "URL to screenshot")]
        url: String,

        #[arg(short, long, help = "Copy the artifact to this path")]
        output: Option<PathBuf>,

        #[arg(long, help = "Output format (webp, png, jpeg)")]
        format: Option<String>,

        #[arg(long, help = "Viewport width")]
        width: Option<u32>,

        #[arg(long, help = "Viewport height")]
        height: Option<u32>,

        #[arg(long, help = "JPEG quality 1-100")]
        quality: Option<u8>,

        #[arg(long, help = "Capture the full scrollable page")]
        full_page: bool,

        #[arg(long, help = "Emulate prefers-color-scheme: dark")]
        dark_mode: bool,

        #[arg(long, help = "CSS selector to wait for before capturing")]
        wait_for: Option<String>,

        #[arg(long, help = "Extra delay in milliseconds before capturing")]
        delay: Option<u64>,

        #[arg(long, help = "Ignore any cached copy")]
        refresh: bool,
    },

    /// Run one retention sweep over the cache directory
    Sweep,

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

/// Apply command-line overrides on top of a loaded configuration
pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(pool_size) = args.pool_size {
        config.browser.pool_size = pool_size;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent_renders = max_concurrent;
    }
    if let Some(timeout) = args.timeout {
        config.browser.render_timeout_secs = timeout;
    }
    if let Some(cache_dir) = &args.cache_dir {
        config.cache.directory = cache_dir.clone();
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.browser.chrome_path = Some(chrome_path.clone());
    }
    if let Commands::Serve { bind: Some(bind) } = &args.command {
        config.server.bind = bind.clone();
    }
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands, shutdown: broadcast::Sender<()>) -> anyhow::Result<()> {
        match command {
            Commands::Serve { .. } => self.run_server(shutdown).await,
            Commands::Capture {
                url,
                output,
                format,
                width,
                height,
                quality,
                full_page,
                dark_mode,
                wait_for,
                delay,
                refresh,
            } => {
                let params = ScreenshotParams {
                    format,
                    width: width.map(i64::from),
                    height: height.map(i64::from),
                    quality: quality.map(i64::from),
                    full_page,
                    dark_mode,
                    wait_for,
                    delay: delay.map(|d| d as i64),
                    cache: refresh.then(|| "refresh".to_string()),
                    ..ScreenshotParams::for_url(url)
                };
                self.run_capture(params, output).await
            }
            Commands::Sweep => self.run_sweep().await,
            Commands::Validate { config } => validate_config(config).await,
        }
    }

    pub async fn run_server(&self, shutdown: broadcast::Sender<()>) -> anyhow::Result<()> {
        let state = build_state(self.config.clone())
            .await
            .context("failed to initialise service")?;
        let renderer = state.coordinator.renderer().clone();

        let mut tasks = Vec::new();
        if self.config.retention.enabled {
            let retention = RetentionManager::from_config(state.store.clone(), &self.config.retention);
            tasks.push(retention.start(self.config.retention.interval(), shutdown.subscribe()));
        }
        if state.rate_limiter.is_enabled() {
            let interval = self.config.rate_limit.window().min(std::time::Duration::from_secs(300));
            tasks.push(state.rate_limiter.clone().start_pruning(interval, shutdown.subscribe()));
        }

        let result = crate::serve(state, shutdown.subscribe()).await;

        let _ = shutdown.send(());
        for task in tasks {
            let _ = task.await;
        }
        renderer.shutdown().await;

        result.context("HTTP server failed")
    }

    pub async fn run_capture(&self, params: ScreenshotParams, output: Option<PathBuf>) -> anyhow::Result<()> {
        let (request, _) = params.into_request(&SafetyGate::new())?;

        let store = CacheStore::open(&self.config.cache.directory).await?;
        let renderer = Arc::new(ChromiumRenderer::launch(self.config.browser.clone()).await?);
        let uploader: Option<Arc<dyn ObjectStore>> = match &self.config.upload {
            Some(upload) => Some(Arc::new(S3ObjectStore::from_config(upload).await)),
            None => None,
        };
        let coordinator = CaptureCoordinator::new(
            store,
            renderer.clone(),
            Arc::new(StatsCollector::new()),
            CoordinatorSettings::from_config(&self.config),
        )
        .with_uploader(uploader);

        let result = coordinator.resolve(&request).await;
        renderer.shutdown().await;
        let artifact = result?;

        if let Some(output) = &output {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(output, &artifact.data).await?;
            info!("Screenshot saved to: {}", output.display());
        }

        println!("Screenshot captured successfully:");
        println!("  URL: {}", request.url);
        println!("  Cache file: {}", artifact.path.display());
        if let Some(output) = &output {
            println!("  Output: {}", output.display());
        }
        println!("  Format: {}", request.format);
        println!("  Size: {}", format_bytes(artifact.size() as u64));
        println!("  Cached: {}", artifact.cached);
        println!("  Duration: {}", format_duration(artifact.duration));
        if let Some(title) = artifact.metadata.as_ref().and_then(|m| m.title.as_deref()) {
            println!("  Title: {title}");
        }
        if let Some(url) = &artifact.upload_url {
            println!("  Uploaded: {url}");
        }

        Ok(())
    }

    pub async fn run_sweep(&self) -> anyhow::Result<()> {
        let store = CacheStore::open(&self.config.cache.directory).await?;
        let report = RetentionManager::from_config(store, &self.config.retention)
            .sweep()
            .await?;

        println!("Retention sweep finished:");
        println!("  Scanned: {}", report.scanned);
        println!("  Deleted: {}", report.deleted);
        println!("  Freed: {}", format_bytes(report.freed_bytes));
        println!("  Remaining: {}", format_bytes(report.remaining_bytes));
        Ok(())
    }
}

pub async fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = Config::from_file(&config_path).await?;
    if let Err(e) = config.validate() {
        bail!("configuration is invalid: {}", e);
    }

    println!("Configuration is valid:");
    println!("  Listen address: {}", config.server.address());
    println!("  Browser pool size: {}", config.browser.pool_size);
    println!("  Max concurrent renders: {}", config.max_concurrent_renders);
    println!("  Render timeout: {:?}", config.browser.render_timeout());
    println!("  Cache directory: {}", config.cache.directory.display());
    println!(
        "  Retention: {} (max age {}, budget {})",
        if config.retention.enabled { "enabled" } else { "disabled" },
        format_duration(config.retention.max_age()),
        format_bytes(config.retention.max_storage_bytes)
    );
    println!(
        "  Rate limit: {} ({} requests per {})",
        if config.rate_limit.enabled { "enabled" } else { "disabled" },
        config.rate_limit.max_requests,
        format_duration(config.rate_limit.window())
    );
    match &config.upload {
        Some(upload) => println!("  Upload: s3://{}/{}", upload.bucket, upload.prefix),
        None => println!("  Upload: disabled"),
    }

    Ok(())
}

/// Install the global subscriber; `RUST_LOG` takes precedence over `--verbose`
pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))?;

    Ok(())
}

/// Load the configuration file if one was given, then apply CLI overrides
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };
    apply_overrides(&mut config, args);

    if let Err(e) = config.validate() {
        warn!("Rejecting configuration: {}", e);
        return Err(e.into());
    }

    info!("Configuration loaded successfully");
    info!("Browser pool size: {}", config.browser.pool_size);
    info!("Max concurrent renders: {}", config.max_concurrent_renders);
    info!("Render timeout: {:?}", config.browser.render_timeout());

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_to_nested_sections() {
        let args = Cli::parse_from([
            "screenshot-api",
            "--port",
            "8080",
            "--pool-size",
            "4",
            "--timeout",
            "45",
            "--cache-dir",
            "/tmp/shots",
            "serve",
            "--bind",
            "127.0.0.1",
        ]);

        let mut config = Config::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.browser.pool_size, 4);
        assert_eq!(config.browser.render_timeout_secs, 45);
        assert_eq!(config.cache.directory, PathBuf::from("/tmp/shots"));
    }

    #[test]
    fn test_capture_arguments_parse() {
        let args = Cli::parse_from([
            "screenshot-api",
            "capture",
            "--url",
            "https://example.com",
            "--format",
            "png",
            "--full-page",
            "--refresh",
        ]);

        match args.command {
            Commands::Capture {
                url,
                format,
                full_page,
                refresh,
                dark_mode,
                ..
            } => {
                assert_eq!(url, "https://example.com");
                assert_eq!(format.as_deref(), Some("png"));
                assert!(full_page);
                assert!(refresh);
                assert!(!dark_mode);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Cli::parse_from(["screenshot-api", "sweep", "--verbose"]);
        assert!(args.verbose);
        assert!(matches!(args.command, Commands::Sweep));
    }

    #[tokio::test]
    async fn test_validate_config_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"browser": {"pool_size": 0}}"#).await.unwrap();

        assert!(validate_config(path).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_config_accepts_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"server": {"port": 9000}}"#).await.unwrap();

        assert!(validate_config(path).await.is_ok());
    }
}
