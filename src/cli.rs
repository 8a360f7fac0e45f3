use crate::{
    CacheAsideGateway, ChromiumEngine, Config, MemoryCache, Metrics, OutputFormat,
    RequestParser, SessionManager,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "render-gateway")]
#[command(about = "Render URLs to PNG screenshots or PDF documents through headless Chrome")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Render timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse a request URL and print the resulting render request
    Parse {
        #[arg(help = "Request URL")]
        url: String,
    },

    /// Render a single request URL to a file
    Render {
        #[arg(help = "Request URL")]
        url: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,
    },

    /// Render every request URL listed in a file
    Batch {
        #[arg(short, long, help = "Input file containing request URLs (one per line)")]
        input: PathBuf,

        #[arg(short, long, help = "Output directory for rendered files")]
        output: PathBuf,

        #[arg(short, long, default_value = "4", help = "Concurrent renders")]
        concurrency: usize,
    },

    /// Validate a configuration file
    Validate {
        #[arg(help = "Configuration file to validate")]
        config: PathBuf,
    },
}

pub struct CliRunner {
    pub config: Config,
    pub parser: RequestParser,
    pub sessions: Arc<SessionManager>,
    pub gateway: CacheAsideGateway,
}

impl CliRunner {
    /// Wires the gateway to a Chrome-backed session manager. No browser is
    /// started until the first render. Must be called inside a Tokio runtime.
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Self {
        let engine = Arc::new(ChromiumEngine::new(config.clone()));
        let sessions = Arc::new(SessionManager::new(engine, &config, metrics.clone()));
        let parser = RequestParser::from_config(&config);

        let cache = Arc::new(MemoryCache::new());
        cache.spawn_purger(config.cache_purge_interval);

        let gateway = CacheAsideGateway::new(
            parser.clone(),
            sessions.clone(),
            cache,
            config.session.key.clone(),
            metrics,
        );

        Self {
            config,
            parser,
            sessions,
            gateway,
        }
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Parse { url } => self.run_parse(&url),
            Commands::Render { url, output } => self.run_render(&url, &output).await,
            Commands::Batch {
                input,
                output,
                concurrency,
            } => self.run_batch(&input, &output, concurrency).await,
            Commands::Validate { config } => validate_config_file(&config).await,
        }
    }

    pub fn run_parse(&self, url: &str) -> anyhow::Result<()> {
        let request = self.parser.parse(url)?;
        println!("{}", serde_json::to_string_pretty(&request)?);
        Ok(())
    }

    pub async fn run_render(&self, url: &str, output: &Path) -> anyhow::Result<()> {
        info!("Rendering: {}", url);
        let started = Instant::now();

        let response = self.gateway.handle(url).await;
        if !response.is_success() {
            bail!(
                "Render failed with status {}: {}",
                response.status,
                String::from_utf8_lossy(&response.body)
            );
        }

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(output, &response.body)
            .await
            .with_context(|| format!("writing {}", output.display()))?;

        println!("Render completed successfully:");
        println!("  URL: {url}");
        println!("  Output: {}", output.display());
        println!(
            "  Content-Type: {}",
            response.header("Content-Type").unwrap_or("unknown")
        );
        println!("  Size: {} bytes", response.body.len());
        println!("  Duration: {:?}", started.elapsed());

        Ok(())
    }

    pub async fn run_batch(
        &self,
        input: &Path,
        output: &Path,
        concurrency: usize,
    ) -> anyhow::Result<()> {
        if concurrency == 0 {
            bail!("Concurrency must be greater than 0");
        }

        let urls = read_urls_from_file(input).await?;
        info!("Loaded {} URLs from {}", urls.len(), input.display());

        fs::create_dir_all(output).await?;

        let mut results = stream::iter(urls)
            .map(|url| async move {
                let response = self.gateway.handle(&url).await;
                (url, response)
            })
            .buffer_unordered(concurrency);

        let mut success_count = 0;
        let mut error_count = 0;

        while let Some((url, response)) = results.next().await {
            if !response.is_success() {
                error_count += 1;
                warn!(
                    "Failed to render {} ({}): {}",
                    url,
                    response.status,
                    String::from_utf8_lossy(&response.body)
                );
                continue;
            }

            let format = self
                .parser
                .parse(&url)
                .map(|request| request.output_format)
                .unwrap_or(self.config.defaults.format);
            let filepath = output.join(generate_filename(&url, format));

            fs::write(&filepath, &response.body).await?;
            success_count += 1;
            info!("Saved render: {}", filepath.display());
        }

        info!(
            "Batch processing completed. Success: {}, Errors: {}",
            success_count, error_count
        );
        println!("Rendered {success_count} of {} URLs", success_count + error_count);

        Ok(())
    }
}

pub async fn validate_config_file(config_path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config_content = fs::read_to_string(config_path)
        .await
        .with_context(|| format!("reading {}", config_path.display()))?;
    let config: Config = serde_json::from_str(&config_content)?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Session key: {}", config.session.key);
    println!("  Idle budget: {:?}", config.session.idle_budget);
    println!("  Tick interval: {:?}", config.session.tick_interval);
    println!("  Render timeout: {:?}", config.session.render_timeout);
    println!(
        "  Defaults: {}x{}@{}x {:?}",
        config.defaults.width, config.defaults.height, config.defaults.scale, config.defaults.format
    );
    println!("  Cache TTL: {}s", config.defaults.cache_ttl_seconds);
    println!(
        "  Global query params: {}",
        config.global_query_params.len()
    );

    Ok(())
}

/// Reads one URL per line, skipping blank lines and `#` comments.
pub async fn read_urls_from_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    Ok(content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect())
}

/// Flattens a request URL into a file name ending in the output extension.
pub fn generate_filename(url: &str, format: OutputFormat) -> String {
    let without_scheme = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let (path, query) = without_scheme
        .split_once('?')
        .unwrap_or((without_scheme, ""));

    let extension = format.extension();
    let stem = path
        .strip_suffix(&format!(".{extension}"))
        .unwrap_or(path);

    let mut name = sanitize(stem);
    if !query.is_empty() {
        name.push('_');
        name.push_str(&sanitize(query));
    }

    format!("{name}.{extension}")
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' | '@' => c,
            _ => '_',
        })
        .collect()
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}
