use crate::{
    load_sources, FailurePolicy, FileStore, HttpFetcher, Metrics, Pipeline, PipelineConfig,
    RetryingFetcher, RunReport, RunTimer, SourceLocation, TransformKind, WorkerPool,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

#[derive(Parser)]
#[command(name = "image-pipeline")]
#[command(about = "Concurrent image fetch, transform and store pipeline")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Worker pool size (default: hardware threads + 1)")]
    pub threads: Option<usize>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Print Prometheus metrics when the command finishes")]
    pub metrics: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch, transform and store a set of images
    Run {
        #[arg(short, long, help = "Input file containing image URLs (one per line)")]
        input: Option<PathBuf>,

        #[arg(short, long, help = "Image URL (repeatable)")]
        url: Vec<String>,

        #[arg(short, long, help = "Output directory for stored variants")]
        output: Option<PathBuf>,

        #[arg(short, long = "transform", help = "Transform tag to apply (repeatable)")]
        transforms: Vec<String>,

        #[arg(long, help = "Also store the unmodified images under raw/")]
        persist_raw: bool,

        #[arg(long, help = "Abort the whole run on the first failure")]
        fail_fast: bool,

        #[arg(long, default_value = "1", help = "Number of timed runs")]
        runs: usize,

        #[arg(long, help = "Keep stored artifacts instead of deleting them after each run")]
        keep: bool,

        #[arg(long, help = "Write a JSON report of every run to this path")]
        report: Option<PathBuf>,
    },

    /// List the supported transform tags
    Transforms,

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: Option<PathBuf>,
    pub urls: Vec<String>,
    pub output: Option<PathBuf>,
    pub transforms: Vec<String>,
    pub persist_raw: bool,
    pub fail_fast: bool,
    pub runs: usize,
    pub keep: bool,
    pub report: Option<PathBuf>,
}

impl RunOptions {
    /// Layer command-line flags over the loaded configuration.
    pub fn apply(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if !self.transforms.is_empty() {
            config.transforms = self.transforms.clone();
        }
        if self.persist_raw {
            config.persist_raw = true;
        }
        if self.fail_fast {
            config.failure_policy = FailurePolicy::FailFast;
        }
        if self.keep {
            config.cleanup_after_run = false;
        }
        config
    }
}

pub struct CliRunner {
    pub config: PipelineConfig,
    pub timer: Arc<RunTimer>,
    metrics: Arc<Metrics>,
}

impl CliRunner {
    pub fn new(config: PipelineConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            timer: Arc::new(RunTimer::new()),
            metrics,
        }
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Run {
                input,
                url,
                output,
                transforms,
                persist_raw,
                fail_fast,
                runs,
                keep,
                report,
            } => {
                self.run_pipeline(RunOptions {
                    input,
                    urls: url,
                    output,
                    transforms,
                    persist_raw,
                    fail_fast,
                    runs,
                    keep,
                    report,
                })
                .await
            }
            Commands::Transforms => {
                self.list_transforms();
                Ok(())
            }
            Commands::Validate { config } => self.validate_config(config),
        }
    }

    pub async fn run_pipeline(&self, options: RunOptions) -> anyhow::Result<()> {
        let config = options.apply(self.config.clone());
        config.validate()?;

        if options.runs == 0 {
            bail!("--runs must be at least 1");
        }

        let sources = self.collect_sources(&options).await?;
        info!("Loaded {} source locations", sources.len());

        fs::create_dir_all(&config.output_dir)
            .await
            .with_context(|| format!("creating {}", config.output_dir.display()))?;

        let fetcher = RetryingFetcher::new(
            HttpFetcher::new(config.request_timeout, config.user_agent.as_deref())?,
            config.retry.clone(),
        );
        let pool = WorkerPool::new(config.pool_size())?;
        let pipeline = Pipeline::new(
            config.clone(),
            config.registry()?,
            Arc::new(fetcher),
            Arc::new(FileStore::new()),
            pool,
        )
        .with_metrics(self.metrics.clone());

        println!(
            "Entering the pipeline with {} cores available",
            num_cpus::get()
        );

        let mut reports: Vec<RunReport> = Vec::with_capacity(options.runs);
        for run in 1..=options.runs {
            let name = if options.runs == 1 {
                "default".to_string()
            } else {
                format!("run-{run}")
            };
            let report = pipeline.run_timed(&name, &sources, &self.timer).await?;
            for failure in &report.failures {
                println!("  failed [{}] {}: {}", failure.stage, failure.origin, failure.error);
            }
            reports.push(report);
        }

        if let Some(path) = &options.report {
            let json = serde_json::to_string_pretty(&reports)?;
            fs::write(path, json)
                .await
                .with_context(|| format!("writing report to {}", path.display()))?;
            info!("Run report written to {}", path.display());
        }

        print!("{}", self.timer.report());
        Ok(())
    }

    pub async fn collect_sources(&self, options: &RunOptions) -> anyhow::Result<Vec<SourceLocation>> {
        let mut sources = match &options.input {
            Some(path) => load_sources(path)
                .await
                .with_context(|| format!("reading sources from {}", path.display()))?,
            None => Vec::new(),
        };

        for url in &options.urls {
            sources.push(SourceLocation::parse(url)?);
        }

        if sources.is_empty() {
            bail!("No source locations given; use --input or --url");
        }
        Ok(sources)
    }

    pub fn list_transforms(&self) {
        println!("Supported transforms:");
        for kind in TransformKind::ALL {
            println!("  {kind}");
        }
    }

    pub fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = PipelineConfig::load(&config_path)?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Output directory: {}", config.output_dir.display());
        println!("  Worker threads: {}", config.pool_size());
        println!("  Transforms: {}", config.transforms.join(", "));
        println!("  Persist raw: {}", config.persist_raw);
        println!("  Failure policy: {:?}", config.failure_policy);
        println!("  Fetch timeout: {:?}", config.fetch_timeout);
        println!("  Request timeout: {:?}", config.request_timeout);
        println!("  Cleanup after run: {}", config.cleanup_after_run);

        Ok(())
    }
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
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}
