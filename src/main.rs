use clap::Parser;
use image_pipeline::{setup_logging, Cli, CliRunner, Metrics, PipelineConfig, PrometheusExporter};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting image-pipeline v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration before the runtime so the pool size can size it
    let config = load_config(&args)?;

    let exporter = if args.metrics {
        Some(PrometheusExporter::install()?)
    } else {
        None
    };
    let metrics = Arc::new(Metrics::new());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.pool_size())
        .enable_all()
        .build()?;

    let cli_runner = CliRunner::new(config, metrics);

    let result = runtime.block_on(async {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
        let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

        tokio::select! {
            result = cli_runner.run(args.command) => {
                info!("Application completed");
                result
            }
            _ = shutdown_rx.recv() => {
                info!("Received shutdown signal");
                Ok(())
            }
        }
    });

    if let Some(exporter) = &exporter {
        print!("{}", exporter.render());
    }

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("image-pipeline stopped");
    Ok(())
}

fn load_config(args: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(config_path) => PipelineConfig::load(config_path)?,
        None => PipelineConfig::default(),
    };

    // Override with CLI arguments
    if let Some(threads) = args.threads {
        config.worker_threads = Some(threads);
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Worker pool size: {}", config.pool_size());
    info!("Output directory: {}", config.output_dir.display());
    info!("Failure policy: {:?}", config.failure_policy);

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                return;
            }
        }

        let _ = shutdown_tx.send(());
    })
}
