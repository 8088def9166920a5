use std::{process, sync::Arc};

use tokio::sync::watch;
use tracing_subscriber::{filter::LevelFilter, fmt};

use paragon_app::AppError;
use paragon_app::cli::{Cli, Commands, WorkArgs};
use paragon_app::config::{self, AppConfig, LogFormat};
use paragon_app::engines::{AlignerClient, EngineTransport, PaddleOcrClient, TesseractClient};
use paragon_app::events::EventPublisher;
use paragon_app::ingest::IngestService;
use paragon_app::pipeline::{ConfidenceThresholds, RecognitionProcessor};
use paragon_app::queue::JobQueue;
use paragon_app::server::{self, ApiState};
use paragon_app::storage::{BlobConfig, Storage};
use paragon_app::worker::WorkerFleet;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            process::exit(1);
        }
    };

    init_tracing(determine_log_level(&config, cli.verbose), config.log_format);

    if let Err(err) = run(cli, config).await {
        tracing::error!(error = %err, "fatal error");
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter, format: LogFormat) {
    let builder = fmt().with_max_level(level).with_target(false);
    let installed = match format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.finish()),
    };
    if installed.is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

fn determine_log_level(config: &AppConfig, verbose: u8) -> LevelFilter {
    match verbose {
        0 => config
            .log_level
            .parse()
            .unwrap_or(LevelFilter::INFO),
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

async fn run(cli: Cli, config: AppConfig) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => run_serve(config).await,
        Some(Commands::Work(args)) => run_work(config, args).await,
        None => {
            Cli::print_help();
            Ok(())
        }
    }
}

async fn run_serve(config: AppConfig) -> Result<(), AppError> {
    let storage = connect_storage(&config).await?;
    let queue = JobQueue::connect(&config.redis_url).await?;
    let publisher = EventPublisher::connect(&config.redis_url).await?;

    let ingest = IngestService::new(storage.clone(), queue, publisher);
    let state = ApiState { ingest, storage };

    let shutdown = spawn_shutdown_watch();
    server::serve(config.port, state, shutdown).await?;
    Ok(())
}

async fn run_work(config: AppConfig, args: WorkArgs) -> Result<(), AppError> {
    let storage = connect_storage(&config).await?;
    let queue = JobQueue::connect(&config.redis_url).await?;
    let publisher = EventPublisher::connect(&config.redis_url).await?;

    let transport = EngineTransport::new(config.engine_timeout())?;
    let aligner = Arc::new(AlignerClient::new(&config.aligner_url, transport.clone()));
    let tesseract = Arc::new(TesseractClient::new(
        &config.tesseract_url,
        config.ocr_default_lang.as_str(),
        transport.clone(),
    ));
    let paddle = Arc::new(PaddleOcrClient::new(&config.paddleocr_url, transport));

    let processor = RecognitionProcessor::new(
        storage,
        publisher,
        aligner,
        tesseract,
        paddle,
        ConfidenceThresholds {
            low: config.confidence_threshold_low,
            high: config.confidence_threshold_high,
        },
    );

    let concurrency = args.workers.unwrap_or(config.worker_concurrency);
    let fleet = WorkerFleet::new(queue, processor, concurrency);

    let shutdown = spawn_shutdown_watch();
    fleet.run(shutdown).await;
    Ok(())
}

async fn connect_storage(config: &AppConfig) -> Result<Storage, AppError> {
    let blob = BlobConfig {
        endpoint: config.blob_endpoint.clone(),
        access_key: config.blob_access_key.clone(),
        secret_key: config.blob_secret_key.clone(),
        use_ssl: config.blob_use_ssl,
        bucket: config.blob_bucket.clone(),
    };
    Ok(Storage::connect(&config.database_url, &config.redis_url, &blob).await?)
}

fn spawn_shutdown_watch() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        if tx.send(true).is_err() {
            tracing::warn!("no listeners left for the shutdown signal");
        }
    });
    rx
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to capture Ctrl+C signal");
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received; shutting down"),
        _ = sigterm => tracing::info!("SIGTERM received; shutting down"),
    }
}
