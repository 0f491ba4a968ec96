//! Resumable Uploadr - resumable large-file upload client
//!
//! Uploads files through chunked-REST, TUS or multipart endpoints and prints
//! the resulting file metadata as JSON.

use clap::Parser;
use resumable_uploadr::{
    config::Config,
    source::FileSource,
    upload::{UploadHooks, UploadMethod},
    UploadDispatcher,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Resumable Uploadr - upload large files with resume support
#[derive(Parser, Debug)]
#[command(name = "resumable-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Upload method override (chunked, tus, multipart)
    #[arg(short, long)]
    method: Option<UploadMethod>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Files to upload
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for results
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Resumable Uploadr v{}", resumable_uploadr::VERSION);

    // Load configuration
    let mut config = Config::load(&args.config)?;
    info!("Loaded configuration from {:?}", args.config);

    if let Some(method) = args.method {
        config.method = Some(method);
        config.validate()?;
    }

    let hooks = UploadHooks::new()
        .on_start(|start| {
            info!(method = %start.method, name = %start.name, size = start.size, "Upload started")
        })
        .on_progress(|p| {
            info!(
                uploaded = p.uploaded,
                total = p.total,
                percentage = p.percentage,
                "Upload progress"
            )
        });

    let dispatcher = Arc::new(UploadDispatcher::from_config(&config, hooks)?);

    // Abort the active upload on Ctrl-C
    let shutdown = CancellationToken::new();
    {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, aborting upload");
                shutdown.cancel();
                dispatcher.abort();
            }
        });
    }

    let mut failures = 0usize;
    for path in &args.files {
        if shutdown.is_cancelled() {
            break;
        }

        let source = match FileSource::open(path).await {
            Ok(source) => source,
            Err(e) => {
                error!(path = ?path, error = %e, "Cannot open file");
                failures += 1;
                continue;
            }
        };

        match dispatcher.upload(Arc::new(source)).await {
            Ok(meta) => println!("{}", serde_json::to_string(&meta)?),
            Err(e) => {
                error!(path = ?path, error = %e, "Upload failed");
                failures += 1;
            }
        }
    }

    if shutdown.is_cancelled() {
        anyhow::bail!("upload interrupted");
    }
    if failures > 0 {
        anyhow::bail!("{} of {} uploads failed", failures, args.files.len());
    }

    Ok(())
}
