mod cleanup;
mod config;
mod fields;
mod hash;
mod merger;
mod ocr;
mod paths;
mod receiver;
mod record;
mod remap;
mod retry;
mod router;
mod sender;
mod sink;
mod site;
mod upload;

use clap::Parser;
use cleanup::Cleanup;
use config::{Config, Label, ServerKind};
use eyre::{eyre, Result};
use fs2::FileExt;
use merger::Merger;
use ocr::detect::{Detector, HttpDetector};
use ocr::PlateReader;
use receiver::Receiver;
use record::Record;
use remap::SiteRemap;
use retry::RetryWorker;
use sender::Sender;
use sink::kv::{BusSubscriber, KvSink};
use sink::local::LocalStore;
use sink::rpc::RpcSink;
use sink::{columnar::ColumnarSink, SinkAdaptor};
use site::Site;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use upload::ImageUploader;

/// Image directories are swept for stale leftovers on this cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    name = "edge-data-handler",
    version,
    about = "Edge-side traffic detection data handler"
)]
struct Args {
    /// Path to the configuration document.
    #[arg(long, default_value = "./config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    // Keep the appender guard alive for the life of the process.
    let _log_guard = init_tracing(&config)?;

    // Single-instance guard: two handlers sharing one spool would double
    // deliver. The lock lives alongside the spool database.
    let _lock_guard = acquire_lock(&config.sqlite.database)?;

    tracing::info!(
        config = %args.config.display(),
        channels = config.channels.len(),
        servers = config.servers.len(),
        merge = config.merge.enabled,
        ocr = config.ocr.enabled,
        "edge data handler starting"
    );

    let site = Site::new();
    let cleanup = Cleanup::new();
    let uploader = ImageUploader::new(
        &config.image_remote.host,
        config.image_remote.port,
        cleanup.clone(),
    )?;
    let remap = SiteRemap::from_config(&config.special_site).map(Arc::new);

    let spool = Arc::new(LocalStore::new(
        "spool",
        &config.sqlite.database,
        &config.sqlite.table,
    )?);
    spool.open()?;

    // Sink adaptors from the server list. A `manual` entry short-circuits
    // camera discovery instead of adding a sink.
    let mut sinks: Vec<Arc<dyn SinkAdaptor>> = Vec::new();
    let mut projection: Option<Arc<LocalStore>> = None;
    for server in &config.servers {
        match server.kind {
            ServerKind::Manual => {
                let cam_id = server
                    .cam_id
                    .as_deref()
                    .ok_or_else(|| eyre!("manual server entry without cam_id"))?;
                site.set_camera_id(cam_id);
                tracing::info!(camera_id = cam_id, "camera id fixed by configuration");
            }
            ServerKind::Grpc => {
                sinks.push(Arc::new(RpcSink::new(server, site.clone())?));
            }
            ServerKind::Volt => {
                sinks.push(Arc::new(ColumnarSink::new(
                    &server.name,
                    &server.ip,
                    server.port,
                    site.clone(),
                )?));
            }
            ServerKind::Redis => {
                let channel = server
                    .channel
                    .as_deref()
                    .ok_or_else(|| eyre!("redis server '{}' without channel", server.name))?;
                sinks.push(Arc::new(KvSink::new(
                    &server.name,
                    &server.ip,
                    server.port,
                    channel,
                )?));
            }
            ServerKind::Sqlite => {
                let database = server
                    .database
                    .as_deref()
                    .ok_or_else(|| eyre!("sqlite server '{}' without database", server.name))?;
                let table = server
                    .table
                    .as_deref()
                    .ok_or_else(|| eyre!("sqlite server '{}' without table", server.name))?;
                let store = Arc::new(LocalStore::new(&server.name, database, table)?);
                if table == "main_table" {
                    projection = Some(store.clone());
                }
                sinks.push(store);
            }
        }
    }

    for sink in &sinks {
        if let Err(err) = sink.connect().await {
            let server = format!("{}|{}", sink.kind(), sink.endpoint());
            tracing::error!(server = %server, error = %err, "sink connect failed");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (server_tx, server_rx) = mpsc::unbounded_channel::<Record>();

    // Merge queues only exist when fusion is enabled; receivers drop merge
    // records otherwise.
    let (merge_tx_2k, merge_tx_4k) = if config.merge.enabled {
        let (tx_2k, rx_2k) = mpsc::unbounded_channel::<Record>();
        let (tx_4k, rx_4k) = mpsc::unbounded_channel::<Record>();
        let merger = Merger::new(
            server_tx.clone(),
            rx_2k,
            rx_4k,
            remap.clone(),
            shutdown_rx.clone(),
        );
        tokio::spawn(merger.run());
        (Some(tx_2k), Some(tx_4k))
    } else {
        (None, None)
    };

    let ocr_tx = if config.ocr.enabled {
        let plate_cfg = config
            .ocr
            .plate_detector_model
            .as_ref()
            .ok_or_else(|| eyre!("OCR enabled without a plate detector model"))?;
        let ocr_cfg = config
            .ocr
            .ocr_model
            .as_ref()
            .ok_or_else(|| eyre!("OCR enabled without an OCR model"))?;
        let plate_detector: Arc<dyn Detector> = Arc::new(HttpDetector::load(plate_cfg)?);
        let ocr_model: Arc<dyn Detector> = Arc::new(HttpDetector::load(ocr_cfg)?);

        let (tx_ocr, rx_ocr) = mpsc::unbounded_channel::<Record>();
        let reader = PlateReader::new(
            server_tx.clone(),
            rx_ocr,
            plate_detector,
            ocr_model,
            cleanup.clone(),
            shutdown_rx.clone(),
        );
        tokio::spawn(reader.run());
        Some(tx_ocr)
    } else {
        None
    };

    let sender = Sender::new(
        server_rx,
        sinks,
        spool.clone(),
        projection,
        site.clone(),
        uploader,
        config.image_remote.clone(),
        shutdown_rx.clone(),
    );
    tokio::spawn(sender.run());

    let retry = RetryWorker::new(
        server_tx.clone(),
        spool,
        site.clone(),
        Duration::from_secs(config.sqlite.interval),
        shutdown_rx.clone(),
    );
    tokio::spawn(retry.run());

    for ch in &config.channels {
        let subscriber = BusSubscriber::new(&ch.ip, ch.port, &ch.channel)?;
        let merge_tx = match ch.label {
            Label::Vehicle2k => merge_tx_2k.clone(),
            Label::Vehicle4k => merge_tx_4k.clone(),
            _ => None,
        };
        let receiver = Receiver::new(
            ch.label,
            ch.channel.clone(),
            ch.send_to.clone(),
            subscriber,
            server_tx.clone(),
            merge_tx,
            ocr_tx.clone(),
            remap.clone(),
            shutdown_rx.clone(),
        );
        tokio::spawn(receiver.run());
    }

    // Housekeeping loop doubles as the shutdown anchor.
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                let _ = shutdown_tx.send(true);
                break;
            }
            _ = sweep.tick() => cleanup.sweep(),
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level));

    if let Some(dir) = &config.log.path {
        let appender = tracing_appender::rolling::daily(dir, "edge-data-handler.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        Ok(None)
    }
}

fn acquire_lock(spool_database: &str) -> Result<std::fs::File> {
    let lock_path = Path::new(spool_database).with_extension("lock");
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create spool directory {}: {e}", parent.display()))?;
        }
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "handler already running or lock unavailable ({}): {e}",
            lock_path.display()
        )
    })?;
    Ok(lock_file)
}
