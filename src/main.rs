//! offline-sync - Offline-first sync engine with Hexagonal Architecture
//!
//! This is the composition root that wires together all the components.

use offline_sync::adapters::outbound::{
    DirectoryQuota, HttpRemoteStore, SqliteReplicaStore, SqliteSettingsStore,
};
use offline_sync::application::SyncNotification;
use offline_sync::infrastructure::shutdown_signal;
use offline_sync::{
    load_config, BackupSource, CancelHandle, DownloadProgress, Platform, RestoreProgress,
    SyncPorts, SyncService,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::format::FmtSpan;

const USAGE: &str = "usage: offline-sync <enable|sync-now|devices|conflicts|export <file> [--upload]|restore <file>|history>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        anyhow::bail!(USAGE);
    };

    tracing::info!(
        "starting offline-sync data_dir={} api={}",
        cfg.data_dir,
        cfg.api_url
    );

    // ===== COMPOSITION ROOT =====

    // 1. Outbound adapters
    std::fs::create_dir_all(&cfg.data_dir)?;
    let replica = Arc::new(SqliteReplicaStore::open(cfg.replica_path())?);
    let settings = Arc::new(SqliteSettingsStore::open(cfg.settings_path())?);
    let quota = Arc::new(DirectoryQuota::new(&cfg.data_dir, cfg.storage_quota_bytes()));
    let remote = Arc::new(HttpRemoteStore::new(cfg.remote())?);

    // 2. Application service
    let service = SyncService::new(
        cfg.sync(),
        SyncPorts {
            remote,
            replica,
            settings,
            quota,
        },
        Platform::detect(),
    )?;
    if cfg.credentials().is_authenticated() {
        service.sign_in();
    } else {
        tracing::warn!("no API key or access token configured, remote operations will fail");
    }

    // 3. Run the requested command until done or interrupted
    let cancel = CancelHandle::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match command {
        "enable" => enable(&service, &cancel).await?,
        "sync-now" => {
            let stats = service.sync_now().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "devices" => {
            for device in service.devices().await? {
                let marker = if device.is_current_device { "*" } else { " " };
                println!(
                    "{} {} {} ({}) last seen {}",
                    marker, device.id, device.name, device.platform, device.last_seen
                );
            }
        }
        "conflicts" => {
            let conflicts = service.detect_conflicts().await?;
            println!("{}", serde_json::to_string_pretty(&conflicts)?);
        }
        "export" => {
            let Some(path) = args.get(1) else {
                anyhow::bail!(USAGE);
            };
            let upload = args.iter().any(|a| a == "--upload");
            let snapshot = service.export_backup(upload).await?;
            tokio::fs::write(path, serde_json::to_vec_pretty(&snapshot)?).await?;
            println!("backup {} written to {}", snapshot.backup_id, path);
        }
        "restore" => {
            let Some(path) = args.get(1) else {
                anyhow::bail!(USAGE);
            };
            let backup = serde_json::from_slice(&tokio::fs::read(path).await?)?;
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_restore_progress(rx));
            let outcome = service
                .restore(BackupSource::Inline(backup), &cancel, Some(&tx))
                .await;
            drop(tx);
            let _ = printer.await;
            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        "history" => {
            println!("{}", serde_json::to_string_pretty(&service.history())?);
        }
        other => anyhow::bail!("unknown command '{}'\n{}", other, USAGE),
    }

    Ok(())
}

/// Bulk download with progress, then live sync until shutdown.
async fn enable(service: &SyncService, cancel: &CancelHandle) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_download_progress(rx));
    let outcome = service.enable(cancel, Some(&tx)).await;
    drop(tx);
    let _ = printer.await;
    outcome?;

    if let Some(mut events) = service.take_event_rx() {
        tokio::spawn(async move {
            while let Some(notification) = events.recv().await {
                log_notification(notification);
            }
        });
    }

    tracing::info!(device_id = %service.device_id(), "live sync running, Ctrl+C to stop");
    cancel.cancelled().await;
    service.disable().await;
    Ok(())
}

fn log_notification(notification: SyncNotification) {
    match notification {
        SyncNotification::StateChanged(state) => tracing::info!("connection {:?}", state),
        SyncNotification::EventApplied(event) => tracing::info!(
            store = %event.store,
            item_id = %event.item_id,
            "applied {} from {}",
            event.operation.as_str(),
            event.device_id
        ),
        SyncNotification::Conflict(report) => tracing::info!(
            store = %report.store,
            item_id = %report.item_id,
            "conflict resolved in favour of {:?}",
            report.winner
        ),
        SyncNotification::Queued { pending } => {
            tracing::warn!(pending, "remote unreachable, events queued")
        }
        SyncNotification::Error(message) => tracing::error!("{}", message),
    }
}

async fn print_download_progress(mut rx: mpsc::UnboundedReceiver<DownloadProgress>) {
    while let Some(p) = rx.recv().await {
        println!(
            "[{:>3}%] {} {}/{}",
            p.percent, p.stage, p.items_downloaded, p.total_items
        );
    }
}

async fn print_restore_progress(mut rx: mpsc::UnboundedReceiver<RestoreProgress>) {
    while let Some(p) = rx.recv().await {
        println!(
            "[{:>3}%] {:?} {} {}/{}",
            p.percent,
            p.stage,
            p.current_store.as_deref().unwrap_or("-"),
            p.items_processed,
            p.total_items
        );
    }
}
