use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use shared::model::{ChapterKey, ChapterStatus, MangaId, OcrLanguage};
use shared::ocr_client::OcrClient;
use shared::settings::Settings;
use shared::status_tracker::OcrStatusTracker;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Directory holding settings.json.
    home_path: PathBuf,
    /// Overrides the OCR language from the settings file.
    #[arg(long)]
    language: Option<OcrLanguage>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the OCR status of a chapter.
    Status {
        manga_id: String,
        source_order: u64,
    },
    /// Start OCR for a chapter and watch it until it settles.
    Start {
        manga_id: String,
        source_order: u64,
    },
    /// Remove a chapter's OCR bookkeeping, and by default its cached data.
    Delete {
        manga_id: String,
        source_order: u64,
        /// Keep the cached OCR data on the server.
        #[arg(long)]
        keep_data: bool,
    },
    /// Print the status of several chapters of a manga in one round-trip.
    BatchStatus {
        manga_id: String,
        source_orders: Vec<u64>,
    },
    /// Check that the OCR server is reachable.
    ServerStatus,
    /// Clear the entire server-side OCR cache.
    PurgeCache,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_ansi(false))
        .init();

    let args = Args::parse();
    fs::create_dir_all(&args.home_path)
        .context("while trying to ensure the home folder exists")?;

    let settings_path = args.home_path.join("settings.json");
    let mut settings = Settings::from_file_or_default(&settings_path)
        .with_context(|| format!("couldn't read settings file at {}", settings_path.display()))?;
    if let Some(language) = args.language {
        settings.ocr_language = language;
    }

    let client = Arc::new(OcrClient::new(&settings));
    let tracker = OcrStatusTracker::new(client.clone(), settings.ocr_language);

    match args.command {
        Command::Status {
            manga_id,
            source_order,
        } => {
            let key = ChapterKey::from_parts(manga_id, source_order);
            let status = tracker.refresh(&key).await?;

            print_status(&key, &status)?;
        }
        Command::Start {
            manga_id,
            source_order,
        } => {
            let key = ChapterKey::from_parts(manga_id, source_order);
            tracker.start_ocr(&key).await?;

            watch_until_settled(&tracker, &key).await;

            if let Some(status) = tracker.status(&key) {
                print_status(&key, &status)?;
            }
        }
        Command::Delete {
            manga_id,
            source_order,
            keep_data,
        } => {
            let key = ChapterKey::from_parts(manga_id, source_order);
            tracker.delete_ocr(&key, !keep_data).await?;

            info!("deleted OCR state for {key}");
        }
        Command::BatchStatus {
            manga_id,
            source_orders,
        } => {
            let keys: Vec<ChapterKey> = source_orders
                .into_iter()
                .map(|source_order| {
                    ChapterKey::new(MangaId::new(manga_id.clone()), source_order)
                })
                .collect();

            let statuses = tracker.refresh_all(&keys).await?;

            for key in &keys {
                match statuses.get(key) {
                    Some(status) => print_status(key, status)?,
                    None => println!("{key}: unknown"),
                }
            }
        }
        Command::ServerStatus => {
            let status = client.server_status().await?;

            println!(
                "{} ({}): {} requests processed, {} items in cache, {} active jobs",
                status.status,
                status.backend,
                status.requests_processed,
                status.items_in_cache,
                status.active_jobs
            );
        }
        Command::PurgeCache => {
            client.purge_cache().await?;
            tracker.invalidate_all();

            info!("server-side OCR cache cleared");
        }
    }

    Ok(())
}

fn print_status(key: &ChapterKey, status: &ChapterStatus) -> anyhow::Result<()> {
    println!("{key}: {}", serde_json::to_string(status)?);

    Ok(())
}

/// Follows the tracker's map until its poll loop gives up or finishes, so the
/// command leaves behind an accurate final state.
async fn watch_until_settled(tracker: &OcrStatusTracker, key: &ChapterKey) {
    let mut last_reported = None;

    while tracker.is_polling(key) {
        let status = tracker.status(key);
        if let Some(ChapterStatus::Processing { progress, total }) = status {
            if last_reported != Some((progress, total)) {
                info!("processing {key}: {progress}/{total}");
                last_reported = Some((progress, total));
            }
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
