use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::cli::VerifyMode;
use crate::config::Settings;
use crate::coordinator::{BatchSummary, Coordinator, CoordinatorState, DownloadItem};
use crate::transport::HttpTransport;

/// How often the host feeds time into the coordinator and redraws the bar.
const HOST_TICK: Duration = Duration::from_millis(100);
const BAR_SCALE: u64 = 1000;

pub async fn load_items(input: &Path) -> Result<Vec<DownloadItem>> {
    let file = fs::File::open(input)
        .await
        .context(format!("Failed to open input file: {:?}", input))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut items = vec![];
    while let Some(line) = lines.next_line().await? {
        if let Some(item) = DownloadItem::parse_line(&line) {
            items.push(item);
        }
    }
    Ok(items)
}

pub fn check_hashes(items: &[DownloadItem], verify_mode: VerifyMode) -> Result<()> {
    if verify_mode != VerifyMode::On {
        return Ok(());
    }
    let missing: Vec<&str> = items
        .iter()
        .filter(|i| i.hash.is_none())
        .map(|i| i.url.as_str())
        .collect();
    if !missing.is_empty() {
        bail!("hash verification is on, but these entries have no hash: {:?}", missing);
    }
    Ok(())
}

/// Downloads `items` into `output` and returns the finished batch's summary.
/// Ctrl-C cancels every transfer still running.
pub async fn run_batch(items: &[DownloadItem], output: &Path, settings: &Settings) -> Result<BatchSummary> {
    if !output.exists() {
        fs::create_dir_all(output)
            .await
            .context("Failed to create output directory")?;
    }

    let transport = HttpTransport::new(settings.transport())?;
    let mut coordinator = Coordinator::new(transport, settings.coordinator());

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    coordinator.subscribe(move |state| {
        let _ = state_tx.send(state);
    });
    coordinator.start_items(output, items)?;

    let pb = ProgressBar::new(BAR_SCALE);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")?
            .progress_chars("=>-"),
    );

    let mut interval = tokio::time::interval(HOST_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last = Instant::now();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                coordinator.tick(now - last);
                last = now;

                let done = coordinator
                    .jobs()
                    .iter()
                    .filter(|job| job.status.is_terminal())
                    .count();
                pb.set_position((coordinator.aggregate_progress() * BAR_SCALE as f32) as u64);
                pb.set_message(format!("{}/{} files", done, coordinator.jobs().len()));
            }
            _ = &mut ctrl_c => {
                coordinator.clear_batch();
                pb.abandon_with_message("Cancelled");
                bail!("download cancelled");
            }
        }

        while let Ok(state) = state_rx.try_recv() {
            if state != CoordinatorState::Finished {
                continue;
            }
            let summary = coordinator
                .summary()
                .cloned()
                .context("finished batch has no summary")?;
            pb.finish_with_message(format!(
                "{}/{} succeeded",
                summary.success_count, summary.total
            ));
            info!("Finished download, dest path: {:?}", output);
            coordinator.clear_batch();
            return Ok(summary);
        }
    }
}

pub fn print_summary(summary: &BatchSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!(
        "Summary: Files: {}/{} succeeded",
        summary.success_count, summary.total
    );
    if let Some(first) = &summary.first_error {
        println!("First error: {} {}", first.url, first.error);
    }
    Ok(())
}

/// Resolves the download directory against the current directory.
pub fn absolute_dir(dir: PathBuf) -> PathBuf {
    if dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            return cwd.join(dir);
        }
    }
    dir
}

pub async fn run(items: Vec<DownloadItem>, output: PathBuf, settings: &Settings, json: bool) -> Result<()> {
    check_hashes(&items, settings.verify_hash)?;
    let summary = run_batch(&items, &output, settings).await?;
    print_summary(&summary, json)?;

    if !summary.all_succeeded() {
        let failed = summary.total - summary.success_count;
        error!("{} of {} downloads failed", failed, summary.total);
        bail!("{} of {} downloads failed", failed, summary.total);
    }
    Ok(())
}
