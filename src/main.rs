use anyhow::{bail, Context, Result};
use clap::Parser;

use batchdl::cli::Args;
use batchdl::commands;
use batchdl::config::Settings;
use batchdl::coordinator::DownloadItem;

fn main() -> Result<()> {
    let args = Args::parse();
    batchdl::logging::init(args.verbose).context("Failed to initialise logging")?;
    let settings = Settings::load(&args)?;

    // Resolve paths to absolute before the runtime starts so relative paths stay stable
    let download_dir = commands::absolute_dir(args.download_dir.clone());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let items = if args.urls.is_empty() {
            commands::load_items(&args.tasks_file).await?
        } else {
            args.urls.iter().map(DownloadItem::new).collect()
        };
        if items.is_empty() {
            bail!("no urls given and {:?} is empty", args.tasks_file);
        }

        commands::run(items, download_dir, &settings, args.json).await
    })
}
