use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Verify only when a hash was provided
    #[default]
    Auto,
    /// Require a hash for every file
    On,
    /// Never verify
    Off,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Download a batch of URLs into one directory", long_about = None)]
pub struct Args {
    /// URLs to download (if provided, tasks-file is ignored)
    #[arg(index = 1)]
    pub urls: Vec<String>,

    /// Path to a file containing URLs, one per line, optionally as `url|sha256`
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    pub tasks_file: PathBuf,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Maximum number of concurrent transfers (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// How often progress is sampled, in milliseconds
    #[arg(short = 'i', long = "interval-ms")]
    pub interval_ms: Option<u64>,

    /// JSON settings file; command-line flags take precedence
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
    #[arg(long = "verify-hash", value_enum)]
    pub verify_hash: Option<VerifyMode>,

    /// Print the batch summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}
