//! pdbpatch
//!
//! Converts the audio on a Pioneer USB export to another format and patches
//! export.pdb and the ANLZ files in place so cues, grids and playlists
//! survive.

mod config;
mod convert;
mod pipeline;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pdbpatch_core::{MappingPolicy, WriteOptions};

use config::{RunConfig, Stages, Strategy};
use convert::FfmpegEncoder;

#[derive(Parser)]
#[command(name = "pdbpatch")]
#[command(about = "Transcode a rekordbox USB export and patch its database in place")]
#[command(version)]
struct Cli {
    /// Path to the USB drive root (e.g. /Volumes/MY_USB)
    root: PathBuf,

    /// Format mapping, repeatable
    #[arg(short, long = "map", value_name = "SOURCE=TARGET", default_value = "flac=aiff")]
    map: Vec<String>,

    /// Only patch the database (files already converted)
    #[arg(long, conflicts_with = "convert_only")]
    patch_only: bool,

    /// Only convert audio, leave the database alone
    #[arg(long)]
    convert_only: bool,

    /// Keep source files after conversion
    #[arg(long)]
    keep_originals: bool,

    #[arg(long, value_enum, default_value_t = Strategy::CacheFirst)]
    strategy: Strategy,

    /// Concurrent encoder processes (default depends on strategy)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Local staging directory for cache-first conversion
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Skip the one-time export.pdb.backup copy
    #[arg(long)]
    no_backup: bool,

    /// ffmpeg binary
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so --json output stays clean
    let default_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    // Validate every mapping before anything on the medium is touched
    let policy = MappingPolicy::from_pairs(&cli.map).context("invalid --map")?;

    let config = RunConfig {
        root: cli.root,
        policy,
        stages: Stages::from_flags(cli.patch_only, cli.convert_only),
        keep_originals: cli.keep_originals,
        strategy: cli.strategy,
        workers: cli.jobs.unwrap_or_else(|| cli.strategy.default_workers()),
        cache_dir: cli.cache_dir,
        write: WriteOptions {
            backup: !cli.no_backup,
        },
    };

    info!("Export root: {:?}", config.root);
    for mapping in config.policy.iter() {
        info!("Mapping {} -> {}", mapping.source, mapping.target);
    }

    let encoder = Arc::new(FfmpegEncoder::new(cli.ffmpeg));
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let summary = pipeline::run(&config, encoder, interrupt).await?;

    summary.log();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(summary.succeeded())
}
