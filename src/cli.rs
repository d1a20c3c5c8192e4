use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use crate::config::{self, load_settings};
use crate::engine::{Engine, OriginSource};
use crate::fetch::HttpFetcher;
use crate::log::RunLogger;
use crate::normalize::UrlRules;
use crate::registry::TestRegistry;
use crate::report::Reporter;
use crate::store::{self, StoredRun};
use crate::types::OutputMode;

#[derive(Parser)]
#[command(name = "siteparity", version, about = "Migration parity checks (CSV reports)")]
pub struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch every URL pair, run the configured tests and write reports
    Run(RunArgs),
    /// Validate a settings file without fetching anything
    Check(CheckArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Settings JSON (domain, auth, rewrites, test groups)
    #[arg(long)]
    settings: PathBuf,
    /// URL map CSV: url,section per line
    #[arg(long)]
    urls: PathBuf,
    /// Reuse origin values from a previous report instead of fetching live
    #[arg(long)]
    stored: Option<PathBuf>,
    /// Report directory (defaults to ~/.siteparity/reports)
    #[arg(long)]
    out: Option<PathBuf>,
    /// Override the batch size from settings
    #[arg(long)]
    batch: Option<usize>,
    /// Skip this many URLs from the front of the map
    #[arg(long)]
    offset: Option<usize>,
    /// Override the per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Override the pause between batches in seconds
    #[arg(long)]
    sleep: Option<u64>,
    /// Override the structural output mode
    #[arg(long, value_enum)]
    mode: Option<OutputMode>,
}

#[derive(Args)]
struct CheckArgs {
    #[arg(long)]
    settings: PathBuf,
}

/// Exit codes: 0 clean run, 1 failed tests or fetch errors, 2 fatal error.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Run(args) => match run_cmd(args).await {
            Ok(clean) => {
                if clean {
                    0
                } else {
                    1
                }
            }
            Err(e) => {
                eprintln!("error: {e:#}");
                2
            }
        },
        Command::Check(args) => match check_cmd(args) {
            Ok(()) => {
                println!("settings ok");
                0
            }
            Err(e) => {
                eprintln!("error: {e:#}");
                2
            }
        },
    }
}

async fn run_cmd(args: RunArgs) -> anyhow::Result<bool> {
    let mut settings = load_settings(&args.settings)
        .with_context(|| format!("loading settings from {}", args.settings.display()))?;
    if let Some(batch) = args.batch {
        settings.batch = batch;
    }
    if let Some(offset) = args.offset {
        settings.offset = offset;
    }
    if let Some(timeout) = args.timeout {
        settings.timeout_secs = timeout;
    }
    if let Some(sleep) = args.sleep {
        settings.sleep_secs = sleep;
    }
    if let Some(mode) = args.mode {
        settings.output_mode = mode;
    }
    settings.validate()?;

    let urls = store::load_url_map(&args.urls)
        .with_context(|| format!("loading url map from {}", args.urls.display()))?;

    let origin_source = match &args.stored {
        Some(path) => OriginSource::Stored(
            StoredRun::load(path)
                .with_context(|| format!("loading stored report from {}", path.display()))?,
        ),
        None => OriginSource::Live,
    };

    let out_dir = match args.out {
        Some(dir) => dir,
        None => config::default_report_dir()?,
    };
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating report directory {}", out_dir.display()))?;

    let rules = UrlRules::from_settings(&settings)?;
    let registry = TestRegistry::new(&settings.tests);
    let fetcher = HttpFetcher::new(settings.timeout_secs)?;
    let logger = RunLogger::new(&out_dir)?;
    let mut reporter =
        Reporter::new(&out_dir, matches!(origin_source, OriginSource::Stored(_)))?;

    let engine = Engine {
        settings: &settings,
        registry: &registry,
        rules: &rules,
        fetcher: &fetcher,
        logger: &logger,
    };
    let summary = engine.run(urls, &origin_source, &mut reporter).await?;

    let _ = logger.info(
        None,
        "run_done",
        Some(&format!("{} report lines", reporter.lines_written())),
    );
    print_json(&summary);
    Ok(summary.clean())
}

fn check_cmd(args: CheckArgs) -> anyhow::Result<()> {
    let settings = load_settings(&args.settings)
        .with_context(|| format!("loading settings from {}", args.settings.display()))?;
    settings.validate()?;
    Ok(())
}

fn print_json<T: serde::Serialize>(val: &T) {
    // pretty JSON output
    match serde_json::to_string_pretty(val) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("error: {e}"),
    }
}
