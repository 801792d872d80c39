//! Headless entrypoint for Polaroid.
//!
//! Stands in for the display layer: indexes the library, then logs one random
//! photo per display interval. All logic lives in the library crate.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use polaroid::PhotoService;
use polaroid::config::Configuration;
use polaroid::settings::{Reconciled, Settings, SettingsStore};
use polaroid::store::Environment;

#[derive(Debug, Parser)]
#[command(name = "polaroid", version, about = "Random slideshow over a locally indexed photo library")]
struct Cli {
    /// Path to YAML config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the photo store (overrides the config file)
    #[arg(long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Change the saved photo library directory
    #[arg(long, value_name = "DIR")]
    source_dir: Option<PathBuf>,

    /// Change the saved display duration, in seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<i64>,

    /// Exit after showing this many photos
    #[arg(long, value_name = "N")]
    picks: Option<usize>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // map -v to log level
    let level = match verbosity {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    };
    if let Some(level) = level {
        filter = filter.add_directive(format!("polaroid={level}").parse()?);
    }
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

fn log_outcome(key: &str, outcome: &Reconciled) {
    match outcome {
        Reconciled::Unchanged => {}
        Reconciled::Reverted => warn!(key, "invalid setting ignored"),
        Reconciled::Accepted(_) => info!(key, "setting changed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let cfg = match &cli.config {
        Some(path) => Configuration::from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Configuration::default(),
    }
    .validated()
    .context("validating configuration")?;

    let workdir = match cli.workdir {
        Some(dir) => dir,
        None => cfg.resolve_working_dir()?,
    };
    let env = Environment::open(&workdir)
        .with_context(|| format!("opening store in {}", workdir.display()))?;
    let store = SettingsStore::new(env.clone());
    let mut settings = Settings::load(&store, &cfg.defaults.resolve()).context("loading settings")?;

    let service = PhotoService::start(env, &cfg, settings.source_dir.committed().clone());
    service.start_indexing(settings.source_dir.committed());

    // Command-line edits take the same apply-or-revert path as an edit session.
    if let Some(dir) = &cli.source_dir {
        let dir = std::path::absolute(dir)?;
        settings.source_dir.propose(dir.to_string_lossy().into_owned());
    }
    if let Some(secs) = cli.duration {
        settings.duration.propose(secs);
    }
    if settings.has_pending_edits() {
        let indexer = service.indexer().clone();
        let report = settings.reconcile_all(service.settings(), move |dir| {
            indexer.start(dir);
        });
        for (key, outcome) in [
            ("SourceDir", report.source_dir),
            ("Duration", report.duration),
            ("ShowPath", report.show_path),
        ] {
            log_outcome(key, &outcome);
            if let Reconciled::Accepted(saving) = outcome {
                saving.await.context("saving setting")?;
            }
        }
    }

    let search_path = settings.source_dir.committed().clone();
    let secs = u64::try_from(*settings.duration.committed()).unwrap_or(1).max(1);
    let dwell = Duration::from_secs(secs);
    let show_path = *settings.show_path.committed();
    info!(
        source_dir = %search_path,
        dwell = %humantime::format_duration(dwell),
        "slideshow started"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(dwell);
    let mut shown = 0usize;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupt received; shutting down");
                break;
            }
            _ = ticker.tick() => {
                match service.request_random_photo(search_path.clone()).await {
                    Ok(Some(pick)) => {
                        shown += 1;
                        let indexed = pick.is_indexed();
                        let photo = pick.into_photo();
                        if show_path {
                            info!(path = %photo.path, hidden = photo.hidden, indexed, "showing photo");
                        } else {
                            info!(indexed, "showing photo");
                        }
                    }
                    Ok(None) => info!(search_path = %search_path, "no photo available yet"),
                    Err(err) => {
                        warn!(error = %err, "photo selection unavailable");
                        break;
                    }
                }
                if cli.picks.is_some_and(|n| shown >= n) {
                    break;
                }
            }
        }
    }

    service.close().await?;
    Ok(())
}
