use crate::attachments::AttachmentResolver;
use crate::cache::ThumbnailCache;
use crate::exporter::{self, Written};
use crate::fetch::HttpFetcher;
use crate::importer::ChatDb;
use crate::parallel;
use crate::pipeline::{Pipeline, Tools};
use crate::process::{self, Resolver};
use crate::richlink::{ClassifierRules, Plutil};
use crate::substitute::{ReferenceStyle, Substituter};
use crate::tools::{Bounds, HeadlessBrowser, Magick, ProcessRunner, Screenshotter};
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::{Connection, OpenFlags, backup::Backup};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::info;

/// Everything one run needs, already resolved from CLI, config file and defaults.
/// This decouples the logic from how the arguments were parsed.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target_dir: PathBuf,
    pub db_path: PathBuf,
    pub attachments_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub jobs: usize,
    pub offline: bool,
    pub screenshots: bool,
    pub snapshot: bool,
    pub quiet: bool,
    pub reference: ReferenceStyle,
    /// Directory the document layer sees thumbnails under; `None` writes absolute cache paths.
    pub reference_prefix: Option<String>,
    pub timeouts: Timeouts,
    pub programs: Programs,
    pub bounds: Bounds,
    pub max_download_bytes: u64,
    pub classifier: ClassifierRules,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub page: Duration,
    pub image: Duration,
    pub process: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            page: Duration::from_secs(10),
            image: Duration::from_secs(15),
            process: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Programs {
    pub plutil: PathBuf,
    pub magick: PathBuf,
    pub browser: PathBuf,
}

impl Default for Programs {
    fn default() -> Self {
        Self {
            plutil: PathBuf::from("plutil"),
            magick: PathBuf::from("magick"),
            browser: PathBuf::from("chromium"),
        }
    }
}

pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Wire the real tools together. The cancel flag reaches every child process.
pub fn build_resolver(config: &RunConfig, cancel: Arc<AtomicBool>) -> Result<Resolver> {
    let runner = ProcessRunner::new(config.timeouts.process).with_cancel(cancel);
    let fetcher = HttpFetcher::new(
        config.timeouts.page,
        config.timeouts.image,
        config.max_download_bytes,
    )
    .wrap_err("Failed to build HTTP client")?;
    let screenshotter = config.screenshots.then(|| {
        let browser = HeadlessBrowser::new(&config.programs.browser, runner.clone());
        Box::new(browser) as Box<dyn Screenshotter>
    });
    let tools = Tools {
        fetcher: Box::new(fetcher),
        converter: Box::new(Magick::new(&config.programs.magick, runner.clone())),
        screenshotter,
    };

    let mut pipeline = Pipeline::new(
        ThumbnailCache::new(&config.cache_dir),
        AttachmentResolver::new(&config.attachments_dir),
        tools,
    )
    .with_bounds(config.bounds);
    if config.offline {
        pipeline = pipeline.offline();
    }

    Ok(Resolver::new(
        pipeline,
        Box::new(Plutil::new(&config.programs.plutil, runner)),
        config.classifier.clone(),
    ))
}

/// Snapshot the database, resolve every link, write the manifest and digest.
///
/// Runs to completion: no interrupt handler is installed. Callers that need to stop a run
/// early build their own flag, pass it to [`build_resolver`] and drive [`process::run`] or
/// [`parallel::run`] with it.
pub fn execute(config: &RunConfig) -> Result<Written> {
    let cancel = Arc::new(AtomicBool::new(false));
    let resolver = build_resolver(config, Arc::clone(&cancel))?;

    let snapshot = if config.snapshot {
        Some(backup_database(&config.db_path, config.quiet)?)
    } else {
        None
    };
    let db_path = snapshot.as_ref().map_or(config.db_path.as_path(), |s| s.path());
    let db = ChatDb::open(db_path)?;

    let batch = if config.jobs > 1 {
        parallel::run(&resolver, &db, config.jobs, config.quiet, &cancel)?
    } else {
        process::run(&resolver, &db, config.quiet, &cancel)?
    };

    let substituter = Substituter::new(config.reference, config.reference_prefix.clone());
    let written = exporter::export(&batch, &config.cache_dir, &substituter, &config.target_dir)?;
    info!(
        manifest = %written.manifest.display(),
        digest = %written.digest.display(),
        "export written"
    );
    if !config.quiet {
        eprintln!(
            "Done. {} links, {} thumbnails, {} left as text.",
            batch.thumbnails.len(),
            batch.resolved(),
            batch.failed(),
        );
    }
    Ok(written)
}

/// Copy the live database into a temporary file with the SQLite backup API, so Messages
/// holding locks cannot stall the run.
pub fn backup_database(db_path: &Path, quiet: bool) -> Result<NamedTempFile> {
    let spinner = if quiet {
        ProgressBar::hidden()
    } else {
        let s = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg}") {
            s.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        }
        s.set_message("Snapshotting database...");
        s.enable_steady_tick(Duration::from_millis(80));
        s
    };

    let src = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .wrap_err_with(|| format!("Failed to open source database: {}", db_path.display()))?;

    let tmp = NamedTempFile::new().wrap_err("Failed to create temporary file")?;
    let mut dst =
        Connection::open(tmp.path()).wrap_err("Failed to open snapshot database connection")?;

    {
        let backup = Backup::new(&src, &mut dst).wrap_err("Failed to initialize backup")?;
        backup
            .run_to_completion(1000, Duration::from_millis(5), None)
            .wrap_err("Backup did not complete successfully")?;
    }

    drop(src);
    spinner.finish_and_clear();
    Ok(tmp)
}
