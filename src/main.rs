use clap::Parser;
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use threadbound_links::richlink::ClassifierRules;
use threadbound_links::substitute::ReferenceStyle;
use threadbound_links::tools::Bounds;
use threadbound_links::utils::{self, Programs, RunConfig, Timeouts};
use tracing_subscriber::EnvFilter;

/// Resolve link previews in a Messages archive into cached thumbnails.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory for the manifest, the message digest and the thumbnail cache.
    /// Defaults to ./threadbound-links if not set in config.
    #[arg(value_name = "TARGET_DIR")]
    target_dir: Option<PathBuf>,

    /// Path to the Messages database (chat.db).
    /// Defaults to ~/Library/Messages/chat.db.
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Root that attachment paths are resolved against.
    /// Defaults to ~/Library/Messages.
    #[arg(long, value_name = "PATH")]
    attachments: Option<PathBuf>,

    /// Thumbnail cache directory. Defaults to TARGET_DIR/url-thumbnails.
    #[arg(long, value_name = "PATH")]
    cache_dir: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/threadbound/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Resolve this many URLs concurrently.
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,

    /// Never touch the network: only attachments and generated cards.
    #[arg(long)]
    offline: bool,

    /// Try a headless-browser screenshot before falling back to a domain card.
    #[arg(long)]
    screenshots: bool,

    /// How resolved links are written into message text.
    #[arg(long, value_enum, value_name = "STYLE")]
    reference: Option<ReferenceStyle>,

    /// Read the database in place instead of snapshotting it first.
    #[arg(long)]
    no_snapshot: bool,

    /// Log every strategy attempt.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress progress output and warnings.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    target_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    attachments_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    jobs: Option<usize>,
    offline: Option<bool>,
    screenshots: Option<bool>,
    reference: Option<ReferenceStyle>,
    reference_prefix: Option<String>,
    timeouts: TimeoutsConfig,
    tools: ToolsConfig,
    limits: LimitsConfig,
    classifier: Option<ClassifierRules>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct TimeoutsConfig {
    page_secs: Option<u64>,
    image_secs: Option<u64>,
    process_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ToolsConfig {
    plutil: Option<PathBuf>,
    magick: Option<PathBuf>,
    browser: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LimitsConfig {
    max_width: Option<u32>,
    max_height: Option<u32>,
    max_download_bytes: Option<u64>,
}

fn messages_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|d| d.join("Library/Messages"))
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("threadbound/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if quiet {
        "error"
    } else if verbose {
        "threadbound_links=debug,warn"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve paths (CLI > Config > Default)
    let target_dir = cli
        .target_dir
        .or(file_cfg.target_dir)
        .unwrap_or_else(|| PathBuf::from("threadbound-links"));

    let db_path = cli
        .db
        .or(file_cfg.db_path)
        .or_else(|| messages_dir().map(|d| d.join("chat.db")))
        .ok_or_else(|| {
            eyre!(
                "Could not determine database path.\n\
                 Use --db to specify manually, or set db_path in config.toml."
            )
        })?;

    if !db_path.exists() {
        return Err(eyre!(
            "Database not found at: {}\nUse --db to specify the path manually.",
            db_path.display()
        ));
    }

    let attachments_dir = cli
        .attachments
        .or(file_cfg.attachments_dir)
        .or_else(messages_dir)
        .ok_or_else(|| eyre!("Could not determine attachments directory. Use --attachments."))?;

    let cache_dir = cli
        .cache_dir
        .or(file_cfg.cache_dir)
        .unwrap_or_else(|| target_dir.join("url-thumbnails"));

    // A cache outside the target dir is referenced by absolute path.
    let reference_prefix = file_cfg.reference_prefix.or_else(|| {
        cache_dir
            .strip_prefix(&target_dir)
            .ok()
            .map(|rel| rel.to_string_lossy().into_owned())
    });

    // 3. Resolve behaviour switches
    let timeouts = Timeouts::default();
    let timeouts = Timeouts {
        page: file_cfg.timeouts.page_secs.map_or(timeouts.page, Duration::from_secs),
        image: file_cfg.timeouts.image_secs.map_or(timeouts.image, Duration::from_secs),
        process: file_cfg.timeouts.process_secs.map_or(timeouts.process, Duration::from_secs),
    };
    let programs = Programs::default();
    let programs = Programs {
        plutil: file_cfg.tools.plutil.unwrap_or(programs.plutil),
        magick: file_cfg.tools.magick.unwrap_or(programs.magick),
        browser: file_cfg.tools.browser.unwrap_or(programs.browser),
    };
    let bounds = Bounds::default();
    let bounds = Bounds {
        max_width: file_cfg.limits.max_width.unwrap_or(bounds.max_width),
        max_height: file_cfg.limits.max_height.unwrap_or(bounds.max_height),
    };

    let config = RunConfig {
        target_dir,
        db_path,
        attachments_dir,
        cache_dir,
        jobs: cli.jobs.or(file_cfg.jobs).unwrap_or(1),
        offline: cli.offline || file_cfg.offline.unwrap_or(false),
        screenshots: cli.screenshots || file_cfg.screenshots.unwrap_or(false),
        snapshot: !cli.no_snapshot,
        quiet: cli.quiet,
        reference: cli.reference.or(file_cfg.reference).unwrap_or_default(),
        reference_prefix,
        timeouts,
        programs,
        bounds,
        max_download_bytes: file_cfg
            .limits
            .max_download_bytes
            .unwrap_or(utils::DEFAULT_MAX_DOWNLOAD_BYTES),
        classifier: file_cfg.classifier.unwrap_or_default(),
    };

    // 4. Run
    utils::execute(&config)?;
    Ok(())
}
