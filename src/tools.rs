//! External programs the resolver shells out to: the plist converter, ImageMagick and an
//! optional headless browser. All of them go through [`ProcessRunner`] so every invocation
//! is bounded by a timeout and can be cancelled from outside.

use crate::error::{PreviewError, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs a command to completion, capturing stdout. The child is killed when the timeout
/// elapses or the shared cancel flag is raised.
#[derive(Clone)]
pub struct ProcessRunner {
    timeout: Duration,
    cancel: Arc<AtomicBool>,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag with the caller (e.g. the run driver).
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run(&self, mut command: Command) -> Result<Vec<u8>> {
        let program = command.get_program().to_string_lossy().into_owned();
        if self.cancel.load(Ordering::Relaxed) {
            return Err(PreviewError::Cancelled { program });
        }

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PreviewError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Drain both pipes off-thread so a chatty child cannot block on a full pipe.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if self.cancel.load(Ordering::Relaxed) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PreviewError::Cancelled { program });
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PreviewError::Timeout {
                    program,
                    timeout: self.timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout.join().unwrap_or_default();
        if !status.success() {
            let stderr = stderr.join().unwrap_or_default();
            return Err(PreviewError::ProcessFailed {
                program,
                status,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        debug!(program = %program, bytes = stdout.len(), "process finished");
        Ok(stdout)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Largest width/height a thumbnail may have; aspect ratio is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            max_width: 800,
            max_height: 600,
        }
    }
}

/// A synthesized placeholder: a headline, a smaller second line and an optional icon.
#[derive(Debug, Clone)]
pub struct Card<'a> {
    pub headline: &'a str,
    pub subline: &'a str,
    pub icon: Option<&'a Path>,
}

pub trait ImageConverter: Send + Sync {
    /// Normalize `source` to PNG at `target`, shrinking it to fit `bounds`.
    fn convert(&self, source: &Path, target: &Path, bounds: Bounds) -> Result<()>;
    fn render_card(&self, card: &Card<'_>, target: &Path) -> Result<()>;
}

/// ImageMagick 7 (`magick`).
pub struct Magick {
    program: PathBuf,
    runner: ProcessRunner,
}

impl Magick {
    pub fn new(program: impl Into<PathBuf>, runner: ProcessRunner) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }
}

const CARD_SIZE: &str = "400x200";
const CARD_TITLE_LIMIT: usize = 40;

impl ImageConverter for Magick {
    fn convert(&self, source: &Path, target: &Path, bounds: Bounds) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        // `[0]` keeps only the first frame of animated GIFs and multi-size ICOs.
        let mut input = source.as_os_str().to_owned();
        input.push("[0]");
        cmd.arg(input)
            .arg("-auto-orient")
            .arg("-resize")
            .arg(format!("{}x{}>", bounds.max_width, bounds.max_height))
            .args(["-quality", "85", "-strip"])
            .arg(png_target(target));
        self.runner.run(cmd).map(|_| ())
    }

    fn render_card(&self, card: &Card<'_>, target: &Path) -> Result<()> {
        let headline = truncate_chars(card.headline, CARD_TITLE_LIMIT);
        let mut cmd = Command::new(&self.program);
        cmd.args(["-size", CARD_SIZE, "xc:white"]);
        match card.icon {
            Some(icon) => {
                cmd.arg("(")
                    .arg(icon)
                    .args(["-resize", "32x32", ")"])
                    .args(["-gravity", "center", "-geometry", "+0-40", "-composite"])
                    .args(["-pointsize", "16", "-fill", "black", "-annotate", "+0+20"])
                    .arg(&headline)
                    .args(["-pointsize", "12", "-fill", "gray", "-annotate", "+0+40"])
                    .arg(card.subline);
            }
            None => {
                cmd.args(["-gravity", "center"])
                    .args(["-pointsize", "24", "-fill", "black", "-annotate", "+0-20"])
                    .arg(&headline)
                    .args(["-pointsize", "14", "-fill", "gray", "-annotate", "+0+20"])
                    .arg(card.subline);
            }
        }
        cmd.args(["-bordercolor", "lightgray", "-border", "2x2"])
            .arg(png_target(target));
        self.runner.run(cmd).map(|_| ())
    }
}

/// Force PNG output regardless of the staging file's extension.
fn png_target(target: &Path) -> std::ffi::OsString {
    let mut out = std::ffi::OsString::from("png:");
    out.push(target);
    out
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit.saturating_sub(3)).collect();
    format!("{kept}...")
}

pub trait Screenshotter: Send + Sync {
    /// Capture the rendered page at `url` as a PNG at `target`.
    fn capture(&self, url: &str, target: &Path) -> Result<()>;
}

/// Chromium-family browser in headless mode.
pub struct HeadlessBrowser {
    program: PathBuf,
    runner: ProcessRunner,
}

impl HeadlessBrowser {
    pub fn new(program: impl Into<PathBuf>, runner: ProcessRunner) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }
}

impl Screenshotter for HeadlessBrowser {
    fn capture(&self, url: &str, target: &Path) -> Result<()> {
        let mut shot = std::ffi::OsString::from("--screenshot=");
        shot.push(target);
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "--headless",
            "--disable-gpu",
            "--hide-scrollbars",
            "--window-size=1200,800",
        ])
        .arg(shot)
        .arg(url);
        self.runner.run(cmd).map(|_| ())
    }
}
