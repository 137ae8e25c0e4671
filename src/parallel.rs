use crate::importer::MessageSource;
use crate::pipeline::UrlThumbnail;
use crate::process::{self, Batch, Planner, Resolver, UrlJob};
use crossbeam_channel::{SendTimeoutError, bounded, unbounded};
use eyre::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Resolve every URL in the archive on `jobs` worker threads.
///
/// The calling thread is the only one touching the database: it plans jobs (deduplicating
/// URLs as it goes) and feeds them through a bounded channel. Workers only see owned
/// [`UrlJob`]s, so two workers never receive the same URL.
pub fn run(
    resolver: &Resolver,
    source: &dyn MessageSource,
    jobs: usize,
    quiet: bool,
    cancel: &AtomicBool,
) -> Result<Batch> {
    let messages = process::linked_messages(source)?;
    let mut planner = Planner::default();
    let planned: Vec<UrlJob> = messages
        .iter()
        .flat_map(|m| planner.jobs_for(resolver.pipeline().attachments(), source, m))
        .collect();

    let bar = process::progress_bar(planned.len() as u64, quiet);
    let n_workers = jobs.max(1);
    let (tx, rx) = bounded::<UrlJob>(n_workers * 4);
    let (result_tx, result_rx) = unbounded::<UrlThumbnail>();
    let count_resolved = AtomicUsize::new(0);
    let count_failed = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..n_workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            let (bar, count_resolved, count_failed) = (&bar, &count_resolved, &count_failed);

            s.spawn(move || {
                while let Ok(job) = rx.recv() {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let thumbnail = resolver.resolve_job(&job);
                    if thumbnail.success {
                        count_resolved.fetch_add(1, Ordering::Relaxed);
                    } else {
                        count_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    bar.inc(1);
                    if result_tx.send(thumbnail).is_err() {
                        break;
                    }
                }
            });
        }

        drop(rx);
        drop(result_tx);

        'outer: for job in planned {
            let mut pending = job;
            loop {
                if cancel.load(Ordering::Relaxed) {
                    warn!("cancelled, not queueing further URLs");
                    break 'outer;
                }
                match tx.send_timeout(pending, Duration::from_millis(50)) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Disconnected(_)) => break 'outer,
                    Err(SendTimeoutError::Timeout(j)) => {
                        pending = j;
                    }
                }
            }
        }

        drop(tx);
        Ok::<_, eyre::Error>(())
    })
    .wrap_err("Parallel resolution failed")?;

    bar.finish_and_clear();

    let thumbnails = result_rx.into_iter().map(|t| (t.url.clone(), t)).collect();
    info!(
        resolved = count_resolved.load(Ordering::Relaxed),
        failed = count_failed.load(Ordering::Relaxed),
        workers = n_workers,
        "link previews done"
    );
    Ok(Batch {
        messages,
        thumbnails,
    })
}
