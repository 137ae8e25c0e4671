//! Run-scoped driver: turns messages into URL jobs, remembers which URLs a run has already
//! handled, and resolves them one at a time.

use crate::attachments::AttachmentResolver;
use crate::importer::{MessageAttachment, MessageRow, MessageSource};
use crate::pipeline::{Pipeline, UrlThumbnail};
use crate::richlink::{self, ClassifierRules, PlistDecoder, RichLinkMetadata};
use crate::urls;
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// One distinct URL and everything its owning message can tell the pipeline about it.
#[derive(Debug, Clone)]
pub struct UrlJob {
    pub message_id: i64,
    pub url: String,
    /// Rich-link blob, only for the first URL of a message that carries one.
    pub payload: Option<Vec<u8>>,
    pub attachments: Vec<MessageAttachment>,
}

/// The stateless half of a run: shared, read-only, safe to use from several threads.
pub struct Resolver {
    pipeline: Pipeline,
    decoder: Box<dyn PlistDecoder>,
    rules: ClassifierRules,
}

impl Resolver {
    pub fn new(pipeline: Pipeline, decoder: Box<dyn PlistDecoder>, rules: ClassifierRules) -> Self {
        Self {
            pipeline,
            decoder,
            rules,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Decoded metadata for the job's blob, or `None` if it has none or it is unreadable. A
    /// decode failure only means the strategies that need metadata get skipped.
    pub fn metadata(&self, job: &UrlJob) -> Option<RichLinkMetadata> {
        let blob = job.payload.as_deref()?;
        match richlink::parse(self.decoder.as_ref(), blob, &job.url, &self.rules) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(
                    message_id = job.message_id,
                    url = %job.url,
                    "rich-link metadata unavailable: {e}"
                );
                None
            }
        }
    }

    pub fn resolve_job(&self, job: &UrlJob) -> UrlThumbnail {
        let metadata = self.metadata(job);
        self.pipeline
            .resolve(&job.url, metadata.as_ref(), &job.attachments)
    }
}

/// Hands out each URL at most once per run.
#[derive(Default)]
pub struct Planner {
    planned: HashSet<String>,
}

impl Planner {
    /// Jobs for the URLs in `message` this run has not seen yet. Source errors degrade to
    /// "no payload" and "no attachments".
    pub fn jobs_for(
        &mut self,
        attachments: &AttachmentResolver,
        source: &dyn MessageSource,
        message: &MessageRow,
    ) -> Vec<UrlJob> {
        let mut jobs = Vec::new();
        for (position, url) in urls::find_urls(&message.text).into_iter().enumerate() {
            if !self.planned.insert(url.clone()) {
                debug!(url = %url, "already handled in this run");
                continue;
            }
            let payload = (position == 0 && message.has_payload)
                .then(|| read_payload(source, message.id))
                .flatten();
            let attachments = if payload.is_some() {
                attachments.resolve(source, message.id)
            } else {
                Vec::new()
            };
            jobs.push(UrlJob {
                message_id: message.id,
                url,
                payload,
                attachments,
            });
        }
        jobs
    }
}

fn read_payload(source: &dyn MessageSource, message_id: i64) -> Option<Vec<u8>> {
    source.payload(message_id).unwrap_or_else(|e| {
        warn!(message_id, "payload read failed: {e:#}");
        None
    })
}

/// Messages that mention at least one URL, plus the outcome for every distinct URL.
#[derive(Debug, Default)]
pub struct Batch {
    pub messages: Vec<MessageRow>,
    pub thumbnails: BTreeMap<String, UrlThumbnail>,
}

impl Batch {
    pub fn resolved(&self) -> usize {
        self.thumbnails.values().filter(|t| t.success).count()
    }

    pub fn failed(&self) -> usize {
        self.thumbnails.len() - self.resolved()
    }
}

/// One generation run. Owns the seen-URL map; nothing is shared with other runs.
pub struct PreviewRun<'r> {
    resolver: &'r Resolver,
    planner: Planner,
    thumbnails: BTreeMap<String, UrlThumbnail>,
}

impl<'r> PreviewRun<'r> {
    pub fn new(resolver: &'r Resolver) -> Self {
        Self {
            resolver,
            planner: Planner::default(),
            thumbnails: BTreeMap::new(),
        }
    }

    /// Resolve the new URLs of one message. Returns how many were resolved now.
    pub fn process_message(&mut self, source: &dyn MessageSource, message: &MessageRow) -> usize {
        let jobs = self
            .planner
            .jobs_for(self.resolver.pipeline.attachments(), source, message);
        let count = jobs.len();
        for job in jobs {
            let thumbnail = self.resolver.resolve_job(&job);
            self.thumbnails.insert(job.url, thumbnail);
        }
        count
    }

    pub fn thumbnails(&self) -> &BTreeMap<String, UrlThumbnail> {
        &self.thumbnails
    }

    pub fn into_thumbnails(self) -> BTreeMap<String, UrlThumbnail> {
        self.thumbnails
    }
}

/// Messages worth processing, i.e. those with at least one URL.
pub fn linked_messages(source: &dyn MessageSource) -> Result<Vec<MessageRow>> {
    let messages = source.messages().wrap_err("Failed to list messages")?;
    Ok(messages
        .into_iter()
        .filter(|m| !urls::find_urls(&m.text).is_empty())
        .collect())
}

pub(crate) fn progress_bar(len: u64, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

/// Resolve every URL in the archive, one at a time. Stops early, keeping what it has, once
/// `cancel` is set.
pub fn run(
    resolver: &Resolver,
    source: &dyn MessageSource,
    quiet: bool,
    cancel: &AtomicBool,
) -> Result<Batch> {
    let messages = linked_messages(source)?;
    let bar = progress_bar(messages.len() as u64, quiet);
    let mut run = PreviewRun::new(resolver);

    for (done, message) in messages.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            warn!(
                remaining = messages.len() - done,
                "cancelled before all messages were processed"
            );
            break;
        }
        run.process_message(source, message);
        bar.inc(1);
    }
    bar.finish_and_clear();

    let batch = Batch {
        messages,
        thumbnails: run.into_thumbnails(),
    };
    info!(
        urls = batch.thumbnails.len(),
        resolved = batch.resolved(),
        failed = batch.failed(),
        "link previews done"
    );
    Ok(batch)
}
