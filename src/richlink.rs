//! Rich-link metadata carried in `message.payload_data`.
//!
//! The blob is an `NSKeyedArchiver` property list whose schema Apple never published. Rather
//! than decode the object graph, the blob is rendered to text by a [`PlistDecoder`] (by default
//! `plutil -p`) and individual fields are picked out with targeted patterns. Every field is
//! optional; a layout change on a future OS release degrades to "less metadata", never to an
//! error for the whole message.
//!
//! The `plutil -p` rendering looks like:
//!
//! ```text
//! "$objects" => [
//!   0 => "$null"
//!   1 => {
//!     "title" => <CFKeyedArchiverUID 0x600000c3c0a0>{value = 5}
//!     "richLinkImageAttachmentSubstituteIndex" => 0
//!   }
//!   5 => "Example Domain"
//! ```
//!
//! Text fields are UID references into the `$objects` table, so each is a two-hop lookup.

use crate::error::{PreviewError, Result};
use crate::tools::ProcessRunner;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use tracing::debug;
use url::Url;

static ATTACHMENT_INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""richLinkImageAttachmentSubstituteIndex" => (\d+)"#).unwrap()
});

static EMBEDDED_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(https?://[^"\s]+)""#).unwrap());

/// Candidate fields recovered from one message's blob. Built per message, consumed by the
/// pipeline, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RichLinkMetadata {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub site_name: Option<String>,
    pub image_url: Option<String>,
    pub icon_url: Option<String>,
    pub image_attachment_index: Option<usize>,
    pub has_image: bool,
    pub has_icon: bool,
}

/// Substring heuristics separating preview images from icons. Empirically tuned; every list
/// can be replaced from the `[classifier]` config table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierRules {
    /// Hosts or path fragments that only ever serve preview images.
    pub preview_markers: Vec<String>,
    pub image_extensions: Vec<String>,
    pub icon_markers: Vec<String>,
    /// Fixed pixel sizes that betray a favicon or touch icon.
    pub icon_dimensions: Vec<String>,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        let owned =
            |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            preview_markers: owned(&["cdn-link-previews", "ytimg.com"]),
            image_extensions: owned(&[".jpg", ".jpeg", ".png", ".webp", ".gif"]),
            icon_markers: owned(&["favicon", "icon"]),
            icon_dimensions: owned(&["16x16", "32x32", "64x64"]),
        }
    }
}

impl ClassifierRules {
    fn any_of(list: &[String], url: &str) -> bool {
        list.iter().any(|needle| url.contains(needle.as_str()))
    }

    pub fn is_preview_image(&self, url: &str) -> bool {
        let lower = url.to_ascii_lowercase();
        if Self::any_of(&self.preview_markers, &lower) {
            return !lower.contains("favicon");
        }
        Self::any_of(&self.image_extensions, &lower)
            && !Self::any_of(&self.icon_markers, &lower)
            && !Self::any_of(&self.icon_dimensions, &lower)
    }

    pub fn is_icon(&self, url: &str) -> bool {
        let lower = url.to_ascii_lowercase();
        Self::any_of(&self.icon_markers, &lower) || Self::any_of(&self.icon_dimensions, &lower)
    }

    /// First preview candidate and first icon candidate, in blob order.
    pub fn classify<'a>(
        &self,
        urls: impl IntoIterator<Item = &'a str>,
    ) -> (Option<&'a str>, Option<&'a str>) {
        let mut preview = None;
        let mut icon = None;
        for url in urls {
            if self.is_preview_image(url) {
                preview = preview.or(Some(url));
            } else if self.is_icon(url) {
                icon = icon.or(Some(url));
            }
        }
        (preview, icon)
    }
}

/// Turns a raw payload blob into the indented text form the field extractor understands.
pub trait PlistDecoder: Send + Sync {
    fn decode(&self, blob: &[u8]) -> Result<String>;
}

/// Shells out to macOS `plutil -p`.
pub struct Plutil {
    program: PathBuf,
    runner: ProcessRunner,
}

impl Plutil {
    pub fn new(program: impl Into<PathBuf>, runner: ProcessRunner) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }
}

impl PlistDecoder for Plutil {
    fn decode(&self, blob: &[u8]) -> Result<String> {
        if blob.is_empty() {
            return Err(PreviewError::Metadata("empty payload".into()));
        }
        let mut tmp = tempfile::Builder::new()
            .prefix("payload_data")
            .suffix(".plist")
            .tempfile()?;
        tmp.write_all(blob)?;
        tmp.flush()?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("-p").arg(tmp.path());
        let output = self
            .runner
            .run(cmd)
            .map_err(|e| PreviewError::Metadata(e.to_string()))?;
        if output.is_empty() {
            return Err(PreviewError::Metadata("plutil produced no output".into()));
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

/// Decode `blob` and extract its fields. `original_url` feeds the per-service reconstruction
/// when the blob names no preview image.
pub fn parse(
    decoder: &dyn PlistDecoder,
    blob: &[u8],
    original_url: &str,
    rules: &ClassifierRules,
) -> Result<RichLinkMetadata> {
    let text = decoder.decode(blob)?;
    Ok(parse_plist_text(&text, original_url, rules))
}

pub fn parse_plist_text(
    text: &str,
    original_url: &str,
    rules: &ClassifierRules,
) -> RichLinkMetadata {
    let mut metadata = RichLinkMetadata {
        title: referenced_string(text, "title"),
        summary: referenced_string(text, "summary"),
        site_name: referenced_string(text, "siteName"),
        ..Default::default()
    };

    if let Some(index) = ATTACHMENT_INDEX_RE
        .captures(text)
        .and_then(|c| c[1].parse::<usize>().ok())
    {
        metadata.image_attachment_index = Some(index);
        metadata.has_image = true;
    }

    let urls = embedded_urls(text);
    let (preview, icon) = rules.classify(urls.iter().map(String::as_str));

    match preview {
        Some(url) => {
            debug!(url = %url, "found preview image in rich link");
            metadata.image_url = Some(url.to_string());
            metadata.has_image = true;
        }
        None => {
            if let Some(url) = reconstruct_preview_url(text, original_url) {
                debug!(url = %url, "reconstructed preview image");
                metadata.image_url = Some(url);
                metadata.has_image = true;
            }
        }
    }

    if let Some(url) = icon {
        metadata.icon_url = Some(url.to_string());
        metadata.has_icon = true;
    }

    metadata
}

/// Resolve `"field" => <UID>{value = N}` and then the string stored at object index `N`.
fn referenced_string(text: &str, field: &str) -> Option<String> {
    let reference = Regex::new(&format!(
        r#""{}" => <[^>]+>\{{value = (\d+)\}}"#,
        regex::escape(field)
    ))
    .ok()?;
    let index: usize = reference.captures(text)?[1].parse().ok()?;

    let entry = Regex::new(&format!(r#"(?m)^\s+{index} => "((?:[^"\\]|\\.)*)""#)).ok()?;
    let raw = entry.captures(text)?.get(1)?.as_str();
    let value = unescape(raw);
    (!value.trim().is_empty()).then_some(value)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn embedded_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    EMBEDDED_URL_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// Services that keep their artwork out of the blob but expose it at a predictable address.
pub fn reconstruct_preview_url(_plist_text: &str, original_url: &str) -> Option<String> {
    let url = Url::parse(original_url).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
    match host {
        "youtube.com" | "youtu.be" | "music.youtube.com" => youtube_thumbnail(&url),
        // Playlist and album artwork needs the catalog API; nothing to derive from the URL.
        "music.apple.com" | "itunes.apple.com" => None,
        _ => None,
    }
}

fn youtube_thumbnail(url: &Url) -> Option<String> {
    let id = if url.host_str()? == "youtu.be" {
        url.path_segments()?.next().map(str::to_string)
    } else if url.path() == "/watch" {
        url.query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
    } else {
        let mut segments = url.path_segments()?;
        match segments.next() {
            Some("shorts") | Some("embed") | Some("live") => segments.next().map(str::to_string),
            _ => None,
        }
    }?;
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then(|| format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg"))
}
