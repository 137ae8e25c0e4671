//! Thumbnail resolution for a single URL.
//!
//! A cache hit short-circuits everything. Otherwise the strategies in the chain run in order,
//! each writing into a fresh staging file inside the cache directory; the first one that
//! produces a non-empty image is published into the cache and wins. Failures are logged and
//! skipped. The last link, the domain card, only fails when the filesystem does.

use crate::attachments::AttachmentResolver;
use crate::cache::ThumbnailCache;
use crate::error::{PreviewError, Result};
use crate::fetch::{self, Fetcher};
use crate::importer::MessageAttachment;
use crate::richlink::RichLinkMetadata;
use crate::tools::{Bounds, Card, ImageConverter, Screenshotter};
use serde::Serialize;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

/// Outcome for one URL. Exactly one exists per distinct URL per run and it is never mutated
/// after being produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlThumbnail {
    pub url: String,
    pub title: String,
    pub description: String,
    /// Present iff `success`.
    pub thumbnail_path: Option<PathBuf>,
    pub success: bool,
    /// Diagnostic only.
    pub error: Option<String>,
    /// Which link of the chain produced the thumbnail.
    pub strategy: Option<Strategy>,
}

impl UrlThumbnail {
    fn resolved(
        url: &str,
        title: String,
        description: String,
        path: PathBuf,
        strategy: Strategy,
    ) -> Self {
        Self {
            url: url.to_string(),
            title,
            description,
            thumbnail_path: Some(path),
            success: true,
            error: None,
            strategy: Some(strategy),
        }
    }

    fn failed(url: &str, title: String, description: String, error: &PreviewError) -> Self {
        Self {
            url: url.to_string(),
            title,
            description,
            thumbnail_path: None,
            success: false,
            error: Some(error.to_string()),
            strategy: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Cache,
    AttachmentCopy,
    MetadataImage,
    MetadataIcon,
    LivePage,
    Screenshot,
    DomainCard,
}

impl Strategy {
    /// Every strategy after the cache check, in the order they are tried.
    pub const CHAIN: [Strategy; 6] = [
        Strategy::AttachmentCopy,
        Strategy::MetadataImage,
        Strategy::MetadataIcon,
        Strategy::LivePage,
        Strategy::Screenshot,
        Strategy::DomainCard,
    ];

    pub fn needs_network(self) -> bool {
        matches!(
            self,
            Strategy::MetadataImage
                | Strategy::MetadataIcon
                | Strategy::LivePage
                | Strategy::Screenshot
        )
    }
}

/// Injectable capabilities the strategies call out to.
pub struct Tools {
    pub fetcher: Box<dyn Fetcher>,
    pub converter: Box<dyn ImageConverter>,
    pub screenshotter: Option<Box<dyn Screenshotter>>,
}

/// Everything one strategy gets to look at.
struct Candidate<'a> {
    url: &'a str,
    metadata: Option<&'a RichLinkMetadata>,
    attachments: &'a [MessageAttachment],
}

/// Text a strategy learned along the way; the image itself is in the staging file.
#[derive(Default)]
struct Found {
    title: Option<String>,
    description: Option<String>,
}

/// Stand-in written when even the card renderer is unavailable: a 1x1 white PNG.
const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90, 0x77, 0x53,
    0xde, 0x00, 0x00, 0x00, 0x0c, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0xf8, 0xff, 0xff, 0x3f,
    0x00, 0x05, 0xfe, 0x02, 0xfe, 0x0d, 0xef, 0x46, 0xb8, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e,
    0x44, 0xae, 0x42, 0x60, 0x82,
];

const WEB_LINK: &str = "Web Link";

pub struct Pipeline {
    cache: ThumbnailCache,
    attachments: AttachmentResolver,
    tools: Tools,
    chain: Vec<Strategy>,
    bounds: Bounds,
}

impl Pipeline {
    pub fn new(cache: ThumbnailCache, attachments: AttachmentResolver, tools: Tools) -> Self {
        Self {
            cache,
            attachments,
            tools,
            chain: Strategy::CHAIN.to_vec(),
            bounds: Bounds::default(),
        }
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Drop the strategies that reach the network.
    pub fn offline(mut self) -> Self {
        self.chain.retain(|s| !s.needs_network());
        self
    }

    pub fn chain(&self) -> &[Strategy] {
        &self.chain
    }

    pub fn cache(&self) -> &ThumbnailCache {
        &self.cache
    }

    pub fn attachments(&self) -> &AttachmentResolver {
        &self.attachments
    }

    /// Resolve `url` into exactly one thumbnail outcome. Never panics on bad input and never
    /// leaves the outcome undecided.
    pub fn resolve(
        &self,
        url: &str,
        metadata: Option<&RichLinkMetadata>,
        attachments: &[MessageAttachment],
    ) -> UrlThumbnail {
        self.cache
            .with_key_locked(url, || self.resolve_locked(url, metadata, attachments))
    }

    fn resolve_locked(
        &self,
        url: &str,
        metadata: Option<&RichLinkMetadata>,
        attachments: &[MessageAttachment],
    ) -> UrlThumbnail {
        let known_title = metadata.and_then(|m| m.title.clone());
        let known_summary = metadata.and_then(|m| m.summary.clone());
        let site_name = metadata.and_then(|m| m.site_name.clone());
        let fallback_title = || {
            known_title
                .clone()
                .or_else(|| site_name.clone())
                .unwrap_or_else(|| domain_title(url))
        };
        let known_description = || known_summary.clone().unwrap_or_default();
        let failed = |e: &PreviewError| {
            UrlThumbnail::failed(url, fallback_title(), known_description(), e)
        };

        if self.cache.exists(url) {
            debug!(url, "thumbnail cache hit");
            return UrlThumbnail::resolved(
                url,
                fallback_title(),
                known_summary.clone().unwrap_or_default(),
                self.cache.path(url),
                Strategy::Cache,
            );
        }

        let candidate = Candidate {
            url,
            metadata,
            attachments,
        };
        let mut last_error = PreviewError::NotApplicable("no strategy configured");

        for &strategy in &self.chain {
            let staged = match self.cache.stage() {
                Ok(staged) => staged,
                Err(e) => {
                    warn!(url, "cannot stage thumbnail: {e}");
                    return failed(&e);
                }
            };

            let found = match self.attempt(strategy, &candidate, staged.path()) {
                Ok(found) => found,
                Err(e) if e.is_not_applicable() => {
                    debug!(url, ?strategy, "skipped: {e}");
                    continue;
                }
                Err(e) => {
                    warn!(url, ?strategy, "strategy failed: {e}");
                    last_error = e;
                    continue;
                }
            };

            match self.cache.commit(url, staged) {
                Ok(path) => {
                    info!(url, ?strategy, path = %path.display(), "thumbnail resolved");
                    let title = known_title
                        .clone()
                        .or_else(|| site_name.clone())
                        .or(found.title)
                        .unwrap_or_else(|| domain_title(url));
                    let description =
                        known_summary.clone().or(found.description).unwrap_or_default();
                    return UrlThumbnail::resolved(url, title, description, path, strategy);
                }
                Err(e @ PreviewError::Cache { .. }) => {
                    warn!(url, "cannot publish thumbnail: {e}");
                    return failed(&e);
                }
                Err(e) => {
                    warn!(url, ?strategy, "strategy produced no image: {e}");
                    last_error = e;
                }
            }
        }

        failed(&last_error)
    }

    fn attempt(
        &self,
        strategy: Strategy,
        candidate: &Candidate<'_>,
        staged: &Path,
    ) -> Result<Found> {
        match strategy {
            Strategy::Cache => {
                Err(PreviewError::NotApplicable("cache is checked before the chain"))
            }
            Strategy::AttachmentCopy => self.attachment_copy(candidate, staged),
            Strategy::MetadataImage => self.metadata_image(candidate, staged),
            Strategy::MetadataIcon => self.metadata_icon(candidate, staged),
            Strategy::LivePage => self.live_page(candidate, staged),
            Strategy::Screenshot => self.screenshot(candidate, staged),
            Strategy::DomainCard => self.domain_card(candidate, staged),
        }
    }

    fn attachment_copy(&self, c: &Candidate<'_>, staged: &Path) -> Result<Found> {
        let index = c
            .metadata
            .filter(|m| m.has_image)
            .and_then(|m| m.image_attachment_index)
            .ok_or(PreviewError::NotApplicable("no attachment index"))?;
        let file = self
            .attachments
            .local_file(c.attachments, index)
            .ok_or(PreviewError::NotApplicable("attachment not available locally"))?;
        ensure_image_file(&file)?;
        self.tools.converter.convert(&file, staged, self.bounds)?;
        Ok(Found::default())
    }

    fn metadata_image(&self, c: &Candidate<'_>, staged: &Path) -> Result<Found> {
        let image = c
            .metadata
            .filter(|m| m.has_image)
            .and_then(|m| m.image_url.as_deref())
            .ok_or(PreviewError::NotApplicable("no preview image URL"))?;
        self.download_image(image, staged)?;
        Ok(Found::default())
    }

    fn metadata_icon(&self, c: &Candidate<'_>, staged: &Path) -> Result<Found> {
        let icon = c
            .metadata
            .filter(|m| m.has_icon)
            .and_then(|m| m.icon_url.as_deref())
            .ok_or(PreviewError::NotApplicable("no icon URL"))?;
        self.download_image(icon, staged)?;
        Ok(Found::default())
    }

    fn live_page(&self, c: &Candidate<'_>, staged: &Path) -> Result<Found> {
        let page_url = Url::parse(c.url).map_err(|_| PreviewError::InvalidUrl(c.url.to_string()))?;
        let html = self.tools.fetcher.fetch_page(c.url)?;
        let web = fetch::parse_page(&html, &page_url);
        let title = web.title.clone().unwrap_or_else(|| domain_title(c.url));

        if let Some(image) = web.image_url.as_deref() {
            match self.download_image(image, staged) {
                Ok(()) => {
                    return Ok(Found {
                        title: Some(title),
                        description: web.description,
                    });
                }
                Err(e) => warn!(url = c.url, image, "Open Graph image unusable: {e}"),
            }
        }

        let favicon = web
            .favicon_url
            .as_deref()
            .ok_or(PreviewError::UnsupportedImage("page offers no image".into()))?;
        let bytes = self.tools.fetcher.fetch_bytes(favicon)?;
        ensure_image_bytes(favicon, &bytes)?;
        let icon = write_scratch(&bytes)?;
        let subline = web.description.as_deref().unwrap_or(WEB_LINK);
        self.tools.converter.render_card(
            &Card {
                headline: &title,
                subline,
                icon: Some(icon.path()),
            },
            staged,
        )?;
        Ok(Found {
            title: Some(title),
            description: web.description,
        })
    }

    fn screenshot(&self, c: &Candidate<'_>, staged: &Path) -> Result<Found> {
        let shooter = self
            .tools
            .screenshotter
            .as_ref()
            .ok_or(PreviewError::NotApplicable("screenshots disabled"))?;
        let shot = tempfile::Builder::new().suffix(".png").tempfile()?;
        shooter.capture(c.url, shot.path())?;
        ensure_image_file(shot.path())?;
        self.tools.converter.convert(shot.path(), staged, self.bounds)?;
        Ok(Found {
            title: Some(domain_title(c.url)),
            description: Some("Website screenshot".into()),
        })
    }

    fn domain_card(&self, c: &Candidate<'_>, staged: &Path) -> Result<Found> {
        let headline = domain(c.url).unwrap_or_else(|| WEB_LINK.to_string());
        let card = Card {
            headline: &headline,
            subline: WEB_LINK,
            icon: None,
        };
        if let Err(e) = self.tools.converter.render_card(&card, staged) {
            warn!(url = c.url, "card renderer unavailable, writing placeholder: {e}");
            fs::write(staged, PLACEHOLDER_PNG).map_err(|source| PreviewError::Cache {
                path: staged.to_path_buf(),
                source,
            })?;
        }
        Ok(Found {
            title: Some(domain_title(c.url)),
            description: Some(WEB_LINK.to_string()),
        })
    }

    /// Fetch, sniff, then convert into the staging file.
    fn download_image(&self, image_url: &str, staged: &Path) -> Result<()> {
        debug!(image_url, "downloading image");
        let bytes = self.tools.fetcher.fetch_bytes(image_url)?;
        ensure_image_bytes(image_url, &bytes)?;
        let download = write_scratch(&bytes)?;
        self.tools.converter.convert(download.path(), staged, self.bounds)
    }
}

fn write_scratch(bytes: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

fn ensure_image_bytes(origin: &str, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(PreviewError::EmptyOutput(origin.to_string()));
    }
    if infer::is_image(bytes) || looks_like_svg(bytes) {
        return Ok(());
    }
    let kind = infer::get(bytes).map_or("unknown type", |k| k.mime_type());
    Err(PreviewError::UnsupportedImage(format!("{origin} is {kind}")))
}

fn ensure_image_file(path: &Path) -> Result<()> {
    let meta = fs::metadata(path)?;
    if meta.len() == 0 {
        return Err(PreviewError::EmptyOutput(path.display().to_string()));
    }
    match infer::get_from_path(path)? {
        Some(kind) if matches!(kind.matcher_type(), infer::MatcherType::Image) => Ok(()),
        _ if looks_like_svg(&file_head(path)?) => Ok(()),
        Some(kind) => Err(PreviewError::UnsupportedImage(format!(
            "{} is {}",
            path.display(),
            kind.mime_type()
        ))),
        None => Err(PreviewError::UnsupportedImage(format!(
            "{} is unknown type",
            path.display()
        ))),
    }
}

const SNIFF_LEN: u64 = 1024;

fn file_head(path: &Path) -> Result<Vec<u8>> {
    let mut head = Vec::new();
    fs::File::open(path)?.take(SNIFF_LEN).read_to_end(&mut head)?;
    Ok(head)
}

/// SVG is XML text, which `infer` has no matcher for. Favicons and site logos often are SVG.
fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(SNIFF_LEN as usize)];
    let text = String::from_utf8_lossy(head).to_ascii_lowercase();
    let text = text.trim_start_matches('\u{feff}').trim_start();
    text.starts_with('<') && text.contains("<svg")
}

/// Host without a leading `www.`.
pub fn domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

/// Display title derived from the host: `https://www.example.com/a` becomes `Example.com`.
pub fn domain_title(url: &str) -> String {
    let Some(domain) = domain(url).filter(|d| !d.is_empty()) else {
        return WEB_LINK.to_string();
    };
    let mut chars = domain.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => WEB_LINK.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    pub const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
    pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00];

    pub type CallLog = Arc<Mutex<Vec<String>>>;

    pub enum Response {
        Page(String),
        Bytes(Vec<u8>),
    }

    #[derive(Default)]
    pub struct FakeFetcher {
        pub responses: HashMap<String, Response>,
        pub log: CallLog,
    }

    impl FakeFetcher {
        pub fn page(mut self, url: &str, html: &str) -> Self {
            self.responses.insert(url.into(), Response::Page(html.into()));
            self
        }

        pub fn bytes(mut self, url: &str, bytes: &[u8]) -> Self {
            self.responses.insert(url.into(), Response::Bytes(bytes.to_vec()));
            self
        }
    }

    impl Fetcher for FakeFetcher {
        fn fetch_page(&self, url: &str) -> Result<String> {
            self.log.lock().unwrap().push(format!("page {url}"));
            match self.responses.get(url) {
                Some(Response::Page(html)) => Ok(html.clone()),
                _ => Err(PreviewError::Status { url: url.into(), status: 404 }),
            }
        }

        fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
            self.log.lock().unwrap().push(format!("bytes {url}"));
            match self.responses.get(url) {
                Some(Response::Bytes(b)) => Ok(b.clone()),
                _ => Err(PreviewError::Status { url: url.into(), status: 404 }),
            }
        }
    }

    /// Writes recognizable PNG bytes so cache files reveal which path produced them.
    #[derive(Default)]
    pub struct FakeConverter {
        pub log: CallLog,
        pub broken: bool,
    }

    impl ImageConverter for FakeConverter {
        fn convert(&self, source: &Path, target: &Path, _bounds: Bounds) -> Result<()> {
            self.log.lock().unwrap().push("convert".into());
            if self.broken {
                return Err(PreviewError::EmptyOutput("magick".into()));
            }
            let mut out = PNG.to_vec();
            out.extend_from_slice(b"converted:");
            out.extend_from_slice(&fs::read(source)?);
            fs::write(target, out)?;
            Ok(())
        }

        fn render_card(&self, card: &Card<'_>, target: &Path) -> Result<()> {
            self.log.lock().unwrap().push(format!(
                "card {}|{}|{}",
                card.headline,
                card.subline,
                card.icon.is_some()
            ));
            if self.broken {
                return Err(PreviewError::EmptyOutput("magick".into()));
            }
            let mut out = PNG.to_vec();
            out.extend_from_slice(format!("card:{}", card.headline).as_bytes());
            fs::write(target, out)?;
            Ok(())
        }
    }

    pub struct FakeScreenshotter {
        pub log: CallLog,
    }

    impl Screenshotter for FakeScreenshotter {
        fn capture(&self, url: &str, target: &Path) -> Result<()> {
            self.log.lock().unwrap().push(format!("screenshot {url}"));
            fs::write(target, PNG)?;
            Ok(())
        }
    }

    /// Pipeline over fakes sharing one call log.
    pub fn pipeline(
        cache_dir: &Path,
        attachments_root: &Path,
        fetcher: FakeFetcher,
    ) -> (Pipeline, CallLog) {
        let log = fetcher.log.clone();
        let converter = FakeConverter {
            log: log.clone(),
            broken: false,
        };
        let tools = Tools {
            fetcher: Box::new(fetcher),
            converter: Box::new(converter),
            screenshotter: None,
        };
        let pipeline = Pipeline::new(
            ThumbnailCache::new(cache_dir),
            AttachmentResolver::new(attachments_root),
            tools,
        );
        (pipeline, log)
    }
}
