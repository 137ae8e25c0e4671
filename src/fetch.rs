//! HTTP access for the live-page strategy and image downloads, plus the Open Graph scraper.

use crate::error::{PreviewError, Result};
use scraper::{Html, Selector};
use std::io::Read;
use std::time::Duration;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; threadbound-links)";
const MAX_HTML_BYTES: u64 = 1024 * 1024;

pub trait Fetcher: Send + Sync {
    /// Fetch an HTML document as text.
    fn fetch_page(&self, url: &str) -> Result<String>;
    /// Fetch a binary resource (image, favicon).
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpFetcher {
    page_client: reqwest::blocking::Client,
    image_client: reqwest::blocking::Client,
    max_download_bytes: u64,
}

impl HttpFetcher {
    pub fn new(
        page_timeout: Duration,
        image_timeout: Duration,
        max_download_bytes: u64,
    ) -> Result<Self> {
        let build = |timeout: Duration| {
            reqwest::blocking::Client::builder()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .redirect(reqwest::redirect::Policy::limited(5))
                .build()
        };
        Ok(Self {
            page_client: build(page_timeout)?,
            image_client: build(image_timeout)?,
            max_download_bytes,
        })
    }

    fn get(client: &reqwest::blocking::Client, url: &str, limit: u64) -> Result<Vec<u8>> {
        let response = client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(PreviewError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(PreviewError::TooLarge {
                url: url.to_string(),
                limit,
            });
        }

        let body = read_limited(response, url, limit)?;
        debug!(url, bytes = body.len(), "fetched");
        Ok(body)
    }
}

/// Read at most `limit` bytes; one byte more is an error rather than a silent truncation.
fn read_limited(reader: impl Read, url: &str, limit: u64) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut body)?;
    if body.len() as u64 > limit {
        return Err(PreviewError::TooLarge {
            url: url.to_string(),
            limit,
        });
    }
    if body.is_empty() {
        return Err(PreviewError::EmptyOutput(url.to_string()));
    }
    Ok(body)
}

impl Fetcher for HttpFetcher {
    fn fetch_page(&self, url: &str) -> Result<String> {
        let limit = MAX_HTML_BYTES.min(self.max_download_bytes);
        let body = Self::get(&self.page_client, url, limit)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        Self::get(&self.image_client, url, self.max_download_bytes)
    }
}

/// What the live page says about itself. Image and favicon URLs are absolute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub favicon_url: Option<String>,
}

/// First non-empty `content` of `<meta property=key>` or `<meta name=key>`.
fn meta_content(document: &Html, key: &str) -> Option<String> {
    let selector = Selector::parse(&format!(
        r#"meta[property="{key}"], meta[name="{key}"]"#
    ))
    .ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(String::from)
}

fn title_text(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let title = document.select(&selector).next()?.text().collect::<String>();
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

fn favicon_href(document: &Html) -> Option<String> {
    let selector = Selector::parse(r#"link[rel~="icon"]"#).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .find(|href| !href.is_empty())
        .map(String::from)
}

/// Resolve `href` against the page; protocol-relative and root-relative forms included.
fn absolutize(base: &Url, href: &str) -> Option<String> {
    base.join(href.trim())
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(String::from)
}

pub fn parse_page(html: &str, page_url: &Url) -> WebMetadata {
    let document = Html::parse_document(html);

    let title = meta_content(&document, "og:title").or_else(|| title_text(&document));
    let description = meta_content(&document, "og:description")
        .or_else(|| meta_content(&document, "description"));
    let image_url = meta_content(&document, "og:image")
        .or_else(|| meta_content(&document, "twitter:image"))
        .and_then(|href| absolutize(page_url, &href));
    let favicon_url = favicon_href(&document)
        .and_then(|href| absolutize(page_url, &href))
        .or_else(|| absolutize(page_url, "/favicon.ico"));

    WebMetadata {
        title,
        description,
        image_url,
        favicon_url,
    }
}
