use crate::pipeline::UrlThumbnail;
use crate::urls;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// How a resolved link is spelled in the rewritten text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceStyle {
    /// `\messageimage{url-thumbnails/<file>}`
    #[default]
    Latex,
    /// `![title](url-thumbnails/<file>)`
    Markdown,
}

/// Rewrites resolved URLs into references to their cached thumbnails.
#[derive(Debug, Clone)]
pub struct Substituter {
    style: ReferenceStyle,
    /// Directory the document layer sees the thumbnails under. `None` embeds the cache path as is.
    prefix: Option<String>,
}

impl Substituter {
    pub fn new(style: ReferenceStyle, prefix: Option<String>) -> Self {
        Self {
            style,
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
        }
    }

    /// Replace every successfully resolved URL occurrence. Anything else, including URLs
    /// that only share a prefix with a resolved one, is copied through byte for byte.
    pub fn substitute(&self, text: &str, thumbnails: &BTreeMap<String, UrlThumbnail>) -> String {
        let mut out = String::with_capacity(text.len());
        let mut copied = 0;
        for (span, url) in urls::url_spans(text) {
            let Some(reference) = thumbnails
                .get(url)
                .filter(|t| t.success)
                .and_then(|t| self.reference(t))
            else {
                continue;
            };
            out.push_str(&text[copied..span.start]);
            out.push_str(&reference);
            copied = span.end;
        }
        out.push_str(&text[copied..]);
        out
    }

    fn reference(&self, thumbnail: &UrlThumbnail) -> Option<String> {
        let path = thumbnail.thumbnail_path.as_deref()?;
        let target = self.target(path)?;
        Some(match self.style {
            ReferenceStyle::Latex => format!("\\messageimage{{{target}}}"),
            ReferenceStyle::Markdown => {
                let alt = thumbnail.title.replace(['[', ']'], "");
                format!("![{alt}]({target})")
            }
        })
    }

    fn target(&self, path: &Path) -> Option<String> {
        match &self.prefix {
            Some(prefix) => {
                let file = path.file_name()?.to_str()?;
                Some(if prefix.is_empty() {
                    file.to_string()
                } else {
                    format!("{prefix}/{file}")
                })
            }
            None => Some(path.to_string_lossy().into_owned()),
        }
    }
}

impl Default for Substituter {
    fn default() -> Self {
        Self::new(ReferenceStyle::Latex, Some("url-thumbnails".into()))
    }
}
