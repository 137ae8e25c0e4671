//! # threadbound-links
//!
//! Resolves the links in a macOS Messages archive into cached thumbnails, ready for embedding
//! in an exported document.
//!
//! ## What it does
//!
//! Messages stores chats in a SQLite database (`chat.db`). A message that shared a link
//! usually carries an `NSKeyedArchiver` blob with the rich-link preview the client generated
//! (title, summary, image). For every distinct URL in the archive this crate produces exactly
//! one [`pipeline::UrlThumbnail`]: either a PNG in the thumbnail cache or an explicit failure.
//!
//! Resolution walks an ordered chain and stops at the first success:
//!
//! 1. a thumbnail already in the cache,
//! 2. the preview image attached to the message,
//! 3. the preview image URL named in the blob,
//! 4. the site icon named in the blob,
//! 5. the live page's Open Graph image, or a card built around its favicon,
//! 6. a headless-browser screenshot (opt-in),
//! 7. a generated card carrying just the domain name.
//!
//! The database is opened **read-only**, normally through a snapshot taken with the SQLite
//! backup API.
//!
//! ## Usage
//!
//! ```sh
//! # Resolve every link, writing url-thumbnails.json, messages.md and url-thumbnails/
//! threadbound-links ~/exports/chat
//!
//! # No network, Markdown references, 8 workers
//! threadbound-links ~/exports/chat --offline --reference markdown --jobs 8
//! ```
//!
//! Preferences can be persisted in `~/.config/threadbound/config.toml`.

pub mod attachments;
pub mod cache;
pub mod error;
pub mod exporter;
pub mod fetch;
pub mod importer;
pub mod parallel;
pub mod pipeline;
pub mod process;
pub mod richlink;
pub mod substitute;
pub mod tools;
pub mod urls;
pub mod utils;
