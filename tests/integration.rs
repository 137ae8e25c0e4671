use rusqlite::Connection;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use threadbound_links::attachments::AttachmentResolver;
use threadbound_links::cache::ThumbnailCache;
use threadbound_links::error::{PreviewError, Result};
use threadbound_links::exporter;
use threadbound_links::fetch::Fetcher;
use threadbound_links::importer::ChatDb;
use threadbound_links::parallel;
use threadbound_links::pipeline::{Pipeline, Strategy, Tools};
use threadbound_links::process::{self, Resolver};
use threadbound_links::richlink::{ClassifierRules, PlistDecoder};
use threadbound_links::substitute::{ReferenceStyle, Substituter};
use threadbound_links::tools::{Bounds, Card, ImageConverter};

const SCHEMA: &str = "
    CREATE TABLE message (
        ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
        guid TEXT UNIQUE NOT NULL,
        text TEXT,
        date INTEGER,
        associated_message_guid TEXT,
        payload_data BLOB
    );
    CREATE TABLE attachment (
        ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
        guid TEXT UNIQUE NOT NULL,
        filename TEXT,
        mime_type TEXT
    );
    CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER);
";

const PAYLOAD: &str = r#"{
  "$objects" => [
    0 => "$null"
    1 => {
      "title" => <CFKeyedArchiverUID 0x600000c3c0a0>{value = 3}
      "richLinkImageAttachmentSubstituteIndex" => 0
    }
    3 => "Trip report"
    4 => "https://cdn-link-previews.example.net/trip.jpg"
  ]
}"#;

const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00];

struct TextDecoder;

impl PlistDecoder for TextDecoder {
    fn decode(&self, blob: &[u8]) -> Result<String> {
        Ok(String::from_utf8_lossy(blob).into_owned())
    }
}

/// Serves only what it was given; everything else is a 404.
struct MapFetcher {
    bytes: HashMap<String, Vec<u8>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Fetcher for MapFetcher {
    fn fetch_page(&self, url: &str) -> Result<String> {
        self.calls.lock().unwrap().push(url.to_string());
        Err(PreviewError::Status {
            url: url.to_string(),
            status: 404,
        })
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(url.to_string());
        self.bytes.get(url).cloned().ok_or(PreviewError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

struct CopyConverter;

impl ImageConverter for CopyConverter {
    fn convert(&self, source: &Path, target: &Path, _bounds: Bounds) -> Result<()> {
        fs::copy(source, target)?;
        Ok(())
    }

    fn render_card(&self, card: &Card<'_>, target: &Path) -> Result<()> {
        let mut out = PNG.to_vec();
        out.extend_from_slice(card.headline.as_bytes());
        fs::write(target, out)?;
        Ok(())
    }
}

fn seed_db(path: &Path, attachment_file: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    conn.execute(
        "INSERT INTO message (ROWID, guid, text, date, payload_data) VALUES (1, 'm1', ?1, 10, ?2)",
        rusqlite::params![
            "trip pics https://photos.example/trip and https://down.example/x",
            PAYLOAD.as_bytes()
        ],
    )
    .unwrap();
    conn.execute_batch(
        "INSERT INTO message (ROWID, guid, text, date) VALUES
            (2, 'm2', 'same again https://photos.example/trip.', 20),
            (3, 'm3', 'nothing to see', 30);
         INSERT INTO message (ROWID, guid, text, date, associated_message_guid) VALUES
            (4, 'm4', 'Liked https://tapback.example', 40, 'p:0/m1');",
    )
    .unwrap();
    conn.execute(
        "INSERT INTO attachment (ROWID, guid, filename, mime_type)
         VALUES (1, 'a1', ?1, 'image/jpeg')",
        [attachment_file.to_str().unwrap()],
    )
    .unwrap();
    conn.execute("INSERT INTO message_attachment_join VALUES (1, 1)", []).unwrap();
}

fn resolver(cache_dir: &Path, root: &Path, calls: Arc<Mutex<Vec<String>>>) -> Resolver {
    let fetcher = MapFetcher {
        bytes: HashMap::new(),
        calls,
    };
    let tools = Tools {
        fetcher: Box::new(fetcher),
        converter: Box::new(CopyConverter),
        screenshotter: None,
    };
    let pipeline = Pipeline::new(
        ThumbnailCache::new(cache_dir),
        AttachmentResolver::new(root),
        tools,
    );
    Resolver::new(pipeline, Box::new(TextDecoder), ClassifierRules::default())
}

#[test]
fn full_batch_from_chat_db() {
    let tmp = tempfile::tempdir().unwrap();
    let photo = tmp.path().join("IMG_0001.jpeg");
    fs::write(&photo, JPEG).unwrap();
    let db_path = tmp.path().join("chat.db");
    seed_db(&db_path, &photo);

    let target = tmp.path().join("out");
    let cache_dir = target.join("url-thumbnails");
    let calls = Arc::new(Mutex::new(Vec::new()));
    let resolver = resolver(&cache_dir, tmp.path(), calls.clone());
    let db = ChatDb::open(&db_path).unwrap();

    let batch = process::run(&resolver, &db, true, &AtomicBool::new(false)).unwrap();

    // Tapbacks are skipped, repeated URLs resolved once.
    assert_eq!(batch.messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(batch.thumbnails.len(), 2);

    let trip = &batch.thumbnails["https://photos.example/trip"];
    assert_eq!(trip.strategy, Some(Strategy::AttachmentCopy));
    assert_eq!(trip.title, "Trip report");
    assert_eq!(fs::read(trip.thumbnail_path.as_ref().unwrap()).unwrap(), JPEG);

    let down = &batch.thumbnails["https://down.example/x"];
    assert_eq!(down.strategy, Some(Strategy::DomainCard));
    assert_eq!(down.title, "Down.example");

    // The attachment won, so the preview image in the blob was never downloaded.
    assert_eq!(*calls.lock().unwrap(), vec!["https://down.example/x".to_string()]);

    let substituter = Substituter::new(ReferenceStyle::Latex, Some("url-thumbnails".into()));
    let written = exporter::export(&batch, &cache_dir, &substituter, &target).unwrap();
    let digest = fs::read_to_string(&written.digest).unwrap();
    let trip_file = trip.thumbnail_path.as_ref().unwrap().file_name().unwrap().to_string_lossy();
    assert!(digest.contains(&format!("same again \\messageimage{{url-thumbnails/{trip_file}}}.")));

    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(&written.manifest).unwrap()).unwrap();
    assert_eq!(manifest["total"], 2);
    assert_eq!(manifest["resolved"], 2);
}

#[test]
fn second_run_reuses_cache_and_parallel_agrees() {
    let tmp = tempfile::tempdir().unwrap();
    let photo = tmp.path().join("IMG_0001.jpeg");
    fs::write(&photo, JPEG).unwrap();
    let db_path = tmp.path().join("chat.db");
    seed_db(&db_path, &photo);
    let cache_dir = tmp.path().join("cache");
    let db = ChatDb::open(&db_path).unwrap();

    let first_calls = Arc::new(Mutex::new(Vec::new()));
    let first = process::run(
        &resolver(&cache_dir, tmp.path(), first_calls.clone()),
        &db,
        true,
        &AtomicBool::new(false),
    )
    .unwrap();

    let second_calls = Arc::new(Mutex::new(Vec::new()));
    let second = parallel::run(
        &resolver(&cache_dir, tmp.path(), second_calls.clone()),
        &db,
        3,
        true,
        &AtomicBool::new(false),
    )
    .unwrap();

    assert!(second_calls.lock().unwrap().is_empty());
    for (url, t) in &second.thumbnails {
        assert_eq!(t.strategy, Some(Strategy::Cache));
        assert_eq!(t.thumbnail_path, first.thumbnails[url].thumbnail_path);
    }
    assert_eq!(second.thumbnails["https://photos.example/trip"].title, "Trip report");
}

#[test]
fn unwritable_cache_leaves_text_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let photo = tmp.path().join("IMG_0001.jpeg");
    fs::write(&photo, JPEG).unwrap();
    let db_path = tmp.path().join("chat.db");
    seed_db(&db_path, &photo);
    let blocker = tmp.path().join("blocker");
    fs::write(&blocker, b"file, not dir").unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let resolver = resolver(&blocker.join("cache"), tmp.path(), calls);
    let db = ChatDb::open(&db_path).unwrap();
    let batch = process::run(&resolver, &db, true, &AtomicBool::new(false)).unwrap();

    assert_eq!(batch.resolved(), 0);
    assert!(batch.thumbnails.values().all(|t| t.error.is_some()));

    let text = "trip pics https://photos.example/trip and https://down.example/x";
    assert_eq!(Substituter::default().substitute(text, &batch.thumbnails), text);
}
