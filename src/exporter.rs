use crate::pipeline::UrlThumbnail;
use crate::process::Batch;
use crate::substitute::Substituter;
use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "url-thumbnails.json";
pub const DIGEST_FILE: &str = "messages.md";

/// The `URL -> UrlThumbnail` mapping handed to the document layer.
#[derive(Serialize)]
struct Manifest<'a> {
    generated_at: DateTime<Utc>,
    cache_dir: &'a Path,
    total: usize,
    resolved: usize,
    failed: usize,
    thumbnails: &'a BTreeMap<String, UrlThumbnail>,
}

pub struct Written {
    pub manifest: PathBuf,
    pub digest: PathBuf,
}

pub fn export(
    batch: &Batch,
    cache_dir: &Path,
    substituter: &Substituter,
    target_dir: &Path,
) -> Result<Written> {
    fs::create_dir_all(target_dir)
        .wrap_err_with(|| format!("Failed to create target dir: {}", target_dir.display()))?;

    let manifest = target_dir.join(MANIFEST_FILE);
    write_manifest(batch, cache_dir, &manifest, Utc::now())?;

    let digest = target_dir.join(DIGEST_FILE);
    let file = File::create(&digest)
        .wrap_err_with(|| format!("Failed to create: {}", digest.display()))?;
    let mut writer = BufWriter::new(file);
    write_digest(&mut writer, batch, substituter)
        .wrap_err_with(|| format!("Failed to write: {}", digest.display()))?;
    writer.flush()?;

    Ok(Written { manifest, digest })
}

fn write_manifest(batch: &Batch, cache_dir: &Path, path: &Path, now: DateTime<Utc>) -> Result<()> {
    let manifest = Manifest {
        generated_at: now,
        cache_dir,
        total: batch.thumbnails.len(),
        resolved: batch.resolved(),
        failed: batch.failed(),
        thumbnails: &batch.thumbnails,
    };
    let json = serde_json::to_vec_pretty(&manifest).wrap_err("Failed to serialize manifest")?;
    fs::write(path, json).wrap_err_with(|| format!("Failed to write: {}", path.display()))
}

/// Every URL-bearing message after substitution, one section per message.
pub fn write_digest<W: Write>(
    writer: &mut W,
    batch: &Batch,
    substituter: &Substituter,
) -> std::io::Result<()> {
    writeln!(writer, "# Linked messages")?;
    writeln!(writer)?;
    writeln!(
        writer,
        "{} links, {} with thumbnails.",
        batch.thumbnails.len(),
        batch.resolved()
    )?;
    for message in &batch.messages {
        writeln!(writer)?;
        writeln!(writer, "## Message {}", message.id)?;
        writeln!(writer)?;
        writeln!(writer, "{}", substituter.substitute(&message.text, &batch.thumbnails))?;
    }
    Ok(())
}
