//! Storage collaborator: pre-write backups and atomic writes.
//!
//! The patch engine never touches the filesystem directly; it hands the
//! final buffer to a [`Storage`] implementation. A backup must succeed
//! before any destructive write proceeds. Backups are timestamped copies
//! under a dedicated directory with an append-only JSONL index.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blake3::Hasher as Blake3;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cli::{AppContext, BackupsArgs};
use crate::infra::{config, io};

/// Contract between the patch engine and durable storage.
pub trait Storage {
    /// Preserve the current contents of `path`. Returns the backup
    /// identifier, or `None` when there was nothing to back up.
    fn backup(&self, path: &Path) -> Result<Option<String>>;

    /// Atomically replace `path` with `content`.
    fn write(&self, path: &Path, content: &str) -> Result<()>;
}

/// One backup, as recorded in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub original_path: PathBuf,
    pub timestamp: String, // RFC3339
    pub size_bytes: u64,
    pub checksum: String, // blake3:<hex>
}

/// Filesystem-backed storage with a fixed backup directory. The backup
/// directory must not be one the server itself includes, or backups would
/// be loaded as live vhosts.
#[derive(Debug)]
pub struct FsStorage {
    backup_dir: PathBuf,
}

impl FsStorage {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
        }
    }
}

impl Storage for FsStorage {
    fn backup(&self, path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("create backup dir: {}", self.backup_dir.display()))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let id = format!("{name}.bak.{}", backup_tag());
        let dest = self.backup_dir.join(&id);

        fs::copy(path, &dest)
            .with_context(|| format!("copy {} to {}", path.display(), dest.display()))?;

        let size_bytes = fs::metadata(&dest)
            .with_context(|| format!("stat backup: {}", dest.display()))?
            .len();
        let record = BackupRecord {
            id: id.clone(),
            original_path: path.to_path_buf(),
            timestamp: Utc::now().to_rfc3339(),
            size_bytes,
            checksum: stream_blake3(&dest)?,
        };
        append_to_index(&self.backup_dir, &record)?;

        tracing::info!(backup = %dest.display(), "backed up");
        Ok(Some(id))
    }

    fn write(&self, path: &Path, content: &str) -> Result<()> {
        io::write_atomic(path, content)
    }
}

/// Sortable, filesystem-safe backup tag: UTC timestamp plus random suffix.
fn backup_tag() -> String {
    let ts = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let alphabet = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..5)
        .map(|_| {
            let idx = rng.random_range(0..alphabet.len());
            alphabet[idx] as char
        })
        .collect();
    format!("{ts}-{suffix}")
}

/// Stream a file into a blake3 digest as `blake3:<hex>`.
fn stream_blake3(path: &Path) -> Result<String> {
    let mut f =
        File::open(path).with_context(|| format!("open for checksum: {}", path.display()))?;
    let mut hasher = Blake3::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

fn append_to_index(backup_dir: &Path, record: &BackupRecord) -> Result<()> {
    let index_path = backup_dir.join("index.jsonl");
    let line = serde_json::to_string(record).context("serialize backup record")?;

    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&index_path)
        .with_context(|| format!("open index: {}", index_path.display()))?;
    writeln!(f, "{line}").context("append index")?;
    f.sync_all().ok();
    Ok(())
}

/// Read the append-only index; ignores malformed lines.
pub fn list_backups(backup_dir: &Path) -> Result<Vec<BackupRecord>> {
    let index_path = backup_dir.join("index.jsonl");
    if !index_path.exists() {
        return Ok(Vec::new());
    }

    let file =
        File::open(&index_path).with_context(|| format!("open index: {}", index_path.display()))?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read index line {}", i + 1))?;
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        match serde_json::from_str::<BackupRecord>(t) {
            Ok(r) => out.push(r),
            Err(_) => continue, // tolerate partial/corrupt lines
        }
    }
    Ok(out)
}

/// The `backups` subcommand: list the index for the configured (or
/// overridden) backup directory.
pub fn run(args: BackupsArgs, ctx: &AppContext) -> Result<()> {
    let dir = match args.dir {
        Some(d) => d,
        None => config::load_config()?.backup_dir,
    };
    let records = list_backups(&dir)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if ctx.quiet {
        return Ok(());
    }
    if records.is_empty() {
        println!("no backups recorded in {}", dir.display());
        return Ok(());
    }
    for r in &records {
        println!(
            "{}  {}  {} bytes  {}",
            r.timestamp,
            r.id,
            r.size_bytes,
            r.original_path.display()
        );
    }
    Ok(())
}
