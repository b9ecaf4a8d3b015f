use anyhow::{Context, Result, bail};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::constants::MAX_FILENAME_LENGTH;
use super::hash::compute_file_hash;
use super::receiver::ReceivedFile;

const FALLBACK_NAME: &str = "unknown_file";

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Where completed transfers go.
pub trait FileSink: Send + Sync + 'static {
    /// Persist a received file, returning where it ended up.
    fn save(&self, file: ReceivedFile) -> impl Future<Output = Result<PathBuf>> + Send + '_;
}

/// Saves received files into a directory on disk.
#[derive(Debug, Clone)]
pub struct DownloadDir {
    root: PathBuf,
}

impl DownloadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl FileSink for DownloadDir {
    async fn save(&self, file: ReceivedFile) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;

        let file_name = sanitize_file_name(&file.metadata.name);
        let path = unique_path(&self.root, &file_name).await;

        let mut out = open_secure_file(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        out.write_all(&file.data).await?;
        out.flush().await?;
        drop(out);

        // Read back what landed on disk
        if compute_file_hash(&path).await? != file.digest {
            bail!("{} does not match the received data", path.display());
        }

        info!(
            "Saved {} ({} bytes, {}) to {}",
            file.metadata.name,
            file.data.len(),
            file.metadata.mime_type,
            path.display()
        );
        Ok(path)
    }
}

/// Create a new file readable only by its owner (0o600 on Unix)
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// First free path for `file_name` in `dir`: `name.ext`, `name (1).ext`, ...
async fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let (stem, ext) = match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    };

    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({n}){ext}"));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// Reduce a peer-supplied name to a safe, bare file name
pub fn sanitize_file_name(file_name: &str) -> String {
    // Only the last path component counts, whichever separator the peer used
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();

    let clean: String = last.chars().filter(|c| !c.is_control()).collect();
    let trimmed = clean.trim();

    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || RESERVED_NAMES.iter().any(|r| trimmed.eq_ignore_ascii_case(r))
    {
        return FALLBACK_NAME.to_string();
    }

    truncate_keeping_extension(trimmed)
}

fn truncate_keeping_extension(name: &str) -> String {
    if name.len() <= MAX_FILENAME_LENGTH {
        return name.to_string();
    }

    let ext = match name.rfind('.') {
        Some(idx) if name.len() - idx < 20 => &name[idx..],
        _ => "",
    };
    let mut cutoff = MAX_FILENAME_LENGTH - ext.len();
    while !name.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    format!("{}{}", &name[..cutoff], ext)
}
