//! Durable fallback spool for side effects that could not be delivered.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tap_core::DispatchChannel;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub spool_id: Uuid,
    pub channel: DispatchChannel,
    pub assignment_id: Uuid,
    pub record_id: Uuid,
    /// Recipients still owed a notification. Empty for broadcast entries.
    #[serde(default)]
    pub recipients: Vec<String>,
    pub reason: String,
    pub spooled_at: DateTime<Utc>,
}

impl SpoolEntry {
    pub fn new(
        channel: DispatchChannel,
        assignment_id: Uuid,
        record_id: Uuid,
        recipients: Vec<String>,
        reason: impl Into<String>,
        spooled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            spool_id: Uuid::new_v4(),
            channel,
            assignment_id,
            record_id,
            recipients,
            reason: reason.into(),
            spooled_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpooledFile {
    pub path: PathBuf,
    pub entry: SpoolEntry,
}

/// One JSON file per entry, written through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct FallbackSpool {
    root: PathBuf,
}

impl FallbackSpool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(entry: &SpoolEntry) -> String {
        format!(
            "{}_{}_{}.json",
            entry.spooled_at.format("%Y%m%d_%H%M%S"),
            entry.channel.as_str(),
            entry.spool_id
        )
    }

    pub async fn write(&self, entry: &SpoolEntry) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating spool directory {}", self.root.display()))?;

        let bytes = serde_json::to_vec_pretty(entry).context("serializing spool entry")?;
        let final_path = self.root.join(Self::file_name(entry));
        let temp_path = self.root.join(format!(".{}.tmp", entry.spool_id));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp spool file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp spool file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp spool file {}", temp_path.display()))?;
        drop(file);

        fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("publishing spool file {}", final_path.display()))?;
        Ok(final_path)
    }

    /// Entries in spool order. Unreadable files are logged and left in place.
    pub async fn list(&self) -> anyhow::Result<Vec<SpooledFile>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking spool directory {}", self.root.display()))?
        {
            return Ok(Vec::new());
        }

        let mut dir = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading spool directory {}", self.root.display()))?;
        let mut files = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let is_entry = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| !n.starts_with('.') && n.ends_with(".json"));
            if !is_entry {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading spool file {}", path.display()))?;
            match serde_json::from_slice::<SpoolEntry>(&bytes) {
                Ok(entry) => files.push(SpooledFile { path, entry }),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable spool file"),
            }
        }
        files.sort_by(|a, b| {
            a.entry
                .spooled_at
                .cmp(&b.entry.spooled_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(files)
    }

    pub async fn remove(&self, file: &SpooledFile) -> anyhow::Result<()> {
        match fs::remove_file(&file.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing spool file {}", file.path.display()))
            }
        }
    }

    /// Replace an entry after a partial replay, keeping its file name.
    pub async fn rewrite(&self, file: &SpooledFile, entry: &SpoolEntry) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(entry).context("serializing spool entry")?;
        let temp_path = self.root.join(format!(".{}.{}.tmp", entry.spool_id, Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing temp spool file {}", temp_path.display()))?;
        fs::rename(&temp_path, &file.path)
            .await
            .with_context(|| format!("replacing spool file {}", file.path.display()))
    }
}
