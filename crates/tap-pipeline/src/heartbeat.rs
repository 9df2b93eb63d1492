//! Liveness files for long-running processes, read by external monitoring
//! and by the web health endpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub component: String,
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
    /// Free-form counters and state, e.g. `jobs_ok` or `state`.
    #[serde(default)]
    pub status: BTreeMap<String, serde_json::Value>,
}

impl Heartbeat {
    pub fn new(component: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            component: component.into(),
            pid: std::process::id(),
            updated_at,
            status: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.status.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Stale,
    Missing,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Stale => "stale",
            Health::Missing => "missing",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReport {
    pub health: Health,
    pub heartbeat: Option<Heartbeat>,
    pub age_secs: Option<i64>,
}

pub fn heartbeat_path(dir: &Path, component: &str) -> PathBuf {
    dir.join(format!("{component}.json"))
}

/// Replaces the file through a temp file and a rename so readers never see a
/// partial write.
pub async fn write_heartbeat(dir: &Path, heartbeat: &Heartbeat) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = heartbeat_path(dir, &heartbeat.component);
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(heartbeat).context("serializing heartbeat")?;

    let mut file = fs::File::create(&tmp)
        .await
        .with_context(|| format!("creating {}", tmp.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    file.sync_all().await.ok();
    drop(file);
    fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(path)
}

/// A file that is unreadable or unparseable counts as missing.
pub async fn check_heartbeat(path: &Path, max_age: Duration, now: DateTime<Utc>) -> HeartbeatReport {
    let heartbeat = match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice::<Heartbeat>(&bytes).ok(),
        Err(_) => None,
    };
    let Some(heartbeat) = heartbeat else {
        return HeartbeatReport {
            health: Health::Missing,
            heartbeat: None,
            age_secs: None,
        };
    };
    let age = now - heartbeat.updated_at;
    let limit = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(365));
    HeartbeatReport {
        health: if age > limit {
            Health::Stale
        } else {
            Health::Healthy
        },
        age_secs: Some(age.num_seconds()),
        heartbeat: Some(heartbeat),
    }
}
