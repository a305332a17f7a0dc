use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ph_core::{Cursor, SourceOrder};
use ph_storage::{read_json_opt, write_json_atomic};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredWatermark {
    pub job: String,
    pub cursor: Cursor,
    pub run_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// One JSON file per job under the state directory.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    dir: PathBuf,
}

impl WatermarkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, job: &str) -> PathBuf {
        let safe = job
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect::<String>();
        self.dir.join(format!("{safe}.watermark.json"))
    }

    pub async fn load(&self, job: &str) -> Result<Option<StoredWatermark>> {
        read_json_opt(&self.path_for(job)).await
    }

    pub async fn save(&self, job: &str, run_id: Uuid, cursor: &Cursor) -> Result<()> {
        let record = StoredWatermark {
            job: job.to_string(),
            cursor: cursor.clone(),
            run_id,
            updated_at: Utc::now(),
        };
        write_json_atomic(&self.path_for(job), &record).await
    }

    /// Remove the stored watermark; returns whether one existed.
    pub async fn reset(&self, job: &str) -> Result<bool> {
        let path = self.path_for(job);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Starting cursor for a run: the stored one when it was written for the
    /// same ordering, otherwise the beginning.
    pub async fn resume_cursor(&self, job: &str, order: &SourceOrder, fresh: bool) -> Result<Cursor> {
        if fresh {
            return Ok(Cursor::start(order.clone()));
        }
        match self.load(job).await? {
            Some(stored) if stored.cursor.order() == *order => {
                info!(job, cursor = ?stored.cursor, "resuming from stored watermark");
                Ok(stored.cursor)
            }
            Some(stored) => {
                warn!(
                    job,
                    stored = ?stored.cursor.order(),
                    requested = ?order,
                    "stored watermark is for a different ordering; starting from the beginning"
                );
                Ok(Cursor::start(order.clone()))
            }
            None => Ok(Cursor::start(order.clone())),
        }
    }
}
