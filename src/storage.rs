//! Local result storage, one bucket per video.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A bucket under a storage root. Files are addressed by their name within
/// the bucket, which may contain subdirectories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storage {
    pub root: PathBuf,
    pub bucket_name: String,
}

impl Storage {
    pub fn new<P: Into<PathBuf>>(root: P, bucket_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket_name: bucket_name.into(),
        }
    }

    /// Conventional bucket name for a video record.
    pub fn video_bucket_name(video_id: i64, timestamp: &DateTime<Utc>) -> String {
        format!("{}-{:06}", timestamp.format("%Y%m%d"), video_id)
    }

    pub fn bucket(&self) -> PathBuf {
        self.root.join(&self.bucket_name)
    }

    pub fn local_path(&self, name: &str) -> PathBuf {
        self.bucket().join(name)
    }

    /// Copy a file into the bucket under `dest`, creating directories as needed.
    pub fn upload(&self, src: &Path, dest: &str) -> Result<()> {
        let target = self.local_path(dest);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating bucket dir {:?}", parent))?;
        }
        std::fs::copy(src, &target)
            .with_context(|| format!("uploading {:?} to {:?}", src, target))?;
        Ok(())
    }

    /// Move a file into the bucket under `dest`. Falls back to copy+remove
    /// when the source lives on a different filesystem.
    pub fn upload_move(&self, src: &Path, dest: &str) -> Result<()> {
        let target = self.local_path(dest);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating bucket dir {:?}", parent))?;
        }
        if std::fs::rename(src, &target).is_err() {
            std::fs::copy(src, &target)
                .with_context(|| format!("moving {:?} to {:?}", src, target))?;
            std::fs::remove_file(src).with_context(|| format!("removing {:?}", src))?;
        }
        Ok(())
    }

    /// Fetch a file from the bucket to a target path outside of it.
    pub fn download_file(&self, src: &str, target: &Path, keep_src: bool) -> Result<()> {
        let source = self.local_path(src);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating target dir {:?}", parent))?;
        }
        if keep_src {
            std::fs::copy(&source, target)
                .with_context(|| format!("downloading {:?} to {:?}", source, target))?;
        } else if std::fs::rename(&source, target).is_err() {
            std::fs::copy(&source, target)
                .with_context(|| format!("downloading {:?} to {:?}", source, target))?;
            std::fs::remove_file(&source)
                .with_context(|| format!("removing {:?}", source))?;
        }
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        let bucket = self.bucket();
        if bucket.exists() {
            std::fs::remove_dir_all(&bucket)
                .with_context(|| format!("deleting bucket {:?}", bucket))?;
        }
        Ok(())
    }
}
