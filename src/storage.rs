//! Per-user on-disk layout.
//!
//! ```text
//! <data_dir>/<username>/discussions/
//! <data_dir>/<username>/discussion_assets/<discussion_id>/
//! <data_dir>/<username>/temp_uploads/
//! <data_dir>/<username>/datastores/
//! <data_dir>/<username>/images/
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user_root(&self, username: &str) -> PathBuf {
        self.root.join(safe_filename(username))
    }

    pub fn discussions_dir(&self, username: &str) -> PathBuf {
        self.user_root(username).join("discussions")
    }

    pub fn discussion_assets_dir(&self, username: &str, discussion_id: &str) -> PathBuf {
        self.user_root(username)
            .join("discussion_assets")
            .join(safe_filename(discussion_id))
    }

    pub fn temp_uploads_dir(&self, username: &str) -> PathBuf {
        self.user_root(username).join("temp_uploads")
    }

    pub fn datastores_dir(&self, username: &str) -> PathBuf {
        self.user_root(username).join("datastores")
    }

    pub fn images_dir(&self, username: &str) -> PathBuf {
        self.user_root(username).join("images")
    }

    pub fn ensure_user_tree(&self, username: &str) -> Result<()> {
        for dir in [
            self.discussions_dir(username),
            self.user_root(username).join("discussion_assets"),
            self.temp_uploads_dir(username),
            self.datastores_dir(username),
            self.images_dir(username),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create user directory {:?}", dir))?;
        }
        Ok(())
    }

    /// Maps a client-supplied upload reference onto the user's temp_uploads directory.
    /// Only the final path component is honored.
    pub fn resolve_temp_upload(&self, username: &str, reference: &str) -> Option<PathBuf> {
        let last = reference
            .trim()
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default();
        let name = safe_filename(last);
        if name.is_empty() || name.chars().all(|c| c == '.') {
            return None;
        }
        Some(self.temp_uploads_dir(username).join(name))
    }
}

/// Keeps ASCII alphanumerics, `-`, `_` and `.`; everything else is dropped.
pub fn safe_filename(raw: &str) -> String {
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    filtered.trim_start_matches('.').to_string()
}

pub fn random_prefixed_name(original: &str) -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    let base = safe_filename(original);
    let base = if base.is_empty() {
        "upload".to_string()
    } else {
        base
    };
    format!("{}_{}", &token[..12], base)
}
