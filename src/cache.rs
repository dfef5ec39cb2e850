// Write-through disk cache for static assets — a JSON index plus one body
// blob per request path. Entries never expire; the last writer wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Response headers that must not be replayed from cache.
const VOLATILE_HEADERS: [&str; 3] = ["date", "content-length", "connection"];

const INDEX_FILE: &str = "index.json";

/// Cached status line and headers; the body lives in its own blob file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

pub struct CacheStore {
    dir: PathBuf,
    index: RwLock<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    /// Open (creating if needed) the cache directory and load the persisted
    /// index, so a restarted proxy keeps serving previous entries. A
    /// corrupt index is discarded, not fatal.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating cache dir {}", dir.display()))?;

        let index = match tokio::fs::read(dir.join(INDEX_FILE)).await {
            Ok(raw) => match serde_json::from_slice::<HashMap<String, CacheEntry>>(&raw) {
                Ok(index) => index,
                Err(e) => {
                    warn!("cache index unreadable, starting empty: {}", e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        debug!("cache opened with {} entries", index.len());
        Ok(Self {
            dir: dir.to_path_buf(),
            index: RwLock::new(index),
        })
    }

    pub fn lookup(&self, path: &str) -> Option<CacheEntry> {
        self.index.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Read the cached body blob for a path.
    pub async fn read_body(&self, path: &str) -> Result<Vec<u8>> {
        let blob = self.body_path(path);
        tokio::fs::read(&blob)
            .await
            .with_context(|| format!("reading cache blob {}", blob.display()))
    }

    /// Store a response: volatile headers are dropped, the body blob is
    /// written, and the full index is rewritten to disk. The entry becomes
    /// visible to `lookup` only once both files are durable. Concurrent
    /// writers to the same path race benignly; both derive the entry from
    /// the same upstream resource and the last writer wins.
    pub async fn insert(
        &self,
        path: &str,
        status: u16,
        headers: Vec<(String, String)>,
        body: &[u8],
    ) -> Result<()> {
        let headers: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(name, _)| !VOLATILE_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
            .collect();
        let entry = CacheEntry { status, headers };

        tokio::fs::write(self.body_path(path), body).await?;

        let snapshot = {
            let index = self.index.read();
            let mut snapshot = index.clone();
            snapshot.insert(path.to_string(), entry.clone());
            snapshot
        };
        let raw = serde_json::to_vec(&snapshot)?;
        tokio::fs::write(self.dir.join(INDEX_FILE), raw).await?;

        self.index.write().insert(path.to_string(), entry);

        debug!("cached {} ({} bytes)", path, body.len());
        Ok(())
    }

    fn body_path(&self, path: &str) -> PathBuf {
        self.dir.join(format!("data_{}", sanitize_path(path)))
    }
}

/// Map any request path onto a flat, filesystem-safe blob name: every
/// character outside `[A-Za-z0-9.]` becomes `_`.
pub fn sanitize_path(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/html/assets/logo.png"), "_html_assets_logo.png");
        assert_eq!(sanitize_path("/a b/c?d=e"), "_a_b_c_d_e");
        assert_eq!(sanitize_path("plain.css"), "plain.css");
    }
}
