//! Demo cache layout and validity checks.
//!
//! Layout under the cache root:
//! - `{md5(source)}_{settings}.{ext}` - primary demo
//! - `o_{md5(source)}_{settings}.{ext}` - served when the final rename fails
//! - `.part-{uuid}-{name}` - renders in progress, never looked up
//! - `purchased/{token}_{md5(source)}.{ext}` - purchaser-specific copies
//! - `sources/{md5(source)}.{ext}` - downloaded remote sources
//!
//! `{settings}` is [`DemoCache::settings_key`] of the effective percentage and
//! watermark, so a demo is only ever served under the settings it was
//! rendered with.
//!
//! [`DemoCache::is_valid`] is a header check only. It relies on every file
//! under a primary or `o_` name having been moved there by a rename after the
//! write finished; anything still being written lives under a `.part-` name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use md5::{Digest, Md5};

use crate::audio::{is_text_mime, sniff_file};
use crate::config::DemoSettings;
use crate::sources::source_key;

const FINGERPRINT_FILE: &str = ".settings";
const SECONDARY_PREFIX: &str = "o_";

/// Paths and housekeeping for generated demos.
#[derive(Debug, Clone)]
pub struct DemoCache {
    root: PathBuf,
}

impl DemoCache {
    /// Cache rooted at `root` without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Opens the cache and purges demos rendered under different settings.
    ///
    /// The fingerprint of the previous run is kept in a marker file; a
    /// mismatch means the demo percentage or watermark changed.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - Root could not be created or the marker written
    pub async fn open(root: impl Into<PathBuf>, fingerprint: &str) -> std::io::Result<Self> {
        let cache = Self::new(root);
        tokio::fs::create_dir_all(&cache.root).await?;

        let marker = cache.root.join(FINGERPRINT_FILE);
        let previous = tokio::fs::read_to_string(&marker).await.ok();

        if previous.as_deref() != Some(fingerprint) {
            if previous.is_some() {
                let removed = cache.purge().await?;
                tracing::info!(
                    "Demo settings changed, purged {} cached demos from {}",
                    removed,
                    cache.root.display()
                );
            }
            tokio::fs::write(&marker, fingerprint).await?;
        }

        Ok(cache)
    }

    /// Fingerprint of the settings that shape a demo's content.
    pub fn fingerprint(settings: &DemoSettings) -> String {
        format!(
            "percent={};watermark={}",
            settings.percent,
            settings.watermark.as_deref().unwrap_or("")
        )
    }

    /// First 8 hex digits of the md5 of [`DemoCache::fingerprint`].
    pub fn settings_key(settings: &DemoSettings) -> String {
        let digest = hex::encode(Md5::digest(Self::fingerprint(settings).as_bytes()));
        digest[..8].to_string()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn demo_path(&self, source: &str, settings: &DemoSettings, extension: &str) -> PathBuf {
        self.root.join(demo_file_name(source, settings, extension))
    }

    pub fn secondary_path(
        &self,
        source: &str,
        settings: &DemoSettings,
        extension: &str,
    ) -> PathBuf {
        self.root.join(format!(
            "{SECONDARY_PREFIX}{}",
            demo_file_name(source, settings, extension)
        ))
    }

    pub fn purchased_path(&self, token: &str, source: &str, extension: &str) -> PathBuf {
        self.root
            .join("purchased")
            .join(format!("{token}_{}.{extension}", source_key(source)))
    }

    pub fn source_cache_path(&self, source: &str, extension: &str) -> PathBuf {
        self.root
            .join("sources")
            .join(format!("{}.{extension}", source_key(source)))
    }

    /// A cached demo is usable when it exists, is non-empty and does not
    /// sniff as text (an error page saved in place of audio).
    pub async fn is_valid(path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            _ => return false,
        }

        match sniff_file(path).await {
            Ok(mime) if is_text_mime(mime) => {
                tracing::warn!("Cached demo {} sniffed as {}, discarding", path.display(), mime);
                false
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// First valid demo among the primary and secondary names for `settings`.
    pub async fn find_valid(
        &self,
        source: &str,
        settings: &DemoSettings,
        extension: &str,
    ) -> Option<PathBuf> {
        for candidate in [
            self.demo_path(source, settings, extension),
            self.secondary_path(source, settings, extension),
        ] {
            if Self::is_valid(&candidate).await {
                return Some(candidate);
            }
        }
        None
    }

    /// Deletes every cached demo, keeping downloaded sources and purchased copies.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - Cache directory could not be listed
    pub async fn purge(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == FINGERPRINT_FILE || !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
        }

        tracing::debug!("Purged {} demos from {}", removed, self.root.display());
        Ok(removed)
    }
}

fn demo_file_name(source: &str, settings: &DemoSettings, extension: &str) -> String {
    format!(
        "{}_{}.{extension}",
        source_key(source),
        DemoCache::settings_key(settings)
    )
}

/// At most one concurrent generation per destination path.
///
/// Entries are dropped once no task holds or waits on them.
#[derive(Debug, Clone, Default)]
pub struct GenerationGuard {
    locks: Arc<parking_lot::Mutex<HashMap<PathBuf, Weak<tokio::sync::Mutex<()>>>>>,
}

impl GenerationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| lock.strong_count() > 0);

            match locks.get(key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let created = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(key.to_path_buf(), Arc::downgrade(&created));
                    created
                }
            }
        };

        mutex.lock_owned().await
    }

    /// Number of keys currently held or awaited.
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|lock| lock.strong_count() > 0)
            .count()
    }
}
