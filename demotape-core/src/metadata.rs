//! Per-product key/value metadata written by the format processor.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::audio::AudioFormat;
use crate::catalog::ProductId;

/// Content-identity hash of the product's audio tracks.
pub const AUDIO_FILES_HASH: &str = "audio_files_hash";
/// RFC 3339 timestamp of the last completed format run.
pub const FORMATS_GENERATED_AT: &str = "formats_generated_at";
/// JSON array of formats that have an archive.
pub const AVAILABLE_FORMATS: &str = "available_formats";

/// Errors from metadata reads and writes.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Metadata I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt metadata: {reason}")]
    Corrupt { reason: String },
}

/// Opaque per-product key/value store owned by the shop.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// # Errors
    ///
    /// - `MetadataError::Io` - Backing storage could not be read
    async fn get(&self, product: ProductId, key: &str) -> Result<Option<String>, MetadataError>;

    /// # Errors
    ///
    /// - `MetadataError::Io` - Backing storage could not be written
    async fn set(&self, product: ProductId, key: &str, value: String)
    -> Result<(), MetadataError>;
}

/// Reads `available_formats` for a product, ignoring unknown names.
///
/// # Errors
///
/// - `MetadataError::Io` - Backing storage could not be read
/// - `MetadataError::Corrupt` - Stored value is not a JSON array of strings
pub async fn available_formats(
    store: &dyn MetadataStore,
    product: ProductId,
) -> Result<Vec<AudioFormat>, MetadataError> {
    let Some(raw) = store.get(product, AVAILABLE_FORMATS).await? else {
        return Ok(Vec::new());
    };

    let names: Vec<String> =
        serde_json::from_str(&raw).map_err(|e| MetadataError::Corrupt {
            reason: format!("{AVAILABLE_FORMATS} for product {product}: {e}"),
        })?;

    Ok(names
        .iter()
        .filter_map(|name| AudioFormat::from_extension(name))
        .collect())
}

/// In-memory store; counts writes so tests can assert a run did no work.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetadataStore {
    values: Arc<RwLock<HashMap<(ProductId, String), String>>>,
    writes: Arc<AtomicU64>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, product: ProductId, key: &str) -> Result<Option<String>, MetadataError> {
        Ok(self.values.read().get(&(product, key.to_string())).cloned())
    }

    async fn set(
        &self,
        product: ProductId,
        key: &str,
        value: String,
    ) -> Result<(), MetadataError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.values.write().insert((product, key.to_string()), value);
        Ok(())
    }
}

type FileContents = BTreeMap<String, BTreeMap<String, String>>;

/// Store persisted as one JSON document, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileMetadataStore {
    path: PathBuf,
    values: tokio::sync::Mutex<FileContents>,
}

impl JsonFileMetadataStore {
    /// Opens the store, starting empty when the file does not exist yet.
    ///
    /// # Errors
    ///
    /// - `MetadataError::Io` - Existing file could not be read
    /// - `MetadataError::Corrupt` - Existing file is not valid JSON
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let path = path.into();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => FileContents::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| MetadataError::Corrupt {
                reason: format!("{}: {e}", path.display()),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileContents::new(),
            Err(source) => return Err(MetadataError::Io { path, source }),
        };

        Ok(Self {
            path,
            values: tokio::sync::Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, values: &FileContents) -> Result<(), MetadataError> {
        let io_err = |source| MetadataError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let encoded = serde_json::to_vec_pretty(values).map_err(|e| MetadataError::Corrupt {
            reason: e.to_string(),
        })?;

        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, encoded).await.map_err(io_err)?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(io_err)
    }
}

#[async_trait]
impl MetadataStore for JsonFileMetadataStore {
    async fn get(&self, product: ProductId, key: &str) -> Result<Option<String>, MetadataError> {
        let values = self.values.lock().await;
        Ok(values
            .get(&product.to_string())
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn set(
        &self,
        product: ProductId,
        key: &str,
        value: String,
    ) -> Result<(), MetadataError> {
        let mut values = self.values.lock().await;
        values
            .entry(product.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.persist(&values).await
    }
}
