//! Product catalog supplied by the shop.
//!
//! The core never derives purchase state or user identity; both arrive as
//! explicit values on every request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::audio::content_type_for;
use crate::config::DemoOverrides;

/// Numeric product identifier assigned by the shop.
pub type ProductId = u64;

/// Stable per-product track key.
///
/// Not necessarily sequential; the shop may use composite keys such as
/// `"0_42"` (`{offset}_{productId}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackIndex(String);

impl TrackIndex {
    pub fn new(index: impl Into<String>) -> Self {
        Self(index.into())
    }

    /// Composite key used when the shop does not supply one.
    pub fn composite(offset: usize, product_id: ProductId) -> Self {
        Self(format!("{offset}_{product_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One purchasable audio asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub product_id: ProductId,
    pub index: TrackIndex,
    /// Local filesystem path or http(s) URL
    pub source: String,
    /// Lowercase extension without the dot
    pub extension: String,
    pub display_name: String,
}

impl Track {
    /// Builds a track, deriving extension and display name from the source.
    pub fn new(product_id: ProductId, index: TrackIndex, source: impl Into<String>) -> Self {
        let source = source.into();
        let extension = extension_of(&source);
        let display_name = stem_of(&source);
        Self {
            product_id,
            index,
            source,
            extension,
            display_name,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Whether the track is an audio download the format processor can handle.
    pub fn is_audio(&self) -> bool {
        content_type_for(Path::new(&format!("track.{}", self.extension))).starts_with("audio/")
            || crate::audio::is_segmented_extension(&self.extension)
    }
}

/// A product and its downloadable tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub demo: DemoOverrides,
}

impl Product {
    pub fn track(&self, index: &TrackIndex) -> Option<&Track> {
        self.tracks.iter().find(|t| &t.index == index)
    }

    /// Tracks the format processor converts.
    pub fn audio_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.is_audio())
    }
}

/// Purchase status of the requesting viewer for one product.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PurchaseContext {
    #[default]
    NotPurchased,
    /// `token` is an opaque hash of the purchaser's identity.
    Purchased { token: String },
}

impl PurchaseContext {
    pub fn purchased(token: impl Into<String>) -> Self {
        Self::Purchased {
            token: token.into(),
        }
    }

    pub fn is_purchased(&self) -> bool {
        matches!(self, Self::Purchased { .. })
    }

    /// Token safe to embed in a file name.
    ///
    /// Tokens made of ASCII alphanumerics, `-` and `_` are used verbatim;
    /// anything else is replaced by its md5 digest.
    pub fn path_token(&self) -> Option<String> {
        let Self::Purchased { token } = self else {
            return None;
        };

        let safe = !token.is_empty()
            && token.len() <= 64
            && token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

        if safe {
            Some(token.clone())
        } else {
            Some(hex::encode(Md5::digest(token.as_bytes())))
        }
    }
}

/// The requesting viewer as described by the shop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Viewer {
    /// Authenticated user identifier, if any.
    pub user: Option<String>,
    pub purchase: PurchaseContext,
}

impl Viewer {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Errors from catalog lookups.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid catalog manifest: {reason}")]
    InvalidManifest { reason: String },

    #[error("Catalog unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Source of product and track data.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Looks up a product by id; `Ok(None)` when it does not exist.
    ///
    /// # Errors
    ///
    /// - `CatalogError::Unavailable` - Backing store could not be queried
    async fn product(&self, id: ProductId) -> Result<Option<Product>, CatalogError>;
}

/// Catalog held in memory, optionally loaded from a JSON manifest.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    products: Arc<RwLock<HashMap<ProductId, Product>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a product.
    pub fn upsert(&self, product: Product) {
        self.products.write().insert(product.id, product);
    }

    pub fn remove(&self, id: ProductId) -> Option<Product> {
        self.products.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.products.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.read().is_empty()
    }

    /// Loads a catalog manifest from disk.
    ///
    /// # Errors
    ///
    /// - `CatalogError::Io` - Manifest could not be read
    /// - `CatalogError::InvalidManifest` - Manifest is not valid JSON or has duplicate keys
    pub async fn from_manifest(path: &Path) -> Result<Self, CatalogError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CatalogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let catalog = Self::from_manifest_str(&raw)?;
        tracing::info!(
            "Loaded {} products from catalog {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Parses a catalog manifest.
    ///
    /// # Errors
    ///
    /// - `CatalogError::InvalidManifest` - Manifest is not valid JSON or has duplicate keys
    pub fn from_manifest_str(raw: &str) -> Result<Self, CatalogError> {
        let manifest: Manifest =
            serde_json::from_str(raw).map_err(|e| CatalogError::InvalidManifest {
                reason: e.to_string(),
            })?;

        let catalog = Self::new();
        for entry in manifest.products {
            let product = entry.into_product()?;
            if catalog.products.read().contains_key(&product.id) {
                return Err(CatalogError::InvalidManifest {
                    reason: format!("product {} listed twice", product.id),
                });
            }
            catalog.upsert(product);
        }
        Ok(catalog)
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn product(&self, id: ProductId) -> Result<Option<Product>, CatalogError> {
        Ok(self.products.read().get(&id).cloned())
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    products: Vec<ManifestProduct>,
}

#[derive(Debug, Deserialize)]
struct ManifestProduct {
    id: ProductId,
    #[serde(default)]
    demo: DemoOverrides,
    #[serde(default)]
    tracks: Vec<ManifestTrack>,
}

#[derive(Debug, Deserialize)]
struct ManifestTrack {
    #[serde(default)]
    index: Option<String>,
    source: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    extension: Option<String>,
}

impl ManifestProduct {
    fn into_product(self) -> Result<Product, CatalogError> {
        let id = self.id;
        let mut tracks: Vec<Track> = Vec::with_capacity(self.tracks.len());

        for (offset, entry) in self.tracks.into_iter().enumerate() {
            let index = entry
                .index
                .map(TrackIndex::new)
                .unwrap_or_else(|| TrackIndex::composite(offset, id));

            if tracks.iter().any(|t| t.index == index) {
                return Err(CatalogError::InvalidManifest {
                    reason: format!("product {id} has duplicate track index {index}"),
                });
            }

            let mut track = Track::new(id, index, entry.source);
            if let Some(name) = entry.name {
                track.display_name = name;
            }
            if let Some(extension) = entry.extension {
                track.extension = extension.trim_start_matches('.').to_ascii_lowercase();
            }
            tracks.push(track);
        }

        Ok(Product {
            id,
            tracks,
            demo: self.demo,
        })
    }
}

fn extension_of(source: &str) -> String {
    let path_part = source.split(['?', '#']).next().unwrap_or(source);
    Path::new(path_part)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

fn stem_of(source: &str) -> String {
    let path_part = source.split(['?', '#']).next().unwrap_or(source);
    Path::new(path_part)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("track")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_derives_extension_and_name() {
        let track = Track::new(
            7,
            TrackIndex::new("a"),
            "https://cdn.example.com/music/Song.FLAC?sig=abc",
        );
        assert_eq!(track.extension, "flac");
        assert_eq!(track.display_name, "Song");
        assert!(track.is_audio());

        let booklet = Track::new(7, TrackIndex::new("b"), "/srv/booklet.pdf");
        assert!(!booklet.is_audio());
    }

    #[test]
    fn test_manifest_assigns_composite_indices() {
        let raw = r#"{
            "products": [
                {
                    "id": 42,
                    "demo": { "percent": 20 },
                    "tracks": [
                        { "source": "/music/one.mp3", "name": "One" },
                        { "source": "/music/two.wav", "index": "custom" }
                    ]
                }
            ]
        }"#;

        let catalog = InMemoryCatalog::from_manifest_str(raw).unwrap();
        let product = catalog.products.read().get(&42).cloned().unwrap();

        assert_eq!(product.demo.percent, Some(20));
        assert_eq!(product.tracks[0].index.as_str(), "0_42");
        assert_eq!(product.tracks[0].display_name, "One");
        assert_eq!(product.tracks[1].index.as_str(), "custom");
        assert!(product.track(&TrackIndex::new("custom")).is_some());
    }

    #[test]
    fn test_manifest_rejects_duplicates() {
        let duplicate_products = r#"{"products":[{"id":1},{"id":1}]}"#;
        assert!(InMemoryCatalog::from_manifest_str(duplicate_products).is_err());

        let duplicate_tracks = r#"{"products":[{"id":1,"tracks":[
            {"source":"a.mp3","index":"x"},{"source":"b.mp3","index":"x"}]}]}"#;
        assert!(InMemoryCatalog::from_manifest_str(duplicate_tracks).is_err());

        assert!(InMemoryCatalog::from_manifest_str("not json").is_err());
    }

    #[test]
    fn test_purchase_path_token() {
        assert_eq!(PurchaseContext::NotPurchased.path_token(), None);
        assert_eq!(
            PurchaseContext::purchased("abc123_X").path_token().as_deref(),
            Some("abc123_X")
        );

        let hashed = PurchaseContext::purchased("../../etc/passwd")
            .path_token()
            .unwrap();
        assert_eq!(hashed.len(), 32);
        assert!(hashed.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_viewer_authentication() {
        assert!(!Viewer::anonymous().is_authenticated());
        let viewer = Viewer {
            user: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(!viewer.is_authenticated());
        let viewer = Viewer {
            user: Some("17".to_string()),
            ..Default::default()
        };
        assert!(viewer.is_authenticated());
    }

    #[tokio::test]
    async fn test_catalog_lookup() {
        let catalog = InMemoryCatalog::new();
        catalog.upsert(Product {
            id: 3,
            tracks: vec![Track::new(3, TrackIndex::composite(0, 3), "/a.mp3")],
            demo: DemoOverrides::default(),
        });

        assert!(catalog.product(3).await.unwrap().is_some());
        assert!(catalog.product(4).await.unwrap().is_none());
    }
}
