//! Shared setup for integration tests.

use std::path::PathBuf;
use std::sync::Arc;

use axum::response::Response;
use demotape_core::catalog::{InMemoryCatalog, Product, ProductId, Track, TrackIndex, Viewer};
use demotape_core::config::{DemoSettings, DemotapeConfig};
use demotape_core::demo::DemoCache;
use demotape_core::formats::FormatProcessor;
use demotape_core::metadata::InMemoryMetadataStore;
use demotape_core::streaming::{PlayCounter, StreamController, StreamRequest};
use demotape_core::test_fixtures::{temp_workspace, write_source_file};
use demotape_core::transcoder::Transcoder;
use tempfile::TempDir;

/// A temporary shop: directories, catalog and metadata store.
pub struct Shop {
    pub dir: TempDir,
    pub config: DemotapeConfig,
    pub catalog: InMemoryCatalog,
    pub metadata: Arc<InMemoryMetadataStore>,
    pub plays: Arc<PlayCounter>,
}

impl Shop {
    pub fn new() -> Self {
        let (dir, config) = temp_workspace();
        Self {
            dir,
            config,
            catalog: InMemoryCatalog::new(),
            metadata: Arc::new(InMemoryMetadataStore::new()),
            plays: Arc::new(PlayCounter::new()),
        }
    }

    pub fn music_dir(&self, product_id: ProductId) -> PathBuf {
        self.dir.path().join("music").join(product_id.to_string())
    }

    /// Writes one source file per `(name, size)` and registers the product.
    pub fn add_product(&self, product_id: ProductId, files: &[(&str, usize)]) -> Product {
        let dir = self.music_dir(product_id);
        let tracks = files
            .iter()
            .enumerate()
            .map(|(offset, (name, size))| {
                let path = write_source_file(&dir, name, *size);
                Track::new(
                    product_id,
                    TrackIndex::composite(offset, product_id),
                    path.to_string_lossy(),
                )
            })
            .collect();

        let product = Product {
            id: product_id,
            tracks,
            demo: Default::default(),
        };
        self.catalog.upsert(product.clone());
        product
    }

    pub fn cache(&self) -> DemoCache {
        DemoCache::new(&self.config.demo.cache_dir)
    }

    /// Where the mp3 demo of `product`'s first track lives under its current settings.
    pub fn demo_path(&self, product: &Product) -> PathBuf {
        let settings = DemoSettings::resolve(&self.config.demo, &product.demo);
        self.cache()
            .demo_path(&product.tracks[0].source, &settings, "mp3")
    }

    pub fn controller(&self, transcoder: Arc<dyn Transcoder>) -> StreamController {
        StreamController::new(
            &self.config,
            Arc::new(self.catalog.clone()),
            transcoder,
            self.cache(),
            self.plays.clone(),
        )
        .unwrap()
    }

    pub fn processor(&self, transcoder: Arc<dyn Transcoder>) -> FormatProcessor {
        FormatProcessor::new(
            &self.config,
            Arc::new(self.catalog.clone()),
            self.metadata.clone(),
            transcoder,
        )
        .unwrap()
    }
}

pub fn request(product_id: ProductId, track: &str, viewer: Viewer) -> StreamRequest {
    StreamRequest {
        product_id,
        track: TrackIndex::new(track),
        viewer,
    }
}

pub fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}
