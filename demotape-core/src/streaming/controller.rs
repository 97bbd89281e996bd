//! Per-request stream decisions: who gets which bytes.
//!
//! Each request walks `resolve track -> check purchase -> full | ensure demo`
//! and then emits either the whole entity or one byte range. No state is kept
//! across requests apart from the demo cache on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use url::Url;

use super::body::file_body;
use super::notify::{PlayEvent, PlayNotifier, notify_detached};
use super::range::{RangeSpec, parse_range};
use crate::audio::{content_type_for, is_segmented_extension};
use crate::catalog::{Catalog, CatalogError, ProductId, PurchaseContext, Track, TrackIndex, Viewer};
use crate::config::{DemoConfig, DemoSettings, DemotapeConfig};
use crate::demo::{DemoCache, DemoError, DemoGenerator, GenerationGuard, demo_extension};
use crate::demo::generator::truncated_len;
use crate::sources::{FetchError, SourceFetcher, SourceLocation};
use crate::transcoder::Transcoder;

/// One streaming request as described by the shop.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub product_id: ProductId,
    pub track: TrackIndex,
    pub viewer: Viewer,
}

/// Errors that end a stream request before any body bytes are sent.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Registered users only")]
    Forbidden,

    #[error("Product {product_id} not found")]
    ProductNotFound { product_id: ProductId },

    #[error("Track {track} not found in product {product_id}")]
    TrackNotFound {
        product_id: ProductId,
        track: TrackIndex,
    },

    #[error("Source file {path} is missing")]
    SourceMissing { path: PathBuf },

    #[error("Requested range not satisfiable for {total} bytes")]
    RangeNotSatisfiable { total: u64 },

    #[error("Demo unavailable: {0}")]
    Demo(#[from] DemoError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Remote source error: {0}")]
    Fetch(#[from] FetchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to build response: {reason}")]
    Response { reason: String },
}

impl StreamError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamError::Forbidden => StatusCode::FORBIDDEN,
            StreamError::ProductNotFound { .. }
            | StreamError::TrackNotFound { .. }
            | StreamError::SourceMissing { .. }
            | StreamError::Demo(_) => StatusCode::NOT_FOUND,
            StreamError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            StreamError::Catalog(_) => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::Fetch(_) => StatusCode::BAD_GATEWAY,
            StreamError::Io(_) | StreamError::Response { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Stream failed: {}", self);
        } else {
            tracing::debug!("Stream rejected with {}: {}", status, self);
        }

        let mut response = (status, status.canonical_reason().unwrap_or("Error")).into_response();
        if let StreamError::RangeNotSatisfiable { total } = self
            && let Ok(value) = format!("bytes */{total}").parse::<HeaderValue>()
        {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
        response
    }
}

/// What the request resolved to.
#[derive(Debug)]
enum Delivery {
    Redirect(Url),
    File {
        path: PathBuf,
        /// Entity length cap for stream-time truncation
        limit: Option<u64>,
    },
}

/// Serves full tracks to purchasers and demos to everyone else.
pub struct StreamController {
    demo_config: DemoConfig,
    catalog: Arc<dyn Catalog>,
    generator: DemoGenerator,
    cache: DemoCache,
    guard: GenerationGuard,
    fetcher: SourceFetcher,
    notifier: Arc<dyn PlayNotifier>,
}

impl StreamController {
    /// # Errors
    ///
    /// - `StreamError::Fetch` - HTTP client for remote sources could not be built
    pub fn new(
        config: &DemotapeConfig,
        catalog: Arc<dyn Catalog>,
        transcoder: Arc<dyn Transcoder>,
        cache: DemoCache,
        notifier: Arc<dyn PlayNotifier>,
    ) -> Result<Self, StreamError> {
        Ok(Self {
            demo_config: config.demo.clone(),
            catalog,
            generator: DemoGenerator::new(transcoder),
            cache,
            guard: GenerationGuard::new(),
            fetcher: SourceFetcher::new(&config.network)?,
            notifier,
        })
    }

    /// Replaces the demo generator, for a custom target length policy.
    pub fn with_generator(mut self, generator: DemoGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn cache(&self) -> &DemoCache {
        &self.cache
    }

    /// Resolves and serves one track.
    ///
    /// # Errors
    ///
    /// - `StreamError::Forbidden` - Registered-only mode and anonymous viewer
    /// - `StreamError::ProductNotFound` / `StreamError::TrackNotFound` - Unknown ids
    /// - `StreamError::RangeNotSatisfiable` - Range starts past the entity
    /// - `StreamError::Demo` - No demo could be produced
    /// - `StreamError::Fetch` - Remote source could not be downloaded
    pub async fn stream(
        &self,
        request: &StreamRequest,
        range: Option<&str>,
    ) -> Result<Response, StreamError> {
        if self.demo_config.registered_only && !request.viewer.is_authenticated() {
            return Err(StreamError::Forbidden);
        }

        let product = self.catalog.product(request.product_id).await?.ok_or(
            StreamError::ProductNotFound {
                product_id: request.product_id,
            },
        )?;
        let track = product
            .track(&request.track)
            .cloned()
            .ok_or_else(|| StreamError::TrackNotFound {
                product_id: request.product_id,
                track: request.track.clone(),
            })?;

        let settings = DemoSettings::resolve(&self.demo_config, &product.demo);
        let delivery = self
            .resolve(&track, &settings, &request.viewer.purchase)
            .await?;

        let response = match delivery {
            Delivery::Redirect(url) => redirect(&url)?,
            Delivery::File { path, limit } => file_response(&path, limit, range).await?,
        };

        notify_detached(
            self.notifier.clone(),
            PlayEvent::new(track.product_id, track.index.clone(), track.source.clone()),
        );

        Ok(response)
    }

    async fn resolve(
        &self,
        track: &Track,
        settings: &DemoSettings,
        purchase: &PurchaseContext,
    ) -> Result<Delivery, StreamError> {
        let location = SourceLocation::parse(&track.source);

        if !settings.secure_demos || purchase.is_purchased() {
            return self.full_delivery(track, location, settings, purchase).await;
        }

        let segmented = is_segmented_extension(&track.extension);
        if !self.demo_config.persist_demos && !segmented {
            let path = self.local_source(track, location).await?;
            let size = file_len(&path).await?;
            tracing::debug!(
                "Truncating {} at stream time to {}%",
                path.display(),
                settings.percent
            );
            return Ok(Delivery::File {
                path,
                limit: Some(truncated_len(size, settings.percent)),
            });
        }

        let path = self.ensure_demo(track, location, settings).await?;
        Ok(Delivery::File { path, limit: None })
    }

    async fn full_delivery(
        &self,
        track: &Track,
        location: SourceLocation,
        settings: &DemoSettings,
        purchase: &PurchaseContext,
    ) -> Result<Delivery, StreamError> {
        match location {
            SourceLocation::Local(path) => Ok(Delivery::File { path, limit: None }),
            SourceLocation::Remote(url) => match purchase.path_token() {
                // Purchasers of protected products get a private copy instead of the origin URL.
                Some(token) if settings.secure_demos => {
                    let dest = self
                        .cache
                        .purchased_path(&token, &track.source, &track.extension);
                    self.download(&url, &dest).await?;
                    Ok(Delivery::File {
                        path: dest,
                        limit: None,
                    })
                }
                _ => Ok(Delivery::Redirect(url)),
            },
        }
    }

    async fn ensure_demo(
        &self,
        track: &Track,
        location: SourceLocation,
        settings: &DemoSettings,
    ) -> Result<PathBuf, StreamError> {
        let extension = demo_extension(&track.extension);
        if let Some(path) = self
            .cache
            .find_valid(&track.source, settings, &extension)
            .await
        {
            return Ok(path);
        }

        let dest = self.cache.demo_path(&track.source, settings, &extension);
        let _generation = self.guard.lock(&dest).await;

        // Another request may have finished while we waited.
        if let Some(path) = self
            .cache
            .find_valid(&track.source, settings, &extension)
            .await
        {
            return Ok(path);
        }

        let source = self.local_source(track, location).await?;
        tracing::info!(
            "Generating {}% demo for product {} track {}",
            settings.percent,
            track.product_id,
            track.index
        );

        let outcome = self
            .generator
            .make_demo(
                &source,
                &dest,
                settings.percent,
                settings.watermark.as_deref().map(Path::new),
            )
            .await?;

        Ok(outcome.path)
    }

    async fn local_source(
        &self,
        track: &Track,
        location: SourceLocation,
    ) -> Result<PathBuf, StreamError> {
        match location {
            SourceLocation::Local(path) => Ok(path),
            SourceLocation::Remote(url) => {
                let dest = self
                    .cache
                    .source_cache_path(&track.source, &track.extension);
                self.download(&url, &dest).await?;
                Ok(dest)
            }
        }
    }

    async fn download(&self, url: &Url, dest: &Path) -> Result<(), StreamError> {
        let _download = self.guard.lock(dest).await;
        self.fetcher.fetch_to(url, dest).await?;
        Ok(())
    }
}

async fn file_len(path: &Path) -> Result<u64, StreamError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(StreamError::SourceMissing {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StreamError::SourceMissing {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(StreamError::Io(e)),
    }
}

fn redirect(url: &Url) -> Result<Response, StreamError> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, url.as_str())
        .body(Body::empty())
        .map_err(|e| StreamError::Response {
            reason: e.to_string(),
        })
}

/// Builds a 200 or 206 response for `path`, capped at `limit` bytes.
async fn file_response(
    path: &Path,
    limit: Option<u64>,
    range: Option<&str>,
) -> Result<Response, StreamError> {
    let size = file_len(path).await?;
    let total = limit.map_or(size, |limit| limit.min(size));

    let (status, start, len) = match parse_range(range, total) {
        RangeSpec::Full => (StatusCode::OK, 0, total),
        RangeSpec::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        RangeSpec::Unsatisfiable => return Err(StreamError::RangeNotSatisfiable { total }),
    };

    let body = file_body(path, start, len).await?;

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type_for(path))
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-cache");

    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, start + len - 1, total),
        );
    }

    builder.body(body).map_err(|e| StreamError::Response {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::to_bytes;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::catalog::{InMemoryCatalog, Product};
    use crate::config::DemoOverrides;
    use crate::streaming::notify::PlayCounter;
    use crate::test_fixtures::{FakeTranscoder, write_source_file};

    struct Harness {
        _dir: TempDir,
        controller: StreamController,
        catalog: InMemoryCatalog,
        plays: Arc<PlayCounter>,
        source: PathBuf,
        settings: DemoSettings,
    }

    impl Harness {
        fn demo_path(&self) -> PathBuf {
            self.controller
                .cache()
                .demo_path(&self.source.to_string_lossy(), &self.settings, "mp3")
        }
    }

    fn harness(configure: impl FnOnce(&mut DemotapeConfig), overrides: DemoOverrides) -> Harness {
        harness_with(Arc::new(FakeTranscoder::unavailable()), configure, overrides)
    }

    fn harness_with(
        transcoder: Arc<dyn Transcoder>,
        configure: impl FnOnce(&mut DemotapeConfig),
        overrides: DemoOverrides,
    ) -> Harness {
        let dir = tempdir().unwrap();
        let source = write_source_file(dir.path(), "track.mp3", 10_000);

        let mut config = DemotapeConfig::for_testing(dir.path());
        configure(&mut config);

        let settings = DemoSettings::resolve(&config.demo, &overrides);
        let catalog = InMemoryCatalog::new();
        catalog.upsert(Product {
            id: 1,
            tracks: vec![Track::new(
                1,
                TrackIndex::composite(0, 1),
                source.to_string_lossy(),
            )],
            demo: overrides,
        });

        let plays = Arc::new(PlayCounter::new());
        let controller = StreamController::new(
            &config,
            Arc::new(catalog.clone()),
            transcoder,
            DemoCache::new(&config.demo.cache_dir),
            plays.clone(),
        )
        .unwrap();

        Harness {
            _dir: dir,
            controller,
            catalog,
            plays,
            source,
            settings,
        }
    }

    fn request(viewer: Viewer) -> StreamRequest {
        StreamRequest {
            product_id: 1,
            track: TrackIndex::composite(0, 1),
            viewer,
        }
    }

    fn purchaser() -> Viewer {
        Viewer {
            user: Some("buyer".to_string()),
            purchase: PurchaseContext::purchased("tok"),
        }
    }

    async fn body_of(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_anonymous_viewer_gets_persisted_demo() {
        let h = harness(|_| {}, DemoOverrides::default());
        let response = h
            .controller
            .stream(&request(Viewer::anonymous()), None)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "5000");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");

        let body = body_of(response).await;
        assert_eq!(body, std::fs::read(&h.source).unwrap()[..5_000]);

        assert_eq!(std::fs::metadata(h.demo_path()).unwrap().len(), 5_000);
    }

    #[tokio::test]
    async fn test_purchaser_gets_full_file() {
        let h = harness(|_| {}, DemoOverrides::default());
        let response = h.controller.stream(&request(purchaser()), None).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await.len(), 10_000);
        assert!(!h.controller.cache().root().exists());
    }

    #[tokio::test]
    async fn test_secure_demos_disabled_serves_full_file() {
        let h = harness(
            |_| {},
            DemoOverrides {
                secure_demos: Some(false),
                ..Default::default()
            },
        );
        let response = h
            .controller
            .stream(&request(Viewer::anonymous()), None)
            .await
            .unwrap();
        assert_eq!(body_of(response).await.len(), 10_000);
    }

    #[tokio::test]
    async fn test_stream_time_truncation_when_not_persisting() {
        let h = harness(
            |config| config.demo.persist_demos = false,
            DemoOverrides {
                percent: Some(20),
                ..Default::default()
            },
        );
        let response = h
            .controller
            .stream(&request(Viewer::anonymous()), Some("bytes=1000-"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 1000-1999/2000");
        assert_eq!(body_of(response).await.len(), 1_000);
        assert!(!h.controller.cache().root().exists());
    }

    #[tokio::test]
    async fn test_registered_only_rejects_anonymous() {
        let h = harness(|config| config.demo.registered_only = true, DemoOverrides::default());
        let result = h
            .controller
            .stream(&request(Viewer::anonymous()), None)
            .await;
        assert!(matches!(result, Err(StreamError::Forbidden)));

        let member = Viewer {
            user: Some("7".to_string()),
            ..Default::default()
        };
        assert!(h.controller.stream(&request(member), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let h = harness(|_| {}, DemoOverrides::default());

        let mut missing_product = request(Viewer::anonymous());
        missing_product.product_id = 99;
        let err = h.controller.stream(&missing_product, None).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let mut missing_track = request(Viewer::anonymous());
        missing_track.track = TrackIndex::new("9_1");
        let err = h.controller.stream(&missing_track, None).await.unwrap_err();
        assert!(matches!(err, StreamError::TrackNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_reports_total() {
        let h = harness(|_| {}, DemoOverrides::default());
        let err = h
            .controller
            .stream(&request(purchaser()), Some("bytes=10000-"))
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::RangeNotSatisfiable { total: 10_000 }));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10000");
    }

    #[tokio::test]
    async fn test_invalid_cached_demo_is_regenerated() {
        let h = harness(|_| {}, DemoOverrides::default());
        let demo = h.demo_path();
        std::fs::create_dir_all(demo.parent().unwrap()).unwrap();
        std::fs::write(&demo, "<html>error</html>").unwrap();

        let response = h
            .controller
            .stream(&request(Viewer::anonymous()), None)
            .await
            .unwrap();
        assert_eq!(body_of(response).await.len(), 5_000);
    }

    #[tokio::test]
    async fn test_successful_streams_notify() {
        let h = harness(|_| {}, DemoOverrides::default());
        h.controller
            .stream(&request(purchaser()), None)
            .await
            .unwrap();
        let _ = h
            .controller
            .stream(&request(purchaser()), Some("bytes=99999-"))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.plays.count(1), 1);
    }

    #[tokio::test]
    async fn test_product_override_change_renders_a_new_demo() {
        let h = harness(
            |_| {},
            DemoOverrides {
                percent: Some(20),
                ..Default::default()
            },
        );
        let anonymous = || request(Viewer::anonymous());

        let response = h.controller.stream(&anonymous(), None).await.unwrap();
        assert_eq!(body_of(response).await.len(), 2_000);

        let mut product = h.catalog.product(1).await.unwrap().unwrap();
        product.demo.percent = Some(80);
        h.catalog.upsert(product.clone());
        let response = h.controller.stream(&anonymous(), None).await.unwrap();
        assert_eq!(body_of(response).await.len(), 8_000);

        // Switching back reuses the first demo.
        product.demo.percent = Some(20);
        h.catalog.upsert(product);
        let response = h.controller.stream(&anonymous(), None).await.unwrap();
        assert_eq!(body_of(response).await.len(), 2_000);
        assert_eq!(std::fs::read_dir(h.controller.cache().root()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_demo_requests_share_one_generation() {
        let transcoder = Arc::new(
            FakeTranscoder::with_duration(Duration::from_secs(100))
                .with_render_delay(Duration::from_millis(300)),
        );
        let h = Arc::new(harness_with(
            transcoder.clone(),
            |_| {},
            DemoOverrides::default(),
        ));
        let spawn_stream = |h: Arc<Harness>| {
            tokio::spawn(async move {
                let response = h
                    .controller
                    .stream(&request(Viewer::anonymous()), None)
                    .await
                    .unwrap();
                body_of(response).await
            })
        };

        let first = spawn_stream(h.clone());
        // Later requests arrive while the first render is half written.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let late: Vec<_> = (0..7).map(|_| spawn_stream(h.clone())).collect();

        let mut bodies = vec![first.await.unwrap()];
        for task in late {
            bodies.push(task.await.unwrap());
        }

        assert_eq!(transcoder.rendered_lengths(), vec![Duration::from_secs(50)]);
        let demo = std::fs::read(h.demo_path()).unwrap();
        assert_eq!(demo.len(), 6 + 64 + 50 * 128);
        for body in &bodies {
            assert_eq!(body, &demo);
        }
    }
}
