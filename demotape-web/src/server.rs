//! Application state, router and server bootstrap.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use demotape_core::catalog::{Catalog, InMemoryCatalog};
use demotape_core::config::{DemoOverrides, DemoSettings, DemotapeConfig};
use demotape_core::formats::{FormatProcessor, FormatWorkerHandle, NoticeBoard, spawn_format_worker};
use demotape_core::metadata::{JsonFileMetadataStore, MetadataStore};
use demotape_core::streaming::{PlayCounter, StreamController};
use demotape_core::transcoder::{FfmpegTranscoder, Transcoder};
use demotape_core::{DemoCache, DemotapeError};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    api_formats, api_health, api_notices, api_plays, api_product_saved, api_purge_demos,
    stream_track,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<StreamController>,
    pub worker: FormatWorkerHandle,
    pub notices: NoticeBoard,
    pub metadata: Arc<dyn MetadataStore>,
    pub plays: Arc<PlayCounter>,
    pub transcoder_available: bool,
    pub server_started_at: Instant,
}

impl AppState {
    /// Wires every component from explicit collaborators.
    ///
    /// Opens the demo cache, purging it when the global demo settings changed
    /// since the last start, and spawns the format worker.
    ///
    /// # Errors
    ///
    /// - `DemotapeError::Io` - Demo cache directory unusable
    /// - `DemotapeError::Stream` / `DemotapeError::Format` - HTTP client setup failed
    pub async fn new(
        config: &DemotapeConfig,
        catalog: Arc<dyn Catalog>,
        metadata: Arc<dyn MetadataStore>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Self, DemotapeError> {
        let settings = DemoSettings::resolve(&config.demo, &DemoOverrides::default());
        let cache = DemoCache::open(&config.demo.cache_dir, &DemoCache::fingerprint(&settings)).await?;

        let plays = Arc::new(PlayCounter::new());
        let controller = StreamController::new(
            config,
            catalog.clone(),
            transcoder.clone(),
            cache,
            plays.clone(),
        )?;

        let processor =
            FormatProcessor::new(config, catalog, metadata.clone(), transcoder.clone())?;
        let notices = NoticeBoard::new();
        let worker = spawn_format_worker(
            Arc::new(processor),
            notices.clone(),
            config.formats.max_concurrent_products,
        );

        Ok(Self {
            controller: Arc::new(controller),
            worker,
            notices,
            metadata,
            plays,
            transcoder_available: transcoder.is_available(),
            server_started_at: Instant::now(),
        })
    }

    /// Builds production state: manifest catalog, file-backed metadata and ffmpeg.
    ///
    /// # Errors
    ///
    /// - `DemotapeError::Catalog` - Manifest unreadable or invalid
    /// - `DemotapeError::Metadata` - Metadata file corrupt
    pub async fn from_config(config: &DemotapeConfig) -> Result<Self, DemotapeError> {
        let catalog = match &config.server.catalog_path {
            Some(path) => InMemoryCatalog::from_manifest(path).await?,
            None => {
                tracing::warn!("No catalog manifest configured, serving an empty catalog");
                InMemoryCatalog::new()
            }
        };
        tracing::info!("Catalog loaded with {} products", catalog.len());

        let metadata = JsonFileMetadataStore::open(&config.server.metadata_path).await?;
        let transcoder = FfmpegTranscoder::from_config(&config.transcoder);

        Self::new(
            config,
            Arc::new(catalog),
            Arc::new(metadata),
            Arc::new(transcoder),
        )
        .await
    }
}

/// Routes for streaming and the JSON admin API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/stream/{product_id}/{track}", get(stream_track))
        .route("/api/products/{product_id}/saved", post(api_product_saved))
        .route("/api/products/{product_id}/formats", get(api_formats))
        .route("/api/products/{product_id}/notices", get(api_notices))
        .route("/api/demos/purge", post(api_purge_demos))
        .route("/api/plays", get(api_plays))
        .route("/health", get(api_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves until the listener fails.
///
/// # Errors
///
/// - Component setup failed (see [`AppState::from_config`])
/// - Address could not be bound
pub async fn run_server(config: DemotapeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_config(&config).await?;
    let app = build_router(state);

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("Demotape server running on http://{}", address);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use demotape_core::catalog::{Product, Track, TrackIndex};
    use demotape_core::metadata::InMemoryMetadataStore;
    use demotape_core::test_fixtures::{FakeTranscoder, temp_workspace, write_source_file};
    use tower::ServiceExt;

    use super::*;

    async fn test_app(dir: &std::path::Path, config: &DemotapeConfig) -> Router {
        let catalog = InMemoryCatalog::new();
        let source = write_source_file(&dir.join("music"), "song.mp3", 1_000);
        catalog.upsert(Product {
            id: 1,
            tracks: vec![Track::new(1, TrackIndex::composite(0, 1), source.to_string_lossy())],
            demo: Default::default(),
        });

        let state = AppState::new(
            config,
            Arc::new(catalog),
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(FakeTranscoder::unavailable()),
        )
        .await
        .unwrap();
        build_router(state)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (dir, config) = temp_workspace();
        let app = test_app(dir.path(), &config).await;

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["transcoder"], false);
    }

    #[tokio::test]
    async fn test_stream_demo_and_unknown_track() {
        let (dir, config) = temp_workspace();
        let app = test_app(dir.path(), &config).await;

        let response = app
            .clone()
            .oneshot(Request::get("/stream/1/0_1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), 500);

        let response = app
            .oneshot(Request::get("/stream/1/9_1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_saved_without_transcoder_posts_notice() {
        let (dir, config) = temp_workspace();
        let app = test_app(dir.path(), &config).await;

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/products/1/saved")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["outcome"], "queued");

        // The notice lands asynchronously.
        let mut notices = serde_json::Value::Null;
        for _ in 0..50 {
            let response = app
                .clone()
                .oneshot(
                    Request::get("/api/products/1/notices")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            notices = json_body(response).await;
            if notices.as_array().is_some_and(|n| !n.is_empty()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(notices[0]["level"], "warning");

        let response = app
            .oneshot(
                Request::get("/api/products/1/formats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["formats"], serde_json::json!([]));
        assert!(body["generated_at"].is_null());
    }

    #[tokio::test]
    async fn test_purge_removes_demos() {
        let (dir, config) = temp_workspace();
        let app = test_app(dir.path(), &config).await;

        app.clone()
            .oneshot(Request::get("/stream/1/0_1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let response = app
            .oneshot(Request::post("/api/demos/purge").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["removed"], 1);
    }
}
