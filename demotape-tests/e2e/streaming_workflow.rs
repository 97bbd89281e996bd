//! End-to-end streaming and batch workflows through the router

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use demotape_core::catalog::{InMemoryCatalog, Product, ProductId, Track, TrackIndex};
use demotape_core::config::DemotapeConfig;
use demotape_core::metadata::InMemoryMetadataStore;
use demotape_core::test_fixtures::{FakeTranscoder, temp_workspace, write_source_file};
use demotape_core::transcoder::Transcoder;
use demotape_web::{AppState, build_router};
use tempfile::TempDir;
use tower::ServiceExt;

struct Server {
    dir: TempDir,
    config: DemotapeConfig,
    catalog: InMemoryCatalog,
    router: Router,
}

impl Server {
    async fn start(configure: impl FnOnce(&mut DemotapeConfig), transcoder: Arc<dyn Transcoder>) -> Self {
        let (dir, mut config) = temp_workspace();
        configure(&mut config);
        let catalog = InMemoryCatalog::new();

        let state = AppState::new(
            &config,
            Arc::new(catalog.clone()),
            Arc::new(InMemoryMetadataStore::new()),
            transcoder,
        )
        .await
        .unwrap();

        Self {
            dir,
            config,
            catalog,
            router: build_router(state),
        }
    }

    fn add_product(&self, product_id: ProductId, name: &str, size: usize) -> Track {
        let music = self.dir.path().join("music").join(product_id.to_string());
        let path = write_source_file(&music, name, size);
        let track = Track::new(
            product_id,
            TrackIndex::composite(0, product_id),
            path.to_string_lossy(),
        );
        self.catalog.upsert(Product {
            id: product_id,
            tracks: vec![track.clone()],
            demo: Default::default(),
        });
        track
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str, headers: &[(&str, &str)]) -> Response {
        let mut builder = Request::get(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn json(&self, uri: &str) -> serde_json::Value {
        let response = self.get(uri, &[]).await;
        assert_eq!(response.status(), StatusCode::OK, "GET {uri}");
        serde_json::from_slice(&bytes(response).await).unwrap()
    }
}

async fn bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[tokio::test]
async fn test_product_42_anonymous_demo_and_range() {
    let server = Server::start(
        |config| config.demo.percent = 20,
        Arc::new(FakeTranscoder::unavailable()),
    )
    .await;
    let track = server.add_product(42, "single.mp3", 1_000_000);
    let source = std::fs::read(&track.source).unwrap();

    let response = server.get("/stream/42/0_42", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-length").as_deref(), Some("200000"));
    assert_eq!(header(&response, "content-type").as_deref(), Some("audio/mpeg"));
    assert_eq!(bytes(response).await, source[..200_000]);

    let response = server
        .get("/stream/42/0_42", &[("range", "bytes=100000-149999")])
        .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header(&response, "content-range").as_deref(),
        Some("bytes 100000-149999/200000")
    );
    let body = bytes(response).await;
    assert_eq!(body.len(), 50_000);
    assert_eq!(body, source[100_000..150_000]);

    let response = server
        .get("/stream/42/0_42", &[("range", "bytes=200000-")])
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        header(&response, "content-range").as_deref(),
        Some("bytes */200000")
    );
}

#[tokio::test]
async fn test_purchase_header_unlocks_full_track() {
    let server = Server::start(|_| {}, Arc::new(FakeTranscoder::unavailable())).await;
    let track = server.add_product(8, "song.mp3", 30_000);

    let response = server
        .get(
            "/stream/8/0_8",
            &[("x-demotape-user", "fan"), ("x-demotape-purchase", "receipt-88")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(bytes(response).await, std::fs::read(&track.source).unwrap());

    let response = server.get("/stream/8/0_8", &[]).await;
    assert_eq!(bytes(response).await.len(), 15_000);
}

#[tokio::test]
async fn test_registered_only_needs_user_header() {
    let server = Server::start(
        |config| config.demo.registered_only = true,
        Arc::new(FakeTranscoder::unavailable()),
    )
    .await;
    server.add_product(9, "song.mp3", 2_000);

    let response = server.get("/stream/9/0_9", &[]).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = server
        .get("/stream/9/0_9", &[("x-demotape-user", "member")])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_plays_are_counted() {
    let server = Server::start(|_| {}, Arc::new(FakeTranscoder::unavailable())).await;
    server.add_product(5, "song.mp3", 2_000);

    for _ in 0..3 {
        let response = server.get("/stream/5/0_5", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let mut plays = serde_json::Value::Null;
    for _ in 0..50 {
        plays = server.json("/api/plays").await;
        if plays["plays"]["5"] == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(plays["plays"]["5"], 3);
}

#[tokio::test]
async fn test_save_generates_formats_in_background() {
    let server = Server::start(
        |_| {},
        Arc::new(FakeTranscoder::with_duration(Duration::from_secs(60))),
    )
    .await;
    server.add_product(7, "Track One.wav", 16_000);
    let music = server.dir.path().join("music").join("7");
    std::fs::write(music.join("cover.png"), b"\x89PNG\r\n\x1a\n").unwrap();

    let response = server
        .send(
            Request::post("/api/products/7/saved")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // The run posts its notice once everything is persisted.
    let mut notices = serde_json::Value::Null;
    for _ in 0..100 {
        notices = server.json("/api/products/7/notices").await;
        if notices.as_array().is_some_and(|n| !n.is_empty()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(notices[0]["level"], "info");

    let formats = server.json("/api/products/7/formats").await;
    assert!(!formats["generated_at"].is_null());
    assert_eq!(
        formats["formats"],
        serde_json::json!(["mp3", "wav", "flac", "ogg"])
    );

    let zips = server.config.formats.output_dir.join("7").join("zips");
    for name in ["mp3.zip", "wav.zip", "flac.zip", "ogg.zip"] {
        assert!(std::fs::metadata(zips.join(name)).unwrap().len() > 0);
    }
    assert!(
        server
            .config
            .formats
            .output_dir
            .join("7")
            .join("flac")
            .join("cover.png")
            .exists()
    );

}

#[tokio::test]
async fn test_purge_endpoint_forces_regeneration() {
    let transcoder = Arc::new(FakeTranscoder::with_duration(Duration::from_secs(40)));
    let server = Server::start(|_| {}, transcoder.clone()).await;
    server.add_product(3, "song.mp3", 5_000);

    server.get("/stream/3/0_3", &[]).await;
    assert_eq!(transcoder.rendered_lengths().len(), 1);

    let response = server
        .send(Request::post("/api/demos/purge").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    server.get("/stream/3/0_3", &[]).await;
    assert_eq!(transcoder.rendered_lengths().len(), 2);
}
