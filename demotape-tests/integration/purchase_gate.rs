//! Purchase state and registration gating

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use demotape_core::catalog::{Product, PurchaseContext, Track, TrackIndex, Viewer};
use demotape_core::config::DemoOverrides;
use demotape_core::streaming::StreamError;
use demotape_core::test_fixtures::FakeTranscoder;

use crate::fixtures::{Shop, body_bytes, header, request};

fn buyer() -> Viewer {
    Viewer {
        user: Some("buyer".to_string()),
        purchase: PurchaseContext::purchased("order-1001"),
    }
}

#[tokio::test]
async fn test_purchased_viewer_never_gets_a_demo() {
    let mut shop = Shop::new();
    shop.config.demo.percent = 10;
    let product = shop.add_product(1, &[("song.mp3", 10_000), ("b-side.wav", 4_000)]);
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));

    for track in &product.tracks {
        let response = controller
            .stream(&request(1, track.index.as_str(), buyer()), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, std::fs::read(&track.source).unwrap());
    }

    assert!(!shop.demo_path(&product).exists());
}

#[tokio::test]
async fn test_disabled_secure_demos_serve_everyone_in_full() {
    let shop = Shop::new();
    let mut product = shop.add_product(2, &[("song.mp3", 10_000)]);
    product.demo = DemoOverrides {
        secure_demos: Some(false),
        ..Default::default()
    };
    shop.catalog.upsert(product);
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));

    let response = controller
        .stream(&request(2, "0_2", Viewer::anonymous()), None)
        .await
        .unwrap();
    assert_eq!(body_bytes(response).await.len(), 10_000);
}

#[tokio::test]
async fn test_registered_only_rejects_anonymous() {
    let mut shop = Shop::new();
    shop.config.demo.registered_only = true;
    shop.add_product(3, &[("song.mp3", 1_000)]);
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));

    let error = controller
        .stream(&request(3, "0_3", Viewer::anonymous()), None)
        .await
        .unwrap_err();
    assert!(matches!(error, StreamError::Forbidden));
    assert_eq!(error.status_code(), StatusCode::FORBIDDEN);

    let member = Viewer {
        user: Some("member".to_string()),
        purchase: PurchaseContext::NotPurchased,
    };
    let response = controller
        .stream(&request(3, "0_3", member), None)
        .await
        .unwrap();
    assert_eq!(body_bytes(response).await.len(), 500);
}

#[tokio::test]
async fn test_unprotected_remote_source_redirects() {
    let shop = Shop::new();
    let url = "http://127.0.0.1:9/catalog/song.mp3";
    shop.catalog.upsert(Product {
        id: 4,
        tracks: vec![Track::new(4, TrackIndex::composite(0, 4), url)],
        demo: DemoOverrides {
            secure_demos: Some(false),
            ..Default::default()
        },
    });
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));

    let response = controller
        .stream(&request(4, "0_4", Viewer::anonymous()), None)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(header(&response, "location").as_deref(), Some(url));
}

#[tokio::test]
async fn test_purchased_remote_source_is_downloaded_privately() {
    let audio: Vec<u8> = (0..8_192u32).map(|i| (i % 241) as u8).collect();
    let served = audio.clone();
    let app = Router::new().route(
        "/song.mp3",
        get(move || {
            let body = served.clone();
            async move { body }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let shop = Shop::new();
    let url = format!("http://{address}/song.mp3");
    shop.catalog.upsert(Product {
        id: 5,
        tracks: vec![Track::new(5, TrackIndex::composite(0, 5), url.clone())],
        demo: Default::default(),
    });
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));

    let response = controller
        .stream(&request(5, "0_5", buyer()), Some("bytes=0-99"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_bytes(response).await, audio[..100]);

    let private_copy = shop.cache().purchased_path("order-1001", &url, "mp3");
    assert_eq!(std::fs::read(private_copy).unwrap(), audio);

    let response = controller
        .stream(&request(5, "0_5", Viewer::anonymous()), None)
        .await
        .unwrap();
    assert_eq!(body_bytes(response).await.len(), 4_096);
}

#[tokio::test]
async fn test_unknown_product_and_track() {
    let shop = Shop::new();
    shop.add_product(6, &[("song.mp3", 1_000)]);
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));

    let error = controller
        .stream(&request(99, "0_99", Viewer::anonymous()), None)
        .await
        .unwrap_err();
    assert_eq!(error.status_code(), StatusCode::NOT_FOUND);

    let error = controller
        .stream(&request(6, "7_6", Viewer::anonymous()), None)
        .await
        .unwrap_err();
    assert!(matches!(error, StreamError::TrackNotFound { .. }));
}
