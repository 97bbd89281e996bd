//! Demo generation through the streaming controller

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use demotape_core::catalog::{Product, Track, TrackIndex, Viewer};
use demotape_core::config::{DemoOverrides, DemoSettings};
use demotape_core::demo::{DemoCache, DemoGenerator};
use demotape_core::test_fixtures::{FakeTranscoder, write_source_file};
use proptest::prelude::*;
use proptest::test_runner::TestRunner;

use crate::fixtures::{Shop, body_bytes, header, request};

#[tokio::test]
async fn test_product_42_demo_then_range() {
    let mut shop = Shop::new();
    shop.config.demo.percent = 20;
    let product = shop.add_product(42, &[("master.mp3", 1_000_000)]);
    let source = &product.tracks[0].source;
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));
    let req = request(42, "0_42", Viewer::anonymous());

    let response = controller.stream(&req, None).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.len(), 200_000);

    let demo = shop.demo_path(&product);
    assert_eq!(std::fs::metadata(&demo).unwrap().len(), 200_000);

    let response = controller
        .stream(&req, Some("bytes=100000-149999"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header(&response, "content-range").as_deref(),
        Some("bytes 100000-149999/200000")
    );
    let body = body_bytes(response).await;
    assert_eq!(body.len(), 50_000);
    assert_eq!(body, std::fs::read(source).unwrap()[100_000..150_000]);
}

#[test]
fn test_truncated_demo_size_is_monotonic_in_percent() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let source = write_source_file(dir.path(), "song.flac", 50_000);
    let generator = DemoGenerator::new(Arc::new(FakeTranscoder::unavailable()));

    let size_at = |percent: u8| {
        let dest = dir.path().join(format!("demo-{percent}.flac"));
        runtime
            .block_on(generator.make_demo(&source, &dest, percent, None))
            .unwrap()
            .size
    };

    assert_eq!(size_at(0), 0);
    assert_eq!(size_at(100), 50_000);

    let mut runner = TestRunner::default();
    runner
        .run(&(0u8..=100, 0u8..=100), |(a, b)| {
            let (low, high) = (a.min(b), a.max(b));
            prop_assert!(size_at(low) <= size_at(high));
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn test_transcoded_demo_size_is_monotonic_in_percent() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source_file(dir.path(), "song.mp3", 10_000);
    let generator =
        DemoGenerator::new(Arc::new(FakeTranscoder::with_duration(Duration::from_secs(240))));

    let mut previous = 0;
    for percent in [0u8, 10, 25, 50, 75, 100] {
        let dest = dir.path().join(format!("demo-{percent}.mp3"));
        let outcome = generator.make_demo(&source, &dest, percent, None).await.unwrap();
        assert!(outcome.size >= previous, "percent {percent}");
        previous = outcome.size;
    }
}

#[tokio::test]
async fn test_demo_is_rendered_once_and_reused() {
    let shop = Shop::new();
    shop.add_product(3, &[("song.mp3", 20_000)]);
    let transcoder = Arc::new(FakeTranscoder::with_duration(Duration::from_secs(100)));
    let controller = Arc::new(shop.controller(transcoder.clone()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let controller = controller.clone();
        tasks.push(tokio::spawn(async move {
            let req = request(3, "0_3", Viewer::anonymous());
            let response = controller.stream(&req, None).await.unwrap();
            body_bytes(response).await
        }));
    }

    let mut bodies = Vec::new();
    for task in tasks {
        bodies.push(task.await.unwrap());
    }

    assert_eq!(transcoder.rendered_lengths(), vec![Duration::from_secs(50)]);
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(bodies[0].starts_with(b"ID3"));

    let req = request(3, "0_3", Viewer::anonymous());
    controller.stream(&req, None).await.unwrap();
    assert_eq!(transcoder.rendered_lengths().len(), 1);
}

#[tokio::test]
async fn test_product_override_changes_percent() {
    let shop = Shop::new();
    let mut product = shop.add_product(8, &[("song.mp3", 10_000)]);
    product.demo = DemoOverrides {
        percent: Some(10),
        ..Default::default()
    };
    shop.catalog.upsert(product);
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));

    let response = controller
        .stream(&request(8, "0_8", Viewer::anonymous()), None)
        .await
        .unwrap();
    assert_eq!(body_bytes(response).await.len(), 1_000);
}

#[tokio::test]
async fn test_changed_override_is_not_served_a_stale_demo() {
    let shop = Shop::new();
    let mut product = shop.add_product(12, &[("song.mp3", 10_000)]);
    product.demo.percent = Some(20);
    shop.catalog.upsert(product.clone());
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));
    let req = request(12, "0_12", Viewer::anonymous());

    let response = controller.stream(&req, None).await.unwrap();
    assert_eq!(body_bytes(response).await.len(), 2_000);
    let first_demo = shop.demo_path(&product);

    product.demo.percent = Some(80);
    shop.catalog.upsert(product.clone());
    let response = controller.stream(&req, None).await.unwrap();
    assert_eq!(header(&response, "content-length").as_deref(), Some("8000"));
    assert_eq!(body_bytes(response).await.len(), 8_000);
    assert_ne!(shop.demo_path(&product), first_demo);
    assert_eq!(std::fs::metadata(shop.demo_path(&product)).unwrap().len(), 8_000);
}

#[tokio::test]
async fn test_products_sharing_a_source_keep_their_own_percent() {
    let shop = Shop::new();
    let mut single = shop.add_product(13, &[("shared.mp3", 10_000)]);
    single.demo.percent = Some(10);
    shop.catalog.upsert(single.clone());

    let mut compilation = Product {
        id: 14,
        tracks: vec![Track::new(
            14,
            TrackIndex::composite(0, 14),
            single.tracks[0].source.clone(),
        )],
        demo: DemoOverrides::default(),
    };
    compilation.demo.percent = Some(60);
    shop.catalog.upsert(compilation);

    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));
    for (product_id, track, expected) in [
        (13, "0_13", 1_000),
        (14, "0_14", 6_000),
        (13, "0_13", 1_000),
    ] {
        let response = controller
            .stream(&request(product_id, track, Viewer::anonymous()), None)
            .await
            .unwrap();
        assert_eq!(body_bytes(response).await.len(), expected, "product {product_id}");
    }
}

#[tokio::test]
async fn test_stream_time_truncation_without_persisted_demos() {
    let mut shop = Shop::new();
    shop.config.demo.persist_demos = false;
    shop.config.demo.percent = 30;
    shop.add_product(9, &[("song.mp3", 10_000)]);
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));
    let req = request(9, "0_9", Viewer::anonymous());

    let response = controller.stream(&req, None).await.unwrap();
    assert_eq!(header(&response, "content-length").as_deref(), Some("3000"));
    assert_eq!(body_bytes(response).await.len(), 3_000);

    let error = controller
        .stream(&req, Some("bytes=3000-"))
        .await
        .unwrap_err();
    assert_eq!(error.status_code(), StatusCode::RANGE_NOT_SATISFIABLE);

    let demo_files = std::fs::read_dir(&shop.config.demo.cache_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(demo_files, 0);
}

#[tokio::test]
async fn test_settings_change_purges_demos() {
    let mut shop = Shop::new();
    let product = shop.add_product(4, &[("song.mp3", 10_000)]);
    let settings = DemoSettings::resolve(&shop.config.demo, &DemoOverrides::default());
    DemoCache::open(&shop.config.demo.cache_dir, &DemoCache::fingerprint(&settings))
        .await
        .unwrap();

    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));
    controller
        .stream(&request(4, "0_4", Viewer::anonymous()), None)
        .await
        .unwrap();
    let demo = shop.demo_path(&product);
    assert!(demo.exists());

    shop.config.demo.percent = 80;
    let settings = DemoSettings::resolve(&shop.config.demo, &DemoOverrides::default());
    DemoCache::open(&shop.config.demo.cache_dir, &DemoCache::fingerprint(&settings))
        .await
        .unwrap();
    assert!(!demo.exists());
}
