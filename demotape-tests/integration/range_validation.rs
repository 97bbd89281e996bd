//! Range handling against real files
//!
//! Every satisfiable range returns exactly the requested slice; ranges that
//! start past the end return 416 with the entity size, never a short 200.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use demotape_core::catalog::Viewer;
use demotape_core::streaming::StreamError;
use demotape_core::test_fixtures::FakeTranscoder;
use proptest::prelude::*;
use proptest::test_runner::{TestCaseError, TestRunner};

use crate::fixtures::{Shop, body_bytes, header, request};

const FILE_SIZE: u64 = 4_096;

fn open_shop() -> (Shop, Vec<u8>) {
    let mut shop = Shop::new();
    shop.config.demo.secure_demos = false;
    let product = shop.add_product(5, &[("track.mp3", FILE_SIZE as usize)]);
    let full = std::fs::read(&product.tracks[0].source).unwrap();
    (shop, full)
}

#[test]
fn test_ranges_return_exact_slices() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (shop, full) = open_shop();
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));
    let req = request(5, "0_5", Viewer::anonymous());

    let mut runner = TestRunner::new(ProptestConfig::with_cases(64));
    runner
        .run(&(0..FILE_SIZE, 0..FILE_SIZE), |(a, b)| {
            let (start, end) = (a.min(b), a.max(b));
            let range = format!("bytes={start}-{end}");

            let (status, content_range, body) = runtime.block_on(async {
                let response = controller.stream(&req, Some(&range)).await.unwrap();
                let status = response.status();
                let content_range = header(&response, "content-range");
                (status, content_range, body_bytes(response).await)
            });

            prop_assert_eq!(status, StatusCode::PARTIAL_CONTENT);
            prop_assert_eq!(
                content_range,
                Some(format!("bytes {start}-{end}/{FILE_SIZE}"))
            );
            prop_assert_eq!(&body[..], &full[start as usize..=end as usize]);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_out_of_bounds_ranges_are_416() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (shop, _full) = open_shop();
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));
    let req = request(5, "0_5", Viewer::anonymous());

    let mut runner = TestRunner::new(ProptestConfig::with_cases(32));
    runner
        .run(&(FILE_SIZE..FILE_SIZE * 4), |start| {
            let range = format!("bytes={start}-");
            let result = runtime.block_on(controller.stream(&req, Some(&range)));

            let error = match result {
                Err(e) => e,
                Ok(response) => {
                    return Err(TestCaseError::fail(format!(
                        "expected 416, got {}",
                        response.status()
                    )));
                }
            };
            prop_assert!(matches!(
                error,
                StreamError::RangeNotSatisfiable { total: FILE_SIZE }
            ), "assertion failed: error matches StreamError::RangeNotSatisfiable {{ total: FILE_SIZE }}");

            let response = error.into_response();
            prop_assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
            prop_assert_eq!(
                header(&response, "content-range"),
                Some(format!("bytes */{FILE_SIZE}"))
            );
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn test_suffix_and_open_ranges() {
    let (shop, full) = open_shop();
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));
    let req = request(5, "0_5", Viewer::anonymous());

    let response = controller.stream(&req, Some("bytes=-100")).await.unwrap();
    assert_eq!(
        header(&response, "content-range").as_deref(),
        Some("bytes 3996-4095/4096")
    );
    assert_eq!(body_bytes(response).await, full[3996..]);

    let response = controller.stream(&req, Some("bytes=4000-")).await.unwrap();
    assert_eq!(header(&response, "content-length").as_deref(), Some("96"));

    let response = controller
        .stream(&req, Some("bytes=100-999999"))
        .await
        .unwrap();
    assert_eq!(
        header(&response, "content-range").as_deref(),
        Some("bytes 100-4095/4096")
    );
}

#[tokio::test]
async fn test_malformed_range_serves_full_file() {
    let (shop, full) = open_shop();
    let controller = shop.controller(Arc::new(FakeTranscoder::unavailable()));
    let req = request(5, "0_5", Viewer::anonymous());

    for range in ["bytes=abc", "items=0-10", "bytes=0-1,5-6", "bytes=9-3"] {
        let response = controller.stream(&req, Some(range)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "range {range}");
        assert_eq!(header(&response, "accept-ranges").as_deref(), Some("bytes"));
        assert_eq!(body_bytes(response).await, full);
    }
}
