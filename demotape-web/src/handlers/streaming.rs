//! Track streaming endpoint.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::http::header::RANGE;
use axum::response::{IntoResponse, Response};
use demotape_core::catalog::{ProductId, PurchaseContext, TrackIndex, Viewer};
use demotape_core::streaming::{StreamError, StreamRequest};

use crate::server::AppState;

/// Authenticated shop user; any non-empty value counts.
pub const USER_HEADER: &str = "x-demotape-user";
/// Opaque purchase token; presence means the viewer bought the product.
pub const PURCHASE_HEADER: &str = "x-demotape-purchase";

/// Reads viewer identity supplied by the upstream shop.
pub fn viewer_from_headers(headers: &HeaderMap) -> Viewer {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    Viewer {
        user: value(USER_HEADER),
        purchase: value(PURCHASE_HEADER)
            .map(PurchaseContext::purchased)
            .unwrap_or_default(),
    }
}

/// `GET /stream/{product_id}/{track}`
pub async fn stream_track(
    State(state): State<AppState>,
    Path((product_id, track)): Path<(ProductId, String)>,
    headers: HeaderMap,
) -> Response {
    let request = StreamRequest {
        product_id,
        track: TrackIndex::new(track),
        viewer: viewer_from_headers(&headers),
    };
    let range = headers.get(RANGE).and_then(|v| v.to_str().ok());

    match state.controller.stream(&request, range).await {
        Ok(response) => response,
        Err(e) => {
            log_stream_error(&request, &e);
            e.into_response()
        }
    }
}

fn log_stream_error(request: &StreamRequest, error: &StreamError) {
    if error.status_code().is_server_error() {
        tracing::error!(
            "Streaming product {} track {} failed: {}",
            request.product_id,
            request.track,
            error
        );
    } else {
        tracing::debug!(
            "Streaming product {} track {} refused: {}",
            request.product_id,
            request.track,
            error
        );
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_viewer_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(viewer_from_headers(&headers), Viewer::anonymous());

        headers.insert(USER_HEADER, HeaderValue::from_static("alice"));
        headers.insert(PURCHASE_HEADER, HeaderValue::from_static("order-17"));
        let viewer = viewer_from_headers(&headers);
        assert!(viewer.is_authenticated());
        assert_eq!(viewer.purchase, PurchaseContext::purchased("order-17"));
    }

    #[test]
    fn test_blank_headers_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_static("  "));
        headers.insert(PURCHASE_HEADER, HeaderValue::from_static(""));
        let viewer = viewer_from_headers(&headers);
        assert!(!viewer.is_authenticated());
        assert!(!viewer.purchase.is_purchased());
    }
}
