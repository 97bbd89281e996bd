//! HTTP request handlers organized by functionality

pub mod api;
pub mod streaming;

// Re-export handler functions
pub use api::{
    ApiError, api_formats, api_health, api_notices, api_plays, api_product_saved, api_purge_demos,
};
pub use streaming::{PURCHASE_HEADER, USER_HEADER, stream_track, viewer_from_headers};
