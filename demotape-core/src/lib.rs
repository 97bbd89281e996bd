//! Demotape Core - audio previews, protected streaming and format bundles
//!
//! This crate provides the building blocks for selling audio: preview demo
//! generation, range-aware streaming gated on purchase state, and batch
//! conversion of product audio into downloadable format archives.

pub mod audio;
pub mod catalog;
pub mod config;
pub mod demo;
pub mod formats;
pub mod metadata;
pub mod sources;
pub mod streaming;
pub mod tracing_setup;
pub mod transcoder;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

// Re-export main types for convenient access
pub use audio::AudioFormat;
pub use catalog::{Catalog, CatalogError, InMemoryCatalog, Product, PurchaseContext, Viewer};
pub use config::DemotapeConfig;
pub use demo::{DemoCache, DemoError, DemoGenerator};
pub use formats::{FormatError, FormatProcessor, NoticeBoard, spawn_format_worker};
pub use metadata::{JsonFileMetadataStore, MetadataError, MetadataStore};
pub use sources::FetchError;
pub use streaming::{NotifyError, StreamController, StreamError, StreamRequest};
pub use transcoder::{FfmpegTranscoder, TranscodeError, Transcoder};

/// Core errors that can bubble up from any Demotape subsystem.
#[derive(Debug, thiserror::Error)]
pub enum DemotapeError {
    #[error("Transcoder error: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Demo error: {0}")]
    Demo(#[from] DemoError),

    #[error("Streaming error: {0}")]
    Stream(#[from] StreamError),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DemotapeError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            DemotapeError::Stream(e) => match e {
                StreamError::Forbidden => "Sign in to listen to this track".to_string(),
                StreamError::ProductNotFound { product_id } => {
                    format!("Product {product_id} not found")
                }
                StreamError::TrackNotFound { .. } => "Track not found".to_string(),
                StreamError::RangeNotSatisfiable { .. } => {
                    "Requested range is outside the file".to_string()
                }
                _ => "Streaming error occurred".to_string(),
            },
            DemotapeError::Format(e) => match e {
                FormatError::ProductNotFound { product_id } => {
                    format!("Product {product_id} not found")
                }
                FormatError::TranscoderNotConfigured { .. } => {
                    "Install ffmpeg to generate download formats".to_string()
                }
                _ => "Format generation error occurred".to_string(),
            },
            DemotapeError::Transcode(_) => "Transcoder error occurred".to_string(),
            DemotapeError::Demo(_) => "Demo could not be generated".to_string(),
            DemotapeError::Catalog(_) => "Product catalog unavailable".to_string(),
            DemotapeError::Metadata(_) => "Product metadata unavailable".to_string(),
            DemotapeError::Fetch(_) => "Could not download the audio source".to_string(),
            DemotapeError::Notify(_) => "Play could not be recorded".to_string(),
            DemotapeError::Configuration { reason } => format!("Configuration error: {reason}"),
            DemotapeError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DemotapeError::Configuration { .. }
                | DemotapeError::Stream(
                    StreamError::Forbidden
                        | StreamError::ProductNotFound { .. }
                        | StreamError::TrackNotFound { .. }
                        | StreamError::RangeNotSatisfiable { .. }
                )
                | DemotapeError::Format(FormatError::ProductNotFound { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, DemotapeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let forbidden = DemotapeError::from(StreamError::Forbidden);
        assert!(forbidden.is_user_error());
        assert_eq!(forbidden.user_message(), "Sign in to listen to this track");

        let io = DemotapeError::from(std::io::Error::other("disk"));
        assert!(!io.is_user_error());
        assert_eq!(io.user_message(), "File system error occurred");
    }

    #[test]
    fn test_missing_transcoder_message() {
        let error = DemotapeError::from(FormatError::TranscoderNotConfigured { product_id: 3 });
        assert!(error.user_message().contains("ffmpeg"));
        assert!(!error.is_user_error());
    }
}
