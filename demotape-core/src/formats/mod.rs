//! Batch conversion of product audio into downloadable format bundles.

pub mod bundle;
pub mod identity;
pub mod notices;
pub mod processor;
pub mod worker;

use std::path::PathBuf;

pub use bundle::{ArchiveError, find_cover, write_zip};
pub use identity::content_identity;
pub use notices::{Notice, NoticeBoard, NoticeLevel};
pub use processor::{FormatProcessor, ProcessReport, RunSummary, SkipReason};
pub use worker::{EnqueueOutcome, FormatJob, FormatWorkerHandle, spawn_format_worker};

use crate::audio::AudioFormat;
use crate::catalog::{CatalogError, ProductId};
use crate::metadata::MetadataError;
use crate::sources::FetchError;

/// Errors from format runs.
///
/// `ConversionFailed`, `ArchiveFailed` and `SourceUnavailable` are recorded
/// in a run summary; the others end the run.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("Product {product_id} not found")]
    ProductNotFound { product_id: ProductId },

    #[error("No transcoder configured; formats for product {product_id} were not generated")]
    TranscoderNotConfigured { product_id: ProductId },

    #[error("Converting {track} to {format} failed: {reason}")]
    ConversionFailed {
        track: String,
        format: AudioFormat,
        reason: String,
    },

    #[error("Writing {format}.zip failed: {reason}")]
    ArchiveFailed { format: AudioFormat, reason: String },

    #[error("Source for {track} unavailable: {reason}")]
    SourceUnavailable { track: String, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("Format worker is shut down")]
    WorkerShutdown,

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}
