//! Per-product conversion into every target format plus one archive each.
//!
//! A run either skips entirely (unchanged content identity) or rebuilds the
//! product directory from scratch. Individual conversion and archive failures
//! are recorded and never abort the run.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use super::bundle::{find_cover, write_zip};
use super::identity::content_identity;
use super::FormatError;
use crate::audio::AudioFormat;
use crate::catalog::{Catalog, ProductId, Track};
use crate::config::DemotapeConfig;
use crate::metadata::{AUDIO_FILES_HASH, AVAILABLE_FORMATS, FORMATS_GENERATED_AT, MetadataStore};
use crate::sources::{SourceFetcher, SourceLocation, source_key};
use crate::transcoder::Transcoder;

/// Why a run did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Product has no downloadable audio.
    NoAudio,
    /// Content identity matches the last completed run.
    Unchanged,
}

/// Result of one completed run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub product_id: ProductId,
    pub content_hash: String,
    /// Produced files per format, cover excluded
    pub produced: BTreeMap<AudioFormat, Vec<PathBuf>>,
    /// Formats with an archive, in target order
    pub archives: Vec<AudioFormat>,
    pub cover: Option<PathBuf>,
    /// Non-fatal failures (`ConversionFailed`, `ArchiveFailed`, `SourceUnavailable`)
    pub failures: Vec<FormatError>,
}

/// What `process_product` did.
#[derive(Debug)]
pub enum ProcessReport {
    Skipped(SkipReason),
    Completed(RunSummary),
}

/// Converts product audio into every target format.
pub struct FormatProcessor {
    output_dir: PathBuf,
    source_cache: PathBuf,
    targets: Vec<AudioFormat>,
    catalog: Arc<dyn Catalog>,
    metadata: Arc<dyn MetadataStore>,
    transcoder: Arc<dyn Transcoder>,
    fetcher: SourceFetcher,
}

impl FormatProcessor {
    /// # Errors
    ///
    /// - `FormatError::Fetch` - HTTP client for remote sources could not be built
    pub fn new(
        config: &DemotapeConfig,
        catalog: Arc<dyn Catalog>,
        metadata: Arc<dyn MetadataStore>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Self, FormatError> {
        Ok(Self {
            output_dir: config.formats.output_dir.clone(),
            source_cache: config.demo.cache_dir.join("sources"),
            targets: config.formats.targets.clone(),
            catalog,
            metadata,
            transcoder,
            fetcher: SourceFetcher::new(&config.network)?,
        })
    }

    /// Directory holding all bundles of one product.
    pub fn product_dir(&self, product_id: ProductId) -> PathBuf {
        self.output_dir.join(product_id.to_string())
    }

    /// Path of the archive for one format.
    pub fn archive_path(&self, product_id: ProductId, format: AudioFormat) -> PathBuf {
        self.product_dir(product_id)
            .join("zips")
            .join(format!("{}.zip", format.extension()))
    }

    /// Brings the product's format bundles up to date.
    ///
    /// Safe to call redundantly: an unchanged product is skipped after two
    /// metadata reads.
    ///
    /// # Errors
    ///
    /// - `FormatError::ProductNotFound` - Unknown product id
    /// - `FormatError::TranscoderNotConfigured` - No transcoder; nothing was touched
    /// - `FormatError::Io` - Product directory could not be reset
    /// - `FormatError::Catalog` / `FormatError::Metadata` - Collaborator failures
    pub async fn process_product(&self, product_id: ProductId) -> Result<ProcessReport, FormatError> {
        let product = self
            .catalog
            .product(product_id)
            .await?
            .ok_or(FormatError::ProductNotFound { product_id })?;

        let tracks: Vec<Track> = product.audio_tracks().cloned().collect();
        if tracks.is_empty() {
            tracing::debug!("Product {} has no audio, skipping formats", product_id);
            return Ok(ProcessReport::Skipped(SkipReason::NoAudio));
        }

        let content_hash = content_identity(&tracks);
        let stored_hash = self.metadata.get(product_id, AUDIO_FILES_HASH).await?;
        let generated_at = self.metadata.get(product_id, FORMATS_GENERATED_AT).await?;
        if stored_hash.as_deref() == Some(content_hash.as_str()) && generated_at.is_some() {
            tracing::debug!("Product {} audio unchanged, skipping formats", product_id);
            return Ok(ProcessReport::Skipped(SkipReason::Unchanged));
        }

        if !self.transcoder.is_available() {
            return Err(FormatError::TranscoderNotConfigured { product_id });
        }

        tracing::info!(
            "Generating {} formats for product {} ({} tracks)",
            self.targets.len(),
            product_id,
            tracks.len()
        );

        let product_dir = self.product_dir(product_id);
        self.reset_product_dir(&product_dir).await?;

        let mut summary = RunSummary {
            product_id,
            content_hash,
            ..Default::default()
        };

        let mut first_local_dir: Option<PathBuf> = None;
        let mut used_names = HashSet::new();

        for track in &tracks {
            let source = match self.local_source(track).await {
                Ok(source) => source,
                Err(e) => {
                    tracing::warn!("Skipping track {}: {}", track.display_name, e);
                    summary.failures.push(e);
                    continue;
                }
            };

            if first_local_dir.is_none() && !SourceLocation::parse(&track.source).is_remote() {
                first_local_dir = source.parent().map(Path::to_path_buf);
            }

            let stem = unique_stem(&mut used_names, track);
            for &format in &self.targets {
                let output = product_dir
                    .join(format.extension())
                    .join(format!("{stem}.{}", format.extension()));

                match self.produce(track, &source, &output, format).await {
                    Ok(()) => summary.produced.entry(format).or_default().push(output),
                    Err(e) => {
                        tracing::warn!("{}", e);
                        let _ = tokio::fs::remove_file(&output).await;
                        summary.failures.push(e);
                    }
                }
            }
        }

        summary.cover = self.copy_cover(first_local_dir.as_deref(), &product_dir).await;

        for &format in &self.targets {
            let Some(files) = summary.produced.get(&format) else {
                continue;
            };

            let mut entries = files.clone();
            if let Some(name) = summary.cover.as_deref().and_then(Path::file_name) {
                entries.push(product_dir.join(format.extension()).join(name));
            }

            match write_zip(entries, self.archive_path(product_id, format)).await {
                Ok(size) => {
                    tracing::debug!("Wrote {}.zip for product {} ({} bytes)", format, product_id, size);
                    summary.archives.push(format);
                }
                Err(e) => {
                    let failure = FormatError::ArchiveFailed {
                        format,
                        reason: e.to_string(),
                    };
                    tracing::warn!("{}", failure);
                    summary.failures.push(failure);
                }
            }
        }

        self.persist(&summary).await?;

        tracing::info!(
            "Product {} formats ready: {:?} ({} failures)",
            product_id,
            summary.archives,
            summary.failures.len()
        );

        Ok(ProcessReport::Completed(summary))
    }

    async fn reset_product_dir(&self, product_dir: &Path) -> Result<(), FormatError> {
        let io_error = |source| FormatError::Io {
            path: product_dir.to_path_buf(),
            source,
        };

        match tokio::fs::remove_dir_all(product_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(e)),
        }

        for format in &self.targets {
            tokio::fs::create_dir_all(product_dir.join(format.extension()))
                .await
                .map_err(io_error)?;
        }
        tokio::fs::create_dir_all(product_dir.join("zips"))
            .await
            .map_err(io_error)
    }

    async fn local_source(&self, track: &Track) -> Result<PathBuf, FormatError> {
        let unavailable = |reason: String| FormatError::SourceUnavailable {
            track: track.display_name.clone(),
            reason,
        };

        match SourceLocation::parse(&track.source) {
            SourceLocation::Local(path) => match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(path),
                Ok(_) => Err(unavailable(format!("{} is not a file", path.display()))),
                Err(e) => Err(unavailable(format!("{}: {e}", path.display()))),
            },
            SourceLocation::Remote(url) => {
                let dest = self
                    .source_cache
                    .join(format!("{}.{}", source_key(&track.source), track.extension));
                self.fetcher
                    .fetch_to(&url, &dest)
                    .await
                    .map_err(|e| unavailable(e.to_string()))?;
                Ok(dest)
            }
        }
    }

    async fn produce(
        &self,
        track: &Track,
        source: &Path,
        output: &Path,
        format: AudioFormat,
    ) -> Result<(), FormatError> {
        let failed = |reason: String| FormatError::ConversionFailed {
            track: track.display_name.clone(),
            format,
            reason,
        };

        if AudioFormat::from_extension(&track.extension) == Some(format) {
            tokio::fs::copy(source, output)
                .await
                .map_err(|e| failed(e.to_string()))?;
            return Ok(());
        }

        self.transcoder
            .convert(source, output, format)
            .await
            .map_err(|e| failed(e.to_string()))
    }

    async fn copy_cover(&self, source_dir: Option<&Path>, product_dir: &Path) -> Option<PathBuf> {
        let source_dir = source_dir?;
        let cover = match find_cover(source_dir).await {
            Ok(Some(cover)) => cover,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Could not search {} for a cover: {}", source_dir.display(), e);
                return None;
            }
        };
        let name = cover.file_name()?;

        for format in &self.targets {
            let dest = product_dir.join(format.extension()).join(name);
            if let Err(e) = tokio::fs::copy(&cover, &dest).await {
                tracing::warn!("Could not copy cover into {}: {}", dest.display(), e);
                return None;
            }
        }

        Some(cover)
    }

    async fn persist(&self, summary: &RunSummary) -> Result<(), FormatError> {
        let names: Vec<&str> = summary.archives.iter().map(|f| f.extension()).collect();
        let available = serde_json::to_string(&names).map_err(|e| FormatError::Encoding {
            reason: e.to_string(),
        })?;

        // The timestamp goes last; together with the hash it marks a completed run.
        self.metadata
            .set(summary.product_id, AVAILABLE_FORMATS, available)
            .await?;
        self.metadata
            .set(summary.product_id, AUDIO_FILES_HASH, summary.content_hash.clone())
            .await?;
        self.metadata
            .set(summary.product_id, FORMATS_GENERATED_AT, Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }
}

/// File stem for a track, unique within one run.
fn unique_stem(used: &mut HashSet<String>, track: &Track) -> String {
    let cleaned: String = track
        .display_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    let base = if cleaned.is_empty() {
        format!("track-{}", track.index)
    } else {
        cleaned
    };

    let mut candidate = base.clone();
    let mut counter = 2;
    while !used.insert(candidate.to_lowercase()) {
        candidate = format!("{base} ({counter})");
        counter += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::catalog::{InMemoryCatalog, Product, TrackIndex};
    use crate::metadata::InMemoryMetadataStore;
    use crate::test_fixtures::{FakeTranscoder, write_source_file};

    struct Setup {
        dir: TempDir,
        catalog: InMemoryCatalog,
        metadata: Arc<InMemoryMetadataStore>,
        transcoder: Arc<FakeTranscoder>,
        processor: FormatProcessor,
    }

    fn setup(transcoder: FakeTranscoder) -> Setup {
        let dir = tempdir().unwrap();
        let config = DemotapeConfig::for_testing(dir.path());
        let catalog = InMemoryCatalog::new();
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let transcoder = Arc::new(transcoder);
        let processor = FormatProcessor::new(
            &config,
            Arc::new(catalog.clone()),
            metadata.clone(),
            transcoder.clone(),
        )
        .unwrap();

        Setup {
            dir,
            catalog,
            metadata,
            transcoder,
            processor,
        }
    }

    fn product_with(setup: &Setup, id: ProductId, files: &[&str]) -> Product {
        let music = setup.dir.path().join("music");
        let tracks = files
            .iter()
            .enumerate()
            .map(|(offset, name)| {
                let path = write_source_file(&music, name, 4_096);
                Track::new(id, TrackIndex::composite(offset, id), path.to_string_lossy())
            })
            .collect();
        let product = Product {
            id,
            tracks,
            demo: Default::default(),
        };
        setup.catalog.upsert(product.clone());
        product
    }

    #[test]
    fn test_unique_stems() {
        let mut used = HashSet::new();
        let track = Track::new(1, TrackIndex::new("0_1"), "/a.wav").with_display_name("A/B: Live");
        assert_eq!(unique_stem(&mut used, &track), "A_B_ Live");
        assert_eq!(unique_stem(&mut used, &track), "A_B_ Live (2)");

        let blank = Track::new(1, TrackIndex::new("3_1"), "/a.wav").with_display_name(" .. ");
        assert_eq!(unique_stem(&mut used, &blank), "track-3_1");
    }

    #[tokio::test]
    async fn test_no_audio_is_skipped() {
        let s = setup(FakeTranscoder::with_duration(std::time::Duration::from_secs(1)));
        product_with(&s, 3, &["booklet.pdf"]);

        let report = s.processor.process_product(3).await.unwrap();
        assert!(matches!(report, ProcessReport::Skipped(SkipReason::NoAudio)));
        assert_eq!(s.metadata.write_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_product_errors() {
        let s = setup(FakeTranscoder::unavailable());
        assert!(matches!(
            s.processor.process_product(404).await,
            Err(FormatError::ProductNotFound { product_id: 404 })
        ));
    }

    #[tokio::test]
    async fn test_missing_transcoder_touches_nothing() {
        let s = setup(FakeTranscoder::unavailable());
        product_with(&s, 5, &["a.wav"]);
        let marker = s.processor.product_dir(5).join("mp3").join("old.mp3");
        std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
        std::fs::write(&marker, b"old").unwrap();

        let result = s.processor.process_product(5).await;
        assert!(matches!(
            result,
            Err(FormatError::TranscoderNotConfigured { product_id: 5 })
        ));
        assert!(marker.exists());
        assert_eq!(s.metadata.write_count(), 0);
    }

    #[tokio::test]
    async fn test_native_format_is_copied_verbatim() {
        let s = setup(FakeTranscoder::with_duration(std::time::Duration::from_secs(1)));
        let product = product_with(&s, 8, &["a.wav"]);

        let report = s.processor.process_product(8).await.unwrap();
        let ProcessReport::Completed(summary) = report else {
            panic!("expected a completed run");
        };

        let wav = &summary.produced[&AudioFormat::Wav][0];
        assert_eq!(
            std::fs::read(wav).unwrap(),
            std::fs::read(&product.tracks[0].source).unwrap()
        );
        // Three conversions: mp3, flac, ogg.
        assert_eq!(s.transcoder.conversions().len(), 3);
    }

    #[tokio::test]
    async fn test_conversion_failure_is_isolated() {
        let s = setup(
            FakeTranscoder::with_duration(std::time::Duration::from_secs(1))
                .failing_format(AudioFormat::Flac),
        );
        product_with(&s, 9, &["a.wav", "b.wav"]);

        let ProcessReport::Completed(summary) = s.processor.process_product(9).await.unwrap() else {
            panic!("expected a completed run");
        };

        assert_eq!(summary.failures.len(), 2);
        assert!(summary
            .failures
            .iter()
            .all(|f| matches!(f, FormatError::ConversionFailed { format: AudioFormat::Flac, .. })));
        assert_eq!(
            summary.archives,
            vec![AudioFormat::Mp3, AudioFormat::Wav, AudioFormat::Ogg]
        );
        assert!(!s.processor.archive_path(9, AudioFormat::Flac).exists());
        assert_eq!(
            s.metadata.get(9, AVAILABLE_FORMATS).await.unwrap().as_deref(),
            Some(r#"["mp3","wav","ogg"]"#)
        );
    }

    #[tokio::test]
    async fn test_rerun_rebuilds_wholesale() {
        let s = setup(FakeTranscoder::with_duration(std::time::Duration::from_secs(1)));
        let mut product = product_with(&s, 11, &["a.wav"]);
        s.processor.process_product(11).await.unwrap();

        let stray = s.processor.product_dir(11).join("mp3").join("stray.mp3");
        std::fs::write(&stray, b"stray").unwrap();

        product.tracks[0].display_name = "Renamed".to_string();
        s.catalog.upsert(product);
        s.processor.process_product(11).await.unwrap();

        assert!(!stray.exists());
        assert!(!s.processor.product_dir(11).join("mp3").join("a.mp3").exists());
        assert!(s.processor.product_dir(11).join("mp3").join("Renamed.mp3").exists());
    }
}
