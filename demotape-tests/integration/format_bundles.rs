//! Batch format bundles for downloadable products

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use demotape_core::audio::AudioFormat;
use demotape_core::config::DemoOverrides;
use demotape_core::formats::{FormatError, ProcessReport, SkipReason};
use demotape_core::metadata::{
    AUDIO_FILES_HASH, AVAILABLE_FORMATS, FORMATS_GENERATED_AT, MetadataStore, available_formats,
};
use demotape_core::test_fixtures::FakeTranscoder;

use crate::fixtures::Shop;

fn working_transcoder() -> Arc<FakeTranscoder> {
    Arc::new(FakeTranscoder::with_duration(Duration::from_secs(180)))
}

#[tokio::test]
async fn test_product_7_bundles_every_format() {
    let shop = Shop::new();
    shop.add_product(7, &[("Opening Theme.wav", 32_000)]);
    std::fs::write(shop.music_dir(7).join("cover.jpg"), b"\xFF\xD8\xFFjpeg").unwrap();
    let processor = shop.processor(working_transcoder());

    let report = processor.process_product(7).await.unwrap();
    let ProcessReport::Completed(summary) = report else {
        panic!("expected a completed run");
    };
    assert!(summary.failures.is_empty());
    assert!(summary.cover.is_some());

    let product_dir = processor.product_dir(7);
    for format in AudioFormat::ALL {
        let dir = product_dir.join(format.extension());
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                format!("Opening Theme.{}", format.extension()),
                "cover.jpg".to_string()
            ]
        );

        let archive_path = processor.archive_path(7, format);
        assert!(std::fs::metadata(&archive_path).unwrap().len() > 0);
        let archive = zip::ZipArchive::new(File::open(&archive_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
    }

    assert_eq!(
        shop.metadata.get(7, AVAILABLE_FORMATS).await.unwrap().as_deref(),
        Some(r#"["mp3","wav","flac","ogg"]"#)
    );
    assert_eq!(
        available_formats(shop.metadata.as_ref(), 7).await.unwrap(),
        AudioFormat::ALL.to_vec()
    );
    let generated_at = shop.metadata.get(7, FORMATS_GENERATED_AT).await.unwrap().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(&generated_at).is_ok());
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let shop = Shop::new();
    shop.add_product(10, &[("a.wav", 8_000), ("b.mp3", 8_000)]);
    let transcoder = working_transcoder();
    let processor = shop.processor(transcoder.clone());

    processor.process_product(10).await.unwrap();
    let writes = shop.metadata.write_count();
    let conversions = transcoder.conversions().len();
    let archive = processor.archive_path(10, AudioFormat::Flac);
    let modified = std::fs::metadata(&archive).unwrap().modified().unwrap();

    let report = processor.process_product(10).await.unwrap();
    assert!(matches!(report, ProcessReport::Skipped(SkipReason::Unchanged)));
    assert_eq!(shop.metadata.write_count(), writes);
    assert_eq!(transcoder.conversions().len(), conversions);
    assert_eq!(
        std::fs::metadata(&archive).unwrap().modified().unwrap(),
        modified
    );
}

#[tokio::test]
async fn test_track_changes_trigger_regeneration() {
    let shop = Shop::new();
    let product = shop.add_product(11, &[("a.wav", 8_000)]);
    let processor = shop.processor(working_transcoder());
    processor.process_product(11).await.unwrap();
    let first_hash = shop.metadata.get(11, AUDIO_FILES_HASH).await.unwrap();

    // Demo settings are not part of the content identity.
    let mut unrelated = product.clone();
    unrelated.demo = DemoOverrides {
        percent: Some(5),
        ..Default::default()
    };
    shop.catalog.upsert(unrelated.clone());
    assert!(matches!(
        processor.process_product(11).await.unwrap(),
        ProcessReport::Skipped(SkipReason::Unchanged)
    ));

    let mut renamed = unrelated;
    renamed.tracks[0].display_name = "Side A".to_string();
    shop.catalog.upsert(renamed);
    assert!(matches!(
        processor.process_product(11).await.unwrap(),
        ProcessReport::Completed(_)
    ));
    assert_ne!(
        shop.metadata.get(11, AUDIO_FILES_HASH).await.unwrap(),
        first_hash
    );
    assert!(processor.product_dir(11).join("ogg").join("Side A.ogg").exists());
    assert!(!processor.product_dir(11).join("ogg").join("a.ogg").exists());
}

#[tokio::test]
async fn test_missing_transcoder_keeps_previous_bundles() {
    let shop = Shop::new();
    let mut product = shop.add_product(12, &[("a.wav", 8_000)]);
    shop.processor(working_transcoder())
        .process_product(12)
        .await
        .unwrap();

    product.tracks[0].display_name = "Changed".to_string();
    shop.catalog.upsert(product);
    let processor = shop.processor(Arc::new(FakeTranscoder::unavailable()));

    let result = processor.process_product(12).await;
    assert!(matches!(
        result,
        Err(FormatError::TranscoderNotConfigured { product_id: 12 })
    ));
    assert!(processor.archive_path(12, AudioFormat::Mp3).exists());
}

#[tokio::test]
async fn test_missing_source_is_recorded_not_fatal() {
    let shop = Shop::new();
    let product = shop.add_product(13, &[("a.wav", 8_000), ("b.wav", 8_000)]);
    std::fs::remove_file(&product.tracks[1].source).unwrap();
    let processor = shop.processor(working_transcoder());

    let ProcessReport::Completed(summary) = processor.process_product(13).await.unwrap() else {
        panic!("expected a completed run");
    };
    assert_eq!(summary.failures.len(), 1);
    assert!(matches!(
        summary.failures[0],
        FormatError::SourceUnavailable { .. }
    ));
    assert_eq!(summary.archives, AudioFormat::ALL.to_vec());
    assert_eq!(summary.produced[&AudioFormat::Wav].len(), 1);
}
