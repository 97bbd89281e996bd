//! Centralized configuration for Demotape.
//!
//! Every component receives its section of [`DemotapeConfig`] explicitly.
//! Product-level overrides are merged by [`DemoSettings::resolve`] once per
//! request.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;

/// Central configuration for all Demotape components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct DemotapeConfig {
    pub demo: DemoConfig,
    pub transcoder: TranscoderConfig,
    pub formats: FormatsConfig,
    pub network: NetworkConfig,
    pub server: ServerConfig,
}

/// Demo protection settings shared by every product.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// Serve truncated demos to viewers who have not purchased
    pub secure_demos: bool,
    /// Share of the original kept in a demo (0-100)
    pub percent: u8,
    /// Optional audio file mixed under every demo
    pub watermark: Option<String>,
    /// Reject anonymous viewers before touching any file
    pub registered_only: bool,
    /// Persist generated demos; when false, plain files are truncated while streaming
    pub persist_demos: bool,
    /// Root directory for demo artifacts and downloaded sources
    pub cache_dir: PathBuf,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            secure_demos: true,
            percent: 50,
            watermark: None,
            registered_only: false,
            persist_demos: true,
            cache_dir: PathBuf::from("demos"),
        }
    }
}

/// External transcoder (ffmpeg) settings.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    /// Path to the ffmpeg executable; `None` disables transcoding
    pub ffmpeg_path: Option<PathBuf>,
    /// Hard limit for a single transcoder invocation
    pub timeout: Duration,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Batch format processing settings.
#[derive(Debug, Clone)]
pub struct FormatsConfig {
    /// Root directory for per-product format bundles
    pub output_dir: PathBuf,
    /// Formats generated for every product
    pub targets: Vec<AudioFormat>,
    /// Products processed concurrently by the background worker
    pub max_concurrent_products: usize,
}

impl Default for FormatsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("formats"),
            targets: AudioFormat::ALL.to_vec(),
            max_concurrent_products: num_cpus::get().clamp(1, 4),
        }
    }
}

/// Remote source download settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Timeout for downloading a remote source file
    pub download_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            download_timeout: Duration::from_secs(120),
            user_agent: "demotape/0.1.0",
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// JSON catalog manifest describing products and tracks
    pub catalog_path: Option<PathBuf>,
    /// JSON file backing the product metadata store
    pub metadata_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            catalog_path: None,
            metadata_path: PathBuf::from("metadata.json"),
        }
    }
}

/// Per-product overrides supplied by the shop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoOverrides {
    #[serde(default)]
    pub secure_demos: Option<bool>,
    #[serde(default)]
    pub percent: Option<u8>,
    #[serde(default)]
    pub watermark: Option<String>,
}

/// Effective demo settings for one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSettings {
    pub secure_demos: bool,
    pub percent: u8,
    pub watermark: Option<String>,
}

impl DemoSettings {
    /// Merges product overrides over the global demo configuration.
    ///
    /// The percentage is clamped to 100.
    pub fn resolve(global: &DemoConfig, overrides: &DemoOverrides) -> Self {
        Self {
            secure_demos: overrides.secure_demos.unwrap_or(global.secure_demos),
            percent: overrides.percent.unwrap_or(global.percent).min(100),
            watermark: overrides
                .watermark
                .clone()
                .or_else(|| global.watermark.clone())
                .filter(|w| !w.trim().is_empty()),
        }
    }
}

impl DemotapeConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("DEMOTAPE_FFMPEG_PATH")
            && !path.trim().is_empty()
        {
            config.transcoder.ffmpeg_path = Some(PathBuf::from(path));
        }

        if let Ok(timeout) = std::env::var("DEMOTAPE_TRANSCODE_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.transcoder.timeout = Duration::from_secs(seconds);
        }

        if let Ok(percent) = std::env::var("DEMOTAPE_DEMO_PERCENT")
            && let Ok(value) = percent.parse::<u8>()
        {
            config.demo.percent = value.min(100);
        }

        if let Ok(secure) = std::env::var("DEMOTAPE_SECURE_DEMOS") {
            config.demo.secure_demos = secure.parse().unwrap_or(config.demo.secure_demos);
        }

        if let Ok(watermark) = std::env::var("DEMOTAPE_WATERMARK")
            && !watermark.trim().is_empty()
        {
            config.demo.watermark = Some(watermark);
        }

        if let Ok(registered) = std::env::var("DEMOTAPE_REGISTERED_ONLY") {
            config.demo.registered_only = registered.parse().unwrap_or(false);
        }

        if let Ok(persist) = std::env::var("DEMOTAPE_PERSIST_DEMOS") {
            config.demo.persist_demos = persist.parse().unwrap_or(true);
        }

        if let Ok(dir) = std::env::var("DEMOTAPE_DEMO_DIR") {
            config.demo.cache_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("DEMOTAPE_FORMATS_DIR") {
            config.formats.output_dir = PathBuf::from(dir);
        }

        if let Ok(catalog) = std::env::var("DEMOTAPE_CATALOG") {
            config.server.catalog_path = Some(PathBuf::from(catalog));
        }

        config
    }

    /// Creates a configuration rooted in a scratch directory for tests.
    ///
    /// No transcoder is configured, so demos fall back to byte truncation.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            demo: DemoConfig {
                cache_dir: root.join("demos"),
                ..Default::default()
            },
            transcoder: TranscoderConfig {
                ffmpeg_path: None,
                timeout: Duration::from_secs(5),
            },
            formats: FormatsConfig {
                output_dir: root.join("formats"),
                max_concurrent_products: 2,
                ..Default::default()
            },
            server: ServerConfig {
                metadata_path: root.join("metadata.json"),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = DemotapeConfig::default();

        assert!(config.demo.secure_demos);
        assert_eq!(config.demo.percent, 50);
        assert!(!config.demo.registered_only);
        assert!(config.demo.persist_demos);
        assert!(config.transcoder.ffmpeg_path.is_none());
        assert_eq!(config.transcoder.timeout, Duration::from_secs(300));
        assert_eq!(config.formats.targets, AudioFormat::ALL.to_vec());
        assert!(config.formats.max_concurrent_products >= 1);
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_demo_settings_resolution() {
        let global = DemoConfig {
            watermark: Some("wm.mp3".to_string()),
            ..Default::default()
        };

        let plain = DemoSettings::resolve(&global, &DemoOverrides::default());
        assert!(plain.secure_demos);
        assert_eq!(plain.percent, 50);
        assert_eq!(plain.watermark.as_deref(), Some("wm.mp3"));

        let overridden = DemoSettings::resolve(
            &global,
            &DemoOverrides {
                secure_demos: Some(false),
                percent: Some(250),
                watermark: Some("  ".to_string()),
            },
        );
        assert!(!overridden.secure_demos);
        assert_eq!(overridden.percent, 100);
        assert_eq!(overridden.watermark, None);
    }

    #[test]
    fn test_testing_config_is_rooted() {
        let root = std::path::Path::new("/tmp/demotape-test");
        let config = DemotapeConfig::for_testing(root);
        assert_eq!(config.demo.cache_dir, root.join("demos"));
        assert_eq!(config.formats.output_dir, root.join("formats"));
        assert!(config.transcoder.ffmpeg_path.is_none());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("DEMOTAPE_FFMPEG_PATH", "/usr/bin/ffmpeg");
            std::env::set_var("DEMOTAPE_DEMO_PERCENT", "20");
            std::env::set_var("DEMOTAPE_SECURE_DEMOS", "false");
            std::env::set_var("DEMOTAPE_REGISTERED_ONLY", "true");
            std::env::set_var("DEMOTAPE_TRANSCODE_TIMEOUT", "12");
        }

        let config = DemotapeConfig::from_env();

        assert_eq!(
            config.transcoder.ffmpeg_path,
            Some(PathBuf::from("/usr/bin/ffmpeg"))
        );
        assert_eq!(config.demo.percent, 20);
        assert!(!config.demo.secure_demos);
        assert!(config.demo.registered_only);
        assert_eq!(config.transcoder.timeout, Duration::from_secs(12));

        // Cleanup
        unsafe {
            std::env::remove_var("DEMOTAPE_FFMPEG_PATH");
            std::env::remove_var("DEMOTAPE_DEMO_PERCENT");
            std::env::remove_var("DEMOTAPE_SECURE_DEMOS");
            std::env::remove_var("DEMOTAPE_REGISTERED_ONLY");
            std::env::remove_var("DEMOTAPE_TRANSCODE_TIMEOUT");
        }
    }
}
