use std::path::{Path, PathBuf};
use std::time::Duration;

use billscan_core::ScanConfig;
use billscan_ocr::{ImageNormalizer, PipelineOptions, RecognizeOptions};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

pub const VISION_API_KEY_ENV: &str = "BILLSCAN_VISION_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Could not determine a home directory for app data")]
    NoHomeDir,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where the bill database lives. Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Folder watched by `billscan watch`. Defaults to `<data_dir>/intake`.
    pub intake_dir: Option<PathBuf>,
    /// Store the "Unknown (OCR Failed)" stub when a scan fails instead of only reporting it.
    pub auto_accept_fallback: bool,
    pub scan: ScanConfig,
    pub ocr: OcrSettings,
    pub vision: VisionSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    pub language: String,
    /// Directory holding `*.traineddata`; `None` lets Tesseract use its default.
    pub tessdata_path: Option<String>,
    pub timeout_secs: u64,
    pub normalize_timeout_secs: u64,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            tessdata_path: None,
            timeout_secs: 60,
            normalize_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionSettings {
    pub base_url: String,
    pub model: String,
    /// Usually supplied through `BILLSCAN_VISION_API_KEY` rather than the file.
    pub api_key: Option<String>,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
        }
    }
}

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("com", "billscan", "BillScan").ok_or(ConfigError::NoHomeDir)
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

impl AppConfig {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => return Err(ConfigError::Read { path: path.to_path_buf(), source }),
        };
        config.apply_api_key(std::env::var(VISION_API_KEY_ENV).ok());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// A non-empty key from the environment wins over the file.
    pub fn apply_api_key(&mut self, key: Option<String>) {
        if let Some(key) = key.filter(|k| !k.trim().is_empty()) {
            self.vision.api_key = Some(key);
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().to_path_buf()),
        }
    }

    pub fn intake_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.intake_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("intake")),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            global_deadline: Duration::from_secs(self.ocr.timeout_secs),
            normalizer: ImageNormalizer::with_deadline(Duration::from_secs(
                self.ocr.normalize_timeout_secs,
            )),
            recognize: RecognizeOptions {
                language: self.ocr.language.clone(),
                ..RecognizeOptions::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = AppConfig::from_toml("").unwrap();
        assert!(cfg.scan.use_local_ocr);
        assert!(!cfg.auto_accept_fallback);
        assert_eq!(cfg.ocr.language, "eng");
        assert_eq!(cfg.ocr.timeout_secs, 60);
        assert!(cfg.vision.api_key.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            auto_accept_fallback = true
            data_dir = "/tmp/bills"

            [scan]
            use_local_ocr = false

            [ocr]
            timeout_secs = 30
            "#,
        )
        .unwrap();
        assert!(cfg.auto_accept_fallback);
        assert!(!cfg.scan.use_local_ocr);
        assert!(!cfg.scan.skip_normalization);
        assert_eq!(cfg.ocr.timeout_secs, 30);
        assert_eq!(cfg.ocr.normalize_timeout_secs, 10);
        assert_eq!(cfg.intake_dir().unwrap(), PathBuf::from("/tmp/bills/intake"));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(AppConfig::from_toml("scan = 3"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.ocr.language, "eng");
    }

    #[test]
    fn env_key_overrides_file_key() {
        let mut cfg = AppConfig::from_toml("[vision]\napi_key = \"from-file\"").unwrap();
        cfg.apply_api_key(Some("   ".into()));
        assert_eq!(cfg.vision.api_key.as_deref(), Some("from-file"));
        cfg.apply_api_key(Some("from-env".into()));
        assert_eq!(cfg.vision.api_key.as_deref(), Some("from-env"));
    }

    #[test]
    fn pipeline_options_follow_config() {
        let cfg = AppConfig::from_toml("[ocr]\ntimeout_secs = 5\nlanguage = \"deu\"").unwrap();
        let opts = cfg.pipeline_options();
        assert_eq!(opts.global_deadline, Duration::from_secs(5));
        assert_eq!(opts.normalizer.deadline, Duration::from_secs(10));
        assert_eq!(opts.recognize.language, "deu");
    }
}
