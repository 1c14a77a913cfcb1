//! Code for supporting the worker configuration file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the configuration file looked up in the working directory.
pub const CONF_FILE_NAME: &str = "conf.toml";

/// Compression used for the blocks of the variant store.
#[derive(
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Debug,
    Default,
    clap::ValueEnum,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StoreCompression {
    /// No compression.
    None,
    /// Snappy.
    Snappy,
    /// LZ4
    #[default]
    Lz4,
    /// Zstandard.
    Zstd,
    /// zlib
    Zlib,
    /// bzip2
    Bz2,
}

impl From<StoreCompression> for rocksdb::DBCompressionType {
    fn from(val: StoreCompression) -> Self {
        match val {
            StoreCompression::None => rocksdb::DBCompressionType::None,
            StoreCompression::Snappy => rocksdb::DBCompressionType::Snappy,
            StoreCompression::Lz4 => rocksdb::DBCompressionType::Lz4,
            StoreCompression::Zstd => rocksdb::DBCompressionType::Zstd,
            StoreCompression::Zlib => rocksdb::DBCompressionType::Zlib,
            StoreCompression::Bz2 => rocksdb::DBCompressionType::Bz2,
        }
    }
}

/// Settings of the optional annotation step.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct AnnotationSettings {
    /// Endpoint accepting `POST {"ids": [...]}` in VEP format.
    pub endpoint: String,
    /// Maximal number of identifiers per request.
    pub batch_size: usize,
    /// Timeout for one request in seconds.
    pub timeout_secs: u64,
    /// Number of retries of a failed batch before it is skipped.
    pub max_retries: usize,
    /// Initial backoff between retries in milliseconds, doubled on each retry.
    pub retry_backoff_ms: u64,
}

impl Default for AnnotationSettings {
    fn default() -> Self {
        Self {
            endpoint: String::from("https://rest.ensembl.org/vep/human/id"),
            batch_size: 50,
            timeout_secs: 60,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

/// Top-level configuration.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    /// Number of VCF records per chunk in the chunked passes.
    pub chunk_size: usize,
    /// Block compression of the variant store.
    pub store_compression: StoreCompression,
    /// Directory for the decompressed working copy and the default store.
    pub working_dir: String,
    /// Whether to run the annotation step after ingestion.
    pub annotate: bool,
    /// Annotation settings.
    pub annotation: AnnotationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: 5000,
            store_compression: StoreCompression::default(),
            working_dir: default_working_dir().to_owned(),
            annotate: false,
            annotation: AnnotationSettings::default(),
        }
    }
}

/// Platform specific default for the working directory.
fn default_working_dir() -> &'static str {
    if cfg!(target_os = "macos") {
        "~/Library/Caches/varstat"
    } else if cfg!(target_os = "windows") {
        "$APPDATA/varstat"
    } else {
        "~/.cache/varstat"
    }
}

impl Settings {
    /// Load settings from the TOML file at `path`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let toml_str = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "could not read configuration {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        let settings: Settings = toml::from_str(&toml_str).map_err(|e| {
            anyhow::anyhow!(
                "could not parse configuration {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        settings.check()?;
        Ok(settings)
    }

    /// Load from `path_conf` if given, else from `conf.toml` in the default
    /// working directory if that exists, else fall back to the defaults.
    pub fn load(path_conf: Option<&str>) -> Result<Self, anyhow::Error> {
        if let Some(path_conf) = path_conf {
            return Self::from_path(path_conf);
        }
        let defaults = Self::default();
        let candidate = defaults.working_dir()?.join(CONF_FILE_NAME);
        if candidate.exists() {
            tracing::debug!("loading configuration from {}", candidate.display());
            Self::from_path(candidate)
        } else {
            Ok(defaults)
        }
    }

    /// Check the values for consistency.
    pub fn check(&self) -> Result<(), anyhow::Error> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be positive");
        }
        if self.annotation.batch_size == 0 {
            anyhow::bail!("annotation.batch_size must be positive");
        }
        Ok(())
    }

    /// The working directory with `~` and environment variables expanded.
    pub fn working_dir(&self) -> Result<PathBuf, anyhow::Error> {
        let expanded = shellexpand::full(&self.working_dir).map_err(|e| {
            anyhow::anyhow!("could not expand working directory {:?}: {}", &self.working_dir, e)
        })?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    /// Path of the decompressed working copy of the input file.
    pub fn path_decompressed(&self) -> Result<PathBuf, anyhow::Error> {
        Ok(self.working_dir()?.join("decompressed.vcf"))
    }

    /// Default path of the variant store.
    pub fn path_store(&self) -> Result<PathBuf, anyhow::Error> {
        Ok(self.working_dir()?.join("store"))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.chunk_size, 5000);
        assert_eq!(settings.annotation.batch_size, 50);
        assert_eq!(settings.store_compression, StoreCompression::Lz4);
        assert!(!settings.annotate);
    }

    #[test]
    fn from_path_partial() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("conf.toml");
        std::fs::write(
            &path,
            "chunk_size = 10\nstore_compression = \"zstd\"\nworking_dir = \"/tmp/x\"\n\n\
             [annotation]\nbatch_size = 20\n",
        )?;

        let settings = Settings::from_path(&path)?;
        assert_eq!(settings.chunk_size, 10);
        assert_eq!(settings.store_compression, StoreCompression::Zstd);
        assert_eq!(settings.working_dir()?, PathBuf::from("/tmp/x"));
        assert_eq!(settings.annotation.batch_size, 20);
        assert_eq!(settings.annotation.timeout_secs, 60);

        Ok(())
    }

    #[test]
    fn from_path_rejects_zero_chunk_size() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("conf.toml");
        std::fs::write(&path, "chunk_size = 0\n")?;

        assert!(Settings::from_path(&path).is_err());

        Ok(())
    }

    #[test]
    fn working_dir_expands_tilde() -> Result<(), anyhow::Error> {
        let settings = Settings {
            working_dir: String::from("~/data"),
            ..Default::default()
        };
        assert!(!settings.working_dir()?.to_string_lossy().starts_with('~'));

        Ok(())
    }
}
