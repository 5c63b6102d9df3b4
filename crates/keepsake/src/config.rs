use crate::codec::{JsonPayloadCodec, PayloadCodec, RawPayloadCodec};
use crate::error::RecordError;
use crate::key::{CacheKeyer, KeyConfig};
use crate::response_cache::ResponseCache;
use keepsake_store::{FileLocking, StoreOptions};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// `[cache]` section: where and how responses are stored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    /// Bumping this discards everything stored by earlier versions.
    #[serde(default = "default_app_version")]
    pub app_version: u32,
    #[serde(default)]
    pub identity_salt: String,
    #[serde(default)]
    pub default_ignored: Vec<String>,
    #[serde(default)]
    pub file_locking: FileLockingMode,
    #[serde(default)]
    pub codec: CodecKind,
}

fn default_directory() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_max_size_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_app_version() -> u32 {
    1
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            max_size_bytes: default_max_size_bytes(),
            app_version: default_app_version(),
            identity_salt: String::new(),
            default_ignored: Vec::new(),
            file_locking: FileLockingMode::default(),
            codec: CodecKind::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileLockingMode {
    #[default]
    Detect,
    Permissive,
    Exclusive,
}

impl From<FileLockingMode> for FileLocking {
    fn from(mode: FileLockingMode) -> Self {
        match mode {
            FileLockingMode::Detect => FileLocking::Detect,
            FileLockingMode::Permissive => FileLocking::Permissive,
            FileLockingMode::Exclusive => FileLocking::Exclusive,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    #[default]
    Raw,
    Json,
}

impl CodecKind {
    pub fn build(self) -> Arc<dyn PayloadCodec> {
        match self {
            CodecKind::Raw => Arc::new(RawPayloadCodec),
            CodecKind::Json => Arc::new(JsonPayloadCodec),
        }
    }
}

impl CacheConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::new(&self.directory, self.max_size_bytes)
            .app_version(self.app_version)
            .file_locking(self.file_locking.into())
    }

    pub fn key_config(&self) -> KeyConfig {
        KeyConfig {
            identity_salt: self.identity_salt.clone(),
            default_ignored: self.default_ignored.clone(),
        }
    }

    pub fn keyer(&self) -> CacheKeyer {
        CacheKeyer::new(self.key_config())
    }

    pub fn open_cache(&self) -> Result<ResponseCache, RecordError> {
        ResponseCache::open(self.store_options(), self.codec.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_section() {
        let config: CacheConfig = toml::from_str("").unwrap();
        assert_eq!(config.directory, PathBuf::from("./cache"));
        assert_eq!(config.max_size_bytes, 64 * 1024 * 1024);
        assert_eq!(config.file_locking, FileLockingMode::Detect);
        assert_eq!(config.codec, CodecKind::Raw);
    }

    #[test]
    fn test_parse_full_section() {
        let config: CacheConfig = toml::from_str(
            r#"
            directory = "/var/cache/keepsake"
            max_size_bytes = 1048576
            app_version = 3
            identity_salt = "tenant-a"
            default_ignored = ["ts", "nonce"]
            file_locking = "exclusive"
            codec = "json"
            "#,
        )
        .unwrap();

        let options = config.store_options();
        assert_eq!(options.max_size, 1_048_576);
        assert_eq!(options.app_version, 3);
        assert_eq!(options.file_locking, FileLocking::Exclusive);
        assert_eq!(config.codec.build().name(), "json");
        assert_eq!(config.key_config().default_ignored, vec!["ts", "nonce"]);
    }

    #[test]
    fn test_open_cache_rejects_zero_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = CacheConfig {
            directory: dir.path().to_path_buf(),
            max_size_bytes: 0,
            ..Default::default()
        };
        assert!(config.open_cache().is_err());
    }
}
