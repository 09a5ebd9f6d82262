//! 設定ファイル（TOML）の読み込み。
//!
//! パスは `$KAZE_CONFIG`、なければ `~/.config/kaze/config.toml`。
//! ファイルがなければ既定値、壊れていれば警告を出して既定値で起動する。
//!
//! ```toml
//! [history]
//! path = "~/.kaze_history"
//! max_size = 1000
//! dedup = true
//!
//! [log]
//! level = "warn"
//!
//! [aliases]
//! ll = "ls -la"
//!
//! [env]
//! EDITOR = "vi"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::parser::expand_tilde;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// `~` で始まる場合はホームディレクトリに展開される。
    pub path: String,
    pub max_size: usize,
    /// 直前と同一のコマンドを記録しない。
    pub dedup: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: "~/.kaze_history".to_string(),
            max_size: 1000,
            dedup: true,
        }
    }
}

impl HistoryConfig {
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.path).as_ref())
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `off` / `error` / `warn` / `info` / `debug` / `trace`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Config {
    /// 設定ファイルを探して読み込む。失敗しても既定値で続行する。
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        match Self::from_file(&path) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                eprintln!("kaze: config: {}", e);
                Self::default()
            }
        }
    }

    fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os("KAZE_CONFIG") {
            return Some(PathBuf::from(path));
        }
        let home = std::env::var_os("HOME")?;
        Some(Path::new(&home).join(".config/kaze/config.toml"))
    }

    /// `path` を読み込む。ファイルが存在しなければ `Ok(None)`。
    pub fn from_file(path: &Path) -> Result<Option<Self>, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&content)
            .map(Some)
            .map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })
    }
}
