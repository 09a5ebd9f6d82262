//! ログ出力の初期化。
//!
//! `log` ファサードの出力先は `simplelog::WriteLogger` によるファイルのみ。
//! 端末に書くと行エディタの表示が崩れるため、stderr には出さない。
//!
//! - 出力先: `$XDG_STATE_HOME/kaze/kaze.log`（既定 `~/.local/state/kaze/kaze.log`）
//! - レベル: `KAZE_LOG` > 設定 `log.level` > `warn`

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use simplelog::{ConfigBuilder, LevelFilter, WriteLogger};

fn log_path() -> Option<PathBuf> {
    let state_dir = match std::env::var_os("XDG_STATE_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => Path::new(&std::env::var_os("HOME")?).join(".local/state"),
    };
    Some(state_dir.join("kaze").join("kaze.log"))
}

/// レベル文字列を解釈する。不正な値は `None`。
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(s.trim()).ok()
}

/// ロガーを初期化する。失敗しても致命的ではなく、警告を出してログなしで続行する。
pub fn init(configured_level: &str) {
    let level = std::env::var("KAZE_LOG")
        .ok()
        .and_then(|s| parse_level(&s))
        .or_else(|| parse_level(configured_level))
        .unwrap_or(LevelFilter::Warn);
    if level == LevelFilter::Off {
        return;
    }

    let Some(path) = log_path() else {
        eprintln!("kaze: log: HOME not set, logging disabled");
        return;
    };
    if let Some(dir) = path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    let file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("kaze: log: {}: {}", path.display(), e);
            return;
        }
    };

    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    if let Err(e) = WriteLogger::init(level, config, file) {
        eprintln!("kaze: log: {}", e);
    }
}
