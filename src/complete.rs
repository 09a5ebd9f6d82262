//! Tab 補完（コマンド名、ファイル名、チルダ展開、`|` 後のコマンド位置認識）。
//!
//! 補完は [`CommandUniverse`]（ビルトイン + エイリアス名 + `$PATH` 内の実行可能ファイル）と
//! ファイルシステムを読むだけで、シェルの状態は変更しない。
//!
//! ## 補完の種類
//!
//! - **コマンド名補完**（行頭 or `|` の後の最初の単語）: [`CommandUniverse`] から候補を収集
//! - **ファイル名補完**（それ以外の位置）:
//!   カレントディレクトリまたは指定ディレクトリのファイル名から候補を収集。
//!   `~/` プレフィックスはチルダ展開してディレクトリを検索し、
//!   表示用にはオリジナルの `~` プレフィックスを維持する。
//!
//! ## 候補の適用（[`editor`](crate::editor) 側で処理）
//!
//! - 候補 0 件 → ベル
//! - 候補 1 件 → 単語を置換 + 末尾にスペース（ディレクトリなら `/`）
//! - 候補複数 → 共通接頭辞まで補完 + 候補一覧を表示

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::builtins;
use crate::parser;

// ── PATH キャッシュ ───────────────────────────────────────────────

/// `$PATH` 内の実行可能コマンド名をキャッシュする。
/// `$PATH` が変更されたら再構築する。
#[derive(Debug, Default)]
pub struct PathCache {
    commands: BTreeSet<String>,
    /// キャッシュ構築時の `$PATH` 値。変更検出に使う。
    path_str: Option<String>,
}

impl PathCache {
    pub fn new() -> Self {
        let mut cache = Self::default();
        cache.refresh();
        cache
    }

    /// `$PATH` が変更されていればキャッシュを再構築する。
    pub fn refresh(&mut self) {
        let current = std::env::var("PATH").unwrap_or_default();
        if self.path_str.as_deref() == Some(current.as_str()) {
            return;
        }
        self.commands.clear();
        for dir in current.split(':').filter(|d| !d.is_empty()) {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    if let Ok(name) = entry.file_name().into_string() {
                        if is_executable(&entry.path()) {
                            self.commands.insert(name);
                        }
                    }
                }
            }
        }
        log::debug!("path cache rebuilt: {} commands", self.commands.len());
        self.path_str = Some(current);
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains(name)
    }

    /// `prefix` で始まるコマンド名（ソート済み）。
    pub fn commands_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.commands
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |cmd| cmd.starts_with(prefix))
            .map(String::as_str)
    }
}

/// ファイルが実行可能か判定する（Unix パーミッションビット `0o111`）。
pub fn is_executable(path: &Path) -> bool {
    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

// ── CommandUniverse ─────────────────────────────────────────────────

/// コマンド名補完の候補全体。`read_line` の前に [`refresh`](Self::refresh) で最新化する。
#[derive(Debug, Default)]
pub struct CommandUniverse {
    path: PathCache,
    aliases: BTreeSet<String>,
}

impl CommandUniverse {
    pub fn new(aliases: &HashMap<String, String>) -> Self {
        let mut universe = Self::default();
        universe.refresh(aliases);
        universe
    }

    /// PATH キャッシュとエイリアス名を更新する。
    pub fn refresh(&mut self, aliases: &HashMap<String, String>) {
        self.path.refresh();
        self.aliases = aliases.keys().cloned().collect();
    }

    /// `name` がビルトイン・エイリアス・PATH 内コマンドのいずれかか。
    pub fn contains(&self, name: &str) -> bool {
        builtins::is_builtin(name) || self.aliases.contains(name) || self.path.has_command(name)
    }

    fn with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut results: BTreeSet<&str> = builtins::BUILTINS
            .iter()
            .copied()
            .filter(|b| b.starts_with(prefix))
            .collect();
        results.extend(
            self.aliases
                .iter()
                .filter(|a| a.starts_with(prefix))
                .map(String::as_str),
        );
        results.extend(self.path.commands_with_prefix(prefix));
        results.into_iter().map(str::to_string).collect()
    }
}

// ── 補完 ─────────────────────────────────────────────────────────

/// Tab 補完の結果。候補リストと補完対象の単語位置を持つ。
#[derive(Debug, PartialEq)]
pub struct Completion {
    /// 補完候補のリスト（ソート済み・重複なし）。
    pub candidates: Vec<String>,
    /// 補完対象の単語の開始バイトオフセット（バッファ内）。
    pub word_start: usize,
    /// 補完対象の単語の終了バイトオフセット（= カーソル位置）。
    pub word_end: usize,
}

/// カーソル位置の単語に対する補完候補を返す。
pub fn complete(buf: &str, cursor: usize, universe: &CommandUniverse) -> Completion {
    let (word_start, word, is_command) = current_word(buf, cursor);

    let candidates = if is_command && !word.contains('/') {
        universe.with_prefix(word)
    } else {
        find_files(word)
    };

    Completion {
        candidates,
        word_start,
        word_end: cursor,
    }
}

/// カーソル位置の単語を抽出する。
/// 戻り値: (word_start_byte, word, is_first_word_in_segment)
fn current_word(buf: &str, cursor: usize) -> (usize, &str, bool) {
    let before = &buf[..cursor];
    let word_start = before
        .rfind(|c: char| c == ' ' || c == '\t')
        .map(|i| i + 1)
        .unwrap_or(0);
    let word = &buf[word_start..cursor];

    let prefix = buf[..word_start].trim_end();
    let is_command = prefix.is_empty() || prefix.ends_with('|');

    (word_start, word, is_command)
}

/// ファイル名補完。ディレクトリには末尾 `/` を付加する。
///
/// `prefix` に `/` が含まれればそのディレクトリを基準に検索し、
/// 含まれなければカレントディレクトリを検索する。
/// `.` で始まる隠しファイルは `prefix` が `.` で始まる場合のみ候補に含める。
fn find_files(prefix: &str) -> Vec<String> {
    let expanded = parser::expand_tilde(prefix);

    let (search_dir, file_prefix, display_dir) = match expanded.rfind('/') {
        Some(slash) => {
            let dir = &expanded[..slash + 1];
            // 表示用はオリジナルの ~ プレフィックスを維持
            let shown = match prefix.rfind('/') {
                Some(orig) if prefix.starts_with('~') => &prefix[..orig + 1],
                _ => dir,
            };
            (dir.to_string(), &expanded[slash + 1..], shown.to_string())
        }
        None => (String::from("./"), &expanded[..], String::new()),
    };

    let mut results = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&search_dir) {
        for entry in entries.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with(file_prefix) {
                continue;
            }
            if name.starts_with('.') && !file_prefix.starts_with('.') {
                continue;
            }
            // シンボリックリンク先がディレクトリの場合も `/` を付ける
            let is_dir = entry.path().is_dir();
            results.push(format!(
                "{}{}{}",
                display_dir,
                name,
                if is_dir { "/" } else { "" }
            ));
        }
    }

    results.sort();
    results
}

/// 候補群の最長共通接頭辞を返す。UTF-8 文字境界を考慮する。
///
/// 候補が空なら空文字列を返す。
pub fn longest_common_prefix(candidates: &[String]) -> &str {
    let Some(first) = candidates.first() else {
        return "";
    };
    let mut prefix_len = first.len();
    for candidate in &candidates[1..] {
        prefix_len = first
            .bytes()
            .zip(candidate.bytes())
            .take(prefix_len)
            .take_while(|(a, b)| a == b)
            .count();
    }
    while prefix_len > 0 && !first.is_char_boundary(prefix_len) {
        prefix_len -= 1;
    }
    &first[..prefix_len]
}
