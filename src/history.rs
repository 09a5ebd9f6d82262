//! コマンド履歴の管理。
//!
//! [`ShellState`](crate::shell::ShellState) が所有する履歴バッファと、その永続化・検索・
//! ↑↓ ナビゲーション状態を提供する。行エディタは `&mut History` を借りて操作する。
//!
//! ## ファイル形式
//!
//! - パス: 設定 `history.path`（既定 `~/.kaze_history`）
//! - 1 行 1 エントリ: `timestamp<TAB>exit_status<TAB>command`
//! - コマンド中の `\` と改行は `\\` / `\n` にエスケープする
//! - タブ区切りでない行は旧形式として `timestamp = 0, exit_status = 0` で読み込む
//! - 書き込みは追記モードで 1 エントリずつ。上限超過分は終了時の [`History::flush`] で切り詰める
//!
//! ## ナビゲーション
//!
//! `nav_index` は `entries` のインデックスで、`entries.len()` は「現在の入力」を指す。
//! ↑で `nav_index` を減少、↓で増加し、末尾に到達すると `saved_buf`（保存した入力）を復元する。

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

/// 履歴 1 件。
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub command: String,
    pub exit_status: i32,
    /// UNIX 秒。同一秒のエントリは挿入順で新旧を決める。
    pub timestamp: u64,
}

impl HistoryEntry {
    fn to_line(&self) -> String {
        let mut escaped = String::with_capacity(self.command.len());
        for ch in self.command.chars() {
            match ch {
                '\\' => escaped.push_str("\\\\"),
                '\n' => escaped.push_str("\\n"),
                _ => escaped.push(ch),
            }
        }
        format!("{}\t{}\t{}", self.timestamp, self.exit_status, escaped)
    }

    fn from_line(line: &str) -> Self {
        let mut parts = line.splitn(3, '\t');
        if let (Some(ts), Some(status), Some(cmd)) = (parts.next(), parts.next(), parts.next()) {
            if let (Ok(timestamp), Ok(exit_status)) = (ts.parse(), status.parse()) {
                return Self {
                    command: unescape(cmd),
                    exit_status,
                    timestamp,
                };
            }
        }
        Self {
            command: line.to_string(),
            exit_status: 0,
            timestamp: 0,
        }
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// 現在時刻（UNIX 秒）。
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// コマンド履歴。エントリの永続化とナビゲーション状態を管理する。
pub struct History {
    /// 履歴エントリ（古い順）。
    entries: Vec<HistoryEntry>,
    max_size: usize,
    /// 直前と同一のコマンドを追加しない。
    dedup: bool,
    /// 現在のナビゲーション位置。`entries.len()` は「現在の入力」を意味する。
    nav_index: usize,
    /// ↑で履歴に入る前の入力バッファ。
    saved_buf: String,
    /// 永続化先。`None` ならメモリのみ。
    path: Option<PathBuf>,
    /// ファイルが上限を超えており、[`flush`](Self::flush) で書き直す必要がある。
    needs_compact: bool,
}

impl History {
    /// メモリ上のみの履歴。
    pub fn in_memory(max_size: usize, dedup: bool) -> Self {
        Self {
            entries: Vec::new(),
            max_size: max_size.max(1),
            dedup,
            nav_index: 0,
            saved_buf: String::new(),
            path: None,
            needs_compact: false,
        }
    }

    /// `path` から既存エントリを読み込む。ファイルがなければ空で始める。
    pub fn open(path: PathBuf, max_size: usize, dedup: bool) -> Self {
        let mut h = Self::in_memory(max_size, dedup);
        if let Ok(file) = fs::File::open(&path) {
            for line in BufReader::new(file).lines().map_while(Result::ok) {
                if !line.is_empty() {
                    h.entries.push(HistoryEntry::from_line(&line));
                }
            }
            h.truncate_to_max();
        }
        log::debug!("loaded {} history entries from {}", h.entries.len(), path.display());
        h.path = Some(path);
        h.nav_index = h.entries.len();
        h
    }

    fn truncate_to_max(&mut self) {
        if self.entries.len() > self.max_size {
            let excess = self.entries.len() - self.max_size;
            self.entries.drain(..excess);
            self.needs_compact = true;
        }
    }

    /// エントリを追加し、ファイルに追記する。空行と（`dedup` 時）直前との重複はスキップ。
    /// 追加したら `true`。
    pub fn append(&mut self, command: &str, exit_status: i32, timestamp: u64) -> bool {
        let command = command.trim();
        if command.is_empty() {
            return false;
        }
        if self.dedup && self.entries.last().is_some_and(|last| last.command == command) {
            return false;
        }
        let entry = HistoryEntry {
            command: command.to_string(),
            exit_status,
            timestamp,
        };
        if let Some(path) = &self.path {
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{}", entry.to_line()));
            if let Err(e) = written {
                log::warn!("history append to {} failed: {}", path.display(), e);
            }
        }
        self.entries.push(entry);
        self.truncate_to_max();
        self.nav_index = self.entries.len();
        true
    }

    /// 最新 `n` 件を古い順で返す。
    pub fn recent(&self, n: usize) -> Vec<&str> {
        let start = self.entries.len().saturating_sub(n);
        self.entries[start..].iter().map(|e| e.command.as_str()).collect()
    }

    /// `needle` を含むエントリを新しい順で返す（大文字小文字を区別する）。
    pub fn search(&self, needle: &str) -> Vec<&str> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.command.contains(needle))
            .map(|e| e.command.as_str())
            .collect()
    }

    /// インデックス `start` 以前（`start` を含む）で `query` を大文字小文字を区別せずに含む
    /// 最も新しいエントリのインデックス。インクリメンタル検索用。
    pub fn find_before(&self, query: &str, start: usize) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let query = query.to_lowercase();
        let start = start.min(self.entries.len() - 1);
        (0..=start)
            .rev()
            .find(|&i| self.entries[i].command.to_lowercase().contains(&query))
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|e| e.command.as_str())
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 全エントリを消去する（`history -c`）。ファイルも空にする。
    pub fn clear(&mut self) {
        self.entries.clear();
        self.nav_index = 0;
        self.needs_compact = true;
    }

    /// 終了時に呼ぶ。上限超過や `clear` があった場合だけファイルを書き直す。
    pub fn flush(&mut self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.needs_compact {
            return Ok(());
        }
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_line());
            out.push('\n');
        }
        fs::write(path, out)?;
        self.needs_compact = false;
        Ok(())
    }

    // ── ナビゲーション ────────────────────────────────────────────

    /// ナビゲーション状態をリセット（`read_line` 開始時・閲覧終了時に呼ぶ）。
    pub fn reset_nav(&mut self) {
        self.nav_index = self.entries.len();
        self.saved_buf.clear();
    }

    /// 現在の入力バッファを保存（初回 Up 時）。
    pub fn save_current(&mut self, buf: &str) {
        self.saved_buf = buf.to_string();
    }

    /// ナビゲーション位置が末尾（= まだ履歴に入っていない）か。
    pub fn at_end(&self) -> bool {
        self.nav_index == self.entries.len()
    }

    /// ↑: 一つ前のエントリを返す。先頭なら None。
    pub fn prev(&mut self) -> Option<&str> {
        if self.nav_index > 0 {
            self.nav_index -= 1;
            Some(&self.entries[self.nav_index].command)
        } else {
            None
        }
    }

    /// ↓: 一つ次のエントリを返す。末尾到達時は saved_buf を復元。
    pub fn next(&mut self) -> Option<&str> {
        if self.nav_index < self.entries.len() {
            self.nav_index += 1;
            if self.nav_index == self.entries.len() {
                Some(&self.saved_buf)
            } else {
                Some(&self.entries[self.nav_index].command)
            }
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_history(entries: &[&str]) -> History {
        let mut h = History::in_memory(1000, true);
        for (i, e) in entries.iter().enumerate() {
            h.append(e, 0, i as u64);
        }
        h
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("kaze-history-{}-{}", std::process::id(), name))
    }

    #[test]
    fn prev_next_navigation() {
        let mut h = make_history(&["first", "second", "third"]);
        h.save_current("current");

        assert_eq!(h.prev(), Some("third"));
        assert_eq!(h.prev(), Some("second"));
        assert_eq!(h.prev(), Some("first"));
        assert_eq!(h.prev(), None);

        assert_eq!(h.next(), Some("second"));
        assert_eq!(h.next(), Some("third"));
        assert_eq!(h.next(), Some("current"));
        assert_eq!(h.next(), None);
    }

    #[test]
    fn append_skips_empty_and_duplicates() {
        let mut h = History::in_memory(1000, true);
        assert!(!h.append("", 0, 0));
        assert!(!h.append("  ", 0, 0));
        assert!(h.append("echo hello", 0, 0));
        assert!(!h.append("echo hello", 1, 1));
        assert!(h.append("echo world", 0, 2));
        assert!(h.append("echo hello", 0, 3));
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn duplicates_kept_without_dedup() {
        let mut h = History::in_memory(1000, false);
        h.append("ls", 0, 0);
        h.append("ls", 0, 0);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn max_size_drops_oldest() {
        let mut h = History::in_memory(2, true);
        h.append("a", 0, 0);
        h.append("b", 0, 0);
        h.append("c", 0, 0);
        assert_eq!(h.recent(10), vec!["b", "c"]);
    }

    #[test]
    fn recent_and_search_order() {
        let h = make_history(&["echo a", "git status", "echo b"]);
        assert_eq!(h.recent(2), vec!["git status", "echo b"]);
        assert_eq!(h.search("echo"), vec!["echo b", "echo a"]);
        assert!(h.search("ECHO").is_empty());
    }

    #[test]
    fn find_before_is_case_insensitive_and_bounded() {
        let h = make_history(&["echo a", "git status", "ECHO b"]);
        assert_eq!(h.find_before("ec", 2), Some(2));
        assert_eq!(h.find_before("ec", 1), Some(0));
        assert_eq!(h.find_before("ec", 99), Some(2));
        assert_eq!(h.find_before("zzz", 2), None);
        assert_eq!(History::in_memory(10, true).find_before("", 0), None);
    }

    #[test]
    fn persists_and_reloads() {
        let path = temp_path("reload");
        let _ = fs::remove_file(&path);
        {
            let mut h = History::open(path.clone(), 100, true);
            h.append("echo one", 0, 10);
            h.append("printf 'a\\b'\nnext", 2, 11);
        }
        let h = History::open(path.clone(), 100, true);
        assert_eq!(
            h.entries(),
            &[
                HistoryEntry { command: "echo one".into(), exit_status: 0, timestamp: 10 },
                HistoryEntry { command: "printf 'a\\b'\nnext".into(), exit_status: 2, timestamp: 11 },
            ]
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn legacy_plain_lines_load() {
        let path = temp_path("legacy");
        fs::write(&path, "ls -la\ncd /tmp\n").unwrap();
        let h = History::open(path.clone(), 100, true);
        assert_eq!(h.recent(5), vec!["ls -la", "cd /tmp"]);
        assert_eq!(h.entries()[0].timestamp, 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn flush_compacts_oversized_file() {
        let path = temp_path("compact");
        fs::write(&path, "a\nb\nc\nd\n").unwrap();
        let mut h = History::open(path.clone(), 2, true);
        h.flush().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "0\t0\tc\n0\t0\td\n");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reset_nav_goes_to_end() {
        let mut h = make_history(&["a", "b"]);
        h.prev();
        h.prev();
        assert!(!h.at_end());
        h.reset_nav();
        assert!(h.at_end());
    }
}
