//! 行エディタ: raw モード、キー入力、モード遷移、表示更新。
//!
//! ターミナルを raw モードに切り替え、自前の行エディタを提供する。
//! 端末 I/O は `libc`（termios, `read(2)`, `write(2)`, `poll(2)`）のみ、
//! カーソル移動・削除の単位は `unicode-segmentation` の拡張書記素クラスタ。
//!
//! ## モード
//!
//! ```text
//!            ↑                     Ctrl+R
//!   Editing ────▶ Browsing ──────────────────▶ Search
//!      ▲  ◀──────── ↓ で末尾 / 編集キー          │
//!      │                                          │
//!      └──── Enter / Ctrl+C / Ctrl+G / その他のキー ┘
//! ```
//!
//! キーは 1 つずつ [`LineEditor::handle_key`] に渡され、現在のモードに応じて
//! バッファ・モードを更新する。戻り値は確定した行か EOF、またはなし（入力継続）。
//! ベルや候補一覧などの表示要求は [`Notice`] として保留され、`read_line` が出力する。
//!
//! ## raw モードの範囲
//!
//! raw モードは [`LineEditor::read_line`] 内でのみ有効。
//! [`RawMode`] の RAII ガードにより、`read_line` から抜けると（正常復帰でもパニックでも）
//! 自動的に元の termios 設定が復元される。
//!
//! ## 表示更新
//!
//! 全行再描画方式。プロンプト + バッファ + 行末クリアを出力した後、`\r` + プロンプト +
//! カーソル前のテキストを再出力してカーソルを置く。端末自身に幅を計算させるので、
//! 全角文字や結合文字でも位置がずれない。すべて 1 回の `write(2)` で出力する。

use std::io::{self, BufRead};

use unicode_segmentation::UnicodeSegmentation;

use crate::complete::{self, CommandUniverse};
use crate::history::History;

// ── RawMode ガード ────────────────────────────────────────────────

/// RAII ガードで raw モードを管理する。Drop で元の termios を自動復元する。
///
/// ## termios 設定
///
/// | フラグ | 操作 | 理由 |
/// |--------|------|------|
/// | `c_iflag` | `BRKINT\|ICRNL\|INPCK\|ISTRIP\|IXON` OFF | CR→LF 変換を無効化、フロー制御を無効化 |
/// | `c_oflag` | `OPOST` ON のまま | `\n` → `\r\n` 自動変換を維持 |
/// | `c_cflag` | `CS8` ON | 8 ビットクリーンな入力 |
/// | `c_lflag` | `ECHO\|ICANON\|IEXTEN\|ISIG` OFF | エコー無効、1 バイトずつ読み取り、Ctrl+C/Z をキー入力として受信 |
/// | `VMIN`/`VTIME` | `1` / `0` | 最低 1 バイトで即座に返る |
struct RawMode {
    orig: libc::termios,
    fd: i32,
}

impl RawMode {
    /// 現在の設定を保存し raw モードを適用する。端末でなければエラー。
    fn enable(fd: i32) -> io::Result<Self> {
        let mut orig: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut orig) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut raw = orig;
        raw.c_iflag &= !(libc::BRKINT | libc::ICRNL | libc::INPCK | libc::ISTRIP | libc::IXON);
        raw.c_cflag |= libc::CS8;
        raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::IEXTEN | libc::ISIG);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;
        if unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &raw) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { orig, fd })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSAFLUSH, &self.orig);
        }
    }
}

// ── Key 入力 ──────────────────────────────────────────────────────

/// raw モードで読み取ったキー入力。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Key {
    Char(char),
    Enter,
    /// DEL `0x7f` または BS `0x08`。
    Backspace,
    /// `ESC [ 3 ~`
    Delete,
    Left,
    Right,
    Up,
    Down,
    Home,
    End,
    Tab,
    /// 行頭へ移動。
    CtrlA,
    /// 入力破棄 / 検索キャンセル。
    CtrlC,
    /// 空バッファなら EOF、それ以外はカーソル位置を削除。
    CtrlD,
    /// 行末へ移動。
    CtrlE,
    /// 検索キャンセル。
    CtrlG,
    CtrlK,
    CtrlL,
    /// インクリメンタル逆方向検索。
    CtrlR,
    CtrlU,
    CtrlW,
    /// 未対応のバイト列。無視される。
    Unknown,
}

/// 1 バイト読み取る。`EINTR` は再試行し、EOF・エラーは `None`。
fn read_byte(fd: i32) -> Option<u8> {
    let mut buf = [0u8; 1];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
        if n == 1 {
            return Some(buf[0]);
        }
        if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return None;
    }
}

/// ESC (`\x1b`) 後のエスケープシーケンスを解析する。
///
/// `poll(fd, POLLIN, 50ms)` で後続バイトの有無を判定し、
/// タイムアウトすれば ESC 単独として `Unknown` を返す。
fn read_escape_seq(fd: i32) -> Key {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    if unsafe { libc::poll(&mut pfd, 1, 50) } <= 0 {
        return Key::Unknown;
    }

    match read_byte(fd) {
        Some(b'[') | Some(b'O') => {}
        _ => return Key::Unknown,
    }

    let tilde = |key: Key| {
        if read_byte(fd) == Some(b'~') {
            key
        } else {
            Key::Unknown
        }
    };
    match read_byte(fd) {
        Some(b'A') => Key::Up,
        Some(b'B') => Key::Down,
        Some(b'C') => Key::Right,
        Some(b'D') => Key::Left,
        Some(b'H') => Key::Home,
        Some(b'F') => Key::End,
        Some(b'1') | Some(b'7') => tilde(Key::Home),
        Some(b'3') => tilde(Key::Delete),
        Some(b'4') | Some(b'8') => tilde(Key::End),
        _ => Key::Unknown,
    }
}

/// UTF-8 マルチバイト文字の残りのバイトを読み取る。
fn read_utf8(fd: i32, first: u8, expected_len: usize) -> Key {
    let mut buf = [0u8; 4];
    buf[0] = first;
    for slot in buf.iter_mut().take(expected_len).skip(1) {
        match read_byte(fd) {
            Some(b) => *slot = b,
            None => return Key::Unknown,
        }
    }
    match std::str::from_utf8(&buf[..expected_len]) {
        Ok(s) => s.chars().next().map_or(Key::Unknown, Key::Char),
        Err(_) => Key::Unknown,
    }
}

/// `fd` から 1 キー分のバイト列を読み取る。入力が閉じていれば `None`。
fn read_key(fd: i32) -> Option<Key> {
    let byte = read_byte(fd)?;
    let key = match byte {
        b'\r' | b'\n' => Key::Enter,
        0x7f | 0x08 => Key::Backspace,
        0x1b => read_escape_seq(fd),
        0x09 => Key::Tab,
        0x01 => Key::CtrlA,
        0x03 => Key::CtrlC,
        0x04 => Key::CtrlD,
        0x05 => Key::CtrlE,
        0x07 => Key::CtrlG,
        0x0b => Key::CtrlK,
        0x0c => Key::CtrlL,
        0x12 => Key::CtrlR,
        0x15 => Key::CtrlU,
        0x17 => Key::CtrlW,
        b if (32..127).contains(&b) => Key::Char(b as char),
        b if b & 0xE0 == 0xC0 => read_utf8(fd, b, 2),
        b if b & 0xF0 == 0xE0 => read_utf8(fd, b, 3),
        b if b & 0xF8 == 0xF0 => read_utf8(fd, b, 4),
        _ => Key::Unknown,
    };
    Some(key)
}

// ── モードと遷移結果 ──────────────────────────────────────────────

/// インクリメンタル検索の状態。
#[derive(Debug, Clone, PartialEq)]
pub struct SearchState {
    pub query: String,
    /// 表示中の一致エントリのインデックス。
    pub matched: Option<usize>,
    /// 直前の検索が失敗したか。失敗しても `matched` は保持する。
    pub failed: bool,
    /// 検索開始前のバッファとカーソル（キャンセル時に復元）。
    saved_buf: String,
    saved_cursor: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Editing,
    /// ↑↓ で履歴を閲覧中。バッファには表示中のエントリが入っている。
    Browsing,
    Search(SearchState),
}

/// キー処理の結果。入力継続の場合は `None` が返る。
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Submitted(String),
    Eof,
}

/// 再描画以外に必要な表示。
#[derive(Debug, PartialEq)]
pub enum Notice {
    Bell,
    /// 補完候補の一覧。
    Candidates(Vec<String>),
    ClearScreen,
    /// Ctrl+C で行を破棄した。
    Interrupted,
}

// ── LineEditor ────────────────────────────────────────────────────

/// 行エディタ本体。入力バッファ、カーソル位置、モードを保持する。
///
/// 履歴は [`ShellState`](crate::shell::ShellState) が所有し、呼び出しごとに借りる。
pub struct LineEditor {
    buf: String,
    /// カーソルのバイトオフセット。常に書記素クラスタ境界上にある。
    cursor: usize,
    mode: Mode,
    notice: Option<Notice>,
    fd: i32,
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new()
    }
}

impl LineEditor {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            cursor: 0,
            mode: Mode::Editing,
            notice: None,
            fd: libc::STDIN_FILENO,
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buf
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// 保留中の表示要求を取り出す。
    pub fn take_notice(&mut self) -> Option<Notice> {
        self.notice.take()
    }

    fn reset(&mut self, history: &mut History) {
        self.buf.clear();
        self.cursor = 0;
        self.mode = Mode::Editing;
        self.notice = None;
        history.reset_nav();
    }

    /// プロンプトを表示し、1 行読み取る。
    /// Enter → `Some(line)`, Ctrl+D (空バッファ) または入力終了 → `None`。
    ///
    /// 標準入力が端末でなければ、行エディタを使わず 1 行ずつ読む。
    pub fn read_line(
        &mut self,
        prompt: &str,
        history: &mut History,
        universe: &CommandUniverse,
    ) -> Option<String> {
        self.reset(history);

        let _raw = match RawMode::enable(self.fd) {
            Ok(raw) => raw,
            Err(_) => return read_plain_line(),
        };
        write_all(&self.render(prompt, history));

        loop {
            let Some(key) = read_key(self.fd) else {
                write_all("\n");
                return None;
            };
            let outcome = self.handle_key(key, history, universe);
            match self.take_notice() {
                Some(Notice::Bell) => write_all("\x07"),
                Some(Notice::Candidates(list)) => write_all(&format!("\n{}\n", list.join("  "))),
                Some(Notice::ClearScreen) => write_all("\x1b[2J\x1b[H"),
                Some(Notice::Interrupted) => write_all("^C\n"),
                None => {}
            }
            match outcome {
                Some(Outcome::Submitted(line)) => {
                    write_all(&self.render(prompt, history));
                    write_all("\n");
                    return Some(line);
                }
                Some(Outcome::Eof) => {
                    write_all("\n");
                    return None;
                }
                None => write_all(&self.render(prompt, history)),
            }
        }
    }

    /// 1 キー分の状態遷移。
    pub fn handle_key(
        &mut self,
        key: Key,
        history: &mut History,
        universe: &CommandUniverse,
    ) -> Option<Outcome> {
        match std::mem::replace(&mut self.mode, Mode::Editing) {
            Mode::Editing => self.handle_editing(key, history, universe),
            Mode::Browsing => self.handle_browsing(key, history, universe),
            Mode::Search(state) => self.handle_search(state, key, history, universe),
        }
    }

    // ── Editing ───────────────────────────────────────────────────

    fn handle_editing(
        &mut self,
        key: Key,
        history: &mut History,
        universe: &CommandUniverse,
    ) -> Option<Outcome> {
        match key {
            Key::Enter => {
                history.reset_nav();
                return Some(Outcome::Submitted(self.buf.clone()));
            }
            Key::CtrlD => {
                if self.buf.is_empty() {
                    return Some(Outcome::Eof);
                }
                self.delete_grapheme_at();
            }
            Key::CtrlC => {
                self.buf.clear();
                self.cursor = 0;
                history.reset_nav();
                self.notice = Some(Notice::Interrupted);
            }
            Key::CtrlG | Key::Unknown => {}
            Key::Char(ch) => self.insert_char(ch),
            Key::Backspace => self.delete_grapheme_before(),
            Key::Delete => self.delete_grapheme_at(),
            Key::Left => self.move_left(),
            Key::Right => self.move_right(),
            Key::Home | Key::CtrlA => self.cursor = 0,
            Key::End | Key::CtrlE => self.cursor = self.buf.len(),
            Key::CtrlK => self.buf.truncate(self.cursor),
            Key::CtrlU => {
                self.buf.drain(..self.cursor);
                self.cursor = 0;
            }
            Key::CtrlW => self.kill_word_back(),
            Key::CtrlL => self.notice = Some(Notice::ClearScreen),
            Key::Tab => self.do_complete(universe),
            Key::Up => self.history_prev(history),
            Key::Down => {}
            Key::CtrlR => self.start_search(history),
        }
        None
    }

    // ── Browsing ──────────────────────────────────────────────────

    fn handle_browsing(
        &mut self,
        key: Key,
        history: &mut History,
        universe: &CommandUniverse,
    ) -> Option<Outcome> {
        match key {
            Key::Up => self.history_prev(history),
            Key::Down => self.history_next(history),
            Key::CtrlR => self.start_search(history),
            _ => {
                // 表示中のエントリを編集の起点にする
                history.reset_nav();
                return self.handle_editing(key, history, universe);
            }
        }
        None
    }

    /// ↑: 履歴を一つ遡る。初回は現在のバッファを保存する。
    fn history_prev(&mut self, history: &mut History) {
        if history.at_end() {
            history.save_current(&self.buf);
        }
        if let Some(entry) = history.prev() {
            self.buf = entry.to_string();
            self.cursor = self.buf.len();
        }
        if !history.at_end() {
            self.mode = Mode::Browsing;
        }
    }

    /// ↓: 履歴を一つ進む。末尾に戻ったら保存しておいたバッファを復元して Editing へ。
    fn history_next(&mut self, history: &mut History) {
        if let Some(entry) = history.next() {
            self.buf = entry.to_string();
            self.cursor = self.buf.len();
        }
        self.mode = if history.at_end() {
            Mode::Editing
        } else {
            Mode::Browsing
        };
    }

    // ── Search ────────────────────────────────────────────────────

    fn start_search(&mut self, history: &History) {
        let matched = history.len().checked_sub(1);
        self.mode = Mode::Search(SearchState {
            query: String::new(),
            matched,
            failed: false,
            saved_buf: self.buf.clone(),
            saved_cursor: self.cursor,
        });
    }

    fn handle_search(
        &mut self,
        mut state: SearchState,
        key: Key,
        history: &mut History,
        universe: &CommandUniverse,
    ) -> Option<Outcome> {
        let newest = history.len().saturating_sub(1);
        match key {
            Key::Char(ch) => {
                state.query.push(ch);
                let from = state.matched.unwrap_or(newest);
                research(&mut state, history, Some(from));
            }
            Key::CtrlR => {
                let from = state.matched.and_then(|i| i.checked_sub(1));
                research(&mut state, history, from);
            }
            Key::Backspace => {
                state.query.pop();
                research(&mut state, history, Some(newest));
            }
            Key::Enter => {
                self.accept_match(&state, history);
                history.reset_nav();
                return Some(Outcome::Submitted(self.buf.clone()));
            }
            Key::CtrlC | Key::CtrlG => {
                self.buf = state.saved_buf;
                self.cursor = state.saved_cursor;
                history.reset_nav();
                return None;
            }
            _ => {
                self.accept_match(&state, history);
                history.reset_nav();
                return self.handle_editing(key, history, universe);
            }
        }
        self.mode = Mode::Search(state);
        None
    }

    /// 一致エントリ（なければ検索前のバッファ）を編集バッファに取り込む。
    fn accept_match(&mut self, state: &SearchState, history: &History) {
        self.buf = match state.matched.and_then(|i| history.get(i)) {
            Some(entry) => entry.to_string(),
            None => state.saved_buf.clone(),
        };
        self.cursor = self.buf.len();
    }

    // ── バッファ操作 ──────────────────────────────────────────────

    fn insert_char(&mut self, ch: char) {
        self.buf.insert(self.cursor, ch);
        self.cursor += ch.len_utf8();
        // 結合文字が直前のクラスタに吸収された場合も境界上に保つ
        self.cursor = next_boundary(&self.buf, prev_boundary(&self.buf, self.cursor));
    }

    fn delete_grapheme_before(&mut self) {
        if self.cursor > 0 {
            let prev = prev_boundary(&self.buf, self.cursor);
            self.buf.drain(prev..self.cursor);
            self.cursor = prev;
        }
    }

    fn delete_grapheme_at(&mut self) {
        if self.cursor < self.buf.len() {
            let next = next_boundary(&self.buf, self.cursor);
            self.buf.drain(self.cursor..next);
        }
    }

    fn move_left(&mut self) {
        self.cursor = prev_boundary(&self.buf, self.cursor);
    }

    fn move_right(&mut self) {
        self.cursor = next_boundary(&self.buf, self.cursor);
    }

    /// Ctrl+W: カーソル手前の空白と、その前の単語を削除する。
    fn kill_word_back(&mut self) {
        let before = &self.buf[..self.cursor];
        let word_end = before.trim_end_matches(' ').len();
        let start = before[..word_end].rfind(' ').map_or(0, |i| i + 1);
        self.buf.drain(start..self.cursor);
        self.cursor = start;
    }

    // ── Tab 補完 ──────────────────────────────────────────────────

    /// - 候補 0 件 → ベル
    /// - 候補 1 件 → 単語を置換し、末尾にスペース（ディレクトリなら `/` のまま）
    /// - 候補複数 → 共通接頭辞まで補完し、候補一覧を表示
    fn do_complete(&mut self, universe: &CommandUniverse) {
        let result = complete::complete(&self.buf, self.cursor, universe);
        match result.candidates.as_slice() {
            [] => self.notice = Some(Notice::Bell),
            [only] => {
                let suffix = if only.ends_with('/') { "" } else { " " };
                let new_word = format!("{}{}", only, suffix);
                self.buf
                    .replace_range(result.word_start..result.word_end, &new_word);
                self.cursor = result.word_start + new_word.len();
            }
            candidates => {
                let common = complete::longest_common_prefix(candidates);
                if common.len() > result.word_end - result.word_start {
                    let common = common.to_string();
                    self.buf
                        .replace_range(result.word_start..result.word_end, &common);
                    self.cursor = result.word_start + common.len();
                }
                self.notice = Some(Notice::Candidates(result.candidates.clone()));
            }
        }
    }

    // ── 表示 ──────────────────────────────────────────────────────

    /// 現在の状態を描画するエスケープシーケンス付き文字列。
    pub fn render(&self, prompt: &str, history: &History) -> String {
        let mut out = String::from("\r");
        match &self.mode {
            Mode::Search(state) => {
                let label = if state.failed {
                    "(failed reverse-i-search)"
                } else {
                    "(reverse-i-search)"
                };
                let text = state.matched.and_then(|i| history.get(i)).unwrap_or("");
                out.push_str(&format!("{}`{}': {}", label, state.query, text));
                out.push_str("\x1b[K");
            }
            Mode::Editing | Mode::Browsing => {
                out.push_str(prompt);
                out.push_str(&self.buf);
                out.push_str("\x1b[K");
                if self.cursor < self.buf.len() {
                    out.push('\r');
                    out.push_str(prompt);
                    out.push_str(&self.buf[..self.cursor]);
                }
            }
        }
        out
    }
}

/// `state.query` で `from` 以前を検索し直す。見つからなければ失敗扱いで一致は保持する。
fn research(state: &mut SearchState, history: &History, from: Option<usize>) {
    match from.and_then(|start| history.find_before(&state.query, start)) {
        Some(i) => {
            state.matched = Some(i);
            state.failed = false;
        }
        None => state.failed = true,
    }
}

fn prev_boundary(buf: &str, cursor: usize) -> usize {
    buf[..cursor]
        .grapheme_indices(true)
        .next_back()
        .map_or(0, |(i, _)| i)
}

fn next_boundary(buf: &str, cursor: usize) -> usize {
    buf[cursor..]
        .graphemes(true)
        .next()
        .map_or(buf.len(), |g| cursor + g.len())
}

/// 端末でない標準入力から 1 行読む。末尾の改行は除く。
fn read_plain_line() -> Option<String> {
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            if line.ends_with('\n') {
                line.pop();
            }
            Some(line)
        }
    }
}

/// libc::write で直接出力する（Rust の stdout バッファをバイパス）。
fn write_all(s: &str) {
    let bytes = s.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
        let n = unsafe {
            libc::write(
                libc::STDOUT_FILENO,
                bytes[written..].as_ptr() as *const libc::c_void,
                bytes.len() - written,
            )
        };
        if n <= 0 {
            break;
        }
        written += n as usize;
    }
}

// ── Tests ─────────────────────────────────────────────────────────
