//! トークナイザ + パーサー: 1 行の入力から [`Pipeline`] を構築する。
//!
//! 手書きトークナイザで可能な限りゼロコピー（[`Cow::Borrowed`]）のトークン列を生成し、
//! 先頭ワードのエイリアス展開（1 段のみ）を行ったあと、ループベースで AST に組み立てる。
//!
//! ## 対応構文
//!
//! - パイプライン: `cmd1 | cmd2 | cmd3`
//! - リダイレクト: `>`, `>>`, `<`, `2>`, fd 複製 `2>&1` / `>&2`
//! - クォート: シングル (`'...'`) はリテラル、ダブル (`"..."`) は変数展開あり。
//!   隣接するセグメントは 1 ワードに連結される（`a"b c"'d'` → `ab cd`）
//! - 変数展開: `$VAR`, `${VAR}`, `$?`
//! - コマンド置換パススルー: `$(cmd)`, `` `cmd` ``: パーサーでは展開せず、
//!   ワード内の範囲を [`Word::substitutions`] に記録して executor に委ねる
//! - チルダ展開: クォート外のワード先頭（または `VAR=` の直後）の `~` / `~user`
//! - バックグラウンド実行: 行末の `&`
//!
//! `&&`, `||`, `;` は未対応で、黙って落とさず [`ParseError::UnsupportedOperator`] を返す。

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, Range};

use thiserror::Error;

// ── AST ─────────────────────────────────────────────────────────────

/// パイプラインで接続されたコマンド列。`cmd1 | cmd2 | cmd3` → 3 要素。
///
/// `background` が `true` のとき、executor は待機せずジョブとして登録する。
#[derive(Debug, PartialEq)]
pub struct Pipeline<'a> {
    pub commands: Vec<Command<'a>>,
    /// 行末に `&` が指定された場合に `true`。
    pub background: bool,
}

/// 単一コマンド（パイプラインの 1 段）。引数リストとリダイレクト指定を持つ。
#[derive(Debug, PartialEq)]
pub struct Command<'a> {
    pub args: Vec<Word<'a>>,
    pub redirects: Vec<Redirect<'a>>,
}

impl Command<'_> {
    /// `args[0]`。パーサーは空のコマンドを作らないので常に存在する。
    pub fn name(&self) -> &str {
        self.args.first().map(|a| a.text.as_ref()).unwrap_or("")
    }
}

/// 1 ワード。クォート除去・変数展開・チルダ展開を済ませたテキストを持つ。
///
/// クォート・エスケープ・展開のないワードは入力文字列を借用する。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Word<'a> {
    pub text: Cow<'a, str>,
    /// `text` 内でコマンド置換すべき `$(...)` / `` `...` `` のバイト範囲。
    /// クォート外かダブルクォート内に書かれたものだけで、シングルクォート内や
    /// 変数の値に含まれる同じ文字列は入らない。
    pub substitutions: Vec<Range<usize>>,
    /// クォートかバックスラッシュを含んでいた。エイリアス展開の対象外。
    pub quoted: bool,
}

impl<'a> Word<'a> {
    fn push_str(&mut self, s: &'a str) {
        if self.text.is_empty() {
            self.text = Cow::Borrowed(s);
        } else {
            self.text.to_mut().push_str(s);
        }
    }

    fn push_substitution(&mut self, span: &str) {
        let buf = self.text.to_mut();
        let start = buf.len();
        buf.push_str(span);
        self.substitutions.push(start..buf.len());
    }
}

impl<'a> From<&'a str> for Word<'a> {
    fn from(s: &'a str) -> Self {
        Word {
            text: Cow::Borrowed(s),
            ..Word::default()
        }
    }
}

impl Deref for Word<'_> {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

impl PartialEq<&str> for Word<'_> {
    fn eq(&self, other: &&str) -> bool {
        self.text == *other
    }
}

impl fmt::Display for Word<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// ファイルリダイレクト指定。
#[derive(Debug, PartialEq)]
pub struct Redirect<'a> {
    pub kind: RedirectKind,
    pub target: Word<'a>,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum RedirectKind {
    /// `>`: stdout を上書き
    Output,
    /// `>>`: stdout に追記
    Append,
    /// `<`: stdin をファイルから読み取り
    Input,
    /// `2>`: stderr を上書き
    Stderr,
    /// `N>&M`: src_fd を dst_fd の複製にする
    FdDup { src_fd: i32, dst_fd: i32 },
}

// ── Error ───────────────────────────────────────────────────────────

/// パース時に発生しうるエラー。いずれも回復可能で、入力行は破棄される。
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    /// クォートが閉じられていない。引数は開始クォート文字。
    #[error("unexpected EOF while looking for matching `{0}'")]
    UnclosedQuote(char),
    /// パイプや `&` の前後にコマンドがない。
    #[error("syntax error: empty command in pipeline")]
    EmptyCommand,
    /// `&&` / `||` / `;` など未対応の演算子。
    #[error("syntax error near unexpected token `{0}'")]
    UnsupportedOperator(&'static str),
    /// リダイレクト演算子の後にターゲットがない。
    #[error("syntax error: missing redirect target")]
    MissingRedirectTarget,
    /// fd 複製リダイレクトの dst_fd が数値でない。
    #[error("syntax error: invalid file descriptor in redirect")]
    BadFdRedirect,
    /// `&` の後にまだトークンが続いている。
    #[error("syntax error: `&' must be the last token")]
    TrailingAmpersand,
}

// ── Tilde expansion ─────────────────────────────────────────────────

/// チルダ展開: `~` → $HOME, `~/path` → $HOME/path, `~user` → user のホーム。
/// `VAR=~/foo` のように `=` 直後のチルダも展開する。
pub fn expand_tilde(s: &str) -> Cow<'_, str> {
    if !s.starts_with('~') {
        if let Some(eq) = s.find('=') {
            if s[eq + 1..].starts_with('~') {
                let (key, val) = s.split_at(eq + 1);
                if let Cow::Owned(expanded) = expand_tilde_prefix(val) {
                    return Cow::Owned(format!("{}{}", key, expanded));
                }
            }
        }
        return Cow::Borrowed(s);
    }
    expand_tilde_prefix(s)
}

fn expand_tilde_prefix(s: &str) -> Cow<'_, str> {
    let rest_start = s[1..].find('/').map(|i| i + 1).unwrap_or(s.len());
    match home_dir(&s[1..rest_start]) {
        Some(h) => Cow::Owned(format!("{}{}", h, &s[rest_start..])),
        None => Cow::Borrowed(s),
    }
}

/// `~` なら $HOME、`~user` なら user のホーム。
fn home_dir(user: &str) -> Option<String> {
    if user.is_empty() {
        std::env::var("HOME").ok()
    } else {
        home_of(user)
    }
}

/// 裸セグメント `body` の先頭（または最初の `=` の直後）にあるチルダプレフィックスを探す。
///
/// 返り値は `(チルダの位置, プレフィックスの終端, ホームディレクトリ)`。
/// ワードの途中から始まるセグメントや、プレフィックスにエスケープ・展開・クォートが
/// 混じる場合は展開しない。`at_word_end` はセグメントの直後でワードが終わるかどうか。
fn tilde_prefix(body: &str, word_start: bool, at_word_end: bool) -> Option<(usize, usize, String)> {
    if !word_start {
        return None;
    }
    let tilde = if body.starts_with('~') {
        0
    } else {
        let eq = body.find('=')?;
        if body[..eq].contains(['\\', '$', '`']) || !body[eq + 1..].starts_with('~') {
            return None;
        }
        eq + 1
    };
    let end = match body[tilde..].find('/') {
        Some(i) => tilde + i,
        None if at_word_end => body.len(),
        None => return None,
    };
    let user = &body[tilde + 1..end];
    if user.contains(['\\', '$', '`']) {
        return None;
    }
    home_dir(user).map(|home| (tilde, end, home))
}

/// `getpwnam` で user のホームディレクトリを引く。
fn home_of(user: &str) -> Option<String> {
    let c_user = std::ffi::CString::new(user).ok()?;
    let pw = unsafe { libc::getpwnam(c_user.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let dir = unsafe { std::ffi::CStr::from_ptr((*pw).pw_dir) };
    dir.to_str().ok().map(str::to_string)
}

// ── Variable expansion (crate-private) ──────────────────────────────

fn is_var_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_var_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// `s[pos]` が `(` を指している前提で、対応する `)` の直後の位置を返す。
/// シングルクォート内の括弧は数えない。
fn matching_paren(s: &str, mut pos: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(pos + 1);
                }
            }
            b'\'' => {
                pos += 1;
                while pos < bytes.len() && bytes[pos] != b'\'' {
                    pos += 1;
                }
            }
            _ => {}
        }
        pos += 1;
    }
    None
}

/// [`matching_paren`] の閉じていない場合を `s.len()` にしたもの。
fn skip_parens(s: &str, pos: usize) -> usize {
    matching_paren(s, pos).unwrap_or(s.len())
}

/// コマンド置換の範囲（`$(...)` か `` `...` ``）から実行するコマンドを取り出す。
/// 閉じていない置換は末尾までがコマンドになる。
pub fn substitution_command(span: &str) -> &str {
    if span.starts_with("$(") {
        return match matching_paren(span, 1) {
            Some(end) => &span[2..end - 1],
            None => &span[2..],
        };
    }
    let inner = span.strip_prefix('`').unwrap_or(span);
    inner.strip_suffix('`').unwrap_or(inner)
}

/// `$` の直後（`pos`）から展開を 1 つ処理して `buf` に追加し、次の読み取り位置を返す。
///
/// - `$?` は直前の終了ステータス
/// - `${NAME}` / `$NAME` は環境変数。未定義なら空文字
/// - それ以外は `$` 自体をリテラルとして残す
fn expand_dollar(s: &str, pos: usize, buf: &mut String, last_status: i32) -> usize {
    let bytes = s.as_bytes();
    match bytes.get(pos) {
        Some(b'?') => {
            buf.push_str(&last_status.to_string());
            pos + 1
        }
        Some(b'{') => {
            let start = pos + 1;
            let len = bytes[start..].iter().take_while(|&&b| is_var_char(b)).count();
            let end = start + len;
            if len > 0 && bytes.get(end) == Some(&b'}') {
                if let Ok(val) = std::env::var(&s[start..end]) {
                    buf.push_str(&val);
                }
                end + 1
            } else {
                // 閉じ `}` がない → `$` だけ出して `{` 以降は通常文字として読む
                buf.push('$');
                pos
            }
        }
        Some(&b) if is_var_start(b) => {
            let len = bytes[pos..].iter().take_while(|&&b| is_var_char(b)).count();
            if let Ok(val) = std::env::var(&s[pos..pos + len]) {
                buf.push_str(&val);
            }
            pos + len
        }
        _ => {
            buf.push('$');
            pos
        }
    }
}

/// エスケープ解除と変数展開を行い、結果を `word` に追加する。`dquote` はダブルクォート内の規則を使うかどうか。
///
/// ダブルクォート内では `\"`, `\\`, `\$`, `` \` `` のみがエスケープで、
/// それ以外のバックスラッシュは残る。裸ワードでは `\X` は常に `X`。
/// `$(...)` とバッククォートはそのまま残し、範囲を置換対象として記録する。
fn unescape_and_expand(body: &str, dquote: bool, last_status: i32, word: &mut Word<'_>) {
    let mut i = 0;
    while let Some(ch) = body[i..].chars().next() {
        match ch {
            '\\' => match body[i + 1..].chars().next() {
                Some(next) if !dquote || matches!(next, '"' | '\\' | '$' | '`') => {
                    word.text.to_mut().push(next);
                    i += 1 + next.len_utf8();
                }
                _ => {
                    word.text.to_mut().push('\\');
                    i += 1;
                }
            },
            '$' if body[i + 1..].starts_with('(') => {
                let end = skip_parens(body, i + 1);
                word.push_substitution(&body[i..end]);
                i = end;
            }
            '$' => i = expand_dollar(body, i + 1, word.text.to_mut(), last_status),
            '`' => {
                let end = body[i + 1..]
                    .find('`')
                    .map(|p| i + 1 + p + 1)
                    .unwrap_or(body.len());
                word.push_substitution(&body[i..end]);
                i = end;
            }
            _ => {
                word.text.to_mut().push(ch);
                i += ch.len_utf8();
            }
        }
    }
}

// ── Tokenizer (crate-private) ───────────────────────────────────────

enum Token<'a> {
    Word(Word<'a>),
    Pipe,             // |
    Ampersand,        // &
    RedirectOut,      // >
    RedirectAppend,   // >>
    RedirectIn,       // <
    RedirectErr,      // 2>
    FdDupPrefix(i32), // N>&: 次の Word が dst_fd
}

/// 裸ワードを終端させるバイト。
fn is_word_break(b: u8) -> bool {
    matches!(
        b,
        b' ' | b'\t' | b'\n' | b'\r' | b'|' | b'&' | b'>' | b'<' | b';'
    )
}

/// 入力文字列をトークン列に変換するイテレータ。
struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
    last_status: i32,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str, last_status: i32) -> Self {
        Self {
            input,
            pos: 0,
            last_status,
        }
    }

    fn skip_whitespace(&mut self) {
        let bytes = self.input.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.as_bytes().get(self.pos + offset).copied()
    }

    /// クォート・裸セグメントを連結して 1 ワードを読む。
    /// 単一セグメントで展開が不要なら借用のまま返す。
    fn read_word(&mut self) -> Result<Word<'a>, ParseError> {
        let mut word = Word::default();
        while let Some(b) = self.peek() {
            match b {
                b'\'' => self.read_single_quoted(&mut word)?,
                b'"' => self.read_double_quoted(&mut word)?,
                b if is_word_break(b) => break,
                _ => self.read_bare(&mut word),
            }
        }
        Ok(word)
    }

    fn read_single_quoted(&mut self, word: &mut Word<'a>) -> Result<(), ParseError> {
        let start = self.pos + 1;
        let len = self.input[start..]
            .find('\'')
            .ok_or(ParseError::UnclosedQuote('\''))?;
        self.pos = start + len + 1;
        word.quoted = true;
        word.push_str(&self.input[start..start + len]);
        Ok(())
    }

    fn read_double_quoted(&mut self, word: &mut Word<'a>) -> Result<(), ParseError> {
        let bytes = self.input.as_bytes();
        let start = self.pos + 1;
        let mut end = start;
        loop {
            match bytes.get(end) {
                None => return Err(ParseError::UnclosedQuote('"')),
                Some(b'"') => break,
                Some(b'\\') => end += 2,
                Some(_) => end += 1,
            }
        }
        self.pos = end + 1;
        word.quoted = true;
        let body = &self.input[start..end];
        if body.contains(['\\', '$', '`']) {
            unescape_and_expand(body, true, self.last_status, word);
        } else {
            word.push_str(body);
        }
        Ok(())
    }

    /// クォート外のセグメント。`$(...)` とバッククォートの中身はスペースを含んでもまとめて読む。
    fn read_bare(&mut self, word: &mut Word<'a>) {
        let bytes = self.input.as_bytes();
        let start = self.pos;
        while self.pos < bytes.len() {
            match bytes[self.pos] {
                b'\'' | b'"' => break,
                b if is_word_break(b) => break,
                b'\\' => self.pos = (self.pos + 2).min(bytes.len()),
                b'$' if bytes.get(self.pos + 1) == Some(&b'(') => {
                    self.pos = skip_parens(self.input, self.pos + 1);
                }
                b'`' => {
                    self.pos = self.input[self.pos + 1..]
                        .find('`')
                        .map(|p| self.pos + 1 + p + 1)
                        .unwrap_or(bytes.len());
                }
                _ => self.pos += 1,
            }
        }
        // `\` がマルチバイト文字を飛ばした場合でも文字境界に揃える
        while !self.input.is_char_boundary(self.pos) {
            self.pos += 1;
        }
        let mut body = &self.input[start..self.pos];

        let word_start = word.text.is_empty() && !word.quoted;
        let at_word_end = self.peek().map_or(true, is_word_break);
        if let Some((tilde, end, home)) = tilde_prefix(body, word_start, at_word_end) {
            let buf = word.text.to_mut();
            buf.push_str(&body[..tilde]);
            buf.push_str(&home);
            body = &body[end..];
        }

        if body.contains('\\') {
            word.quoted = true;
        }
        if body.contains(['\\', '$', '`']) {
            unescape_and_expand(body, false, self.last_status, word);
        } else {
            word.push_str(body);
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Result<Token<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_whitespace();
        let ch = self.peek()?;

        let token = match ch {
            b'|' => {
                if self.peek_at(1) == Some(b'|') {
                    return Some(Err(ParseError::UnsupportedOperator("||")));
                }
                self.pos += 1;
                Token::Pipe
            }
            b'&' => {
                if self.peek_at(1) == Some(b'&') {
                    return Some(Err(ParseError::UnsupportedOperator("&&")));
                }
                self.pos += 1;
                Token::Ampersand
            }
            b';' => return Some(Err(ParseError::UnsupportedOperator(";"))),
            b'>' => match self.peek_at(1) {
                Some(b'>') => {
                    self.pos += 2;
                    Token::RedirectAppend
                }
                Some(b'&') => {
                    self.pos += 2;
                    Token::FdDupPrefix(1) // >&M は 1>&M の省略形
                }
                _ => {
                    self.pos += 1;
                    Token::RedirectOut
                }
            },
            b'<' => {
                self.pos += 1;
                Token::RedirectIn
            }
            // トークン先頭の `2>` のみ。`file2>` 等の途中はワードとして読まれる。
            b'2' if self.peek_at(1) == Some(b'>') => {
                if self.peek_at(2) == Some(b'&') {
                    self.pos += 3;
                    Token::FdDupPrefix(2)
                } else {
                    self.pos += 2;
                    Token::RedirectErr
                }
            }
            _ => match self.read_word() {
                Ok(w) => Token::Word(w),
                Err(e) => return Some(Err(e)),
            },
        };
        Some(Ok(token))
    }
}

// ── Alias expansion ─────────────────────────────────────────────────

/// 先頭トークンがエイリアス名なら、その値をトークン化して差し替える。
///
/// 差し替えたトークンは再検査しない（1 段のみ）。`foo=foo` のような自己参照でも
/// ループせず、`ll=ls -la` に加えて `ls=ll` があっても `ll` は展開されない。
/// `'ll'` や `\ll` のようにクォート・エスケープされた先頭ワードは展開しない。
fn expand_alias<'a>(
    tokens: &mut Vec<Token<'a>>,
    aliases: &'a HashMap<String, String>,
    last_status: i32,
) -> Result<(), ParseError> {
    let value = match tokens.first() {
        Some(Token::Word(w)) if !w.quoted => match aliases.get(w.text.as_ref()) {
            Some(v) => v,
            None => return Ok(()),
        },
        _ => return Ok(()),
    };
    let replacement = Tokenizer::new(value, last_status).collect::<Result<Vec<_>, _>>()?;
    tokens.splice(0..1, replacement);
    Ok(())
}

// ── Parser ──────────────────────────────────────────────────────────

/// 入力行をパースして [`Pipeline`] を返す。
///
/// - 空入力 → `Ok(None)`
/// - 正常なコマンド → `Ok(Some(Pipeline))`
/// - 構文エラー → `Err(ParseError)`（途中までのパイプラインは返さない）
///
/// `aliases` は先頭ワードの展開に、`last_status` は `$?` 展開に使用される。
pub fn parse<'a>(
    input: &'a str,
    aliases: &'a HashMap<String, String>,
    last_status: i32,
) -> Result<Option<Pipeline<'a>>, ParseError> {
    let mut tokens = Tokenizer::new(input, last_status).collect::<Result<Vec<_>, _>>()?;
    expand_alias(&mut tokens, aliases, last_status)?;
    build_pipeline(tokens)
}

fn build_pipeline(tokens: Vec<Token<'_>>) -> Result<Option<Pipeline<'_>>, ParseError> {
    let mut commands: Vec<Command<'_>> = Vec::new();
    let mut args: Vec<Word<'_>> = Vec::new();
    let mut redirects: Vec<Redirect<'_>> = Vec::new();
    let mut background = false;

    let mut tokens = tokens.into_iter();
    while let Some(token) = tokens.next() {
        if background {
            return Err(ParseError::TrailingAmpersand);
        }
        match token {
            Token::Word(w) => args.push(w),
            Token::Pipe => {
                if args.is_empty() {
                    return Err(ParseError::EmptyCommand);
                }
                commands.push(Command {
                    args: std::mem::take(&mut args),
                    redirects: std::mem::take(&mut redirects),
                });
            }
            Token::Ampersand => {
                if args.is_empty() {
                    return Err(ParseError::EmptyCommand);
                }
                background = true;
            }
            Token::RedirectOut | Token::RedirectAppend | Token::RedirectIn | Token::RedirectErr => {
                let kind = match token {
                    Token::RedirectOut => RedirectKind::Output,
                    Token::RedirectAppend => RedirectKind::Append,
                    Token::RedirectIn => RedirectKind::Input,
                    _ => RedirectKind::Stderr,
                };
                match tokens.next() {
                    Some(Token::Word(target)) => redirects.push(Redirect { kind, target }),
                    _ => return Err(ParseError::MissingRedirectTarget),
                }
            }
            Token::FdDupPrefix(src_fd) => match tokens.next() {
                Some(Token::Word(w)) => {
                    let dst_fd = w.text.parse::<i32>().map_err(|_| ParseError::BadFdRedirect)?;
                    redirects.push(Redirect {
                        kind: RedirectKind::FdDup { src_fd, dst_fd },
                        target: Word::default(),
                    });
                }
                _ => return Err(ParseError::MissingRedirectTarget),
            },
        }
    }

    if args.is_empty() {
        // 空行のみ None。末尾パイプやリダイレクトだけの行はエラー。
        if commands.is_empty() && redirects.is_empty() {
            return Ok(None);
        }
        return Err(ParseError::EmptyCommand);
    }
    commands.push(Command { args, redirects });

    Ok(Some(Pipeline {
        commands,
        background,
    }))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn no_aliases() -> HashMap<String, String> {
        HashMap::new()
    }

    /// 各コマンドの引数を文字列ベクタとして取り出す。
    fn parse_args(input: &str) -> Vec<Vec<String>> {
        let aliases = no_aliases();
        let p = parse(input, &aliases, 0).unwrap().unwrap();
        p.commands
            .iter()
            .map(|cmd| cmd.args.iter().map(|a| a.to_string()).collect())
            .collect()
    }

    fn parse_err(input: &str) -> ParseError {
        let aliases = no_aliases();
        parse(input, &aliases, 0).unwrap_err()
    }

    // ── 単純コマンド ──

    #[test]
    fn simple_command() {
        assert_eq!(
            parse_args("echo hello world"),
            vec![vec!["echo", "hello", "world"]],
        );
    }

    #[test]
    fn extra_whitespace() {
        assert_eq!(parse_args("  echo   hello  "), vec![vec!["echo", "hello"]]);
    }

    // ── クォート ──

    #[test]
    fn single_quotes() {
        assert_eq!(
            parse_args("echo 'hello world'"),
            vec![vec!["echo", "hello world"]],
        );
    }

    #[test]
    fn double_quotes() {
        assert_eq!(
            parse_args("echo \"hello world\""),
            vec![vec!["echo", "hello world"]],
        );
    }

    #[test]
    fn empty_quotes() {
        assert_eq!(parse_args("echo ''"), vec![vec!["echo", ""]]);
    }

    #[test]
    fn adjacent_segments_join() {
        assert_eq!(parse_args("echo a\"b c\"'d'"), vec![vec!["echo", "ab cd"]]);
    }

    #[test]
    fn operators_inside_quotes_are_literal() {
        assert_eq!(
            parse_args("echo 'a | b' \"c & d\""),
            vec![vec!["echo", "a | b", "c & d"]],
        );
    }

    // ── パイプライン ──

    #[test]
    fn three_stage_pipeline() {
        assert_eq!(
            parse_args("cat file | grep name | head -1"),
            vec![
                vec!["cat", "file"],
                vec!["grep", "name"],
                vec!["head", "-1"],
            ],
        );
    }

    #[test]
    fn pipe_without_spaces() {
        assert_eq!(parse_args("ls|wc"), vec![vec!["ls"], vec!["wc"]]);
    }

    // ── リダイレクト ──

    #[test]
    fn redirect_kinds() {
        let aliases = no_aliases();
        let p = parse("cmd < in.txt > out.txt 2> err.txt", &aliases, 0)
            .unwrap()
            .unwrap();
        let r = &p.commands[0].redirects;
        assert_eq!(r.len(), 3);
        assert_eq!(r[0].kind, RedirectKind::Input);
        assert_eq!(r[0].target, "in.txt");
        assert_eq!(r[1].kind, RedirectKind::Output);
        assert_eq!(r[2].kind, RedirectKind::Stderr);
        assert_eq!(p.commands[0].args, vec!["cmd"]);
    }

    #[test]
    fn redirect_append_no_space() {
        let aliases = no_aliases();
        let p = parse("echo hi >>out.txt", &aliases, 0).unwrap().unwrap();
        assert_eq!(p.commands[0].redirects[0].kind, RedirectKind::Append);
        assert_eq!(p.commands[0].redirects[0].target, "out.txt");
    }

    #[test]
    fn redirect_attaches_to_current_stage() {
        let aliases = no_aliases();
        let p = parse("cat < in.txt | grep hello > out.txt", &aliases, 0)
            .unwrap()
            .unwrap();
        assert_eq!(p.commands[0].redirects[0].kind, RedirectKind::Input);
        assert_eq!(p.commands[1].redirects[0].kind, RedirectKind::Output);
        assert_eq!(p.commands[1].redirects[0].target, "out.txt");
    }

    #[test]
    fn two_is_not_stderr_redirect_mid_word() {
        assert_eq!(parse_args("echo 2 > file"), vec![vec!["echo", "2"]]);
        assert_eq!(parse_args("echo file2>x"), vec![vec!["echo", "file2"]]);
    }

    #[test]
    fn fd_dup() {
        let aliases = no_aliases();
        let p = parse("cmd > out 2>&1", &aliases, 0).unwrap().unwrap();
        assert_eq!(
            p.commands[0].redirects[1].kind,
            RedirectKind::FdDup { src_fd: 2, dst_fd: 1 }
        );
        assert_eq!(parse_err("cmd 2>&abc"), ParseError::BadFdRedirect);
    }

    // ── 空入力 ──

    #[test]
    fn empty_input() {
        let aliases = no_aliases();
        assert!(parse("", &aliases, 0).unwrap().is_none());
        assert!(parse(" \t ", &aliases, 0).unwrap().is_none());
    }

    // ── エラーケース ──

    #[test]
    fn unclosed_quotes_never_yield_pipeline() {
        for input in ["echo 'hello", "echo \"hello", "a | b 'c", "ls \"x\\\"", "'"] {
            assert!(
                matches!(parse_err(input), ParseError::UnclosedQuote(_)),
                "input: {input}"
            );
        }
        assert_eq!(parse_err("echo 'a"), ParseError::UnclosedQuote('\''));
        assert_eq!(parse_err("echo \"a"), ParseError::UnclosedQuote('"'));
    }

    #[test]
    fn empty_pipeline_segments() {
        assert_eq!(parse_err("| ls"), ParseError::EmptyCommand);
        assert_eq!(parse_err("ls |"), ParseError::EmptyCommand);
        assert_eq!(parse_err("ls | | grep"), ParseError::EmptyCommand);
        assert_eq!(parse_err("|"), ParseError::EmptyCommand);
        assert_eq!(parse_err("&"), ParseError::EmptyCommand);
        assert_eq!(parse_err("> out"), ParseError::EmptyCommand);
    }

    #[test]
    fn boolean_combinators_rejected() {
        assert_eq!(parse_err("a && b"), ParseError::UnsupportedOperator("&&"));
        assert_eq!(parse_err("a || b"), ParseError::UnsupportedOperator("||"));
        assert_eq!(parse_err("a ; b"), ParseError::UnsupportedOperator(";"));
    }

    #[test]
    fn missing_redirect_target() {
        assert_eq!(parse_err("echo >"), ParseError::MissingRedirectTarget);
        assert_eq!(parse_err("echo > | cat"), ParseError::MissingRedirectTarget);
    }

    // ── background (&) ──

    #[test]
    fn background_flag() {
        let aliases = no_aliases();
        let p = parse("sleep 10 &", &aliases, 0).unwrap().unwrap();
        assert!(p.background);
        let p = parse("ls | grep foo &  ", &aliases, 0).unwrap().unwrap();
        assert!(p.background);
        assert_eq!(p.commands.len(), 2);
        let p = parse("ls", &aliases, 0).unwrap().unwrap();
        assert!(!p.background);
    }

    #[test]
    fn ampersand_must_be_last() {
        assert_eq!(parse_err("sleep 1 & echo"), ParseError::TrailingAmpersand);
        assert_eq!(parse_err("a & | b"), ParseError::TrailingAmpersand);
    }

    // ── 借用 ──

    #[test]
    fn plain_words_are_borrowed() {
        let aliases = no_aliases();
        let p = parse("echo hello 'a b' \"c\"", &aliases, 0).unwrap().unwrap();
        for arg in &p.commands[0].args {
            assert!(matches!(arg.text, Cow::Borrowed(_)), "expected Borrowed: {arg}");
        }
    }

    // ── 変数展開 ──

    #[test]
    fn expand_env_var() {
        std::env::set_var("KAZE_TEST_VAR", "hello");
        assert_eq!(
            parse_args("echo $KAZE_TEST_VAR ${KAZE_TEST_VAR}x \"<$KAZE_TEST_VAR>\""),
            vec![vec!["echo", "hello", "hellox", "<hello>"]],
        );
        std::env::remove_var("KAZE_TEST_VAR");
    }

    #[test]
    fn expand_last_status() {
        let aliases = no_aliases();
        let p = parse("echo $?", &aliases, 42).unwrap().unwrap();
        assert_eq!(p.commands[0].args[1], "42");
    }

    #[test]
    fn undefined_var_is_empty() {
        std::env::remove_var("KAZE_NONEXISTENT_VAR_XYZ");
        assert_eq!(
            parse_args("echo $KAZE_NONEXISTENT_VAR_XYZ"),
            vec![vec!["echo", ""]],
        );
    }

    #[test]
    fn single_quote_no_expand() {
        assert_eq!(parse_args("echo '$HOME'"), vec![vec!["echo", "$HOME"]]);
    }

    #[test]
    fn literal_dollars() {
        assert_eq!(parse_args("echo $ $! ${abc"), vec![vec!["echo", "$", "$!", "${abc"]]);
    }

    // ── エスケープ ──

    #[test]
    fn escapes() {
        assert_eq!(parse_args(r#"echo "a\"b""#), vec![vec!["echo", "a\"b"]]);
        assert_eq!(parse_args(r#"echo "\$HOME""#), vec![vec!["echo", "$HOME"]]);
        assert_eq!(parse_args(r#"echo "a\nb""#), vec![vec!["echo", "a\\nb"]]);
        assert_eq!(parse_args(r"echo file\ name"), vec![vec!["echo", "file name"]]);
        assert_eq!(parse_args(r"echo \$HOME \|"), vec![vec!["echo", "$HOME", "|"]]);
    }

    // ── コマンド置換パススルー ──

    #[test]
    fn command_substitution_passthrough() {
        assert_eq!(
            parse_args("echo $(echo a b) `date` \"now $(date)\""),
            vec![vec!["echo", "$(echo a b)", "`date`", "now $(date)"]],
        );
        assert_eq!(
            parse_args("echo $(echo $(whoami))"),
            vec![vec!["echo", "$(echo $(whoami))"]],
        );
    }

    #[test]
    fn substitution_spans_recorded_outside_single_quotes() {
        let aliases = no_aliases();
        let p = parse(r#"echo a$(b)c "x `y`" '$(z)' \$(w) '`v`'"#, &aliases, 0)
            .unwrap()
            .unwrap();
        let args = &p.commands[0].args;
        assert_eq!(args[1].substitutions, vec![1..5]);
        assert_eq!(&args[1][1..5], "$(b)");
        assert_eq!(args[2].substitutions, vec![2..5]);
        assert_eq!(args[3], "$(z)");
        assert!(args[3].substitutions.is_empty());
        assert_eq!(args[4], "$(w)");
        assert!(args[4].substitutions.is_empty());
        assert!(args[5].substitutions.is_empty());
    }

    #[test]
    fn variable_values_are_never_substitutions() {
        std::env::set_var("KAZE_TEST_INJECT", "$(touch x) `id`");
        let aliases = no_aliases();
        let p = parse(r#"echo $KAZE_TEST_INJECT "$KAZE_TEST_INJECT""#, &aliases, 0)
            .unwrap()
            .unwrap();
        for arg in &p.commands[0].args[1..] {
            assert_eq!(*arg, "$(touch x) `id`");
            assert!(arg.substitutions.is_empty());
        }
        std::env::remove_var("KAZE_TEST_INJECT");
    }

    #[test]
    fn substitution_command_strips_delimiters() {
        assert_eq!(substitution_command("$(echo a)"), "echo a");
        assert_eq!(substitution_command("$(a (b) c)"), "a (b) c");
        assert_eq!(substitution_command("$(echo ')')x)"), "echo ')'");
        assert_eq!(substitution_command("$(open (x)"), "open (x)");
        assert_eq!(substitution_command("`date`"), "date");
        assert_eq!(substitution_command("`date"), "date");
    }

    // ── エイリアス ──

    #[test]
    fn alias_expands_first_word() {
        let mut aliases = HashMap::new();
        aliases.insert("ll".to_string(), "ls -la".to_string());
        let expanded = parse("ll /tmp", &aliases, 0).unwrap().unwrap();
        let empty = no_aliases();
        let direct = parse("ls -la /tmp", &empty, 0).unwrap().unwrap();
        assert_eq!(expanded, direct);
    }

    #[test]
    fn alias_only_in_command_position() {
        let mut aliases = HashMap::new();
        aliases.insert("ll".to_string(), "ls -la".to_string());
        let p = parse("echo ll", &aliases, 0).unwrap().unwrap();
        assert_eq!(p.commands[0].args, vec!["echo", "ll"]);
    }

    #[test]
    fn quoted_command_word_skips_alias() {
        let mut aliases = HashMap::new();
        aliases.insert("ll".to_string(), "ls -la".to_string());
        for input in ["'ll' x", "\"ll\" x", "\\ll x", "l'l' x"] {
            let p = parse(input, &aliases, 0).unwrap().unwrap();
            assert_eq!(p.commands[0].args, vec!["ll", "x"], "input: {input}");
        }
    }

    #[test]
    fn self_referential_alias_is_one_hop() {
        let mut aliases = HashMap::new();
        aliases.insert("foo".to_string(), "foo".to_string());
        let p = parse("foo bar", &aliases, 0).unwrap().unwrap();
        assert_eq!(p.commands[0].args, vec!["foo", "bar"]);

        aliases.insert("a".to_string(), "b x".to_string());
        aliases.insert("b".to_string(), "a y".to_string());
        let p = parse("a", &aliases, 0).unwrap().unwrap();
        assert_eq!(p.commands[0].args, vec!["b", "x"]);
    }

    #[test]
    fn alias_with_pipe_splices_stages() {
        let mut aliases = HashMap::new();
        aliases.insert("count".to_string(), "sort | uniq -c".to_string());
        let p = parse("count < words.txt", &aliases, 0).unwrap().unwrap();
        assert_eq!(p.commands.len(), 2);
        assert_eq!(p.commands[0].args, vec!["sort"]);
        assert_eq!(p.commands[1].args, vec!["uniq", "-c"]);
        assert_eq!(p.commands[1].redirects[0].kind, RedirectKind::Input);
    }

    // ── チルダ展開 ──

    #[test]
    fn tilde_expansion() {
        let home = std::env::var("HOME").unwrap();
        assert_eq!(expand_tilde("~"), Cow::Owned::<str>(home.clone()));
        assert_eq!(expand_tilde("~/foo"), Cow::Owned::<str>(format!("{home}/foo")));
        assert_eq!(expand_tilde("X=~/bar"), Cow::Owned::<str>(format!("X={home}/bar")));
        assert!(matches!(expand_tilde("hello"), Cow::Borrowed(_)));
        assert!(matches!(expand_tilde("X=hello"), Cow::Borrowed(_)));
    }

    #[test]
    fn unquoted_tilde_expands_in_words() {
        let home = std::env::var("HOME").unwrap();
        assert_eq!(
            parse_args("echo ~ ~/x X=~/z a~ ~\"q\""),
            vec![vec![
                "echo".to_string(),
                home.clone(),
                format!("{home}/x"),
                format!("X={home}/z"),
                "a~".to_string(),
                "~q".to_string(),
            ]],
        );
    }

    #[test]
    fn quoted_tilde_stays_literal() {
        assert_eq!(
            parse_args("echo '~' \"~/y\" \\~ '~'/w"),
            vec![vec!["echo", "~", "~/y", "~", "~/w"]],
        );
        std::env::set_var("KAZE_TEST_TILDE", "~");
        assert_eq!(parse_args("echo $KAZE_TEST_TILDE"), vec![vec!["echo", "~"]]);
        std::env::remove_var("KAZE_TEST_TILDE");
    }

    #[test]
    fn tilde_shifts_substitution_spans() {
        let home = std::env::var("HOME").unwrap();
        let aliases = no_aliases();
        let p = parse("echo ~/$(x)", &aliases, 0).unwrap().unwrap();
        let arg = &p.commands[0].args[1];
        let start = home.len() + 1;
        assert_eq!(arg.substitutions, vec![start..start + 4]);
        assert_eq!(&arg[start..start + 4], "$(x)");
    }
}
