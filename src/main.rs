//! kaze: ジョブコントロール付きの対話シェル
//!
//! REPLループ: ジョブ回収 → 完了通知 → プロンプト表示 → 行エディタで入力読み取り → 実行 → 履歴記録 → ループ
//!
//! 起動時に設定ファイル → ロガー → 履歴 → シグナル → ジョブコントロール → `~/.kazerc` の順に初期化する。

use std::io;
use std::path::PathBuf;
use std::process;

use kaze::complete::CommandUniverse;
use kaze::config::Config;
use kaze::editor::LineEditor;
use kaze::history::{self, History};
use kaze::parser::{self, ParseError};
use kaze::shell::ShellState;
use kaze::{executor, logging, prompt, signal};

/// `~/.kazerc` を読み込んで各行を実行する。ファイルが存在しなければサイレントスキップ。
fn load_rc(state: &mut ShellState) {
    let Some(home) = std::env::var_os("HOME") else {
        return;
    };
    let rc_path = PathBuf::from(home).join(".kazerc");
    let content = match std::fs::read_to_string(&rc_path) {
        Ok(c) => c,
        Err(_) => return,
    };
    log::info!("loading {}", rc_path.display());
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        executor::run_line(state, trimmed);
        if state.should_exit {
            break;
        }
    }
}

/// 入力が続きを必要とするか（末尾 `\` または閉じていないクォート）。
fn needs_continuation(state: &ShellState, line: &str) -> bool {
    if line.trim_end().ends_with('\\') {
        return true;
    }
    matches!(
        parser::parse(line, &state.aliases, state.last_status),
        Err(ParseError::UnclosedQuote(_))
    )
}

/// 1 コマンド分の入力を読む。継続行は `> ` プロンプトで読み足す。
/// 入力終了なら `None`。
fn read_command(
    state: &mut ShellState,
    editor: &mut LineEditor,
    universe: &CommandUniverse,
) -> Option<String> {
    let prompt = prompt::render(&state.prompt_context());
    let mut accumulated = editor.read_line(&prompt, &mut state.history, universe)?;

    while needs_continuation(state, &accumulated) {
        let trimmed = accumulated.trim_end();
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            accumulated = stripped.to_string();
        } else {
            accumulated.push('\n');
        }
        match editor.read_line("> ", &mut state.history, universe) {
            Some(next) => accumulated.push_str(&next),
            None => break,
        }
    }
    Some(accumulated)
}

fn main() {
    let config = Config::load();
    logging::init(&config.log.level);
    log::info!("kaze {} starting (pid {})", env!("CARGO_PKG_VERSION"), process::id());

    let history = History::open(
        config.history.resolved_path(),
        config.history.max_size,
        config.history.dedup,
    );
    let mut state = ShellState::new(history);
    state.apply_config(&config);

    if let Err(e) = signal::install() {
        eprintln!("kaze: failed to install signal handlers: {}", e);
        process::exit(1);
    }
    if let Err(e) = state.enable_job_control() {
        eprintln!("kaze: failed to take terminal control: {}", e);
        process::exit(1);
    }

    load_rc(&mut state);

    let mut editor = LineEditor::new();
    let mut universe = CommandUniverse::new(&state.aliases);

    while !state.should_exit {
        // プロンプト前にバックグラウンドジョブを回収し、完了通知を出力
        if signal::take_child_event() {
            signal::reap(&mut state.jobs);
        }
        state.jobs.notify_and_clean(&mut io::stderr());
        universe.refresh(&state.aliases);

        let Some(line) = read_command(&mut state, &mut editor, &universe) else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let outcome = executor::run_line(&mut state, &line);
        state
            .history
            .append(&line, outcome.exit_status, history::now());
    }

    if let Err(e) = state.history.flush() {
        log::warn!("history flush failed: {}", e);
    }
    log::info!("exiting with status {}", state.last_status);
    process::exit(state.last_status);
}
