//! ビルトインコマンドの実装。
//!
//! 単一のフォアグラウンドコマンドとして呼ばれた場合はシェルのプロセス内で直接実行され、
//! パイプライン中や `&` 付きの場合は executor が fork した子で実行する。
//! `try_exec()` が `Some(status)` を返せばビルトインとして処理済み、
//! `None` なら外部コマンドとして executor に委ねる。
//!
//! 通常の出力は引数の `out`（`>` / `>>` のリダイレクト先を含む）へ、
//! エラーメッセージは `kaze: name: ...` 形式で `err`（`2>` のリダイレクト先を含む）へ書く。

use std::io::{self, Write};
use std::path::PathBuf;

use crate::executor;
use crate::job::{JobError, JobStatus};
use crate::shell::ShellState;
use crate::signal;
use crate::spawn::os_message;

/// ビルトイン一覧（アルファベット順）。補完候補にも使われる。
pub const BUILTINS: &[&str] = &[
    "alias", "bg", "cd", "exit", "export", "fg", "history", "jobs", "pwd", "unalias", "unset",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.binary_search(&name).is_ok()
}

/// ビルトインコマンドの実行を試みる。
///
/// 戻り値:
/// - `Some(status)`: ビルトインとして実行済み
/// - `None`: 該当するビルトインなし（外部コマンドとして実行すべき）
pub fn try_exec(
    state: &mut ShellState,
    args: &[String],
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Option<i32> {
    let name = args.first()?.as_str();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let result = match name {
        "exit" => builtin_exit(state, &args, err),
        "cd" => builtin_cd(state, &args, out, err),
        "pwd" => builtin_pwd(state, out),
        "export" => builtin_export(state, &args, out, err),
        "unset" => Ok(builtin_unset(state, &args)),
        "alias" => builtin_alias(state, &args, out, err),
        "unalias" => builtin_unalias(state, &args, err),
        "jobs" => builtin_jobs(state, out),
        "fg" => builtin_fg(state, &args, out, err),
        "bg" => builtin_bg(state, &args, out, err),
        "history" => builtin_history(state, &args, out, err),
        _ => return None,
    };
    Some(result.unwrap_or_else(|e| {
        eprintln!("kaze: {}: write error: {}", name, os_message(&e));
        1
    }))
}

/// `exit [N]`: シェルを終了する。N 省略時は直前のステータスで終了。
fn builtin_exit(state: &mut ShellState, args: &[&str], err: &mut dyn Write) -> io::Result<i32> {
    state.should_exit = true;
    match args.get(1) {
        Some(arg) => match arg.parse::<i32>() {
            Ok(n) => Ok(n & 0xff),
            Err(_) => {
                writeln!(err, "kaze: exit: {}: numeric argument required", arg)?;
                Ok(2)
            }
        },
        None => Ok(state.last_status),
    }
}

/// `cd [dir|-]`: カレントディレクトリを変更する。省略時は `$HOME`、`-` は `$OLDPWD`。
fn builtin_cd(
    state: &mut ShellState,
    args: &[&str],
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> io::Result<i32> {
    let (target, print) = match args.get(1).copied() {
        Some("-") => match state.get_env("OLDPWD") {
            Some(old) => (old.to_string(), true),
            None => {
                writeln!(err, "kaze: cd: OLDPWD not set")?;
                return Ok(1);
            }
        },
        Some(dir) => (dir.to_string(), false),
        None => match state.get_env("HOME") {
            Some(home) => (home.to_string(), false),
            None => {
                writeln!(err, "kaze: cd: HOME not set")?;
                return Ok(1);
            }
        },
    };

    if let Err(e) = state.change_dir(&PathBuf::from(&target)) {
        writeln!(err, "kaze: cd: {}: {}", target, os_message(&e))?;
        return Ok(1);
    }
    if print {
        writeln!(out, "{}", state.cwd.display())?;
    }
    Ok(0)
}

fn builtin_pwd(state: &ShellState, out: &mut dyn Write) -> io::Result<i32> {
    writeln!(out, "{}", state.cwd.display())?;
    Ok(0)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// `export [NAME=VALUE ...]`: 環境変数を設定する。引数なしで一覧表示。
fn builtin_export(
    state: &mut ShellState,
    args: &[&str],
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> io::Result<i32> {
    if args.len() == 1 {
        for (key, value) in &state.env {
            writeln!(out, "export {}=\"{}\"", key, value)?;
        }
        return Ok(0);
    }
    let mut status = 0;
    for arg in &args[1..] {
        let (name, value) = match arg.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (*arg, None),
        };
        if !is_valid_name(name) {
            writeln!(err, "kaze: export: `{}': not a valid identifier", arg)?;
            status = 1;
            continue;
        }
        // 値なしの `export NAME` は既存の環境変数をそのまま残す
        if let Some(value) = value {
            state.set_env(name, value);
        }
    }
    Ok(status)
}

/// `unset NAME...`: 環境変数を削除する。
fn builtin_unset(state: &mut ShellState, args: &[&str]) -> i32 {
    for name in &args[1..] {
        state.unset_env(name);
    }
    0
}

/// `alias [name[=value] ...]`: 引数なしで一覧、`name` で 1 件表示、`name=value` で定義。
fn builtin_alias(
    state: &mut ShellState,
    args: &[&str],
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> io::Result<i32> {
    if args.len() == 1 {
        let mut names: Vec<&String> = state.aliases.keys().collect();
        names.sort();
        for name in names {
            writeln!(out, "alias {}='{}'", name, state.aliases[name])?;
        }
        return Ok(0);
    }
    let mut status = 0;
    for arg in &args[1..] {
        match arg.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                state.aliases.insert(name.to_string(), value.to_string());
            }
            Some(_) => {
                writeln!(err, "kaze: alias: `{}': invalid alias name", arg)?;
                status = 1;
            }
            None => match state.aliases.get(*arg) {
                Some(value) => writeln!(out, "alias {}='{}'", arg, value)?,
                None => {
                    writeln!(err, "kaze: alias: {}: not found", arg)?;
                    status = 1;
                }
            },
        }
    }
    Ok(status)
}

/// `unalias [-a] name...`: エイリアスを削除する。
fn builtin_unalias(state: &mut ShellState, args: &[&str], err: &mut dyn Write) -> io::Result<i32> {
    if args.len() == 1 {
        writeln!(err, "kaze: unalias: usage: unalias [-a] name [name ...]")?;
        return Ok(2);
    }
    let mut status = 0;
    for name in &args[1..] {
        if *name == "-a" {
            state.aliases.clear();
        } else if state.aliases.remove(*name).is_none() {
            writeln!(err, "kaze: unalias: {}: not found", name)?;
            status = 1;
        }
    }
    Ok(status)
}

// ── ジョブ制御 ───────────────────────────────────────────────────────

/// `jobs`: ジョブ一覧。一覧に出した Done ジョブはテーブルから消える。
fn builtin_jobs(state: &mut ShellState, out: &mut dyn Write) -> io::Result<i32> {
    signal::reap(&mut state.jobs);
    state.jobs.list(out)?;
    Ok(0)
}

/// `fg [id]`: ジョブをフォアグラウンドで再開し、完了か停止まで待つ。
fn builtin_fg(
    state: &mut ShellState,
    args: &[&str],
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> io::Result<i32> {
    signal::reap(&mut state.jobs);
    let id = match state.jobs.resolve(args.get(1).copied()) {
        Ok(id) => id,
        Err(e) => {
            writeln!(err, "kaze: fg: {}", e)?;
            return Ok(1);
        }
    };

    let term = state.terminal();
    let Some(job) = state.jobs.get_mut(id) else {
        writeln!(err, "kaze: fg: {}", JobError::NotFound(id.to_string()))?;
        return Ok(1);
    };
    writeln!(out, "{}", job.command)?;
    out.flush()?;

    if job.status() == JobStatus::Stopped {
        signal::continue_group(job.pgid);
    }
    job.mark_running();
    let (status, stopped) = executor::wait_foreground(job, term);

    if stopped {
        writeln!(err, "\n[{}]+  Stopped   {}", id, job.command)?;
    } else {
        state.jobs.remove(id);
    }
    Ok(status)
}

/// `bg [id]`: 停止中のジョブをバックグラウンドで再開する。待機はしない。
fn builtin_bg(
    state: &mut ShellState,
    args: &[&str],
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> io::Result<i32> {
    signal::reap(&mut state.jobs);
    let id = match state.jobs.resolve(args.get(1).copied()) {
        Ok(id) => id,
        Err(e) => {
            writeln!(err, "kaze: bg: {}", e)?;
            return Ok(1);
        }
    };
    let Some(job) = state.jobs.get_mut(id) else {
        writeln!(err, "kaze: bg: {}", JobError::NotFound(id.to_string()))?;
        return Ok(1);
    };
    match job.status() {
        JobStatus::Stopped => {}
        JobStatus::Running => {
            writeln!(err, "kaze: bg: {}", JobError::AlreadyRunning(id))?;
            return Ok(1);
        }
        JobStatus::Done(_) => {
            writeln!(err, "kaze: bg: {}", JobError::Terminated(id))?;
            return Ok(1);
        }
    }
    signal::continue_group(job.pgid);
    job.mark_running();
    writeln!(out, "[{}] continued  {}", id, job.command)?;
    Ok(0)
}

// ── history ──────────────────────────────────────────────────────────

/// `history [n | -c]`: 履歴を番号付きで表示する。`-c` で全消去。
fn builtin_history(
    state: &mut ShellState,
    args: &[&str],
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> io::Result<i32> {
    let total = state.history.len();
    let count = match args.get(1).copied() {
        Some("-c") => {
            state.history.clear();
            return Ok(0);
        }
        Some(n) => match n.parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                writeln!(err, "kaze: history: {}: numeric argument required", n)?;
                return Ok(2);
            }
        },
        None => total,
    };
    let start = total.saturating_sub(count);
    for (i, entry) in state.history.entries()[start..].iter().enumerate() {
        writeln!(out, "{:5}  {}", start + i + 1, entry.command)?;
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;

    fn state() -> ShellState {
        ShellState::new(History::in_memory(100, true))
    }

    fn run(state: &mut ShellState, line: &[&str]) -> (Option<i32>, String) {
        let (status, out, _) = run_with_err(state, line);
        (status, out)
    }

    fn run_with_err(state: &mut ShellState, line: &[&str]) -> (Option<i32>, String, String) {
        let args: Vec<String> = line.iter().map(|s| s.to_string()).collect();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = try_exec(state, &args, &mut out, &mut err);
        (
            status,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[test]
    fn builtin_table_is_sorted() {
        let mut sorted = BUILTINS.to_vec();
        sorted.sort();
        assert_eq!(sorted, BUILTINS);
        assert!(is_builtin("fg"));
        assert!(!is_builtin("ls"));
    }

    #[test]
    fn unknown_command_is_not_handled() {
        let mut st = state();
        assert_eq!(run(&mut st, &["ls"]).0, None);
    }

    #[test]
    fn exit_uses_argument_or_last_status() {
        let mut st = state();
        st.last_status = 7;
        assert_eq!(run(&mut st, &["exit"]).0, Some(7));
        assert!(st.should_exit);
        assert_eq!(run(&mut st, &["exit", "3"]).0, Some(3));
        assert_eq!(run(&mut st, &["exit", "abc"]).0, Some(2));
    }

    #[test]
    fn alias_define_list_and_remove() {
        let mut st = state();
        assert_eq!(run(&mut st, &["alias", "ll=ls -la", "gs=git status"]).0, Some(0));
        assert_eq!(
            run(&mut st, &["alias"]),
            (Some(0), "alias gs='git status'\nalias ll='ls -la'\n".to_string())
        );
        assert_eq!(
            run(&mut st, &["alias", "ll"]),
            (Some(0), "alias ll='ls -la'\n".to_string())
        );
        assert_eq!(run(&mut st, &["alias", "nope"]).0, Some(1));

        assert_eq!(run(&mut st, &["unalias", "ll"]).0, Some(0));
        assert_eq!(run(&mut st, &["unalias", "ll"]).0, Some(1));
        assert_eq!(run(&mut st, &["unalias", "-a"]).0, Some(0));
        assert!(st.aliases.is_empty());
    }

    #[test]
    fn export_validates_names() {
        let mut st = state();
        assert_eq!(run(&mut st, &["export", "KAZE_BUILTIN_EXPORT=1"]).0, Some(0));
        assert_eq!(std::env::var("KAZE_BUILTIN_EXPORT").as_deref(), Ok("1"));
        assert_eq!(run(&mut st, &["export", "1BAD=x"]).0, Some(1));
        assert_eq!(run(&mut st, &["unset", "KAZE_BUILTIN_EXPORT"]).0, Some(0));
        assert!(std::env::var("KAZE_BUILTIN_EXPORT").is_err());
    }

    #[test]
    fn fg_and_bg_without_jobs_fail() {
        let mut st = state();
        assert_eq!(run(&mut st, &["fg"]).0, Some(1));
        assert_eq!(run(&mut st, &["bg", "%3"]).0, Some(1));
        assert_eq!(run(&mut st, &["jobs"]), (Some(0), String::new()));
    }

    #[test]
    fn bg_on_running_job_is_rejected() {
        let mut st = state();
        // 存在しないプロセスグループ。reap は ECHILD で何もしない
        st.jobs.insert(0x3fff_fff0, "sleep 9".into(), &[0x3fff_fff0]);
        let (status, _, err) = run_with_err(&mut st, &["bg", "1"]);
        assert_eq!(status, Some(1));
        assert_eq!(err, "kaze: bg: job 1 already in background\n");
        assert_eq!(st.jobs.len(), 1);
    }

    #[test]
    fn bg_on_finished_job_reports_terminated() {
        let mut st = state();
        st.jobs.insert(0x3fff_fff1, "true".into(), &[0x3fff_fff1]);
        // raw status 0 = exit 0
        st.jobs.mark_pid(0x3fff_fff1, 0);
        let (status, out, err) = run_with_err(&mut st, &["bg", "%1"]);
        assert_eq!(status, Some(1));
        assert!(out.is_empty());
        assert_eq!(err, "kaze: bg: job 1 has terminated\n");
    }

    #[test]
    fn errors_go_to_err_writer() {
        let mut st = state();
        let (status, out, err) = run_with_err(&mut st, &["cd", "/kaze/no/such/dir"]);
        assert_eq!(status, Some(1));
        assert!(out.is_empty());
        assert!(err.starts_with("kaze: cd: /kaze/no/such/dir: "), "{err}");

        let (status, _, err) = run_with_err(&mut st, &["unalias"]);
        assert_eq!(status, Some(2));
        assert!(err.contains("usage"));
    }

    #[test]
    fn history_listing_and_clear() {
        let mut st = state();
        for (i, cmd) in ["a", "b", "c"].iter().enumerate() {
            st.history.append(cmd, 0, i as u64);
        }
        assert_eq!(
            run(&mut st, &["history", "2"]),
            (Some(0), "    2  b\n    3  c\n".to_string())
        );
        assert_eq!(run(&mut st, &["history", "x"]).0, Some(2));
        assert_eq!(run(&mut st, &["history", "-c"]).0, Some(0));
        assert!(st.history.is_empty());
    }
}
