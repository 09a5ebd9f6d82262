//! コマンド実行: ビルトイン判定、事前検査、パイプライン接続、リダイレクト、ジョブ制御。
//!
//! - [`run_line`]: 1 行をパースして実行し、`last_status` を更新する（エラーはここで止まる）
//! - [`execute`]: パース済みの [`Pipeline`] を実行する
//!   - 展開: パーサーが記録した範囲だけをコマンド置換する
//!   - 単一ビルトイン（非 background、非 fd 複製）: fork なしの高速パス
//!   - それ以外: 事前検査 → パイプ作成 → 左から順に spawn
//!     - 外部コマンドは `posix_spawn`、パイプライン中のビルトインは `fork` した子で実行
//!     - foreground: ターミナルを渡して待機。停止したらジョブテーブルへ移す
//!     - background: ジョブテーブルに登録して即座に返る
//!
//! ## 事前検査
//!
//! どのプロセスも起動する前に、全段のコマンドを `$PATH` で解決し、全リダイレクト先を開く。
//! 失敗すれば何も起動せずに [`ExecError`] を報告する。
//!
//! ## fd の扱い
//!
//! パイプとリダイレクト先はすべて `O_CLOEXEC` 付きの [`OwnedFd`] / [`File`] で持つ。
//! 各段の spawn 直後にその段が使った端を drop し、親に残る書き込み端が
//! 下流の EOF を妨げないようにする。fork したビルトインの子は exec しないので、
//! 受け継いだパイプ端は子が自分で閉じる。

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use libc::pid_t;
use thiserror::Error;

use crate::builtins;
use crate::complete::is_executable;
use crate::job::{self, Job, Terminal};
use crate::parser::{self, Command, Pipeline, RedirectKind, Word};
use crate::shell::ShellState;
use crate::signal::{self, ForegroundGuard};
use crate::spawn::{self, os_message, SpawnError, SpawnRequest};

// ── 結果とエラー ─────────────────────────────────────────────────────

/// 実行結果。`job_id` はジョブテーブルに登録された場合（background / 停止）のみ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    pub exit_status: i32,
    pub job_id: Option<usize>,
}

impl ExecOutcome {
    fn status(exit_status: i32) -> Self {
        Self {
            exit_status,
            job_id: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{0}: command not found")]
    CommandNotFound(String),
    #[error("{0}: Permission denied")]
    PermissionDenied(String),
    #[error("{0}: No such file or directory")]
    FileNotFound(String),
    #[error(transparent)]
    SpawnFailed(#[from] SpawnError),
    #[error("{path}: {}", os_message(.source))]
    Redirect {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl ExecError {
    pub fn exit_status(&self) -> i32 {
        match self {
            ExecError::CommandNotFound(_) => 127,
            ExecError::PermissionDenied(_) => 126,
            ExecError::FileNotFound(_) | ExecError::Redirect { .. } => 1,
            ExecError::SpawnFailed(e) if e.errno == libc::ENOENT => 127,
            ExecError::SpawnFailed(_) => 126,
        }
    }
}

fn report(err: ExecError) -> ExecOutcome {
    eprintln!("kaze: {}", err);
    log::debug!("exec error: {:?}", err);
    ExecOutcome::status(err.exit_status())
}

// ── ホスト境界 ───────────────────────────────────────────────────────

/// 1 行をパースして実行し、`state.last_status` を更新する。
///
/// パースエラーはステータス 2。空行は何もせず直前のステータスを返す。
pub fn run_line(state: &mut ShellState, line: &str) -> ExecOutcome {
    // Pipeline はエイリアス値を借用するので、実行中の alias/unalias と衝突しないよう複製する
    let aliases = state.aliases.clone();
    let outcome = match parser::parse(line, &aliases, state.last_status) {
        Ok(Some(pipeline)) => execute(state, &pipeline, line),
        Ok(None) => return ExecOutcome::status(state.last_status),
        Err(e) => {
            eprintln!("kaze: {}", e);
            ExecOutcome::status(2)
        }
    };
    state.last_status = outcome.exit_status;
    outcome
}

/// ビルトインを名前で直接実行する。stdout はシェルの stdout。
pub fn run_builtin(state: &mut ShellState, name: &str, args: Vec<String>) -> ExecOutcome {
    if !builtins::is_builtin(name) {
        return report(ExecError::CommandNotFound(name.to_string()));
    }
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(name.to_string());
    argv.extend(args);
    let status =
        builtins::try_exec(state, &argv, &mut io::stdout(), &mut io::stderr()).unwrap_or(127);
    let _ = io::stdout().flush();
    ExecOutcome::status(status)
}

// ── execute ─────────────────────────────────────────────────────────

/// パイプラインを実行する。`cmd_text` はジョブテーブルの表示用。
pub fn execute(state: &mut ShellState, pipeline: &Pipeline<'_>, cmd_text: &str) -> ExecOutcome {
    let expanded: Vec<Expanded> = pipeline
        .commands
        .iter()
        .map(|cmd| expand_command(cmd, state))
        .collect();

    if expanded.len() == 1 && !pipeline.background {
        let cmd = &expanded[0];
        let has_fd_dup = cmd
            .redirects
            .iter()
            .any(|(kind, _)| matches!(kind, RedirectKind::FdDup { .. }));
        let is_builtin = cmd
            .args
            .first()
            .is_some_and(|name| builtins::is_builtin(name));
        if is_builtin && !has_fd_dup {
            return execute_builtin(state, cmd);
        }
    }

    let display = display_text(cmd_text);
    log::info!("exec: {}", display);

    let stages = match prepare(expanded) {
        Ok(stages) => stages,
        Err(e) => return report(e),
    };
    run_stages(state, stages, pipeline.background, display)
}

/// 末尾の `&` と前後の空白を除いた表示用コマンド文字列。
fn display_text(cmd_text: &str) -> &str {
    let trimmed = cmd_text.trim();
    trimmed.strip_suffix('&').unwrap_or(trimmed).trim_end()
}

// ── 引数展開 ─────────────────────────────────────────────────────────

/// コマンド置換を済ませた 1 段。
struct Expanded {
    args: Vec<String>,
    redirects: Vec<(RedirectKind, String)>,
}

fn expand_command(cmd: &Command<'_>, state: &mut ShellState) -> Expanded {
    let args = cmd.args.iter().map(|arg| expand_word(arg, state)).collect();
    let redirects = cmd
        .redirects
        .iter()
        .map(|r| (r.kind, expand_word(&r.target, state)))
        .collect();
    Expanded { args, redirects }
}

/// [`Word::substitutions`] の範囲だけを実行結果で置き換える。
/// 範囲外のテキストは、`$(...)` に見える文字列を含んでいても実行しない。
fn expand_word(word: &Word<'_>, state: &mut ShellState) -> String {
    let text = word.text.as_ref();
    let mut out = String::with_capacity(text.len());
    let mut literal_start = 0;
    for span in &word.substitutions {
        out.push_str(&text[literal_start..span.start]);
        let command = parser::substitution_command(&text[span.clone()]);
        out.push_str(&capture_output(command, state));
        literal_start = span.end;
    }
    out.push_str(&text[literal_start..]);
    out
}

/// `command` を fork した子で [`run_line`] し、stdout を末尾の改行を除いて返す。
fn capture_output(command: &str, state: &mut ShellState) -> String {
    let (reader, writer) = match cloexec_pipe() {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("command substitution pipe failed: {}", e);
            return String::new();
        }
    };

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        log::warn!("command substitution fork failed: {}", io::Error::last_os_error());
        return String::new();
    }
    if pid == 0 {
        unsafe {
            libc::dup2(writer.as_raw_fd(), libc::STDOUT_FILENO);
        }
        drop(writer);
        drop(reader);
        signal::reset_for_child();
        state.interactive = false;
        let outcome = run_line(state, command);
        let _ = io::stdout().flush();
        unsafe { libc::_exit(outcome.exit_status) }
    }

    drop(writer);
    let mut output = Vec::new();
    if let Err(e) = File::from(reader).read_to_end(&mut output) {
        log::warn!("command substitution read failed: {}", e);
    }
    wait_pid(pid);

    let mut text = String::from_utf8_lossy(&output).into_owned();
    while text.ends_with('\n') {
        text.pop();
    }
    text
}

/// `pid` の終了を待つ。`EINTR` は再試行する。
fn wait_pid(pid: pid_t) -> Option<i32> {
    loop {
        let mut raw_status = 0;
        if unsafe { libc::waitpid(pid, &mut raw_status, 0) } == pid {
            return Some(raw_status);
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return None;
        }
    }
}

// ── ビルトイン高速パス ───────────────────────────────────────────────

/// 単一ビルトインを fork なしで実行する。`>` / `>>` / `2>` があればその出力先に書く。
fn execute_builtin(state: &mut ShellState, cmd: &Expanded) -> ExecOutcome {
    let stage_io = match open_redirects(&cmd.redirects) {
        Ok(io) => io,
        Err(e) => return report(e),
    };
    let mut out: Box<dyn Write> = match stage_io.stdout {
        Some(file) => Box::new(file),
        None => Box::new(io::stdout()),
    };
    let mut err: Box<dyn Write> = match stage_io.stderr {
        Some(file) => Box::new(file),
        None => Box::new(io::stderr()),
    };
    let status = builtins::try_exec(state, &cmd.args, &mut *out, &mut *err);
    let _ = out.flush();
    ExecOutcome::status(status.unwrap_or(1))
}

// ── 事前検査 ─────────────────────────────────────────────────────────

/// `name` を実行ファイルのパスに解決する。`/` を含めばそのままパスとして扱う。
pub fn resolve_command(name: &str) -> Result<PathBuf, ExecError> {
    if name.contains('/') {
        let path = Path::new(name);
        return match path.metadata() {
            Err(_) => Err(ExecError::CommandNotFound(name.to_string())),
            Ok(_) if is_executable(path) => Ok(path.to_path_buf()),
            Ok(_) => Err(ExecError::PermissionDenied(name.to_string())),
        };
    }
    if name.is_empty() {
        return Err(ExecError::CommandNotFound(String::new()));
    }

    let path_var = env::var("PATH").unwrap_or_default();
    let mut denied = false;
    for dir in path_var.split(':') {
        let dir = if dir.is_empty() { "." } else { dir };
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            if is_executable(&candidate) {
                return Ok(candidate);
            }
            denied = true;
        }
    }
    if denied {
        Err(ExecError::PermissionDenied(name.to_string()))
    } else {
        Err(ExecError::CommandNotFound(name.to_string()))
    }
}

/// 1 段分のリダイレクト。`File` は drop で閉じる。
#[derive(Debug, Default)]
struct StageIo {
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
    /// `(src_fd, dst_fd)`
    dups: Vec<(RawFd, RawFd)>,
}

/// リダイレクト先を開く。同じ fd への指定が複数あれば最後が有効（前のファイルも作成はされる）。
fn open_redirects(redirects: &[(RedirectKind, String)]) -> Result<StageIo, ExecError> {
    let mut stage_io = StageIo::default();
    for (kind, target) in redirects {
        let opened = match *kind {
            RedirectKind::Input => File::open(target),
            RedirectKind::Output | RedirectKind::Stderr => File::create(target),
            RedirectKind::Append => OpenOptions::new().create(true).append(true).open(target),
            RedirectKind::FdDup { src_fd, dst_fd } => {
                stage_io.dups.push((src_fd, dst_fd));
                continue;
            }
        };
        let file = opened.map_err(|source| {
            if *kind == RedirectKind::Input && source.kind() == io::ErrorKind::NotFound {
                ExecError::FileNotFound(target.clone())
            } else {
                ExecError::Redirect {
                    path: target.clone(),
                    source,
                }
            }
        })?;
        match kind {
            RedirectKind::Input => stage_io.stdin = Some(file),
            RedirectKind::Stderr => stage_io.stderr = Some(file),
            _ => stage_io.stdout = Some(file),
        }
    }
    Ok(stage_io)
}

/// 起動準備の済んだ 1 段。
struct Stage {
    args: Vec<String>,
    /// `None` ならビルトイン（fork した子で実行する）。
    program: Option<PathBuf>,
    io: StageIo,
}

/// 全段のコマンド解決とリダイレクトのオープン。1 つでも失敗すれば何も起動しない。
fn prepare(expanded: Vec<Expanded>) -> Result<Vec<Stage>, ExecError> {
    let programs = expanded
        .iter()
        .map(|cmd| {
            let name = cmd.args.first().map(String::as_str).unwrap_or("");
            if builtins::is_builtin(name) {
                Ok(None)
            } else {
                resolve_command(name).map(Some)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ios = expanded
        .iter()
        .map(|cmd| open_redirects(&cmd.redirects))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(expanded
        .into_iter()
        .zip(programs)
        .zip(ios)
        .map(|((cmd, program), io)| Stage {
            args: cmd.args,
            program,
            io,
        })
        .collect())
}

// ── spawn ───────────────────────────────────────────────────────────

/// 両端に `O_CLOEXEC` を付けたパイプ `(read, write)`。
#[cfg(target_os = "linux")]
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(not(target_os = "linux"))]
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// 各段を左から順に起動し、foreground なら待機、background なら登録する。
fn run_stages(
    state: &mut ShellState,
    stages: Vec<Stage>,
    background: bool,
    display: &str,
) -> ExecOutcome {
    let n = stages.len();
    let mut pipes: Vec<(Option<OwnedFd>, Option<OwnedFd>)> = Vec::with_capacity(n.saturating_sub(1));
    for _ in 1..n {
        match cloexec_pipe() {
            Ok((r, w)) => pipes.push((Some(r), Some(w))),
            Err(e) => {
                return report(ExecError::SpawnFailed(SpawnError {
                    errno: e.raw_os_error().unwrap_or(libc::EIO),
                    command: "pipe".to_string(),
                }))
            }
        }
    }

    let mut pgid: pid_t = 0;
    let mut pids: Vec<pid_t> = Vec::with_capacity(n);

    for (i, stage) in stages.into_iter().enumerate() {
        // この段が使うパイプ端。spawn 後、反復の終わりで drop されて親側から閉じる
        let pipe_in = if i > 0 { pipes[i - 1].0.take() } else { None };
        let pipe_out = if i + 1 < n { pipes[i].1.take() } else { None };

        let stdin = stage
            .io
            .stdin
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .or_else(|| pipe_in.as_ref().map(AsRawFd::as_raw_fd));
        let stdout = stage
            .io
            .stdout
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .or_else(|| pipe_out.as_ref().map(AsRawFd::as_raw_fd));
        let stderr = stage.io.stderr.as_ref().map(AsRawFd::as_raw_fd);

        let spawned = match &stage.program {
            Some(program) => spawn::spawn(&SpawnRequest {
                program,
                args: &stage.args,
                pgid,
                stdin,
                stdout,
                stderr,
                dups: &stage.io.dups,
            })
            .map_err(ExecError::from),
            None => fork_builtin(
                state,
                &stage.args,
                pgid,
                [stdin, stdout, stderr],
                &stage.io.dups,
                &mut pipes,
            ),
        };

        match spawned {
            Ok(pid) => {
                if pgid == 0 {
                    pgid = pid;
                }
                // 子側と同じ設定を親側でも行い、待機開始前にグループが確定しているようにする
                unsafe {
                    libc::setpgid(pid, pgid);
                }
                pids.push(pid);
            }
            Err(e) => {
                pipes.clear();
                abort_spawned(pgid, &pids);
                return report(e);
            }
        }
    }
    drop(pipes);

    let mut job = Job::new(pgid, display.to_string(), &pids);

    if background {
        let id = state.jobs.adopt(job);
        eprintln!("[{}] {}", id, pgid);
        return ExecOutcome {
            exit_status: 0,
            job_id: Some(id),
        };
    }

    let (status, stopped) = wait_foreground(&mut job, state.terminal());
    if stopped {
        let id = state.jobs.adopt(job);
        eprintln!("\n[{}]+  Stopped   {}", id, display);
        return ExecOutcome {
            exit_status: status,
            job_id: Some(id),
        };
    }
    log::info!("exit {}: {}", status, display);
    ExecOutcome::status(status)
}

/// パイプライン中のビルトインを fork した子で実行する。`fds` は stdin / stdout / stderr。
///
/// 子は `fds` を 0 / 1 / 2 に複製したあと、元の fd と `pipes` に残る全パイプ端を閉じる。
fn fork_builtin(
    state: &mut ShellState,
    args: &[String],
    pgid: pid_t,
    fds: [Option<RawFd>; 3],
    dups: &[(RawFd, RawFd)],
    pipes: &mut Vec<(Option<OwnedFd>, Option<OwnedFd>)>,
) -> Result<pid_t, ExecError> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(ExecError::SpawnFailed(SpawnError {
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(libc::EAGAIN),
            command: args.first().cloned().unwrap_or_default(),
        }));
    }
    if pid == 0 {
        unsafe {
            libc::setpgid(0, pgid);
            for (target, fd) in fds.into_iter().enumerate() {
                if let Some(fd) = fd {
                    libc::dup2(fd, target as RawFd);
                }
            }
            for &(src, dst) in dups {
                libc::dup2(dst, src);
            }
            for fd in fds.into_iter().flatten() {
                let still_needed =
                    fd <= libc::STDERR_FILENO || dups.iter().any(|&(_, dst)| dst == fd);
                if !still_needed {
                    libc::close(fd);
                }
            }
        }
        pipes.clear();
        signal::reset_for_child();
        state.interactive = false;
        let status =
            builtins::try_exec(state, args, &mut io::stdout(), &mut io::stderr()).unwrap_or(127);
        let _ = io::stdout().flush();
        unsafe { libc::_exit(status) }
    }
    log::debug!("forked builtin {:?} as pid {}", args.first(), pid);
    Ok(pid)
}

/// 途中で起動に失敗したとき、起動済みの段に SIGTERM を送って回収する。
fn abort_spawned(pgid: pid_t, pids: &[pid_t]) {
    if pgid > 0 {
        if let Err(e) = signal::signal_group(pgid, libc::SIGTERM) {
            log::debug!("abort: {}", e);
        }
    }
    for &pid in pids {
        wait_pid(pid);
    }
}

/// ターミナルを `job` のグループに渡して待機し、終わったらシェルに戻す。
///
/// 待機中は SIGINT をこのグループに転送する。戻り値は [`job::wait_for_fg`] と同じ。
pub fn wait_foreground(job: &mut Job, term: Terminal) -> (i32, bool) {
    let _guard = ForegroundGuard::new(job.pgid);
    if term.interactive {
        job::give_terminal_to(term.fd, job.pgid);
    }
    let (status, stopped) = job::wait_for_fg(job);
    if term.interactive {
        job::take_terminal_back(term.fd, term.shell_pgid);
    }
    if stopped {
        job.mark_stopped();
    }
    (status, stopped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text_strips_background_marker() {
        assert_eq!(display_text("  sleep 5 &  "), "sleep 5");
        assert_eq!(display_text("ls | wc"), "ls | wc");
    }

    #[test]
    fn exit_status_per_error() {
        assert_eq!(ExecError::CommandNotFound("x".into()).exit_status(), 127);
        assert_eq!(ExecError::PermissionDenied("x".into()).exit_status(), 126);
        assert_eq!(ExecError::FileNotFound("x".into()).exit_status(), 1);
        let spawn = SpawnError {
            errno: libc::ENOEXEC,
            command: "x".into(),
        };
        assert_eq!(ExecError::from(spawn).exit_status(), 126);
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            ExecError::CommandNotFound("nope".into()).to_string(),
            "nope: command not found"
        );
        let redirect = ExecError::Redirect {
            path: "/x".into(),
            source: io::Error::from_raw_os_error(libc::EISDIR),
        };
        assert_eq!(redirect.to_string(), "/x: Is a directory");
    }

    #[test]
    fn resolve_finds_commands_on_path() {
        let sh = resolve_command("sh").unwrap();
        assert!(sh.is_absolute());
        assert!(matches!(
            resolve_command("kaze-no-such-command-xyz"),
            Err(ExecError::CommandNotFound(_))
        ));
        assert!(matches!(
            resolve_command("/kaze/no/such/path"),
            Err(ExecError::CommandNotFound(_))
        ));
    }

    #[test]
    fn resolve_rejects_non_executable_path() {
        let path = env::temp_dir().join(format!("kaze-noexec-{}", std::process::id()));
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        let name = path.to_string_lossy().into_owned();
        assert!(matches!(
            resolve_command(&name),
            Err(ExecError::PermissionDenied(_))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn words_without_spans_are_copied_verbatim() {
        let mut st = ShellState::new(crate::history::History::in_memory(10, true));
        let word = Word::from("$(kaze-no-such-command-xyz) `x`");
        assert_eq!(expand_word(&word, &mut st), "$(kaze-no-such-command-xyz) `x`");
    }

    #[test]
    fn missing_input_redirect_is_file_not_found() {
        let redirects = vec![(RedirectKind::Input, "/kaze/definitely/missing".to_string())];
        let err = open_redirects(&redirects).unwrap_err();
        assert!(matches!(err, ExecError::FileNotFound(_)));
        assert_eq!(err.exit_status(), 1);
    }
}
