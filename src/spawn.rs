//! `posix_spawn()` の安全な Rust ラッパー。
//!
//! executor が PATH 解決済みのプログラムパスを渡し、ここでプロセスグループ・
//! シグナル初期化・fd の付け替えをまとめて設定して起動する。
//!
//! ## 構成
//!
//! | 型 | 役割 |
//! |-----|------|
//! | [`SpawnAttr`] | `posix_spawnattr_t` の RAII ラッパー（プロセスグループ、シグナル設定） |
//! | [`FileActions`] | `posix_spawn_file_actions_t` の RAII ラッパー（fd 操作） |
//! | [`CStringVec`] | argv 用の NULL 終端ポインタ配列 |
//! | [`SpawnRequest`] / [`spawn`] | 上記を組み合わせて `posix_spawn` を呼ぶ公開 API |

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use libc::pid_t;
use thiserror::Error;

// ── エラー型 ──────────────────────────────────────────────────────

/// `posix_spawn` の失敗。`errno` は executor が終了ステータスの決定に使う。
#[derive(Debug, Error)]
#[error("{command}: {}", errno_message(.errno))]
pub struct SpawnError {
    pub errno: i32,
    pub command: String,
}

fn errno_message(errno: &i32) -> String {
    os_message(&io::Error::from_raw_os_error(*errno))
}

/// `io::Error` の表示から ` (os error N)` を除いたメッセージ。
pub fn os_message(err: &io::Error) -> String {
    let text = err.to_string();
    match text.rfind(" (os error ") {
        Some(i) => text[..i].to_string(),
        None => text,
    }
}

// ── SpawnAttr ─────────────────────────────────────────────────────

/// `posix_spawnattr_t` の RAII ラッパー。Drop で destroy。
struct SpawnAttr {
    inner: libc::posix_spawnattr_t,
}

impl SpawnAttr {
    fn new() -> Self {
        unsafe {
            let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
            libc::posix_spawnattr_init(&mut attr);
            Self { inner: attr }
        }
    }

    /// `POSIX_SPAWN_SETPGROUP` と `POSIX_SPAWN_SETSIGDEF` を設定する。
    ///
    /// `pgid == 0` なら子の PID が新しいグループのリーダーになる。
    /// シェルが無視・捕捉しているシグナルは子では `SIG_DFL` に戻す。
    fn configure(&mut self, pgid: pid_t) {
        unsafe {
            let flags = (libc::POSIX_SPAWN_SETPGROUP | libc::POSIX_SPAWN_SETSIGDEF) as libc::c_short;
            libc::posix_spawnattr_setflags(&mut self.inner, flags);
            libc::posix_spawnattr_setpgroup(&mut self.inner, pgid);

            let mut sigset: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut sigset);
            for sig in [
                libc::SIGINT,
                libc::SIGQUIT,
                libc::SIGTSTP,
                libc::SIGTTOU,
                libc::SIGTTIN,
                libc::SIGCHLD,
                // Rust ランタイムは SIGPIPE を無視に設定するので、子では既定に戻す
                libc::SIGPIPE,
            ] {
                libc::sigaddset(&mut sigset, sig);
            }
            libc::posix_spawnattr_setsigdefault(&mut self.inner, &sigset);
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
        &self.inner
    }
}

impl Drop for SpawnAttr {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.inner);
        }
    }
}

// ── FileActions ───────────────────────────────────────────────────

/// `posix_spawn_file_actions_t` の RAII ラッパー。Drop で destroy。
struct FileActions {
    inner: libc::posix_spawn_file_actions_t,
}

impl FileActions {
    fn new() -> Self {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            libc::posix_spawn_file_actions_init(&mut actions);
            Self { inner: actions }
        }
    }

    fn add_dup2(&mut self, fd: RawFd, newfd: RawFd) {
        unsafe {
            libc::posix_spawn_file_actions_adddup2(&mut self.inner, fd, newfd);
        }
    }

    fn add_close(&mut self, fd: RawFd) {
        unsafe {
            libc::posix_spawn_file_actions_addclose(&mut self.inner, fd);
        }
    }

    /// `fd` を標準入出力 `target` に付け替え、元の fd を閉じる。
    fn redirect(&mut self, fd: Option<RawFd>, target: RawFd) {
        if let Some(fd) = fd {
            if fd != target {
                self.add_dup2(fd, target);
                self.add_close(fd);
            }
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawn_file_actions_t {
        &self.inner
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.inner);
        }
    }
}

// ── CStringVec ────────────────────────────────────────────────────

/// argv 用の CString ベクタ。NULL 終端のポインタ配列を保持する。
struct CStringVec {
    _strings: Vec<CString>,
    ptrs: Vec<*mut libc::c_char>,
}

impl CStringVec {
    /// 引数に NUL バイトが含まれていれば `None`。
    fn from_args(args: &[String]) -> Option<Self> {
        let strings = args
            .iter()
            .map(|s| CString::new(s.as_str()).ok())
            .collect::<Option<Vec<_>>>()?;
        let mut ptrs: Vec<*mut libc::c_char> = strings
            .iter()
            .map(|s| s.as_ptr() as *mut libc::c_char)
            .collect();
        ptrs.push(std::ptr::null_mut());
        Some(Self {
            _strings: strings,
            ptrs,
        })
    }

    fn as_ptr(&self) -> *const *mut libc::c_char {
        self.ptrs.as_ptr()
    }
}

// ── spawn ─────────────────────────────────────────────────────────

/// 1 プロセス分の起動パラメータ。fd は `None` ならシェルのものを継承する。
///
/// 渡す fd はすべて `O_CLOEXEC` 付きで開かれている前提。標準入出力に付け替えたもの以外
/// （他ステージ用のパイプ端など）は exec 時に子から自動的に消える。
pub struct SpawnRequest<'a> {
    /// PATH 解決済みのプログラムパス。
    pub program: &'a Path,
    /// `args[0]` はコマンド名（表示用）。
    pub args: &'a [String],
    /// 参加するプロセスグループ（0 なら新規グループのリーダー）。
    pub pgid: pid_t,
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
    /// fd 複製 `(src_fd, dst_fd)`。子で `dup2(dst_fd, src_fd)` を行う。
    pub dups: &'a [(RawFd, RawFd)],
}

/// `posix_spawn` で子プロセスを起動し、PID を返す。
pub fn spawn(req: &SpawnRequest<'_>) -> Result<pid_t, SpawnError> {
    let command = req.args.first().cloned().unwrap_or_default();
    let err = |errno| SpawnError {
        errno,
        command: command.clone(),
    };

    let argv = CStringVec::from_args(req.args).ok_or_else(|| err(libc::EINVAL))?;
    let program =
        CString::new(req.program.as_os_str().as_bytes()).map_err(|_| err(libc::EINVAL))?;

    let mut attr = SpawnAttr::new();
    attr.configure(req.pgid);

    let mut actions = FileActions::new();
    actions.redirect(req.stdin, libc::STDIN_FILENO);
    actions.redirect(req.stdout, libc::STDOUT_FILENO);
    actions.redirect(req.stderr, libc::STDERR_FILENO);
    for &(src, dst) in req.dups {
        actions.add_dup2(dst, src);
    }

    // environ を継承（ShellState::set_env が std::env に反映済み）
    extern "C" {
        static environ: *const *mut libc::c_char;
    }

    let mut pid: pid_t = 0;
    let ret = unsafe {
        libc::posix_spawn(
            &mut pid,
            program.as_ptr(),
            actions.as_ptr(),
            attr.as_ptr(),
            argv.as_ptr(),
            environ as *const *mut libc::c_char,
        )
    };
    if ret != 0 {
        return Err(err(ret));
    }

    log::debug!("spawned {} as pid {} (pgid {})", req.program.display(), pid, req.pgid);
    Ok(pid)
}
