//! シグナル処理と子プロセスの reap。
//!
//! シグナルハンドラ内では atomic への store と `kill(2)` しか行わない
//! （どちらも async-signal-safe）。ジョブテーブルの更新はすべてメインループから呼ばれる
//! [`reap`] で行う。
//!
//! | シグナル | 扱い |
//! |----------|------|
//! | `SIGCHLD` | `SA_RESTART` 付きハンドラ。[`take_child_event`] 用のフラグを立てるだけ |
//! | `SIGINT` | フォアグラウンドのプロセスグループへ転送。シェル自身は終了しない |
//! | `SIGTSTP` / `SIGTTOU` / `SIGTTIN` / `SIGQUIT` | 無視（子は spawn 時に `SIG_DFL` へ戻す） |

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use libc::{c_int, pid_t};
use thiserror::Error;

use crate::job::JobTable;

/// SIGCHLD を受けたら `true`。
static CHILD_EVENT: AtomicBool = AtomicBool::new(false);
/// SIGINT の転送先プロセスグループ。0 ならフォアグラウンドジョブなし。
static FOREGROUND_PGID: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_sigchld(_: c_int) {
    CHILD_EVENT.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigint(_: c_int) {
    let pgid = FOREGROUND_PGID.load(Ordering::SeqCst);
    if pgid > 0 {
        unsafe {
            libc::kill(-pgid, libc::SIGINT);
        }
    }
}

fn set_handler(sig: c_int, handler: libc::sighandler_t, flags: c_int) -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = flags;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// 対話シェル用のシグナル設定を行う。起動時に 1 度だけ呼ぶ。
///
/// SIGINT は `SA_RESTART` なしで登録する。フォアグラウンド待機中の `waitpid` が
/// `EINTR` で戻り、転送後の子の終了を改めて待てるようにするため。
pub fn install() -> io::Result<()> {
    set_handler(
        libc::SIGCHLD,
        on_sigchld as extern "C" fn(c_int) as libc::sighandler_t,
        libc::SA_RESTART,
    )?;
    set_handler(
        libc::SIGINT,
        on_sigint as extern "C" fn(c_int) as libc::sighandler_t,
        0,
    )?;
    for sig in [libc::SIGTSTP, libc::SIGTTOU, libc::SIGTTIN, libc::SIGQUIT] {
        set_handler(sig, libc::SIG_IGN, 0)?;
    }
    Ok(())
}

/// fork した子（パイプライン中のビルトイン、コマンド置換）用にシグナル設定を既定へ戻す。
/// exec する子は spawn 時に `POSIX_SPAWN_SETSIGDEF` で同じことをする。
pub fn reset_for_child() {
    for sig in [
        libc::SIGINT,
        libc::SIGQUIT,
        libc::SIGTSTP,
        libc::SIGTTOU,
        libc::SIGTTIN,
        libc::SIGPIPE,
    ] {
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
    FOREGROUND_PGID.store(0, Ordering::SeqCst);
}

/// SIGCHLD を受けていれば `true` を返してフラグを下ろす。
pub fn take_child_event() -> bool {
    CHILD_EVENT.swap(false, Ordering::SeqCst)
}

/// フォアグラウンド待機の間だけ SIGINT の転送先を設定する RAII ガード。
pub struct ForegroundGuard {
    previous: pid_t,
}

impl ForegroundGuard {
    pub fn new(pgid: pid_t) -> Self {
        let previous = FOREGROUND_PGID.swap(pgid, Ordering::SeqCst);
        Self { previous }
    }
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        FOREGROUND_PGID.store(self.previous, Ordering::SeqCst);
    }
}

/// 非ブロッキングで終了・停止・再開した子プロセスを回収し、ジョブテーブルに反映する。
///
/// 生存中の各ジョブのプロセスグループに対して
/// `waitpid(-pgid, WNOHANG | WUNTRACED | WCONTINUED)` を回収できなくなるまで繰り返す。
/// テーブルにないプロセス（フォアグラウンド待機中のもの等）には触れない。
pub fn reap(jobs: &mut JobTable) {
    for pgid in jobs.live_pgids() {
        loop {
            let mut raw_status: i32 = 0;
            let pid = unsafe {
                libc::waitpid(
                    -pgid,
                    &mut raw_status,
                    libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED,
                )
            };
            if pid <= 0 {
                break;
            }
            jobs.mark_pid(pid, raw_status);
        }
    }
}

/// プロセスグループが既に存在しない。後続の [`reap`] がテーブルを整合させるので無視してよい。
#[derive(Debug, Error)]
#[error("process group {pgid}: {source}")]
pub struct SignalDeliveryError {
    pub pgid: pid_t,
    #[source]
    pub source: io::Error,
}

/// プロセスグループ全体にシグナルを送る。
pub fn signal_group(pgid: pid_t, sig: c_int) -> Result<(), SignalDeliveryError> {
    if unsafe { libc::kill(-pgid, sig) } != 0 {
        return Err(SignalDeliveryError {
            pgid,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// 停止中のプロセスグループを再開させる（`fg` / `bg`）。
pub fn continue_group(pgid: pid_t) {
    if let Err(e) = signal_group(pgid, libc::SIGCONT) {
        log::debug!("SIGCONT not delivered: {}", e);
    }
}
