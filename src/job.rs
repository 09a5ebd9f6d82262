//! ジョブテーブルとジョブ制御ヘルパー。
//!
//! ジョブ ([`Job`]) はパイプライン 1 本分のプロセスグループに対応し、
//! 各プロセスは [`ProcessHandle`] としてジョブが唯一の所有者になる。
//! フォアグラウンドのパイプラインは executor のスタック上の `Job` として待機され、
//! 停止したときだけ [`JobTable::adopt`] でテーブルに移される。
//!
//! 状態遷移はすべて [`JobTable`] / [`Job`] のメソッド経由で行う:
//!
//! ```text
//!   Running ──SIGTSTP──▶ Stopped ──SIGCONT (fg/bg)──▶ Running
//!      │                                                 │
//!      └────────────── exit / signal ──▶ Done ◀──────────┘
//! ```
//!
//! Done ジョブは 1 度ユーザに報告された時点（`jobs` 一覧か、プロンプト前の通知）で削除される。

use std::io::{self, Write};

use libc::pid_t;
use thiserror::Error;

// ── データ構造 ───────────────────────────────────────────────────────

/// 子プロセスを指すハンドル。reap の責任はこれを保持する [`Job`] にある。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessHandle {
    pub pid: pid_t,
    pub process_group_id: pid_t,
}

/// ジョブ内の個別プロセス。パイプライン中の各コマンドに対応する。
#[derive(Debug)]
pub struct JobProcess {
    pub handle: ProcessHandle,
    /// 正常終了またはシグナルで終了した場合に `true`。
    pub completed: bool,
    /// SIGTSTP 等で停止中の場合に `true`。
    pub stopped: bool,
    /// `waitpid` が返した raw status。
    pub status: i32,
}

/// ジョブの集約状態。個別プロセスの状態から導出される。
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum JobStatus {
    Running,
    Stopped,
    /// 全プロセスが完了。引数はパイプライン最終段の終了ステータス。
    Done(i32),
}

impl JobStatus {
    /// `jobs` 一覧に出す状態語。
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "Running",
            JobStatus::Stopped => "Stopped",
            JobStatus::Done(_) => "Done",
        }
    }
}

/// `waitpid` の raw status を終了ステータスに変換する。シグナル終了は 128 + シグナル番号。
pub fn exit_code(raw_status: i32) -> i32 {
    if libc::WIFEXITED(raw_status) {
        libc::WEXITSTATUS(raw_status)
    } else if libc::WIFSIGNALED(raw_status) {
        128 + libc::WTERMSIG(raw_status)
    } else {
        1
    }
}

/// ジョブ。パイプラインのプロセスグループに対応する。
#[derive(Debug)]
pub struct Job {
    /// `[N]` 形式で表示されるジョブ番号。テーブルに入るまでは 0。
    pub id: usize,
    /// プロセスグループ ID（= 先頭ステージの PID）。
    pub pgid: pid_t,
    /// 表示用コマンド文字列（末尾の `&` は除く）。
    pub command: String,
    pub processes: Vec<JobProcess>,
    /// Done をユーザに報告済みか。
    pub notified: bool,
}

impl Job {
    pub fn new(pgid: pid_t, command: String, pids: &[pid_t]) -> Self {
        let processes = pids
            .iter()
            .map(|&pid| JobProcess {
                handle: ProcessHandle {
                    pid,
                    process_group_id: pgid,
                },
                completed: false,
                stopped: false,
                status: 0,
            })
            .collect();
        Self {
            id: 0,
            pgid,
            command,
            processes,
            notified: false,
        }
    }

    /// ジョブの現在のステータスを返す。判定優先度: Stopped > Done > Running。
    pub fn status(&self) -> JobStatus {
        if self.processes.iter().any(|p| p.stopped) {
            return JobStatus::Stopped;
        }
        if self.processes.iter().all(|p| p.completed) {
            // 最終段のステータスがパイプラインのステータス
            let code = self.processes.last().map_or(0, |p| exit_code(p.status));
            return JobStatus::Done(code);
        }
        JobStatus::Running
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status(), JobStatus::Done(_))
    }

    /// `waitpid` の結果を該当プロセスに反映する。該当 PID がなければ `false`。
    pub fn mark_pid(&mut self, pid: pid_t, raw_status: i32) -> bool {
        let Some(proc) = self.processes.iter_mut().find(|p| p.handle.pid == pid) else {
            return false;
        };
        if libc::WIFSTOPPED(raw_status) {
            proc.stopped = true;
        } else if libc::WIFCONTINUED(raw_status) {
            proc.stopped = false;
        } else {
            proc.status = raw_status;
            proc.completed = true;
            proc.stopped = false;
        }
        log::debug!(
            "job {} pid {} -> {:?} (raw {:#x})",
            self.id,
            pid,
            self.status(),
            raw_status
        );
        true
    }

    /// 未完了の全プロセスを停止扱いにする。
    pub fn mark_stopped(&mut self) {
        for proc in self.processes.iter_mut().filter(|p| !p.completed) {
            proc.stopped = true;
        }
    }

    /// SIGCONT 送信後に呼ぶ。停止フラグを下ろして Running に戻す。
    pub fn mark_running(&mut self) {
        for proc in &mut self.processes {
            proc.stopped = false;
        }
    }

    /// 待機すべきプロセスがもう存在しない（ECHILD）ときに全プロセスを完了扱いにする。
    fn mark_vanished(&mut self) {
        for proc in self.processes.iter_mut().filter(|p| !p.completed) {
            proc.completed = true;
            proc.stopped = false;
        }
    }
}

// ── エラー ───────────────────────────────────────────────────────────

/// `fg` / `bg` の失敗。状態は変更されない。
#[derive(Debug, Error, PartialEq)]
pub enum JobError {
    #[error("{0}: no such job")]
    NotFound(String),
    #[error("job {0} already in background")]
    AlreadyRunning(usize),
    #[error("job {0} has terminated")]
    Terminated(usize),
    #[error("current: no such job")]
    NoCurrentJob,
}

// ── JobTable ─────────────────────────────────────────────────────────

/// ジョブテーブル。ジョブの追加・検索・状態更新・削除を管理する。
///
/// 並びは作成順（`jobs` 一覧の順序）。ID は生存中のジョブ間で一意で、削除後にのみ再利用される。
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: Vec<Job>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最小未使用 ID。
    fn free_id(&self) -> usize {
        (1..)
            .find(|id| !self.jobs.iter().any(|j| j.id == *id))
            .unwrap_or(1)
    }

    /// 新しいジョブを追加し、割り当てた ID を返す。
    pub fn insert(&mut self, pgid: pid_t, command: String, pids: &[pid_t]) -> usize {
        self.adopt(Job::new(pgid, command, pids))
    }

    /// 既存の [`Job`]（停止したフォアグラウンドジョブ等）をテーブルに移し、ID を返す。
    pub fn adopt(&mut self, mut job: Job) -> usize {
        let id = self.free_id();
        job.id = id;
        log::info!("job [{}] pgid {} added: {}", id, job.pgid, job.command);
        self.jobs.push(job);
        id
    }

    pub fn get(&self, id: usize) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Job> {
        let idx = self.jobs.iter().position(|j| j.id == id)?;
        log::info!("job [{}] removed", id);
        Some(self.jobs.remove(idx))
    }

    /// `fg` / `bg` の省略時に選ばれるジョブ（最大 ID）。
    pub fn highest_id(&self) -> Option<usize> {
        self.jobs.iter().map(|j| j.id).max()
    }

    /// `fg` / `bg` の引数をジョブ ID に解決する。`N` と `%N` を受け付ける。
    pub fn resolve(&self, arg: Option<&str>) -> Result<usize, JobError> {
        let Some(arg) = arg else {
            return self.highest_id().ok_or(JobError::NoCurrentJob);
        };
        let digits = arg.strip_prefix('%').unwrap_or(arg);
        match digits.parse::<usize>() {
            Ok(id) if self.get(id).is_some() => Ok(id),
            _ => Err(JobError::NotFound(arg.to_string())),
        }
    }

    /// PID の状態変化を所属ジョブに反映する。
    pub fn mark_pid(&mut self, pid: pid_t, raw_status: i32) {
        for job in &mut self.jobs {
            if job.mark_pid(pid, raw_status) {
                return;
            }
        }
    }

    /// まだ終了していないジョブのプロセスグループ ID。reap 対象。
    pub fn live_pgids(&self) -> Vec<pid_t> {
        self.jobs
            .iter()
            .filter(|j| !j.is_done())
            .map(|j| j.pgid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    /// 報告済みの Done ジョブを削除する。
    fn remove_notified(&mut self) {
        self.jobs.retain(|j| !(j.notified && j.is_done()));
    }

    /// `jobs` ビルトインの出力。全ジョブを `[N]  Status   cmd` 形式で書き出し、
    /// 一覧に出した Done ジョブは報告済みとして削除する。
    pub fn list(&mut self, out: &mut dyn Write) -> io::Result<()> {
        for job in &mut self.jobs {
            writeln!(out, "[{}]  {:<8}  {}", job.id, job.status().as_str(), job.command)?;
            if job.is_done() {
                job.notified = true;
            }
        }
        self.remove_notified();
        Ok(())
    }

    /// プロンプト前の完了通知。未報告の Done ジョブを `out` に書き出して削除する。
    pub fn notify_and_clean(&mut self, out: &mut dyn Write) {
        for job in self.jobs.iter_mut().filter(|j| j.is_done() && !j.notified) {
            let _ = writeln!(out, "[{}]   Done   {}", job.id, job.command);
            job.notified = true;
        }
        self.remove_notified();
    }
}

// ── 待機ヘルパー ─────────────────────────────────────────────────────

/// フォアグラウンドジョブを待機する。
///
/// `waitpid(-pgid, WUNTRACED)` をループし、全プロセスが完了するか、
/// いずれかが停止するまでブロックする。SIGINT による `EINTR` は再試行する
/// （SIGINT 自体はシグナルハンドラがフォアグラウンドグループへ転送済み）。
///
/// 戻り値: `(終了ステータス, 停止したか)`。停止時のステータスは 148（128 + SIGTSTP）。
pub fn wait_for_fg(job: &mut Job) -> (i32, bool) {
    loop {
        match job.status() {
            JobStatus::Done(code) => return (code, false),
            JobStatus::Stopped => return (128 + libc::SIGTSTP, true),
            JobStatus::Running => {}
        }

        let mut raw_status: i32 = 0;
        let pid = unsafe { libc::waitpid(-job.pgid, &mut raw_status, libc::WUNTRACED) };
        if pid > 0 {
            job.mark_pid(pid, raw_status);
            continue;
        }
        if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        // ECHILD: 既に誰かが reap 済み
        job.mark_vanished();
    }
}

// ── ターミナル制御ヘルパー ───────────────────────────────────────────

/// フォアグラウンド待機時のターミナル受け渡しに必要な値。
#[derive(Debug, Clone, Copy)]
pub struct Terminal {
    pub fd: i32,
    pub shell_pgid: pid_t,
    /// `false` なら `tcsetpgrp` を呼ばない。
    pub interactive: bool,
}

/// `tcsetpgrp` でターミナルのフォアグラウンドプロセスグループを `pgid` に設定する。
///
/// シェルが SIGTTOU を無視しているため、バックグラウンドからの呼び出しでもブロックしない。
pub fn give_terminal_to(terminal_fd: i32, pgid: pid_t) {
    unsafe {
        libc::tcsetpgrp(terminal_fd, pgid);
    }
}

/// ターミナルのフォアグラウンドプロセスグループをシェルに戻す。
pub fn take_terminal_back(terminal_fd: i32, shell_pgid: pid_t) {
    unsafe {
        libc::tcsetpgrp(terminal_fd, shell_pgid);
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// `W_EXITCODE(code, 0)` 相当の raw status。
    fn exited(code: i32) -> i32 {
        code << 8
    }

    /// `W_STOPCODE(SIGTSTP)` 相当の raw status。
    fn stopped() -> i32 {
        (libc::SIGTSTP << 8) | 0x7f
    }

    fn listing(table: &mut JobTable) -> String {
        let mut out = Vec::new();
        table.list(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn ids_start_at_one_and_reuse_smallest_free() {
        let mut t = JobTable::new();
        assert_eq!(t.insert(100, "a".into(), &[100]), 1);
        assert_eq!(t.insert(200, "b".into(), &[200]), 2);
        assert_eq!(t.insert(300, "c".into(), &[300]), 3);
        t.remove(2);
        assert_eq!(t.insert(400, "d".into(), &[400]), 2);
        assert_eq!(t.insert(500, "e".into(), &[500]), 4);
    }

    #[test]
    fn id_not_reused_while_done_entry_remains() {
        let mut t = JobTable::new();
        let id = t.insert(100, "a".into(), &[100]);
        t.mark_pid(100, exited(0));
        assert!(t.get(id).unwrap().is_done());
        assert_eq!(t.insert(200, "b".into(), &[200]), 2);
    }

    #[test]
    fn pipeline_status_is_last_stage() {
        let mut job = Job::new(10, "false | true".into(), &[10, 11]);
        job.mark_pid(11, exited(0));
        assert_eq!(job.status(), JobStatus::Running);
        job.mark_pid(10, exited(1));
        assert_eq!(job.status(), JobStatus::Done(0));
    }

    #[test]
    fn signal_death_is_128_plus_signal() {
        let mut job = Job::new(10, "sleep 9".into(), &[10]);
        job.mark_pid(10, libc::SIGKILL);
        assert_eq!(job.status(), JobStatus::Done(128 + libc::SIGKILL));
    }

    #[test]
    fn running_stopped_running_done_is_visible_in_listing() {
        let mut t = JobTable::new();
        let id = t.insert(10, "sleep 9".into(), &[10]);
        assert_eq!(listing(&mut t), "[1]  Running   sleep 9\n");

        t.mark_pid(10, stopped());
        assert_eq!(listing(&mut t), "[1]  Stopped   sleep 9\n");

        t.mark_pid(10, 0xffff); // WIFCONTINUED
        assert_eq!(t.get(id).unwrap().status(), JobStatus::Running);
        assert_eq!(listing(&mut t), "[1]  Running   sleep 9\n");

        t.mark_pid(10, exited(0));
        assert_eq!(listing(&mut t), "[1]  Done      sleep 9\n");
        // Done は 1 度報告されたら消える
        assert!(t.is_empty());
        assert_eq!(listing(&mut t), "");
    }

    #[test]
    fn notify_reports_done_once() {
        let mut t = JobTable::new();
        t.insert(10, "a".into(), &[10]);
        t.insert(20, "b".into(), &[20]);
        t.mark_pid(20, exited(3));

        let mut out = Vec::new();
        t.notify_and_clean(&mut out);
        assert_eq!(String::from_utf8(out).unwrap(), "[2]   Done   b\n");
        assert_eq!(t.len(), 1);

        let mut out = Vec::new();
        t.notify_and_clean(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn resolve_job_arguments() {
        let mut t = JobTable::new();
        assert_eq!(t.resolve(None), Err(JobError::NoCurrentJob));
        t.insert(10, "a".into(), &[10]);
        t.insert(20, "b".into(), &[20]);
        assert_eq!(t.resolve(None), Ok(2));
        assert_eq!(t.resolve(Some("1")), Ok(1));
        assert_eq!(t.resolve(Some("%2")), Ok(2));
        assert_eq!(t.resolve(Some("7")), Err(JobError::NotFound("7".into())));
        assert_eq!(t.resolve(Some("x")), Err(JobError::NotFound("x".into())));
    }

    #[test]
    fn mark_stopped_and_running() {
        let mut job = Job::new(10, "a | b".into(), &[10, 11]);
        job.mark_pid(10, exited(0));
        job.mark_stopped();
        assert_eq!(job.status(), JobStatus::Stopped);
        assert!(!job.processes[0].stopped);
        job.mark_running();
        assert_eq!(job.status(), JobStatus::Running);
    }

    #[test]
    fn live_pgids_skip_done() {
        let mut t = JobTable::new();
        t.insert(10, "a".into(), &[10]);
        t.insert(20, "b".into(), &[20]);
        t.mark_pid(10, exited(0));
        assert_eq!(t.live_pgids(), vec![20]);
    }
}
