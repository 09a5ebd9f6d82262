//! シェルのグローバル状態を保持するモジュール。
//!
//! [`ShellState`] は `main` が 1 つだけ所有し、executor・ビルトイン・行エディタに
//! `&mut` で渡される。シグナルハンドラ用の atomic 以外にグローバル状態はない。
//!
//! 環境変数は `env` に写しを持ちつつ、変更時は `std::env` にも反映する。
//! 子プロセスは `posix_spawn` の `environ` 経由でこれを継承する。

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::io;
use std::path::{Path, PathBuf};

use libc::pid_t;

use crate::config::Config;
use crate::history::History;
use crate::job::{JobTable, Terminal};
use crate::prompt::PromptContext;

/// シェルの実行状態。REPL ループ全体で共有される。
pub struct ShellState {
    /// 直前のコマンドの終了ステータス。プロンプト表示、`exit` のデフォルト値、`$?` 展開に使う。
    pub last_status: i32,
    /// `exit` ビルトインで true にセットされ、REPL ループを終了させる。
    pub should_exit: bool,
    /// ジョブテーブル。バックグラウンド/停止ジョブを管理する。
    pub jobs: JobTable,
    /// エイリアスマップ。`alias name=value` で定義される。
    pub aliases: HashMap<String, String>,
    /// OS 環境の写し。`export` / `unset` で更新される。
    pub env: BTreeMap<String, String>,
    /// カレントディレクトリ。`cd` で更新される。
    pub cwd: PathBuf,
    pub history: History,
    /// シェル自身のプロセスグループ ID。
    pub shell_pgid: pid_t,
    /// ターミナルのファイルディスクリプタ（通常 STDIN_FILENO）。
    pub terminal_fd: i32,
    /// ターミナルを制御しているか。`false` の間は `tcsetpgrp` を呼ばない。
    pub interactive: bool,
}

impl ShellState {
    /// 状態を初期化する。ターミナルには触れない（[`enable_job_control`](Self::enable_job_control) を参照）。
    pub fn new(history: History) -> Self {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self {
            last_status: 0,
            should_exit: false,
            jobs: JobTable::new(),
            aliases: HashMap::new(),
            env: env::vars().collect(),
            cwd,
            history,
            shell_pgid: unsafe { libc::getpgrp() },
            terminal_fd: libc::STDIN_FILENO,
            interactive: false,
        }
    }

    /// 標準入力が端末なら、シェルを自身のプロセスグループリーダーにしてターミナルを掌握する。
    ///
    /// 端末でなければ何もしない（パイプ入力やテスト実行時）。
    pub fn enable_job_control(&mut self) -> io::Result<()> {
        if unsafe { libc::isatty(self.terminal_fd) } == 0 {
            return Ok(());
        }
        unsafe {
            let pid = libc::getpid();
            // セッションリーダーの場合は EPERM になるが、既にグループリーダーなので問題ない
            if libc::getpgrp() != pid {
                libc::setpgid(pid, pid);
            }
            self.shell_pgid = libc::getpgrp();
            if libc::tcsetpgrp(self.terminal_fd, self.shell_pgid) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        self.interactive = true;
        log::info!("job control enabled (pgid {})", self.shell_pgid);
        Ok(())
    }

    pub fn terminal(&self) -> Terminal {
        Terminal {
            fd: self.terminal_fd,
            shell_pgid: self.shell_pgid,
            interactive: self.interactive,
        }
    }

    // ── 環境変数 ─────────────────────────────────────────────────

    pub fn set_env(&mut self, key: &str, value: &str) {
        env::set_var(key, value);
        self.env.insert(key.to_string(), value.to_string());
    }

    pub fn unset_env(&mut self, key: &str) {
        env::remove_var(key);
        self.env.remove(key);
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// カレントディレクトリを変更し、`PWD` / `OLDPWD` を更新する。
    pub fn change_dir(&mut self, target: &Path) -> io::Result<()> {
        env::set_current_dir(target)?;
        let old = std::mem::replace(
            &mut self.cwd,
            env::current_dir().unwrap_or_else(|_| target.to_path_buf()),
        );
        let old = old.to_string_lossy().into_owned();
        let new = self.cwd.to_string_lossy().into_owned();
        self.set_env("OLDPWD", &old);
        self.set_env("PWD", &new);
        Ok(())
    }

    /// 設定ファイルのエイリアスと環境変数を取り込む。
    pub fn apply_config(&mut self, config: &Config) {
        for (name, value) in &config.aliases {
            self.aliases.insert(name.clone(), value.clone());
        }
        for (key, value) in &config.env {
            self.set_env(key, value);
        }
    }

    /// プロンプト描画用のスナップショット。
    pub fn prompt_context(&self) -> PromptContext {
        PromptContext {
            last_exit_status: self.last_status,
            job_count: self.jobs.len(),
            cwd: self.cwd.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_does_not_take_terminal() {
        let state = ShellState::new(History::in_memory(10, true));
        assert!(!state.interactive);
        assert_eq!(state.last_status, 0);
        assert!(state.jobs.is_empty());
        assert!(state.cwd.is_absolute());
    }

    #[test]
    fn env_changes_reach_process_environment() {
        let mut state = ShellState::new(History::in_memory(10, true));
        state.set_env("KAZE_SHELL_TEST_VAR", "1");
        assert_eq!(env::var("KAZE_SHELL_TEST_VAR").as_deref(), Ok("1"));
        assert_eq!(state.get_env("KAZE_SHELL_TEST_VAR"), Some("1"));
        state.unset_env("KAZE_SHELL_TEST_VAR");
        assert!(env::var("KAZE_SHELL_TEST_VAR").is_err());
        assert_eq!(state.get_env("KAZE_SHELL_TEST_VAR"), None);
    }

    #[test]
    fn apply_config_merges_aliases_and_env() {
        let config: Config = toml::from_str(
            "[aliases]\nll = \"ls -la\"\n[env]\nKAZE_SHELL_CONFIG_VAR = \"vi\"\n",
        )
        .unwrap();
        let mut state = ShellState::new(History::in_memory(10, true));
        state.apply_config(&config);
        assert_eq!(state.aliases.get("ll").map(String::as_str), Some("ls -la"));
        assert_eq!(env::var("KAZE_SHELL_CONFIG_VAR").as_deref(), Ok("vi"));
        state.unset_env("KAZE_SHELL_CONFIG_VAR");
    }
}
