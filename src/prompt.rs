//! プロンプト描画。
//!
//! [`ShellState::prompt_context`](crate::shell::ShellState::prompt_context) のスナップショットから
//! 文字列を組み立てるだけで、状態には触れない。
//!
//! 形式: `[status] {jobs}j cwd kaze$ `（status は非ゼロ時のみ、jobs は 1 以上のときのみ）。
//! cwd は `$HOME` 配下なら `~` に短縮する。

use std::path::PathBuf;

/// プロンプト描画に必要な状態のスナップショット。
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub last_exit_status: i32,
    pub job_count: usize,
    pub cwd: PathBuf,
}

fn display_cwd(ctx: &PromptContext) -> String {
    let cwd = ctx.cwd.to_string_lossy();
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() && home != "/" {
            if cwd == home {
                return "~".to_string();
            }
            if let Some(rest) = cwd.strip_prefix(&home) {
                if rest.starts_with('/') {
                    return format!("~{}", rest);
                }
            }
        }
    }
    cwd.into_owned()
}

pub fn render(ctx: &PromptContext) -> String {
    let mut prompt = String::new();
    if ctx.last_exit_status != 0 {
        prompt.push_str(&format!("[{}] ", ctx.last_exit_status));
    }
    if ctx.job_count > 0 {
        prompt.push_str(&format!("{}j ", ctx.job_count));
    }
    prompt.push_str(&display_cwd(ctx));
    prompt.push_str(" kaze$ ");
    prompt
}
