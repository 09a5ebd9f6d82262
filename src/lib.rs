//! kaze ライブラリ: バイナリ・結合テスト・ベンチマークから各モジュールを使うために公開する。
//!
//! バイナリ本体は `main.rs` の REPL ループ。
//!
//! ## モジュール構成
//!
//! | モジュール | 役割 |
//! |-----------|------|
//! | [`editor`] | 行エディタ（raw モード、キー入力、履歴ブラウズ、逆方向インクリメンタル検索） |
//! | [`history`] | コマンド履歴（`~/.kaze_history` 永続化、終了ステータス・時刻付き、重複抑制） |
//! | [`complete`] | Tab 補完（ビルトイン・エイリアス・`$PATH` のコマンド名、ファイル名、`|` 後のコマンド位置認識） |
//! | [`parser`] | 構文解析（パイプライン、リダイレクト、クォート、エスケープ、変数展開、エイリアス展開、`&`） |
//! | [`executor`] | コマンド実行（パイプライン接続、コマンド置換、プロセスグループ管理、フォアグラウンド待機） |
//! | [`builtins`] | ビルトイン（`alias`, `bg`, `cd`, `exit`, `export`, `fg`, `history`, `jobs`, `pwd`, `unalias`, `unset`） |
//! | [`job`] | ジョブテーブル（バックグラウンド実行、Ctrl+Z サスペンド、完了通知） |
//! | [`signal`] | シグナルハンドラ（SIGCHLD / SIGINT 転送）と子プロセスの回収 |
//! | [`spawn`] | `posix_spawn` ラッパー（外部コマンド起動） |
//! | [`shell`] | シェルのグローバル状態（終了ステータス、ジョブ、エイリアス、環境、履歴） |
//! | [`prompt`] | プロンプト文字列の組み立て |
//! | [`config`] | `~/.config/kaze/config.toml` の読み込み |
//! | [`logging`] | ファイルへのログ出力（`KAZE_LOG` で上書き可能） |

pub mod builtins;
pub mod complete;
pub mod config;
pub mod editor;
pub mod executor;
pub mod history;
pub mod job;
pub mod logging;
pub mod parser;
pub mod prompt;
pub mod shell;
pub mod signal;
pub mod spawn;
