//! homelab-agent: セルフホスト環境向けインテント解決エージェント
//!
//! チャットメッセージを埋め込みベースでスキルにルーティングし、
//! 確信が持てない場合のみローカルLLMのツール呼び出しにフォールバック
//! する。スキル実行の失敗は人間の承認を経た自己修復ループで処理する。

pub mod agent;
pub mod annealing;
pub mod config;
pub mod error;
pub mod llm;
pub mod routing;
pub mod skills;

// 主要な型の再エクスポート
pub use agent::{AgentPipeline, ChatHistory};
pub use annealing::{AnnealingLoop, ApprovalChannel, ApprovalStore, ErrorLog, LlmFixGenerator};
pub use config::Config;
pub use error::{ExecutionFailureKind, PipelineError};
pub use llm::{ChatProvider, HttpChatClient, IntentClassifier};
pub use routing::{EmbeddingCache, HttpEmbeddingClient, SemanticRouter};
pub use skills::{SkillExecutor, SkillRegistry};

/// バージョン情報
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
