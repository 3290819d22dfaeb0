//! パイプライン全体のエラー分類
//!
//! どの失敗も致命的にはしない方針: プロバイダ系は劣化、認可系は即時通知、
//! 実行系はSelf-Annealingへ回す。

use thiserror::Error;

/// 実行失敗の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailureKind {
    /// 非ゼロ終了コード
    NonZeroExit,
    /// ウォールクロックタイムアウト
    Timeout,
    /// プロセス起動失敗
    SpawnFailed,
}

impl ExecutionFailureKind {
    /// エラーログ用の名前
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionFailureKind::NonZeroExit => "NonZeroExit",
            ExecutionFailureKind::Timeout => "Timeout",
            ExecutionFailureKind::SpawnFailed => "SpawnFailed",
        }
    }
}

/// パイプラインのエラー分類
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 埋め込み/LLMプロバイダに到達できない（LOW tierや会話応答へ劣化）
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// LLMのツール呼び出しが解析不能（1回リトライ後に劣化）
    #[error("unparseable tool call: {0}")]
    ParseError(String),

    /// 書き込み系アクションの権限なし（即時ハード失敗、annealing対象外）
    #[error("authorization denied for {skill}/{action}")]
    AuthorizationDenied { skill: String, action: String },

    /// スキル実行失敗（Self-Annealingへ）
    #[error("execution failed ({kind:?}): {message}")]
    ExecutionFailure {
        kind: ExecutionFailureKind,
        message: String,
    },

    /// 承認がタイムアウトした（暗黙の拒否）
    #[error("approval {0} expired without decision")]
    ApprovalExpired(String),
}

impl PipelineError {
    /// ユーザー向けの平易なメッセージに変換
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::ProviderUnavailable(_) => {
                "Der KI-Dienst ist gerade nicht erreichbar. Bitte später erneut versuchen.".to_string()
            }
            PipelineError::ParseError(_) => {
                "Ich konnte die Anfrage nicht eindeutig zuordnen. Kannst du sie umformulieren?".to_string()
            }
            PipelineError::AuthorizationDenied { skill, action } => {
                format!("Nur Admins dürfen '{}' auf {} ausführen.", action, skill)
            }
            PipelineError::ExecutionFailure { kind, message } => match kind {
                ExecutionFailureKind::Timeout => {
                    "Timeout: Der Skill brauchte zu lange (>30s).".to_string()
                }
                _ => format!("Ausführungsfehler: {}", message),
            },
            PipelineError::ApprovalExpired(_) => {
                "Keine Entscheidung eingetroffen - kein Fix angewendet.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_message_names_action() {
        let err = PipelineError::AuthorizationDenied {
            skill: "proxmox".to_string(),
            action: "stop".to_string(),
        };
        let msg = err.user_message();
        assert!(msg.contains("stop"));
        assert!(msg.contains("proxmox"));
    }

    #[test]
    fn test_timeout_message() {
        let err = PipelineError::ExecutionFailure {
            kind: ExecutionFailureKind::Timeout,
            message: "killed".to_string(),
        };
        assert!(err.user_message().contains("Timeout"));
    }
}
