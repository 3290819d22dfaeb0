//! スキル実行器 - 外部スクリプトの隔離実行
//!
//! スキルスクリプトを子プロセスとして起動し、ウォールクロック
//! タイムアウトを強制する。書き込み系アクションはプロセス起動前に
//! 権限チェックを行い、拒否はannealing対象にしないハード失敗とする。

use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::ExecutorConfig;
use crate::error::{ExecutionFailureKind, PipelineError};
use crate::routing::IntentResult;

use super::registry::SkillSnapshot;

/// 実行の妥当性チェック結果
///
/// Invalidはユーザー向けに即時返す（コード修正では直らないため
/// annealingへは回さない）。
#[derive(Debug)]
pub enum ExecOutcome {
    /// 正常終了、整形済み出力
    Success(String),
    /// スキル/アクションが不明など、リクエスト自体が不正
    Invalid(String),
}

/// スキル実行器
pub struct SkillExecutor {
    config: ExecutorConfig,
    /// 出力の切り詰め上限（文字数）
    max_output_chars: usize,
}

impl SkillExecutor {
    /// 設定から実行器を作成
    pub fn new(config: ExecutorConfig, context_size: usize) -> Self {
        Self {
            config,
            // コンテキストの約2文字/トークンを上限にしてプロンプト余地を残す
            max_output_chars: context_size * 2,
        }
    }

    /// 分類済みインテントを実行
    pub async fn execute(
        &self,
        intent: &IntentResult,
        snapshot: &SkillSnapshot,
        user_id: Option<i64>,
    ) -> Result<ExecOutcome, PipelineError> {
        let skill = match snapshot.get(&intent.skill) {
            Some(s) => s,
            None => {
                return Ok(ExecOutcome::Invalid(format!(
                    "Unbekannter Skill: {}. Verfügbar: {}",
                    intent.skill,
                    snapshot.names().join(", ")
                )));
            }
        };

        let action = match &intent.action {
            Some(a) => a.replace('_', "-"),
            None => {
                let valid: Vec<&str> = skill.actions.iter().map(|a| a.name.as_str()).collect();
                return Ok(ExecOutcome::Invalid(format!(
                    "Keine Aktion für {} angegeben. Verfügbar: {}",
                    intent.skill,
                    valid.join(", ")
                )));
            }
        };

        // 権限チェックはプロセス起動前（annealing対象外のハード失敗）
        if skill.is_admin_action(&action) {
            let authorized = user_id
                .map(|id| self.config.admin_users.contains(&id))
                .unwrap_or(false);
            if !authorized {
                return Err(PipelineError::AuthorizationDenied {
                    skill: intent.skill.clone(),
                    action: action.clone(),
                });
            }
        }

        let script = match &skill.script_path {
            Some(p) => p.clone(),
            None => {
                return Ok(ExecOutcome::Invalid(format!(
                    "Skill '{}' ist nur Dokumentation (kein Script)",
                    intent.skill
                )));
            }
        };

        if skill.find_action(&action).is_none() && !skill.actions.is_empty() {
            let valid: Vec<&str> = skill.actions.iter().map(|a| a.name.as_str()).collect();
            return Ok(ExecOutcome::Invalid(format!(
                "Unbekannte Aktion '{}' für {}. Verfügbar: {}",
                action,
                intent.skill,
                valid.join(", ")
            )));
        }

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.arg(&script).arg(&action);

        // 引数はソートして決定的な順序で渡す
        let mut args: Vec<(&String, &String)> = intent.args.iter().collect();
        args.sort_by_key(|(k, _)| k.as_str());
        for (key, value) in args {
            cmd.arg(format!("--{}", key)).arg(value);
        }

        // 要約出力をサポートするスキルには--humanを付ける
        if skill.metadata.summarize {
            cmd.arg("--human");
        }

        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::debug!(
            skill = %intent.skill,
            action = %action,
            script = %script.display(),
            "Spawning skill process"
        );

        let timeout = std::time::Duration::from_secs(self.config.skill_timeout);
        let result = tokio::time::timeout(timeout, async {
            let mut child = cmd.spawn().map_err(|e| {
                PipelineError::ExecutionFailure {
                    kind: ExecutionFailureKind::SpawnFailed,
                    message: format!("Failed to spawn {}: {}", script.display(), e),
                }
            })?;

            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(mut out) = child.stdout.take() {
                let _ = out.read_to_string(&mut stdout).await;
            }
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr).await;
            }

            let status = child.wait().await.map_err(|e| {
                PipelineError::ExecutionFailure {
                    kind: ExecutionFailureKind::SpawnFailed,
                    message: e.to_string(),
                }
            })?;

            Ok::<_, PipelineError>((status, stdout, stderr))
        })
        .await;

        match result {
            Ok(Ok((status, stdout, stderr))) => {
                if status.success() {
                    Ok(ExecOutcome::Success(self.format_output(&stdout)))
                } else {
                    // 非ゼロ終了はSelf-Annealingへ
                    Err(PipelineError::ExecutionFailure {
                        kind: ExecutionFailureKind::NonZeroExit,
                        message: format!(
                            "exit code {}: {}",
                            status.code().unwrap_or(-1),
                            if stderr.is_empty() { &stdout } else { &stderr }
                        ),
                    })
                }
            }
            Ok(Err(e)) => Err(e),
            // タイムアウト: futureのdropでkill_on_dropが子プロセスを終了させる
            Err(_) => Err(PipelineError::ExecutionFailure {
                kind: ExecutionFailureKind::Timeout,
                message: format!("Script timeout after {}s", self.config.skill_timeout),
            }),
        }
    }

    /// 出力をLLMコンテキストに収まるよう切り詰め
    fn format_output(&self, output: &str) -> String {
        if output.len() > self.max_output_chars {
            let cut = self.max_output_chars.saturating_sub(50);
            // UTF-8境界に合わせて切る
            let boundary = (0..=cut).rev().find(|&i| output.is_char_boundary(i)).unwrap_or(0);
            format!("{}\n\n... (gekürzt)", &output[..boundary])
        } else {
            output.trim().to_string()
        }
    }
}
