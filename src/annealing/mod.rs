//! 自己修復ループ
//!
//! スキル実行の失敗を記録し、LLMにフィックス案を生成させ、
//! 人間の承認を経てから編集を適用する。承認なしに書き込みは
//! 一切行われない。

pub mod approval;
pub mod edit;
pub mod fix;
pub mod log;

pub use approval::{ApprovalChannel, ApprovalStatus, ApprovalStore, PendingApproval};
pub use edit::{apply_edit, check_edit, EditError, ProposedEdit};
pub use fix::{ErrorContext, FixGenerator, LlmFixGenerator, ProposedFix, MIN_FIX_CONFIDENCE};
pub use log::{ErrorLog, ErrorRecord, ErrorStatus};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{ExecutionFailureKind, PipelineError};
use crate::routing::IntentResult;
use crate::skills::{SkillRegistry, SkillSnapshot};

/// フィックス生成に渡すソース断片の上限
const SOURCE_FRAGMENT_LIMIT: usize = 6000;

/// 承認待ちのフィックスと付随情報
struct PendingFix {
    error_id: String,
    skill_dir: PathBuf,
    requester_id: i64,
    fix: ProposedFix,
}

pub struct AnnealingLoop {
    generator: Arc<dyn FixGenerator>,
    store: Arc<ApprovalStore>,
    channel: Arc<dyn ApprovalChannel>,
    log: Arc<ErrorLog>,
    registry: Arc<SkillRegistry>,
    approver_id: i64,
    pending: Mutex<HashMap<String, PendingFix>>,
}

impl AnnealingLoop {
    pub fn new(
        generator: Arc<dyn FixGenerator>,
        store: Arc<ApprovalStore>,
        channel: Arc<dyn ApprovalChannel>,
        log: Arc<ErrorLog>,
        registry: Arc<SkillRegistry>,
        approver_id: i64,
    ) -> Self {
        Self {
            generator,
            store,
            channel,
            log,
            registry,
            approver_id,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingFix>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// スキル実行の失敗を処理する
    ///
    /// エラーを記録し、フィックス案を生成して承認者に送る。
    /// 確信度の低い案は適用せず、分析結果の通知のみ行う。
    pub async fn handle_failure(
        &self,
        intent: &IntentResult,
        kind: ExecutionFailureKind,
        message: &str,
        snapshot: &SkillSnapshot,
        user_id: i64,
    ) {
        let error_id = match self.log.record_error(
            &intent.skill,
            intent.action.as_deref(),
            kind.as_str(),
            message,
        ) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, "Failed to record error");
                return;
            }
        };

        let Some(skill) = snapshot.get(&intent.skill) else {
            tracing::warn!(skill = %intent.skill, "Failed skill no longer in snapshot");
            return;
        };

        let context = ErrorContext {
            skill: intent.skill.clone(),
            action: intent.action.clone(),
            error_kind: kind.as_str().to_string(),
            error_message: message.to_string(),
            source_fragment: load_source_fragment(skill),
        };

        let Some(fix) = self.generator.generate_fix(&context).await else {
            tracing::info!(error_id, "No fix generated");
            return;
        };

        if !fix.is_actionable() {
            // 確信度が低い、または編集なし: 通知のみ
            let note = format!(
                "Fehler in {} analysiert, aber kein automatischer Fix möglich:\n{}",
                intent.skill, fix.analysis
            );
            if let Err(e) = self.channel.notify(user_id, &note).await {
                tracing::warn!(error = %e, "Failed to notify user");
            }
            return;
        }

        let summary = format_fix_summary(&intent.skill, &fix);
        let approval = self.store.insert(summary.clone(), user_id);

        if let Err(e) = self.log.update_status(&error_id, ErrorStatus::FixProposed) {
            tracing::warn!(error = %e, "Failed to update error status");
        }

        self.pending_lock().insert(
            approval.id.clone(),
            PendingFix {
                error_id,
                skill_dir: skill.path.clone(),
                requester_id: user_id,
                fix,
            },
        );

        if let Err(e) = self
            .channel
            .send_decision_request(self.approver_id, &summary, &approval.id)
            .await
        {
            tracing::error!(error = %e, "Failed to send approval request");
        }
    }

    /// 承認者の決定を処理する
    ///
    /// 決定は1回だけ受理される。承認された場合は全編集の一意性を
    /// 先に検証し、1件でも衝突すれば何も書き込まない。
    pub async fn on_decision(
        &self,
        approval_id: &str,
        approved: bool,
    ) -> Result<String, PipelineError> {
        let resolved = self.store.resolve(approval_id, approved)?;

        let Some(pending) = self.pending_lock().remove(approval_id) else {
            return Err(PipelineError::ApprovalExpired(approval_id.to_string()));
        };

        if !approved {
            if let Err(e) = self.log.update_status(&pending.error_id, ErrorStatus::Rejected) {
                tracing::warn!(error = %e, "Failed to update error status");
            }
            tracing::info!(approval_id, "Fix rejected");
            return Ok("Fix verworfen. Der Fehler bleibt offen.".to_string());
        }

        // 先に全編集を検証: 部分適用は許さない
        for edit in &pending.fix.edits {
            let path = pending.skill_dir.join(&edit.file);
            if let Err(e) = check_edit(&path, &edit.old_text) {
                tracing::warn!(approval_id, error = %e, "Edit conflict, nothing applied");
                return Ok(format!(
                    "Fix konnte nicht angewendet werden ({}). Der Fehler bleibt offen.",
                    e
                ));
            }
        }

        for edit in &pending.fix.edits {
            let path = pending.skill_dir.join(&edit.file);
            if let Err(e) = apply_edit(&path, &edit.old_text, &edit.new_text) {
                // 検証後の失敗は想定外だが、残りの編集は中断する
                tracing::error!(approval_id, error = %e, "Edit failed after check");
                return Ok(format!(
                    "Fix konnte nicht vollständig angewendet werden ({}).",
                    e
                ));
            }
        }

        if let Err(e) = self.log.update_status(&pending.error_id, ErrorStatus::Resolved) {
            tracing::warn!(error = %e, "Failed to update error status");
        }

        // 変更されたスキルを再読み込み
        if let Err(e) = self.registry.reload().await {
            tracing::warn!(error = %e, "Skill reload after fix failed");
        }

        tracing::info!(
            approval_id,
            edits = pending.fix.edits.len(),
            requester = resolved.requester_id,
            "Fix applied"
        );
        Ok(format!(
            "Fix angewendet ({} Änderung(en)). Skill wurde neu geladen.",
            pending.fix.edits.len()
        ))
    }

    /// 期限切れスイープを定期実行するタスクを起動
    pub fn spawn_sweeper(self: &Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.sweep_expired().await;
            }
        })
    }

    /// 期限切れの承認リクエストを処理する
    pub async fn sweep_expired(&self) {
        for expired in self.store.sweep() {
            let pending = self.pending_lock().remove(&expired.id);

            if let Some(pending) = pending {
                if let Err(e) = self.log.update_status(&pending.error_id, ErrorStatus::Expired) {
                    tracing::warn!(error = %e, "Failed to update error status");
                }
            }

            let message = PipelineError::ApprovalExpired(expired.id.clone()).user_message();
            if let Err(e) = self.channel.notify(expired.requester_id, &message).await {
                tracing::warn!(error = %e, "Failed to notify about expiry");
            }
        }
    }

    pub fn approval_store(&self) -> &Arc<ApprovalStore> {
        &self.store
    }
}

/// 承認者に見せるフィックスの要約
fn format_fix_summary(skill: &str, fix: &ProposedFix) -> String {
    let mut summary = format!(
        "Fix-Vorschlag für {skill} (Confidence: {:.0}%)\n\nAnalyse: {}\n",
        fix.confidence * 100.0,
        fix.analysis
    );
    if let Some(desc) = &fix.fix_description {
        summary.push_str(&format!("\nFix: {}\n", desc));
    }
    summary.push_str("\nÄnderungen:\n");
    for edit in &fix.edits {
        summary.push_str(&format!("- {}\n", edit.file));
    }
    summary
}

/// フィックス生成のためにスキルスクリプトを読み込む
fn load_source_fragment(skill: &crate::skills::Skill) -> String {
    let Some(script_path) = &skill.script_path else {
        return String::new();
    };

    match std::fs::read_to_string(script_path) {
        Ok(content) if content.len() > SOURCE_FRAGMENT_LIMIT => {
            let mut end = SOURCE_FRAGMENT_LIMIT;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}\n... (gekürzt)", &content[..end])
        }
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read skill source");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ConfidenceSource;
    use crate::skills::loader::SkillMetadata;
    use crate::skills::Skill;
    use async_trait::async_trait;
    use std::time::Duration;

    /// 固定のフィックスを返すスタブ
    struct StubGenerator {
        fix: Option<ProposedFix>,
    }

    #[async_trait]
    impl FixGenerator for StubGenerator {
        async fn generate_fix(&self, _context: &ErrorContext) -> Option<ProposedFix> {
            self.fix.clone()
        }
    }

    /// 送信されたメッセージを記録するチャネル
    #[derive(Default)]
    struct RecordingChannel {
        decisions: Mutex<Vec<(i64, String, String)>>,
        notifications: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ApprovalChannel for RecordingChannel {
        async fn send_decision_request(
            &self,
            approver_id: i64,
            summary: &str,
            request_id: &str,
        ) -> anyhow::Result<()> {
            self.decisions.lock().unwrap().push((
                approver_id,
                summary.to_string(),
                request_id.to_string(),
            ));
            Ok(())
        }

        async fn notify(&self, user_id: i64, message: &str) -> anyhow::Result<()> {
            self.notifications
                .lock()
                .unwrap()
                .push((user_id, message.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        annealing: Arc<AnnealingLoop>,
        channel: Arc<RecordingChannel>,
        log: Arc<ErrorLog>,
        snapshot: SkillSnapshot,
        script_path: PathBuf,
    }

    fn setup(fix: Option<ProposedFix>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();

        let skill_dir = dir.path().join("skills").join("proxmox");
        let scripts_dir = skill_dir.join("scripts");
        std::fs::create_dir_all(&scripts_dir).unwrap();
        let script_path = scripts_dir.join("proxmox_api.py");
        std::fs::write(&script_path, "def main():\n    retrun 1\n").unwrap();

        let skill = Skill {
            metadata: SkillMetadata {
                name: "proxmox".to_string(),
                description: "VM management".to_string(),
                version: "1.0.0".to_string(),
                triggers: Vec::new(),
                intent_hints: Vec::new(),
                admin_actions: Vec::new(),
                summarize: false,
            },
            actions: Vec::new(),
            script_path: Some(script_path.clone()),
            path: skill_dir,
        };
        let snapshot = SkillSnapshot::for_tests(vec![skill]);

        let channel = Arc::new(RecordingChannel::default());
        let log = Arc::new(ErrorLog::new(dir.path().join("errors.jsonl")));
        let registry = Arc::new(SkillRegistry::new(dir.path().join("skills")));
        let annealing = Arc::new(AnnealingLoop::new(
            Arc::new(StubGenerator { fix }),
            Arc::new(ApprovalStore::new(Duration::from_secs(300))),
            channel.clone(),
            log.clone(),
            registry,
            99,
        ));

        Fixture {
            _dir: dir,
            annealing,
            channel,
            log,
            snapshot,
            script_path,
        }
    }

    fn good_fix() -> ProposedFix {
        ProposedFix {
            analysis: "Tippfehler".to_string(),
            fix_description: Some("retrun -> return".to_string()),
            edits: vec![ProposedEdit {
                file: "scripts/proxmox_api.py".to_string(),
                old_text: "retrun 1".to_string(),
                new_text: "return 1".to_string(),
            }],
            confidence: 0.9,
        }
    }

    fn intent() -> IntentResult {
        IntentResult::new("proxmox", Some("start".to_string()), ConfidenceSource::Embedding)
    }

    #[tokio::test]
    async fn test_failure_creates_approval_request() {
        let fx = setup(Some(good_fix()));

        fx.annealing
            .handle_failure(
                &intent(),
                ExecutionFailureKind::NonZeroExit,
                "SyntaxError",
                &fx.snapshot,
                42,
            )
            .await;

        let decisions = fx.channel.decisions.lock().unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].0, 99);
        assert!(decisions[0].1.contains("proxmox"));

        let states = fx.log.current_states().unwrap();
        assert!(states.values().any(|r| r.status == ErrorStatus::FixProposed));
    }

    #[tokio::test]
    async fn test_approved_fix_applied_and_resolved() {
        let fx = setup(Some(good_fix()));

        fx.annealing
            .handle_failure(&intent(), ExecutionFailureKind::NonZeroExit, "err", &fx.snapshot, 42)
            .await;

        let approval_id = fx.channel.decisions.lock().unwrap()[0].2.clone();
        let reply = fx.annealing.on_decision(&approval_id, true).await.unwrap();
        assert!(reply.contains("angewendet"));

        let content = std::fs::read_to_string(&fx.script_path).unwrap();
        assert!(content.contains("return 1"));

        let states = fx.log.current_states().unwrap();
        assert!(states.values().any(|r| r.status == ErrorStatus::Resolved));
    }

    #[tokio::test]
    async fn test_rejected_fix_leaves_file_untouched() {
        let fx = setup(Some(good_fix()));

        fx.annealing
            .handle_failure(&intent(), ExecutionFailureKind::NonZeroExit, "err", &fx.snapshot, 42)
            .await;

        let approval_id = fx.channel.decisions.lock().unwrap()[0].2.clone();
        let reply = fx.annealing.on_decision(&approval_id, false).await.unwrap();
        assert!(reply.contains("verworfen"));

        let content = std::fs::read_to_string(&fx.script_path).unwrap();
        assert!(content.contains("retrun 1"));

        let states = fx.log.current_states().unwrap();
        assert!(states.values().any(|r| r.status == ErrorStatus::Rejected));
    }

    #[tokio::test]
    async fn test_decision_accepted_only_once() {
        let fx = setup(Some(good_fix()));

        fx.annealing
            .handle_failure(&intent(), ExecutionFailureKind::NonZeroExit, "err", &fx.snapshot, 42)
            .await;

        let approval_id = fx.channel.decisions.lock().unwrap()[0].2.clone();
        fx.annealing.on_decision(&approval_id, true).await.unwrap();

        let err = fx.annealing.on_decision(&approval_id, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalExpired(_)));
    }

    #[tokio::test]
    async fn test_edit_conflict_applies_nothing() {
        let mut fix = good_fix();
        fix.edits.push(ProposedEdit {
            file: "scripts/proxmox_api.py".to_string(),
            old_text: "does not exist".to_string(),
            new_text: "x".to_string(),
        });
        let fx = setup(Some(fix));

        fx.annealing
            .handle_failure(&intent(), ExecutionFailureKind::NonZeroExit, "err", &fx.snapshot, 42)
            .await;

        let approval_id = fx.channel.decisions.lock().unwrap()[0].2.clone();
        let reply = fx.annealing.on_decision(&approval_id, true).await.unwrap();
        assert!(reply.contains("nicht angewendet"));

        // 最初の編集も適用されていない
        let content = std::fs::read_to_string(&fx.script_path).unwrap();
        assert!(content.contains("retrun 1"));
    }

    #[tokio::test]
    async fn test_low_confidence_notifies_only() {
        let mut fix = good_fix();
        fix.confidence = 0.2;
        let fx = setup(Some(fix));

        fx.annealing
            .handle_failure(&intent(), ExecutionFailureKind::NonZeroExit, "err", &fx.snapshot, 42)
            .await;

        assert!(fx.channel.decisions.lock().unwrap().is_empty());
        let notifications = fx.channel.notifications.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].0, 42);
        assert!(notifications[0].1.contains("kein automatischer Fix"));
    }

    #[tokio::test]
    async fn test_expiry_notifies_requester() {
        let fx = setup(Some(good_fix()));

        fx.annealing
            .handle_failure(&intent(), ExecutionFailureKind::Timeout, "err", &fx.snapshot, 42)
            .await;

        let approval_id = fx.channel.decisions.lock().unwrap()[0].2.clone();
        fx.annealing.approval_store().force_expire(&approval_id);
        fx.annealing.sweep_expired().await;

        let notifications = fx.channel.notifications.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].0, 42);
        assert!(notifications[0].1.contains("kein Fix angewendet"));

        // 期限切れ後の決定は拒否される
        let err = fx.annealing.on_decision(&approval_id, true).await.unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalExpired(_)));

        let states = fx.log.current_states().unwrap();
        assert!(states.values().any(|r| r.status == ErrorStatus::Expired));
    }
}
