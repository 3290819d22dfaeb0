//! 人間による承認ゲート
//!
//! 提案されたフィックスは承認者の決定を待つ。決定はちょうど1回だけ
//! 受理され、期限切れは定期スイープで処理される。

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::PipelineError;

/// 承認リクエストの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// 承認待ちのリクエスト
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub id: String,
    /// 承認者に見せる要約
    pub summary: String,
    /// 元の依頼を出したユーザー
    pub requester_id: i64,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

/// 承認者へ決定依頼を届けるチャネル
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// 承認者に決定依頼を送信
    async fn send_decision_request(
        &self,
        approver_id: i64,
        summary: &str,
        request_id: &str,
    ) -> anyhow::Result<()>;

    /// ユーザーへの通知
    async fn notify(&self, user_id: i64, message: &str) -> anyhow::Result<()>;
}

/// 承認リクエストの保管庫
pub struct ApprovalStore {
    entries: Mutex<HashMap<String, PendingApproval>>,
    timeout: ChronoDuration,
    counter: AtomicU64,
}

impl ApprovalStore {
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout: ChronoDuration::from_std(timeout)
                .unwrap_or_else(|_| ChronoDuration::minutes(5)),
            counter: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingApproval>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 新しい承認リクエストを登録してIDを返す
    pub fn insert(&self, summary: String, requester_id: i64) -> PendingApproval {
        let now = Utc::now();
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let approval = PendingApproval {
            id: format!("fix-{}-{}", now.timestamp_millis(), seq),
            summary,
            requester_id,
            created_at: now,
            timeout_at: now + self.timeout,
            status: ApprovalStatus::Pending,
        };

        self.lock().insert(approval.id.clone(), approval.clone());
        tracing::info!(id = %approval.id, "Approval request registered");
        approval
    }

    /// 決定を受理する。Pendingのリクエストにのみ有効
    ///
    /// 2回目以降の決定と未知のIDはApprovalExpiredとして拒否される。
    pub fn resolve(&self, id: &str, approved: bool) -> Result<PendingApproval, PipelineError> {
        let mut entries = self.lock();

        let entry = entries
            .get_mut(id)
            .ok_or_else(|| PipelineError::ApprovalExpired(id.to_string()))?;

        if entry.status != ApprovalStatus::Pending {
            return Err(PipelineError::ApprovalExpired(id.to_string()));
        }

        entry.status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        tracing::info!(id, approved, "Approval resolved");
        Ok(entry.clone())
    }

    /// 期限切れのリクエストを回収する
    ///
    /// Pendingのまま期限を過ぎたものをExpiredに遷移させ、保管庫から
    /// 取り除いて返す。呼び出し側が通知とログを担当する。
    pub fn sweep(&self) -> Vec<PendingApproval> {
        let now = Utc::now();
        let mut entries = self.lock();

        let expired_ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.status == ApprovalStatus::Pending && e.timeout_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(mut entry) = entries.remove(&id) {
                entry.status = ApprovalStatus::Expired;
                tracing::warn!(id = %entry.id, "Approval request expired");
                expired.push(entry);
            }
        }

        // 決定済みのものも保管し続ける必要はない
        entries.retain(|_, e| e.status == ApprovalStatus::Pending);

        expired
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|e| e.status == ApprovalStatus::Pending)
            .count()
    }

    #[cfg(test)]
    pub fn force_expire(&self, id: &str) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.timeout_at = Utc::now() - ChronoDuration::seconds(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_insert_and_resolve_approved() {
        let store = ApprovalStore::new(Duration::from_secs(300));
        let approval = store.insert("fix timeout".to_string(), 42);

        let resolved = store.resolve(&approval.id, true).unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.requester_id, 42);
    }

    #[test]
    fn test_resolve_exactly_once() {
        let store = ApprovalStore::new(Duration::from_secs(300));
        let approval = store.insert("fix".to_string(), 1);

        store.resolve(&approval.id, true).unwrap();
        // 2回目の決定は拒否される
        let err = store.resolve(&approval.id, false).unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalExpired(_)));
    }

    #[test]
    fn test_unknown_id_rejected() {
        let store = ApprovalStore::new(Duration::from_secs(300));
        let err = store.resolve("fix-0-0", true).unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalExpired(_)));
    }

    #[test]
    fn test_sweep_expires_pending() {
        let store = ApprovalStore::new(Duration::from_secs(300));
        let approval = store.insert("fix".to_string(), 1);
        store.force_expire(&approval.id);

        let expired = store.sweep();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, ApprovalStatus::Expired);

        // 期限切れ後の決定は受理されない
        let err = store.resolve(&approval.id, true).unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalExpired(_)));
    }

    #[test]
    fn test_sweep_ignores_unexpired() {
        let store = ApprovalStore::new(Duration::from_secs(300));
        store.insert("fix".to_string(), 1);

        assert!(store.sweep().is_empty());
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn test_unique_ids() {
        let store = ApprovalStore::new(Duration::from_secs(300));
        let a = store.insert("a".to_string(), 1);
        let b = store.insert("b".to_string(), 1);
        assert_ne!(a.id, b.id);
    }
}
