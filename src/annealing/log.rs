//! エラーログ（追記専用JSONL）
//!
//! 各エラーの履歴は追記のみで記録する。状態変化は元レコードを
//! 書き換えず、同じIDの新しいレコードで上書きする（最後の
//! レコードが現在の状態）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// エラーレコードの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    Open,
    FixProposed,
    Resolved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub skill: String,
    pub action: Option<String>,
    pub error_kind: String,
    pub error_message: String,
    pub status: ErrorStatus,
    pub timestamp: DateTime<Utc>,
}

pub struct ErrorLog {
    path: PathBuf,
    write_lock: Mutex<()>,
    counter: AtomicU64,
}

impl ErrorLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
            counter: AtomicU64::new(0),
        }
    }

    /// デフォルトのログパス
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".homelab-agent")
            .join("errors.jsonl")
    }

    /// 新しいエラーをOpen状態で記録してIDを返す
    pub fn record_error(
        &self,
        skill: &str,
        action: Option<&str>,
        error_kind: &str,
        error_message: &str,
    ) -> anyhow::Result<String> {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let record = ErrorRecord {
            id: format!("err-{}-{}", Utc::now().timestamp_millis(), seq),
            skill: skill.to_string(),
            action: action.map(|s| s.to_string()),
            error_kind: error_kind.to_string(),
            error_message: error_message.to_string(),
            status: ErrorStatus::Open,
            timestamp: Utc::now(),
        };

        self.append(&record)?;
        Ok(record.id)
    }

    /// 既存エラーの状態遷移を新レコードとして追記
    pub fn update_status(&self, id: &str, status: ErrorStatus) -> anyhow::Result<()> {
        let records = self.load_all()?;
        let original = records
            .iter()
            .rev()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow::anyhow!("unknown error id: {}", id))?;

        let mut updated = original.clone();
        updated.status = status;
        updated.timestamp = Utc::now();
        self.append(&updated)
    }

    fn append(&self, record: &ErrorRecord) -> anyhow::Result<()> {
        use anyhow::Context;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log dir: {}", parent.display()))?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open error log: {}", self.path.display()))?;

        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// 全レコードを時系列順に読み込む
    pub fn load_all(&self) -> anyhow::Result<Vec<ErrorRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ErrorRecord>(line) {
                Ok(record) => records.push(record),
                // 壊れた行は読み捨てる
                Err(e) => tracing::warn!(error = %e, "Skipping malformed error log line"),
            }
        }
        Ok(records)
    }

    /// IDごとの現在状態（最後のレコードが勝つ）
    pub fn current_states(&self) -> anyhow::Result<HashMap<String, ErrorRecord>> {
        let mut states = HashMap::new();
        for record in self.load_all()? {
            states.insert(record.id.clone(), record);
        }
        Ok(states)
    }
}
