//! 埋め込みキャッシュ
//!
//! スナップショット全体のテキストコーパスに対してSHA-256キーを計算し、
//! キーが一致する限りディスクキャッシュのベクトルを使い回す。
//! どこか1箇所でもテキストが変われば、コーパス全体を再埋め込みして
//! ファイルを丸ごと置き換える（粗粒度の無効化）。

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::error::PipelineError;
use crate::skills::SkillSnapshot;

use super::embedding::EmbeddingProvider;

/// エントリ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// 意図ヒント
    Hint,
    /// アクション説明
    Action,
}

/// 埋め込み済みの1テキスト
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    /// 元テキスト
    pub text: String,
    /// 埋め込みベクトル
    pub vector: Vec<f32>,
    /// 由来するスキル名
    pub skill: String,
    /// 種別
    pub kind: EntryKind,
    /// アクション名（kind == Actionの場合のみ）
    pub action: Option<String>,
}

/// ディスク上のキャッシュファイル形式（無効化時は丸ごと置換）
#[derive(Serialize, Deserialize)]
struct CacheFile {
    cache_key: String,
    created_at: i64,
    entries: Vec<EmbeddingEntry>,
}

/// メモリ上のキャッシュ状態
struct CacheState {
    cache_key: String,
    entries: Arc<Vec<EmbeddingEntry>>,
}

/// 埋め込みキャッシュ
pub struct EmbeddingCache {
    path: PathBuf,
    state: RwLock<Option<CacheState>>,
}

impl EmbeddingCache {
    /// 指定パスに永続化するキャッシュを作成
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: RwLock::new(None),
        }
    }

    /// デフォルトのキャッシュファイルパス
    pub fn default_cache_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".homelab-agent").join("embedding_cache.json"))
            .unwrap_or_else(|| PathBuf::from("embedding_cache.json"))
    }

    /// スナップショットに対応するベクトル一式を取得（必要なら構築）
    ///
    /// キー一致の場合はネットワーク呼び出しなし。ミスマッチの場合は
    /// コーパス全体を1バッチ呼び出しで再埋め込みし、旧キャッシュを破棄する。
    pub async fn get_or_build(
        &self,
        snapshot: &SkillSnapshot,
        provider: &dyn EmbeddingProvider,
    ) -> Result<Arc<Vec<EmbeddingEntry>>, PipelineError> {
        let key = corpus_key(snapshot);

        // メモリ上のキャッシュが有効ならそのまま返す
        {
            let guard = self.state.read().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = guard.as_ref() {
                if state.cache_key == key {
                    return Ok(Arc::clone(&state.entries));
                }
            }
        }

        // ディスクキャッシュを確認
        if let Some(entries) = self.load_from_disk(&key) {
            tracing::info!(entries = entries.len(), "Embedding cache loaded from disk");
            let entries = Arc::new(entries);
            self.swap_state(key, Arc::clone(&entries));
            return Ok(entries);
        }

        // 再埋め込み（コーパス全体）
        let (texts, metadata) = build_corpus(snapshot);
        if texts.is_empty() {
            let entries = Arc::new(Vec::new());
            self.swap_state(key, Arc::clone(&entries));
            return Ok(entries);
        }

        tracing::info!(texts = texts.len(), "Recomputing embedding corpus");
        let vectors = provider.embed_batch(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(PipelineError::ProviderUnavailable(format!(
                "embedding count mismatch: got {}, expected {}",
                vectors.len(),
                texts.len()
            )));
        }

        let entries: Vec<EmbeddingEntry> = texts
            .into_iter()
            .zip(vectors)
            .zip(metadata)
            .map(|((text, vector), (skill, kind, action))| EmbeddingEntry {
                text,
                vector,
                skill,
                kind,
                action,
            })
            .collect();

        self.persist(&key, &entries);
        let entries = Arc::new(entries);
        self.swap_state(key, Arc::clone(&entries));
        Ok(entries)
    }

    fn swap_state(&self, cache_key: String, entries: Arc<Vec<EmbeddingEntry>>) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(CacheState { cache_key, entries });
    }

    fn load_from_disk(&self, key: &str) -> Option<Vec<EmbeddingEntry>> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<CacheFile>(&content) {
            Ok(file) if file.cache_key == key => Some(file.entries),
            Ok(_) => {
                tracing::info!("Embedding cache stale, will refresh");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse embedding cache");
                None
            }
        }
    }

    /// キャッシュをディスクに保存（失敗してもパイプラインは止めない）
    fn persist(&self, key: &str, entries: &[EmbeddingEntry]) {
        let file = CacheFile {
            cache_key: key.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            entries: entries.to_vec(),
        };

        let write = || -> Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&self.path, serde_json::to_string(&file)?)?;
            Ok(())
        };

        match write() {
            Ok(()) => {
                tracing::info!(entries = entries.len(), path = %self.path.display(), "Saved embedding cache")
            }
            Err(e) => tracing::warn!(error = %e, "Failed to save embedding cache"),
        }
    }
}

/// スナップショットのコーパステキストとメタデータを構築
///
/// 順序はスナップショットの登録順に固定（キー計算と対応づけのため）。
fn build_corpus(snapshot: &SkillSnapshot) -> (Vec<String>, Vec<(String, EntryKind, Option<String>)>) {
    let mut texts = Vec::new();
    let mut metadata = Vec::new();

    for skill in snapshot.list() {
        let name = &skill.metadata.name;
        for hint in &skill.metadata.intent_hints {
            texts.push(hint.clone());
            metadata.push((name.clone(), EntryKind::Hint, None));
        }
        for action in &skill.actions {
            texts.push(format!("{}: {}", action.name, action.description));
            metadata.push((name.clone(), EntryKind::Action, Some(action.name.clone())));
        }
    }

    (texts, metadata)
}

/// スキルが変わると変化するキャッシュキーを計算
///
/// 名前・バージョン・ヒント・アクション説明をすべて含めるので、
/// どのSKILL.mdを編集しても自動的に再埋め込みされる。
pub fn corpus_key(snapshot: &SkillSnapshot) -> String {
    let mut parts = Vec::new();
    for skill in snapshot.list() {
        parts.push(format!("{}:{}", skill.metadata.name, skill.metadata.version));
        parts.extend(skill.metadata.intent_hints.iter().cloned());
        for action in &skill.actions {
            parts.push(format!("{}:{}", action.name, action.description));
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}
