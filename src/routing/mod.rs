//! 意図解決（埋め込みルーティング + 引数抽出）

pub mod cache;
pub mod embedding;
pub mod extractor;
pub mod router;

pub use cache::{EmbeddingCache, EmbeddingEntry, EntryKind};
pub use embedding::{cosine_similarity, EmbeddingProvider, HttpEmbeddingClient};
pub use extractor::ArgExtractor;
pub use router::{IntentMatch, RouteResult, SemanticRouter, Tier};

use std::collections::HashMap;

/// 意図がどの経路で確定したか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceSource {
    /// 埋め込み類似度のみ（LLMを介さない）
    Embedding,
    /// LLMツール呼び出しによる分類
    Llm,
}

/// 解決済みの意図
#[derive(Debug, Clone)]
pub struct IntentResult {
    pub skill: String,
    pub action: Option<String>,
    pub args: HashMap<String, String>,
    pub source: ConfidenceSource,
}

impl IntentResult {
    pub fn new(skill: impl Into<String>, action: Option<String>, source: ConfidenceSource) -> Self {
        Self {
            skill: skill.into(),
            action,
            args: HashMap::new(),
            source,
        }
    }
}
