//! 埋め込みベースのセマンティックルーター
//!
//! ユーザーメッセージを埋め込み、キャッシュ済みのスキルコーパスと
//! コサイン類似度で照合する。LLMを使わない高速な前段フィルタであり、
//! ここでの判定が直接実行を許可することはない。

use std::sync::Arc;

use crate::skills::SkillSnapshot;

use super::cache::{EmbeddingCache, EntryKind};
use super::embedding::{cosine_similarity, EmbeddingProvider};

/// HIGH tierの下限（これ以上は決定的な引数抽出で処理）
pub const HIGH_CONFIDENCE: f32 = 0.75;
/// MEDIUM tierの下限（これ以上はLLM分類へ）
pub const MEDIUM_CONFIDENCE: f32 = 0.40;

/// 同点とみなす類似度差
const TIE_EPSILON: f32 = 1e-6;

/// 確信度Tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// ≥0.75: 引数抽出して直接実行
    High,
    /// [0.40, 0.75): 候補を絞ってLLM分類
    Medium,
    /// <0.40: 会話応答のみ、実行なし
    Low,
}

impl Tier {
    /// 類似度スコアからTierを導出（固定しきい値、重なりなし）
    pub fn from_score(score: f32) -> Self {
        if score >= HIGH_CONFIDENCE {
            Tier::High
        } else if score >= MEDIUM_CONFIDENCE {
            Tier::Medium
        } else {
            Tier::Low
        }
    }
}

/// スキルごとのマッチ結果
#[derive(Debug, Clone)]
pub struct IntentMatch {
    /// スキル名
    pub skill: String,
    /// 最も近いアクション（Actionエントリがあれば）
    pub action: Option<String>,
    /// 類似度スコア
    pub similarity: f32,
    /// このスコア単体のTier
    pub tier: Tier,
}

/// ルーティング結果
#[derive(Debug, Clone)]
pub struct RouteResult {
    /// 類似度降順のマッチ一覧（上位3件）
    pub matches: Vec<IntentMatch>,
    /// トップスコアから導出したTier
    pub tier: Tier,
}

impl RouteResult {
    /// ルーター利用不能時の結果（常にLOW、実行なし）
    pub fn unavailable() -> Self {
        Self {
            matches: Vec::new(),
            tier: Tier::Low,
        }
    }

    /// 最上位のマッチ
    pub fn top(&self) -> Option<&IntentMatch> {
        self.matches.first()
    }
}

/// セマンティックルーター
pub struct SemanticRouter {
    cache: Arc<EmbeddingCache>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl SemanticRouter {
    /// キャッシュとプロバイダからルーターを作成
    pub fn new(cache: Arc<EmbeddingCache>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { cache, provider }
    }

    /// メッセージをルーティング
    ///
    /// プロバイダ到達不能時はLOW tierの空結果に劣化する（次のメッセージで
    /// 再試行されるので、バックグラウンドのポーリングは持たない）。
    pub async fn route(&self, message: &str, snapshot: &SkillSnapshot) -> RouteResult {
        let entries = match self.cache.get_or_build(snapshot, self.provider.as_ref()).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Embedding cache unavailable, degrading to LOW");
                return RouteResult::unavailable();
            }
        };

        if entries.is_empty() {
            return RouteResult::unavailable();
        }

        let message_vec = match self.provider.embed_one(message).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Message embedding failed, degrading to LOW");
                return RouteResult::unavailable();
            }
        };

        // スキルごとの最大類似度（平均ではなく最大: 強いヒント1つを薄めない）
        let mut skill_scores: Vec<(String, f32)> = Vec::new();
        let mut action_scores: std::collections::HashMap<String, (String, f32)> =
            std::collections::HashMap::new();

        for entry in entries.iter() {
            let sim = cosine_similarity(&message_vec, &entry.vector);

            match skill_scores.iter_mut().find(|(name, _)| name == &entry.skill) {
                Some((_, best)) => {
                    if sim > *best {
                        *best = sim;
                    }
                }
                None => skill_scores.push((entry.skill.clone(), sim)),
            }

            if entry.kind == EntryKind::Action {
                if let Some(action) = &entry.action {
                    let slot = action_scores
                        .entry(entry.skill.clone())
                        .or_insert_with(|| (action.clone(), sim));
                    if sim > slot.1 {
                        *slot = (action.clone(), sim);
                    }
                }
            }
        }

        // 類似度降順に並べ、イプシロン内の隣接する同点ランだけを
        // 登録順に並べ直す（同点判定は推移的でないため比較関数には入れない)
        skill_scores
            .sort_by(|(_, a_sim), (_, b_sim)| b_sim.total_cmp(a_sim));

        let mut run_start = 0;
        for i in 1..=skill_scores.len() {
            let tied = i < skill_scores.len()
                && (skill_scores[i - 1].1 - skill_scores[i].1).abs() <= TIE_EPSILON;
            if !tied {
                if i - run_start > 1 {
                    skill_scores[run_start..i].sort_by_key(|(name, _)| {
                        snapshot.registration_index(name).unwrap_or(usize::MAX)
                    });
                }
                run_start = i;
            }
        }

        let matches: Vec<IntentMatch> = skill_scores
            .into_iter()
            .take(3)
            .map(|(skill, similarity)| IntentMatch {
                action: action_scores.get(&skill).map(|(a, _)| a.clone()),
                tier: Tier::from_score(similarity),
                skill,
                similarity,
            })
            .collect();

        let tier = matches
            .first()
            .map(|m| Tier::from_score(m.similarity))
            .unwrap_or(Tier::Low);

        if let Some(top) = matches.first() {
            tracing::info!(
                skill = %top.skill,
                similarity = top.similarity,
                tier = ?tier,
                "Semantic route"
            );
        }

        RouteResult { matches, tier }
    }
}
