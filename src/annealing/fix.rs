//! LLMによるフィックス生成
//!
//! 失敗したスキル実行のエラーと関連ソースをモデルに渡し、
//! 検索置換形式の編集案を生成させる。

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::annealing::edit::ProposedEdit;
use crate::error::PipelineError;
use crate::llm::{ChatMessage, ChatProvider};

/// このconfidence未満のフィックスは承認に回さず通知のみ
pub const MIN_FIX_CONFIDENCE: f64 = 0.5;

/// 生成されたフィックス案
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedFix {
    /// エラー原因の分析（1-2文）
    pub analysis: String,
    /// フィックスの説明
    #[serde(default)]
    pub fix_description: Option<String>,
    pub edits: Vec<ProposedEdit>,
    /// 0.0-1.0
    pub confidence: f64,
}

impl ProposedFix {
    /// 承認フローに回す価値があるか
    pub fn is_actionable(&self) -> bool {
        self.confidence >= MIN_FIX_CONFIDENCE && !self.edits.is_empty()
    }
}

/// 失敗したスキル実行のコンテキスト
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub skill: String,
    pub action: Option<String>,
    pub error_kind: String,
    pub error_message: String,
    /// 失敗したスクリプトの関連ソース断片
    pub source_fragment: String,
}

/// フィックス生成器
#[async_trait]
pub trait FixGenerator: Send + Sync {
    /// フィックス案を生成。生成不能な場合はNone
    async fn generate_fix(&self, context: &ErrorContext) -> Option<ProposedFix>;
}

pub struct LlmFixGenerator {
    provider: Arc<dyn ChatProvider>,
}

impl LlmFixGenerator {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    fn build_prompt(context: &ErrorContext) -> String {
        format!(
            r#"Analysiere diesen Fehler und schlage einen Fix vor:

## Fehler
- **Typ:** {kind}
- **Nachricht:** {message}
- **Skill:** {skill}
- **Aktion:** {action}

## Relevanter Quellcode
{source}

## Aufgabe

Analysiere den Fehler und erstelle einen Fix. Der Fix sollte:
1. Das Problem korrekt identifizieren
2. Eine minimale, gezielte Änderung vorschlagen
3. Keine Breaking Changes einführen
4. NIEMALS bestehenden Code komplett ersetzen - nur ändern was nötig ist

## Ausgabeformat

Gib NUR ein JSON-Objekt zurück:

```json
{{
  "analysis": "Kurze Analyse was das Problem ist",
  "fix_description": "Beschreibung was der Fix macht",
  "edits": [
    {{
      "file": "scripts/beispiel_api.py",
      "old_text": "exakter bestehender Code",
      "new_text": "korrigierter Code"
    }}
  ],
  "confidence": 0.8
}}
```

## EDIT-REGELN:

1. old_text muss EXAKT und EINDEUTIG im Quellcode vorkommen (inkl. Einrückung)
2. new_text ersetzt old_text vollständig
3. confidence: 0.0-1.0 wie sicher du dir beim Fix bist

Bei niedriger Confidence (< 0.5) oder wenn der Fehler extern ist (API down, Netzwerk):
```json
{{"analysis": "Erklärung warum kein Code-Fix möglich", "edits": [], "confidence": 0.0}}
```"#,
            kind = context.error_kind,
            message = context.error_message,
            skill = context.skill,
            action = context.action.as_deref().unwrap_or("-"),
            source = context.source_fragment,
        )
    }
}

#[async_trait]
impl FixGenerator for LlmFixGenerator {
    async fn generate_fix(&self, context: &ErrorContext) -> Option<ProposedFix> {
        let prompt = Self::build_prompt(context);
        let messages = [ChatMessage::user(prompt)];

        let response = match self.provider.chat(&messages).await {
            Ok(text) => text,
            Err(PipelineError::ProviderUnavailable(msg)) => {
                tracing::warn!(error = %msg, "Fix generation skipped, provider unavailable");
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, "Fix generation failed");
                return None;
            }
        };

        match parse_fix_response(&response) {
            Some(fix) => {
                tracing::info!(
                    skill = %context.skill,
                    confidence = fix.confidence,
                    edits = fix.edits.len(),
                    "Fix generated"
                );
                Some(fix)
            }
            None => {
                tracing::warn!("Could not parse fix response");
                None
            }
        }
    }
}

/// モデル応答からフィックスJSONを抽出
pub fn parse_fix_response(response: &str) -> Option<ProposedFix> {
    for block in extract_json_blocks(response) {
        if let Ok(fix) = serde_json::from_str::<ProposedFix>(&block) {
            return Some(fix);
        }
    }
    None
}

/// JSONブロックを抽出
fn extract_json_blocks(text: &str) -> Vec<String> {
    let re = Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)```").unwrap();
    let mut blocks = Vec::new();

    for cap in re.captures_iter(text) {
        if let Some(content) = cap.get(1) {
            blocks.push(content.as_str().trim().to_string());
        }
    }

    // ```なしの生JSONも検出
    if blocks.is_empty() {
        if let Some(json) = find_raw_json(text) {
            blocks.push(json);
        }
    }

    blocks
}

/// 生のJSONオブジェクトを検出
fn find_raw_json(text: &str) -> Option<String> {
    let text = text.trim();

    if let Some(start) = text.find('{') {
        let mut depth = 0;
        for (i, c) in text.char_indices().skip(start) {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(text[start..=i].to_string());
                    }
                }
                _ => {}
            }
        }
    }
    None
}
