//! LLMによる意図分類（ツール呼び出し）
//!
//! 埋め込みルーティングが確信を持てなかった場合のフォールバック。
//! 候補スキル（最大2件）をOpenAI形式のツール定義に変換してモデルに
//! 渡し、ツール呼び出しの有無で意図を確定する。

use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::llm::client::{ChatMessage, ChatOutcome, ChatProvider};
use crate::routing::{ConfidenceSource, IntentResult};
use crate::skills::Skill;

/// 分類に渡す候補スキルの最大数
pub const MAX_CANDIDATES: usize = 2;

const SYSTEM_PROMPT: &str = r#"Du bist ein Smart Home und Homelab Assistant.
Antworte auf Deutsch.

WICHTIG - Wann Tools benutzen:
- NUR bei konkreten Aktionen: "Zeige Kameras", "Starte VM", "Pi-hole Status"
- Tool wählen wenn Aktion zu einem Skill passt

WICHTIG - Wann KEIN Tool benutzen:
- Begrüßungen: "Hallo", "Hi", "Guten Tag" → Einfach freundlich antworten
- Allgemeine Fragen: "Was kannst du?", "Hilfe" → Erkläre deine Fähigkeiten
- Smalltalk: "Wie geht's?", "Danke" → Normal antworten
- Unklare Anfragen: "Mach was Cooles" → Nachfragen was gemeint ist

Wenn du ein Tool benutzt:
- Setze action auf die gewünschte Aktion
- Setze target wenn ein Ziel benötigt wird (entity_id, VM-Name, etc.)"#;

const STRICT_RETRY_PROMPT: &str = r#"Deine letzte Antwort war kein gültiger Tool-Aufruf.
Wähle jetzt GENAU eines der verfügbaren Tools mit einer action aus der enum-Liste,
oder antworte in normalem Text wenn kein Tool passt. Keine anderen Formate."#;

/// 分類の結果
#[derive(Debug, Clone)]
pub enum ClassifyOutcome {
    /// ツール呼び出しで意図が確定
    Intent(IntentResult),
    /// モデルが会話として応答（スキル該当なし）
    Conversational(String),
}

pub struct IntentClassifier {
    provider: Arc<dyn ChatProvider>,
}

impl IntentClassifier {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    /// 候補スキルに対して意図分類を実行
    ///
    /// 不正なツール呼び出しは一度だけ厳格な再プロンプトでリトライし、
    /// それでも失敗した場合は会話応答へ降格する。
    pub async fn classify(
        &self,
        message: &str,
        candidates: &[&Skill],
        history: &[ChatMessage],
    ) -> Result<ClassifyOutcome, PipelineError> {
        let candidates = &candidates[..candidates.len().min(MAX_CANDIDATES)];
        let tools: Vec<serde_json::Value> =
            candidates.iter().map(|s| build_tool_schema(s)).collect();

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(SYSTEM_PROMPT));
        messages.extend_from_slice(history);
        // 推論モデルの長考を省略させる
        messages.push(ChatMessage::user(format!("{} /no_think", message)));

        match self.attempt(&messages, &tools, candidates).await? {
            Some(outcome) => Ok(outcome),
            None => {
                tracing::warn!("Malformed tool call, retrying with strict prompt");
                messages.push(ChatMessage::system(STRICT_RETRY_PROMPT));

                match self.attempt(&messages, &tools, candidates).await? {
                    Some(outcome) => Ok(outcome),
                    None => {
                        tracing::warn!("Classification failed twice, degrading to conversation");
                        Ok(ClassifyOutcome::Conversational(
                            "Das habe ich nicht ganz verstanden. Kannst du es anders formulieren?"
                                .to_string(),
                        ))
                    }
                }
            }
        }
    }

    /// 1回の分類試行。不正なツール呼び出しはNoneを返す
    async fn attempt(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        candidates: &[&Skill],
    ) -> Result<Option<ClassifyOutcome>, PipelineError> {
        match self.provider.complete(messages, tools).await {
            Ok(ChatOutcome::ToolCall { name, arguments }) => {
                Ok(parse_tool_call(&name, &arguments, candidates))
            }
            Ok(ChatOutcome::Text(text)) => Ok(Some(ClassifyOutcome::Conversational(text))),
            Err(PipelineError::ParseError(msg)) => {
                tracing::debug!(error = %msg, "Tool call parse error");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// スキルをOpenAI形式のツール定義に変換
pub fn build_tool_schema(skill: &Skill) -> serde_json::Value {
    let action_enum: Vec<&str> = skill.actions.iter().map(|a| a.name.as_str()).collect();
    let action_help: String = skill
        .actions
        .iter()
        .map(|a| format!("- {}: {}", a.name, a.description))
        .collect::<Vec<_>>()
        .join("\n");

    json!({
        "type": "function",
        "function": {
            // unifi-protect -> unifi_protect
            "name": skill.metadata.name.replace('-', "_"),
            "description": skill.metadata.description,
            "parameters": {
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "description": format!("Die auszuführende Aktion.\n{}", action_help),
                        "enum": action_enum,
                    },
                    "target": {
                        "type": "string",
                        "description": "Ziel der Aktion (entity_id, VM-Name, Kamera, etc.)",
                    },
                    "args": {
                        "type": "object",
                        "description": "Argumente für die Aktion (z.B. vmid, entity_id, name)",
                        "additionalProperties": true,
                    },
                },
                "required": ["action"],
            },
        },
    })
}

/// ツール呼び出しを検証してIntentResultへ変換
///
/// スキル名が候補に含まれない、またはactionが不正な場合はNone。
fn parse_tool_call(
    name: &str,
    arguments: &serde_json::Value,
    candidates: &[&Skill],
) -> Option<ClassifyOutcome> {
    // unifi_protect -> unifi-protect
    let skill_name = name.replace('_', "-");
    let skill = candidates.iter().find(|s| s.metadata.name == skill_name)?;

    let action_raw = arguments.get("action").and_then(|v| v.as_str())?;
    let action = skill.find_action(action_raw)?.name.clone();

    let mut args = HashMap::new();
    if let Some(obj) = arguments.get("args").and_then(|v| v.as_object()) {
        for (key, value) in obj {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            args.insert(key.clone(), text);
        }
    }
    if let Some(target) = arguments.get("target").and_then(|v| v.as_str()) {
        args.entry("target".to_string()).or_insert_with(|| target.to_string());
    }

    let mut result = IntentResult::new(skill_name, Some(action), ConfidenceSource::Llm);
    result.args = args;
    Some(ClassifyOutcome::Intent(result))
}

/// メッセージが直前の会話への追問かどうか
///
/// 短いメッセージが既知のパターンに一致し、かつ履歴が存在する場合のみ。
pub fn is_conversational_followup(message: &str, history: &[ChatMessage]) -> bool {
    // 長いメッセージは新しい依頼とみなす
    if message.len() > 100 || history.is_empty() {
        return false;
    }

    let patterns = [
        // 理解の問題
        r"versteh.*nicht",
        r"nicht verstanden",
        r"was mein(st|t) du",
        r"erklär.*(genauer|nochmal|bitte)",
        r"was (bedeutet|heißt) das",
        // 直前メッセージへの参照
        r"^das\s",
        r"^die(se)?\s",
        r"damit\b",
        r"davon\b",
        // 短い追問
        r"^warum\??$",
        r"^wieso\??$",
        r"^und\s+(jetzt|dann|weiter)",
        r"mehr (dazu|details)",
        // 絞り込み
        r"^ich (wollte|meinte|brauch\w*) nur",
        r"^nur (den|die|das|im|in|am|an)\b",
        r"^zeig.*nur",
        r"^nicht alles",
        r"^filter.*auf",
        // 文脈が必要な肯定・否定
        r"^ja,?\s+aber",
        r"^nein,?\s+ich",
        r"^ok(ay)?,?\s+aber",
    ];

    let msg = message.trim().to_lowercase();
    for pattern in patterns {
        let re = Regex::new(pattern).unwrap();
        if re.is_match(&msg) {
            tracing::info!(message, "Detected followup");
            return true;
        }
    }

    false
}
