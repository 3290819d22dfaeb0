//! メッセージ処理パイプライン
//!
//! ルーティング、引数抽出、LLM分類、実行、自己修復を固定の順序で
//! つなぐ。HIGHで確定した意図はLLMを介さずに実行される。

use std::sync::Arc;

use crate::agent::history::ChatHistory;
use crate::annealing::AnnealingLoop;
use crate::error::PipelineError;
use crate::llm::{
    is_conversational_followup, ChatMessage, ChatProvider, ClassifyOutcome, IntentClassifier,
};
use crate::routing::{ArgExtractor, ConfidenceSource, IntentResult, SemanticRouter, Tier};
use crate::skills::{ExecOutcome, SkillExecutor, SkillRegistry, SkillSnapshot};

const CONVERSATIONAL_PROMPT: &str = "Du bist ein freundlicher Smart Home und Homelab Assistant. \
Antworte auf Deutsch, kurz und hilfreich.";

/// 追問用のプロンプト。履歴をそのまま渡すだけでは弱いので、
/// 直前のやり取りへの明示的な言及を加える
const FOLLOWUP_PROMPT: &str = "Du bist ein freundlicher Smart Home und Homelab Assistant.

## Konversationsverlauf
{history}

## Deine Aufgabe
Der User bezieht sich auf die vorherige Nachricht. Beantworte seine Frage oder Bitte
basierend auf dem Konversationsverlauf.

Regeln:
1. Beziehe dich auf den Kontext der vorherigen Nachrichten
2. Wenn der User eine Einschränkung möchte (\"nur Garten\", \"ich wollte nur...\"):
   filtere die vorherige Antwort auf den gewünschten Teil, zeige NUR den
   relevanten Ausschnitt
3. Wenn der User etwas nicht verstanden hat, formuliere es einfacher um
4. Bleibe freundlich und antworte auf Deutsch";

const PROVIDER_DOWN_REPLY: &str =
    "Das Sprachmodell ist gerade nicht erreichbar. Bitte versuche es später erneut.";

/// 分類に渡す会話履歴の長さ
const HISTORY_WINDOW: usize = 10;

pub struct AgentPipeline {
    router: SemanticRouter,
    classifier: IntentClassifier,
    executor: SkillExecutor,
    registry: Arc<SkillRegistry>,
    chat: Arc<dyn ChatProvider>,
    annealing: Arc<AnnealingLoop>,
    history: ChatHistory,
}

impl AgentPipeline {
    pub fn new(
        router: SemanticRouter,
        classifier: IntentClassifier,
        executor: SkillExecutor,
        registry: Arc<SkillRegistry>,
        chat: Arc<dyn ChatProvider>,
        annealing: Arc<AnnealingLoop>,
        history: ChatHistory,
    ) -> Self {
        Self {
            router,
            classifier,
            executor,
            registry,
            chat,
            annealing,
            history,
        }
    }

    /// ユーザーメッセージを処理して応答を返す
    pub async fn handle_message(&self, chat_id: i64, user_id: i64, message: &str) -> String {
        let snapshot = self.registry.current();
        let prior = self.history.recent(chat_id, HISTORY_WINDOW);

        let reply = self
            .process(message, user_id, &snapshot, &prior)
            .await;

        self.history.push(chat_id, ChatMessage::user(message));
        self.history.push(chat_id, ChatMessage::assistant(reply.clone()));
        reply
    }

    async fn process(
        &self,
        message: &str,
        user_id: i64,
        snapshot: &SkillSnapshot,
        prior: &[ChatMessage],
    ) -> String {
        // 追問は直前のやり取りを明示して答える（スキル分類をスキップ)
        if is_conversational_followup(message, prior) {
            return self.followup(message, prior).await;
        }

        let route = self.router.route(message, snapshot).await;
        tracing::debug!(tier = ?route.tier, matches = route.matches.len(), "Routed message");

        match route.tier {
            Tier::High => {
                let Some(top) = route.top() else {
                    return self.conversational(message, prior).await;
                };

                // アクションが特定でき、抽出が宣言パラメータを満たす場合のみ直実行
                if let (Some(action), Some(skill)) = (&top.action, snapshot.get(&top.skill)) {
                    let args = ArgExtractor::extract(message, &top.skill, Some(action));
                    if ArgExtractor::satisfies(&args, skill, action) {
                        let mut intent = IntentResult::new(
                            top.skill.clone(),
                            Some(action.clone()),
                            ConfidenceSource::Embedding,
                        );
                        intent.args = args;
                        return self.run_intent(&intent, user_id, snapshot).await;
                    }
                    tracing::info!(skill = %top.skill, "Extraction incomplete, demoting to classifier");
                }

                self.classify_and_run(message, user_id, snapshot, prior, &route.matches)
                    .await
            }
            Tier::Medium => {
                self.classify_and_run(message, user_id, snapshot, prior, &route.matches)
                    .await
            }
            Tier::Low => self.conversational(message, prior).await,
        }
    }

    /// 候補スキルをLLMに分類させて実行
    async fn classify_and_run(
        &self,
        message: &str,
        user_id: i64,
        snapshot: &SkillSnapshot,
        prior: &[ChatMessage],
        matches: &[crate::routing::IntentMatch],
    ) -> String {
        let candidates: Vec<&crate::skills::Skill> = matches
            .iter()
            .filter_map(|m| snapshot.get(&m.skill))
            .take(crate::llm::classifier::MAX_CANDIDATES)
            .collect();

        if candidates.is_empty() {
            return self.conversational(message, prior).await;
        }

        match self.classifier.classify(message, &candidates, prior).await {
            Ok(ClassifyOutcome::Intent(intent)) => {
                self.run_intent(&intent, user_id, snapshot).await
            }
            Ok(ClassifyOutcome::Conversational(text)) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Classification failed");
                e.user_message()
            }
        }
    }

    /// 意図を実行し、失敗は自己修復ループに渡す
    async fn run_intent(
        &self,
        intent: &IntentResult,
        user_id: i64,
        snapshot: &SkillSnapshot,
    ) -> String {
        tracing::info!(
            skill = %intent.skill,
            action = ?intent.action,
            source = ?intent.source,
            "Executing intent"
        );

        match self.executor.execute(intent, snapshot, Some(user_id)).await {
            Ok(ExecOutcome::Success(output)) => output,
            Ok(ExecOutcome::Invalid(message)) => message,
            Err(PipelineError::ExecutionFailure { kind, message }) => {
                self.annealing
                    .handle_failure(intent, kind, &message, snapshot, user_id)
                    .await;
                PipelineError::ExecutionFailure { kind, message }.user_message()
            }
            Err(e) => e.user_message(),
        }
    }

    /// 追問への応答。履歴を埋め込み、直前のやり取りへの参照を明示する
    async fn followup(&self, message: &str, prior: &[ChatMessage]) -> String {
        let history_text = prior
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let system = FOLLOWUP_PROMPT.replace("{history}", &history_text);
        let messages = [ChatMessage::system(system), ChatMessage::user(message)];

        match self.chat.chat(&messages).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => PROVIDER_DOWN_REPLY.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Followup reply failed");
                PROVIDER_DOWN_REPLY.to_string()
            }
        }
    }

    /// スキルなしの会話応答
    async fn conversational(&self, message: &str, prior: &[ChatMessage]) -> String {
        let mut messages = Vec::with_capacity(prior.len() + 2);
        messages.push(ChatMessage::system(CONVERSATIONAL_PROMPT));
        messages.extend_from_slice(prior);
        messages.push(ChatMessage::user(message));

        match self.chat.chat(&messages).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => PROVIDER_DOWN_REPLY.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Conversational reply failed");
                PROVIDER_DOWN_REPLY.to_string()
            }
        }
    }

    /// 承認者の決定をパイプラインに渡す
    pub async fn handle_decision(&self, approval_id: &str, approved: bool) -> String {
        match self.annealing.on_decision(approval_id, approved).await {
            Ok(reply) => reply,
            Err(e) => e.user_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annealing::{
        ApprovalChannel, ApprovalStore, ErrorContext, ErrorLog, ErrorStatus, FixGenerator,
        ProposedFix,
    };
    use crate::config::ExecutorConfig;
    use crate::llm::ChatOutcome;
    use crate::routing::{cosine_similarity, EmbeddingCache, EmbeddingProvider};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 既知のテキストに固定ベクトルを返す埋め込みスタブ
    struct ScriptedEmbeddings {
        vectors: HashMap<String, Vec<f32>>,
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedEmbeddings {
        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, PipelineError> {
            texts
                .iter()
                .map(|t| {
                    self.vectors
                        .get(t)
                        .cloned()
                        .ok_or_else(|| PipelineError::ProviderUnavailable(format!("no vector: {}", t)))
                })
                .collect()
        }
    }

    /// 呼び出し回数と受け取ったメッセージを記録するチャットスタブ
    struct CountingChat {
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
        outcome: ChatOutcome,
    }

    impl CountingChat {
        fn text(reply: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                outcome: ChatOutcome::Text(reply.to_string()),
            }
        }

        fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                outcome: ChatOutcome::ToolCall {
                    name: name.to_string(),
                    arguments,
                },
            }
        }

        fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_request(&self) -> Vec<ChatMessage> {
            self.seen.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl ChatProvider for CountingChat {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: &[serde_json::Value],
        ) -> Result<ChatOutcome, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.outcome.clone())
        }
    }

    /// 常に到達不能なチャットスタブ
    struct DownChat;

    #[async_trait]
    impl ChatProvider for DownChat {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[serde_json::Value],
        ) -> Result<ChatOutcome, PipelineError> {
            Err(PipelineError::ProviderUnavailable("connection refused".to_string()))
        }
    }

    struct NoFix;

    #[async_trait]
    impl FixGenerator for NoFix {
        async fn generate_fix(&self, _context: &ErrorContext) -> Option<ProposedFix> {
            None
        }
    }

    #[derive(Default)]
    struct SilentChannel;

    #[async_trait]
    impl ApprovalChannel for SilentChannel {
        async fn send_decision_request(
            &self,
            _approver_id: i64,
            _summary: &str,
            _request_id: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn notify(&self, _user_id: i64, _message: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        pipeline: AgentPipeline,
        chat: Arc<CountingChat>,
        log: Arc<ErrorLog>,
    }

    /// SKILL.mdとスクリプトをディスクに配置して本物のレジストリで読み込む
    async fn setup(chat: Arc<CountingChat>, script_body: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let skills_dir = dir.path().join("skills");
        let skill_dir = skills_dir.join("testskill");
        let scripts_dir = skill_dir.join("scripts");
        std::fs::create_dir_all(&scripts_dir).unwrap();

        std::fs::write(
            skill_dir.join("SKILL.md"),
            "---\nname: testskill\ndescription: Status checks\nintent_hints:\n  - show status\n---\n\n# testskill\n",
        )
        .unwrap();
        std::fs::write(
            scripts_dir.join("testskill_api.py"),
            format!(
                "import argparse\nparser = argparse.ArgumentParser()\nsub = parser.add_subparsers(dest=\"action\")\nstatus = sub.add_parser(\"status\", help=\"Show status\")\nargs = parser.parse_args()\n{}\n",
                script_body
            ),
        )
        .unwrap();

        let registry = Arc::new(SkillRegistry::new(skills_dir));
        registry.reload().await.unwrap();

        let mut vectors = HashMap::new();
        vectors.insert("show status".to_string(), vec![1.0, 0.0]);
        vectors.insert("status: Show status".to_string(), vec![1.0, 0.0]);
        vectors.insert("zeig mir den status".to_string(), vec![1.0, 0.0]);
        vectors.insert("wie sieht es aus".to_string(), vec![0.6, 0.8]);
        vectors.insert("hallo".to_string(), vec![0.0, 1.0]);
        let embeddings: Arc<dyn EmbeddingProvider> = Arc::new(ScriptedEmbeddings { vectors });

        let cache = Arc::new(EmbeddingCache::new(dir.path().join("cache.json")));
        let router = SemanticRouter::new(cache, embeddings);

        let chat_provider: Arc<dyn ChatProvider> = chat.clone();
        let classifier = IntentClassifier::new(chat_provider.clone());

        let executor = SkillExecutor::new(
            ExecutorConfig {
                skill_timeout: 10,
                interpreter: "python3".to_string(),
                admin_users: Vec::new(),
            },
            8192,
        );

        let log = Arc::new(ErrorLog::new(dir.path().join("errors.jsonl")));
        let annealing = Arc::new(AnnealingLoop::new(
            Arc::new(NoFix),
            Arc::new(ApprovalStore::new(std::time::Duration::from_secs(300))),
            Arc::new(SilentChannel),
            log.clone(),
            registry.clone(),
            99,
        ));

        let pipeline = AgentPipeline::new(
            router,
            classifier,
            executor,
            registry,
            chat_provider,
            annealing,
            ChatHistory::new(50),
        );

        Fixture {
            _dir: dir,
            pipeline,
            chat,
            log,
        }
    }

    #[tokio::test]
    async fn test_high_confidence_skips_llm() {
        let chat = Arc::new(CountingChat::text("sollte nie kommen"));
        let fx = setup(chat, "print('ok')").await;

        let reply = fx.pipeline.handle_message(1, 7, "zeig mir den status").await;
        assert_eq!(reply, "ok");
        // 埋め込みで確定した意図はLLMを呼ばない
        assert_eq!(fx.chat.count(), 0);
    }

    #[tokio::test]
    async fn test_medium_confidence_uses_classifier() {
        let chat = Arc::new(CountingChat::tool_call(
            "testskill",
            serde_json::json!({"action": "status"}),
        ));
        let fx = setup(chat, "print('ok')").await;

        let reply = fx.pipeline.handle_message(1, 7, "wie sieht es aus").await;
        assert_eq!(reply, "ok");
        assert_eq!(fx.chat.count(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_is_conversational() {
        let chat = Arc::new(CountingChat::text("Hallo! Wie kann ich helfen?"));
        let fx = setup(chat, "print('ok')").await;

        let reply = fx.pipeline.handle_message(1, 7, "hallo").await;
        assert_eq!(reply, "Hallo! Wie kann ich helfen?");
        assert_eq!(fx.chat.count(), 1);
    }

    #[tokio::test]
    async fn test_followup_prompt_references_previous_exchange() {
        let chat = Arc::new(CountingChat::text("Im Garten war nichts los."));
        let fx = setup(chat, "print('ok')").await;

        fx.pipeline.handle_message(1, 7, "hallo").await;
        // 短い追問は履歴を埋め込んだ専用プロンプトで処理される
        let reply = fx.pipeline.handle_message(1, 7, "warum?").await;
        assert_eq!(reply, "Im Garten war nichts los.");

        let request = fx.chat.last_request();
        let system = &request[0];
        assert_eq!(system.role, "system");
        assert!(system.content.contains("bezieht sich auf die vorherige Nachricht"));
        // 直前のやり取りがプロンプト本文に含まれる
        assert!(system.content.contains("user: hallo"));
        assert!(system.content.contains("assistant: Im Garten war nichts los."));
        assert_eq!(request[1].content, "warum?");
    }

    #[tokio::test]
    async fn test_execution_failure_recorded_and_reported() {
        let chat = Arc::new(CountingChat::text("unbenutzt"));
        let fx = setup(chat, "import sys; sys.stderr.write('kaputt'); sys.exit(1)").await;

        let reply = fx.pipeline.handle_message(1, 7, "zeig mir den status").await;
        assert!(reply.contains("Ausführungsfehler"));

        let records = fx.log.load_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ErrorStatus::Open);
        assert_eq!(records[0].skill, "testskill");
    }

    #[tokio::test]
    async fn test_history_records_exchange() {
        let chat = Arc::new(CountingChat::text("Hallo!"));
        let fx = setup(chat, "print('ok')").await;

        fx.pipeline.handle_message(5, 7, "hallo").await;
        let history = fx.pipeline.history.get(5);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
    }

    #[tokio::test]
    async fn test_provider_down_gives_fixed_reply() {
        // 埋め込みもチャットも落ちている状態
        let dir = tempfile::tempdir().unwrap();
        let skills_dir = dir.path().join("skills");
        std::fs::create_dir_all(&skills_dir).unwrap();
        let registry = Arc::new(SkillRegistry::new(skills_dir));

        let down: Arc<dyn ChatProvider> = Arc::new(DownChat);
        let embeddings: Arc<dyn EmbeddingProvider> = Arc::new(ScriptedEmbeddings {
            vectors: HashMap::new(),
        });
        let cache = Arc::new(EmbeddingCache::new(dir.path().join("cache.json")));
        let log = Arc::new(ErrorLog::new(dir.path().join("errors.jsonl")));
        let annealing = Arc::new(AnnealingLoop::new(
            Arc::new(NoFix),
            Arc::new(ApprovalStore::new(std::time::Duration::from_secs(300))),
            Arc::new(SilentChannel),
            log,
            registry.clone(),
            99,
        ));

        let pipeline = AgentPipeline::new(
            SemanticRouter::new(cache, embeddings),
            IntentClassifier::new(down.clone()),
            SkillExecutor::new(ExecutorConfig::default(), 8192),
            registry,
            down,
            annealing,
            ChatHistory::new(50),
        );

        let reply = pipeline.handle_message(1, 7, "zeige kameras").await;
        assert_eq!(reply, PROVIDER_DOWN_REPLY);
    }

    #[test]
    fn test_scripted_vectors_hit_expected_tiers() {
        // フィクスチャのベクトルがTier境界を再現していることの自己検証
        let hint = vec![1.0, 0.0];
        assert!(cosine_similarity(&hint, &[1.0, 0.0]) >= 0.75);
        let medium = cosine_similarity(&hint, &[0.6, 0.8]);
        assert!((0.40..0.75).contains(&medium));
        assert!(cosine_similarity(&hint, &[0.0, 1.0]) < 0.40);
    }
}
