use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use homelab_agent::{
    agent::ChatHistory,
    annealing::{AnnealingLoop, ApprovalChannel, ApprovalStore, ErrorLog, LlmFixGenerator},
    config::Config,
    llm::{ChatProvider, HttpChatClient, IntentClassifier},
    routing::{EmbeddingCache, EmbeddingProvider, HttpEmbeddingClient, SemanticRouter},
    skills::{SkillExecutor, SkillRegistry},
    AgentPipeline,
};

#[derive(Parser, Debug)]
#[command(name = "homelab-agent")]
#[command(about = "Intent-Resolution-Agent für Smart Home und Homelab")]
#[command(version)]
struct Args {
    /// 設定ファイルパス
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// スキルディレクトリ
    #[arg(short, long)]
    skills_dir: Option<PathBuf>,

    /// 詳細ログを表示 (INFO level)
    #[arg(long)]
    verbose: bool,
}

/// コンソールで承認依頼と通知を表示するチャネル
struct ConsoleChannel;

#[async_trait]
impl ApprovalChannel for ConsoleChannel {
    async fn send_decision_request(
        &self,
        approver_id: i64,
        summary: &str,
        request_id: &str,
    ) -> Result<()> {
        println!("\n--- Freigabe erforderlich (User {}) ---", approver_id);
        println!("{}", summary);
        println!("Antworte mit: approve {id} | reject {id}\n", id = request_id);
        Ok(())
    }

    async fn notify(&self, user_id: i64, message: &str) -> Result<()> {
        println!("\n[Notiz an User {}] {}\n", user_id, message);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // トレーシング初期化（デフォルトはWARN、--verboseでINFO）
    let args = Args::parse();
    let default_level = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    // 設定ファイルを読み込み
    let config = if args.config.exists() {
        Config::load_from_file(&args.config).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config file: {}, using defaults", e);
            Config::default()
        })
    } else {
        Config::load_default().unwrap_or_else(|e| {
            tracing::warn!("Failed to load default config: {}, using defaults", e);
            Config::default()
        })
    };

    tracing::info!("homelab-agent v{} starting...", homelab_agent::VERSION);
    tracing::info!("Provider URL: {}", config.provider.url);
    tracing::info!("Chat model: {}", config.provider.chat_model);
    tracing::info!("Embedding model: {}", config.provider.embedding_model);

    // スキルレジストリを初期化
    let skills_path = args
        .skills_dir
        .or_else(|| config.skills.custom_path.as_ref().map(PathBuf::from))
        .unwrap_or_else(SkillRegistry::default_skills_path);
    let registry = Arc::new(SkillRegistry::new(skills_path));
    match registry.reload().await {
        Ok(snapshot) => tracing::info!("Loaded {} skills", snapshot.len()),
        Err(e) => tracing::warn!("Skill loading failed: {}", e),
    }

    // プロバイダとルーター
    let embeddings: Arc<dyn EmbeddingProvider> =
        Arc::new(HttpEmbeddingClient::from_config(&config.provider));
    let cache_path = config
        .skills
        .cache_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(EmbeddingCache::default_cache_path);
    let cache = Arc::new(EmbeddingCache::new(cache_path));
    let router = SemanticRouter::new(cache, embeddings);

    let chat: Arc<dyn ChatProvider> = Arc::new(HttpChatClient::from_config(&config.provider));
    let classifier = IntentClassifier::new(chat.clone());

    // 実行と自己修復
    let executor = SkillExecutor::new(config.executor.clone(), config.provider.context_size);
    let channel: Arc<dyn ApprovalChannel> = Arc::new(ConsoleChannel);
    let annealing = Arc::new(AnnealingLoop::new(
        Arc::new(LlmFixGenerator::new(chat.clone())),
        Arc::new(ApprovalStore::new(config.approval_timeout())),
        channel,
        Arc::new(ErrorLog::new(ErrorLog::default_path())),
        registry.clone(),
        config.approval.approver_id,
    ));
    let _sweeper = annealing.spawn_sweeper(config.approval.sweep_interval_secs);

    let user_id = config.executor.admin_users.first().copied().unwrap_or(0);
    let pipeline = AgentPipeline::new(
        router,
        classifier,
        executor,
        registry.clone(),
        chat,
        annealing,
        ChatHistory::new(config.history.limit),
    );

    println!("homelab-agent v{} bereit. 'exit' zum Beenden.", homelab_agent::VERSION);

    // 標準入力のメッセージループ
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    print_prompt();

    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            print_prompt();
            continue;
        }

        match input {
            "exit" | "quit" => break,
            "reload" => match registry.reload().await {
                Ok(snapshot) => println!("{} Skills neu geladen.", snapshot.len()),
                Err(e) => println!("Neuladen fehlgeschlagen: {}", e),
            },
            _ => {
                if let Some(id) = input.strip_prefix("approve ") {
                    println!("{}", pipeline.handle_decision(id.trim(), true).await);
                } else if let Some(id) = input.strip_prefix("reject ") {
                    println!("{}", pipeline.handle_decision(id.trim(), false).await);
                } else {
                    let reply = pipeline.handle_message(0, user_id, input).await;
                    println!("{}", reply);
                }
            }
        }
        print_prompt();
    }

    Ok(())
}

fn print_prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}
