//! 設定ファイル管理モジュール
//!
//! default.tomlから設定を読み込み、アプリケーション全体で使用できる
//! 型安全な設定構造体を提供します。

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// アプリケーション全体の設定
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// LLM/埋め込みプロバイダ接続設定
    #[serde(default)]
    pub provider: ProviderConfig,
    /// スキル関連設定
    #[serde(default)]
    pub skills: SkillsConfig,
    /// スキル実行設定
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// 承認フロー設定
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// 会話履歴設定
    #[serde(default)]
    pub history: HistoryConfig,
}

/// プロバイダ接続設定（OpenAI互換エンドポイント）
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// プロバイダサーバーのURL
    #[serde(default = "default_provider_url")]
    pub url: String,
    /// チャット補完に使うモデル名
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    /// 埋め込みに使うモデル名
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// 接続タイムアウト（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// 読み取りタイムアウト（秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// モデルのコンテキストサイズ（トークン）- 出力の切り詰めに使用
    #[serde(default = "default_context_size")]
    pub context_size: usize,
    /// リトライ設定
    #[serde(default)]
    pub retry: RetryConfig,
}

/// リトライ設定
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// 最大リトライ回数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初期バックオフ時間（ミリ秒）
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// バックオフ倍率
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// 最大バックオフ時間（ミリ秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// スキル設定
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SkillsConfig {
    /// カスタムスキルディレクトリパス（オプション）
    pub custom_path: Option<String>,
    /// 埋め込みキャッシュファイルのパス（オプション）
    pub cache_path: Option<String>,
}

/// スキル実行設定
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// スキルスクリプトのタイムアウト（秒）
    #[serde(default = "default_skill_timeout")]
    pub skill_timeout: u64,
    /// スクリプトを起動するインタプリタ
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// 書き込み系アクションを許可するユーザーID
    #[serde(default)]
    pub admin_users: Vec<i64>,
}

/// 承認フロー設定
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// 承認タイムアウト（分）
    #[serde(default = "default_approval_timeout_minutes")]
    pub timeout_minutes: u64,
    /// 期限切れ掃除の間隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 承認者のユーザーID
    #[serde(default)]
    pub approver_id: i64,
}

/// 会話履歴設定
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// チャットごとの最大メッセージ数
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

// デフォルト値を返す関数群
fn default_provider_url() -> String {
    "http://localhost:1234".to_string()
}

fn default_chat_model() -> String {
    "qwen3-8b".to_string()
}

fn default_embedding_model() -> String {
    "embeddinggemma-300m".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    300
}

fn default_context_size() -> usize {
    8192
}

fn default_skill_timeout() -> u64 {
    30
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_approval_timeout_minutes() -> u64 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_history_limit() -> usize {
    50
}

// リトライ設定のデフォルト値
fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: default_provider_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            context_size: default_context_size(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            skill_timeout: default_skill_timeout(),
            interpreter: default_interpreter(),
            admin_users: Vec::new(),
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_approval_timeout_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
            approver_id: 0,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            limit: default_history_limit(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            skills: SkillsConfig::default(),
            executor: ExecutorConfig::default(),
            approval: ApprovalConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl Config {
    /// TOMLファイルから設定を読み込む
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// TOML文字列から設定をパース
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    /// デフォルト設定ファイルパスを取得
    pub fn default_config_path() -> std::path::PathBuf {
        // 環境変数が最優先
        if let Ok(config_path) = std::env::var("HOMELAB_AGENT_CONFIG") {
            return std::path::PathBuf::from(config_path);
        }

        // カレントディレクトリのconfig/default.toml
        let cwd_config = std::path::PathBuf::from("config/default.toml");
        if cwd_config.exists() {
            return cwd_config;
        }

        // ホームディレクトリの.homelab-agent/config.toml
        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".homelab-agent").join("config.toml");
            if home_config.exists() {
                return home_config;
            }
        }

        std::path::PathBuf::from("config/default.toml")
    }

    /// デフォルト設定ファイルから読み込み（存在しない場合は自動生成）
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // 設定ファイルを自動生成
            if let Err(e) = Self::create_default_config(&config_path) {
                tracing::warn!("Failed to create default config: {}", e);
            } else {
                tracing::info!("Created default config at {}", config_path.display());
            }
            Ok(Self::default())
        }
    }

    /// デフォルト設定ファイルを生成
    fn create_default_config(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let default_content = r#"# homelab-agent default configuration

[provider]
url = "http://localhost:1234"
chat_model = "qwen3-8b"
embedding_model = "embeddinggemma-300m"
connect_timeout = 10   # seconds
read_timeout = 300     # seconds
context_size = 8192    # tokens

[provider.retry]
max_retries = 2
initial_backoff_ms = 1000
backoff_multiplier = 2.0
max_backoff_ms = 10000

[skills]
# custom_path = "/path/to/custom/skills"
# cache_path = "/path/to/embedding_cache.json"

[executor]
skill_timeout = 30     # seconds
interpreter = "python3"
admin_users = []       # user ids allowed to run admin actions

[approval]
timeout_minutes = 5
sweep_interval_secs = 30
approver_id = 0

[history]
limit = 50
"#;

        std::fs::write(path, default_content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// 承認タイムアウトをDurationとして取得
    pub fn approval_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.approval.timeout_minutes * 60)
    }
}
