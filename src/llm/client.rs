//! チャット補完クライアント - エラーリトライ機能付き
//!
//! OpenAI互換の/v1/chat/completionsエンドポイントと通信する。
//! 接続エラー時の自動リトライ（エクスポネンシャルバックオフ）をサポート

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::{ProviderConfig, RetryConfig};
use crate::error::PipelineError;

/// リトライ可能なエラーの種類
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryableError {
    /// 接続エラー（サーバーに到達できない）
    Connection,
    /// タイムアウト
    Timeout,
    /// サーバーエラー（5xx）
    ServerError,
    /// リクエストエラー（リトライ不可）
    NonRetryable,
}

impl RetryableError {
    /// reqwestエラーからリトライ可能かどうかを判定
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_connect() {
            RetryableError::Connection
        } else if error.is_timeout() {
            RetryableError::Timeout
        } else if let Some(status) = error.status() {
            if status.is_server_error() {
                RetryableError::ServerError
            } else {
                RetryableError::NonRetryable
            }
        } else {
            // ネットワーク関連のエラーはリトライ可能とみなす
            if error.is_request() {
                RetryableError::Connection
            } else {
                RetryableError::NonRetryable
            }
        }
    }

    /// リトライ可能かどうか
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetryableError::Connection | RetryableError::Timeout | RetryableError::ServerError
        )
    }

    /// エラーの説明
    pub fn description(&self) -> &'static str {
        match self {
            RetryableError::Connection => "接続エラー",
            RetryableError::Timeout => "タイムアウト",
            RetryableError::ServerError => "サーバーエラー",
            RetryableError::NonRetryable => "リクエストエラー",
        }
    }
}

/// チャットメッセージ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// チャット補完の結果
#[derive(Debug, Clone)]
pub enum ChatOutcome {
    /// モデルがツール呼び出しを選択
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    /// モデルがテキストで応答
    Text(String),
}

/// チャット補完プロバイダ
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// ツール定義付きでチャット補完を実行
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
    ) -> Result<ChatOutcome, PipelineError>;

    /// ツールなしの素のチャット補完
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, PipelineError> {
        match self.complete(messages, &[]).await? {
            ChatOutcome::Text(text) => Ok(text),
            ChatOutcome::ToolCall { name, .. } => Err(PipelineError::ParseError(format!(
                "unexpected tool call in plain chat: {}",
                name
            ))),
        }
    }
}

#[derive(Clone)]
pub struct HttpChatClient {
    client: Client,
    base_url: String,
    model: String,
    retry_config: RetryConfig,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [serde_json::Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

#[derive(Deserialize, Debug)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallEntry>>,
}

#[derive(Deserialize, Debug)]
struct ToolCallEntry {
    function: FunctionCall,
}

#[derive(Deserialize, Debug)]
struct FunctionCall {
    name: String,
    /// OpenAI互換APIはargumentsをJSON文字列で返す
    arguments: String,
}

impl HttpChatClient {
    fn build_client(connect_timeout_secs: u64, read_timeout_secs: u64) -> Client {
        Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .no_proxy()
            .build()
            .unwrap_or_else(|_| Client::new())
    }

    /// 基本的なクライアントを作成（デフォルトタイムアウト使用）
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: Self::build_client(10, 300),
            base_url: base_url.to_string(),
            model: model.to_string(),
            retry_config: RetryConfig::default(),
        }
    }

    /// ProviderConfigからクライアントを作成
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            client: Self::build_client(config.connect_timeout, config.read_timeout),
            base_url: config.url.clone(),
            model: config.chat_model.clone(),
            retry_config: config.retry.clone(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// バックオフ時間を計算（エクスポネンシャルバックオフ）
    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = (self.retry_config.initial_backoff_ms as f64)
            * self.retry_config.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff_ms.min(self.retry_config.max_backoff_ms as f64) as u64;
        Duration::from_millis(backoff_ms)
    }

    /// リトライ付きでリクエストを送信
    async fn send_with_retry<T, F, Fut>(&self, operation: F) -> Result<T, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, reqwest::Error>>,
    {
        for attempt in 0..=self.retry_config.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    let error_type = RetryableError::from_reqwest_error(&error);

                    if !error_type.is_retryable() || attempt >= self.retry_config.max_retries {
                        return Err(PipelineError::ProviderUnavailable(format!(
                            "{}: {} (nach {} Versuchen)",
                            error_type.description(),
                            error,
                            attempt + 1
                        )));
                    }

                    // バックオフを計算して待機
                    let backoff = self.calculate_backoff(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.retry_config.max_retries,
                        error_type = error_type.description(),
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying chat request"
                    );

                    sleep(backoff).await;
                }
            }
        }

        unreachable!("retry loop always returns")
    }
}

#[async_trait]
impl ChatProvider for HttpChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
    ) -> Result<ChatOutcome, PipelineError> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            temperature: 0.1,
            max_tokens: 1500,
            tools: (!tools.is_empty()).then_some(tools),
            tool_choice: (!tools.is_empty()).then_some("auto"),
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = serde_json::to_value(&request)
            .map_err(|e| PipelineError::ParseError(e.to_string()))?;

        let response: CompletionResponse = self
            .send_with_retry(|| {
                let client = self.client.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    client
                        .post(&url)
                        .json(&body)
                        .send()
                        .await?
                        .error_for_status()?
                        .json::<CompletionResponse>()
                        .await
                }
            })
            .await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::ParseError("empty choices in response".to_string()))?;

        if let Some(calls) = choice.message.tool_calls {
            if let Some(call) = calls.into_iter().next() {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .map_err(|e| {
                        PipelineError::ParseError(format!("invalid tool arguments: {}", e))
                    })?;
                return Ok(ChatOutcome::ToolCall {
                    name: call.function.name,
                    arguments,
                });
            }
        }

        let content = choice.message.content.unwrap_or_default();
        Ok(ChatOutcome::Text(strip_think_tags(&content)))
    }
}

/// 推論モデルの<think>ブロックを応答から除去
pub fn strip_think_tags(text: &str) -> String {
    let re = regex::Regex::new(r"(?s)<think>.*?</think>").unwrap();
    re.replace_all(text, "").trim().to_string()
}
