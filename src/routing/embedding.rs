//! 埋め込みプロバイダクライアント
//!
//! OpenAI互換の/v1/embeddingsエンドポイントを呼び出す。
//! エンドポイントを圧迫しないよう、バッチはチャンクに分けて送信する。

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::PipelineError;

/// 1リクエストあたりの最大テキスト数
const BATCH_SIZE: usize = 32;

/// 埋め込みプロバイダのインターフェース
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 複数テキストをまとめて埋め込み
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;

    /// 単一テキストを埋め込み
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| PipelineError::ProviderUnavailable("empty embedding response".into()))
    }
}

/// HTTP実装
#[derive(Clone)]
pub struct HttpEmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    /// プロバイダ設定からクライアントを作成
    pub fn from_config(config: &ProviderConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .read_timeout(Duration::from_secs(30))
            .no_proxy()
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.url.clone(),
            model: config.embedding_model.clone(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/v1/embeddings", self.base_url);
        let mut all_vectors = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(BATCH_SIZE) {
            let request = EmbeddingRequest {
                model: &self.model,
                input: chunk,
            };

            let response = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| PipelineError::ProviderUnavailable(e.to_string()))?;

            if !response.status().is_success() {
                return Err(PipelineError::ProviderUnavailable(format!(
                    "embedding API returned {}",
                    response.status()
                )));
            }

            let mut body: EmbeddingResponse = response
                .json()
                .await
                .map_err(|e| PipelineError::ProviderUnavailable(e.to_string()))?;

            // indexでソートして順序を保証
            body.data.sort_by_key(|d| d.index);
            if body.data.len() != chunk.len() {
                return Err(PipelineError::ProviderUnavailable(format!(
                    "embedding count mismatch: got {}, expected {}",
                    body.data.len(),
                    chunk.len()
                )));
            }
            all_vectors.extend(body.data.into_iter().map(|d| d.embedding));
        }

        Ok(all_vectors)
    }
}

/// コサイン類似度を計算
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
