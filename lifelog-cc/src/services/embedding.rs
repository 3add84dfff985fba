//! Line embeddings: provider seam and the two-level cache in front of it
//!
//! Lookups go memory snapshot → `line_embeddings` table → provider. Only
//! texts missing from both caches are sent to the provider, in batches.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::EmbeddingConfig;
use crate::db;
use crate::error::{DedupError, DedupResult};

const USER_AGENT: &str = concat!("lifelog-cc/", env!("CARGO_PKG_VERSION"));

/// In-memory entries kept before the snapshot is reset
const MAX_MEMORY_ENTRIES: usize = 50_000;

/// Per-item outcome of an embedding call
pub type ItemEmbedding = Result<Vec<f32>, String>;

/// Source of line embeddings
///
/// A call either fails as a whole (provider unreachable) or returns exactly
/// one outcome per input text, in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier; cached vectors are only reused for the same model
    fn model(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> DedupResult<Vec<ItemEmbedding>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint
pub struct HttpEmbeddingProvider {
    http_client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> DedupResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DedupError::Provider(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.resolve_api_key(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> DedupResult<Vec<ItemEmbedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!(count = texts.len(), model = %self.model, "Requesting embeddings");

        let mut request = self.http_client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DedupError::Provider(format!("Embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DedupError::Provider(format!(
                "Embedding endpoint returned {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| DedupError::Provider(format!("Malformed embedding response: {}", e)))?;

        Ok(align_response(texts.len(), parsed.data))
    }
}

/// Order response items by index; indices the endpoint skipped become failures
fn align_response(expected: usize, data: Vec<EmbeddingDatum>) -> Vec<ItemEmbedding> {
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for datum in data {
        if let Some(slot) = slots.get_mut(datum.index) {
            *slot = Some(datum.embedding);
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| slot.ok_or_else(|| format!("No embedding returned for input {}", idx)))
        .collect()
}

/// Hex SHA-256 of a line's exact text
pub fn text_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Cache lookup statistics of one `embed_texts` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbeddingStats {
    pub memory_hits: usize,
    pub stored_hits: usize,
    pub provider_requested: usize,
    pub provider_failed: usize,
}

/// Two-level embedding cache in front of a provider
///
/// Readers clone the `Arc` snapshot and never block each other for longer
/// than that; inserts publish a new snapshot.
pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    memory: RwLock<Arc<HashMap<String, Arc<Vec<f32>>>>>,
}

impl EmbeddingCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            memory: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub async fn memory_len(&self) -> usize {
        self.memory.read().await.len()
    }

    async fn snapshot(&self) -> Arc<HashMap<String, Arc<Vec<f32>>>> {
        Arc::clone(&*self.memory.read().await)
    }

    async fn publish(&self, entries: Vec<(String, Arc<Vec<f32>>)>) {
        if entries.is_empty() {
            return;
        }
        let mut guard = self.memory.write().await;
        let mut next = if guard.len() + entries.len() > MAX_MEMORY_ENTRIES {
            tracing::debug!(entries = guard.len(), "Embedding memory cache full, resetting");
            HashMap::new()
        } else {
            (**guard).clone()
        };
        next.extend(entries);
        *guard = Arc::new(next);
    }

    /// Embed `texts`, one outcome per text in input order
    ///
    /// Items the provider could not embed come back as `None`. When the
    /// provider was needed and produced nothing at all, the call fails with a
    /// retryable `DedupError::Provider`. `on_batch(done, total)` is called
    /// after every provider batch.
    pub async fn embed_texts<F>(
        &self,
        pool: &SqlitePool,
        texts: &[String],
        batch_size: usize,
        mut on_batch: F,
    ) -> DedupResult<(Vec<Option<Arc<Vec<f32>>>>, EmbeddingStats)>
    where
        F: FnMut(usize, usize) + Send,
    {
        let mut stats = EmbeddingStats::default();
        let hashes: Vec<String> = texts.iter().map(|t| text_hash(t)).collect();
        let mut out: Vec<Option<Arc<Vec<f32>>>> = vec![None; texts.len()];

        let snapshot = self.snapshot().await;
        let mut missing: Vec<usize> = Vec::new();
        for (idx, hash) in hashes.iter().enumerate() {
            match snapshot.get(hash) {
                Some(vector) => {
                    out[idx] = Some(Arc::clone(vector));
                    stats.memory_hits += 1;
                }
                None => missing.push(idx),
            }
        }
        drop(snapshot);

        if !missing.is_empty() {
            let wanted: Vec<String> = missing.iter().map(|&i| hashes[i].clone()).collect();
            let stored = db::embeddings::load_vectors(pool, self.model(), &wanted).await?;

            let mut promoted = Vec::new();
            missing.retain(|&idx| match stored.get(&hashes[idx]) {
                Some(vector) => {
                    let vector = Arc::new(vector.clone());
                    promoted.push((hashes[idx].clone(), Arc::clone(&vector)));
                    out[idx] = Some(vector);
                    stats.stored_hits += 1;
                    false
                }
                None => true,
            });
            self.publish(promoted).await;
        }

        // Identical texts are embedded once
        let mut unique_missing: Vec<usize> = Vec::new();
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for &idx in &missing {
            seen.entry(hashes[idx].as_str()).or_insert_with(|| {
                unique_missing.push(idx);
                idx
            });
        }

        let total = unique_missing.len();
        let mut done = 0usize;
        let mut fresh: Vec<(String, Arc<Vec<f32>>)> = Vec::new();
        let mut last_batch_error: Option<DedupError> = None;

        for chunk in unique_missing.chunks(batch_size.max(1)) {
            let batch: Vec<String> = chunk.iter().map(|&i| texts[i].clone()).collect();
            stats.provider_requested += batch.len();

            match self.provider.embed(&batch).await {
                Ok(results) => {
                    for (pos, &idx) in chunk.iter().enumerate() {
                        match results.get(pos) {
                            Some(Ok(vector)) => {
                                fresh.push((hashes[idx].clone(), Arc::new(vector.clone())));
                            }
                            Some(Err(reason)) => {
                                tracing::debug!(reason = %reason, "Embedding failed for line");
                                stats.provider_failed += 1;
                            }
                            None => stats.provider_failed += 1,
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, batch = batch.len(), "Embedding batch failed");
                    stats.provider_failed += batch.len();
                    last_batch_error = Some(e);
                }
            }

            done += chunk.len();
            on_batch(done, total);
        }

        if total > 0 && fresh.is_empty() {
            let reason = last_batch_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "provider returned no usable embeddings".to_string());
            return Err(DedupError::Provider(format!(
                "All {} embedding requests failed: {}",
                total, reason
            )));
        }

        if !fresh.is_empty() {
            let rows: Vec<(String, Vec<f32>)> =
                fresh.iter().map(|(h, v)| (h.clone(), (**v).clone())).collect();
            // A failed write only costs a recompute of these vectors later
            if let Err(e) = db::embeddings::store_vectors(pool, self.model(), &rows).await {
                tracing::warn!(error = %e, "Failed to persist embeddings");
            }

            let by_hash: HashMap<&str, &Arc<Vec<f32>>> =
                fresh.iter().map(|(h, v)| (h.as_str(), v)).collect();
            for &idx in &missing {
                if let Some(vector) = by_hash.get(hashes[idx].as_str()) {
                    out[idx] = Some(Arc::clone(vector));
                }
            }
            self.publish(fresh).await;
        }

        Ok((out, stats))
    }
}
