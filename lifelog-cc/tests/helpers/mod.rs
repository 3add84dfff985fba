//! Shared test utilities: a scriptable embedding provider, a temporary
//! database and a fully wired Clean Up Crew

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use lifelog_cc::config::DedupConfig;
use lifelog_cc::db::records;
use lifelog_cc::models::NewConversationRecord;
use lifelog_cc::services::{CleanUpCrew, EmbeddingCache, EmbeddingProvider, ItemEmbedding, ProgressChannel};
use lifelog_cc::{DedupError, DedupResult};
use lifelog_common::events::EventBus;

pub const DIMENSIONS: usize = 128;
pub const MODEL: &str = "mock-embed";

/// Embedding provider with scripted vectors
///
/// Texts assigned to the same topic embed close to each other (cosine ≈ 0.96).
/// Any other text gets its own orthogonal axis.
pub struct MockProvider {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    next_axis: AtomicUsize,
    calls: AtomicUsize,
    texts_requested: AtomicUsize,
    down: AtomicBool,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            vectors: Mutex::new(HashMap::new()),
            // Axes below 16 are reserved for topics
            next_axis: AtomicUsize::new(16),
            calls: AtomicUsize::new(0),
            texts_requested: AtomicUsize::new(0),
            down: AtomicBool::new(false),
            failing: Mutex::new(HashSet::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Place `text` near every other text of `topic` (0..16)
    pub fn set_topic(&self, text: &str, topic: usize) {
        let mut vector = vec![0.0f32; DIMENSIONS];
        vector[topic] = 1.0;
        vector[self.fresh_axis()] = 0.2;
        self.vectors.lock().unwrap().insert(text.to_string(), vector);
    }

    pub fn set_vector(&self, text: &str, vector: Vec<f32>) {
        self.vectors.lock().unwrap().insert(text.to_string(), vector);
    }

    /// Per-item failure for `text`
    pub fn fail_on(&self, text: &str) {
        self.failing.lock().unwrap().insert(text.to_string());
    }

    /// Fail every call as a whole
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts_requested(&self) -> usize {
        self.texts_requested.load(Ordering::SeqCst)
    }

    fn fresh_axis(&self) -> usize {
        self.next_axis.fetch_add(1, Ordering::SeqCst) % DIMENSIONS
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vectors = self.vectors.lock().unwrap();
        if let Some(v) = vectors.get(text) {
            return v.clone();
        }
        let mut vector = vec![0.0f32; DIMENSIONS];
        vector[self.fresh_axis()] = 1.0;
        vectors.insert(text.to_string(), vector.clone());
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn model(&self) -> &str {
        MODEL
    }

    async fn embed(&self, texts: &[String]) -> DedupResult<Vec<ItemEmbedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_requested.fetch_add(texts.len(), Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.down.load(Ordering::SeqCst) {
            return Err(DedupError::Provider("embedding service unavailable".to_string()));
        }

        let failing = self.failing.lock().unwrap().clone();
        Ok(texts
            .iter()
            .map(|text| {
                if failing.contains(text) {
                    Err(format!("cannot embed '{}'", text))
                } else {
                    Ok(self.vector_for(text))
                }
            })
            .collect())
    }
}

/// Temporary on-disk database with the service schema
///
/// The TempDir must outlive the pool.
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test_lifelog.db");
    let pool = lifelog_cc::db::init_database_pool(&db_path).await.unwrap();
    (temp_dir, pool)
}

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn at(day: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_hms_opt(hour, minute, 0).unwrap())
}

/// Store one plain-transcript record (`Speaker: text` per line)
pub async fn seed_record(
    pool: &SqlitePool,
    day: NaiveDate,
    source_id: &str,
    started_at: DateTime<Utc>,
    lines: &[(&str, &str)],
) -> Uuid {
    let content = lines
        .iter()
        .map(|(speaker, text)| format!("{}: {}", speaker, text))
        .collect::<Vec<_>>()
        .join("\n");
    seed_raw_record(pool, day, source_id, started_at, content).await
}

/// Store one record with content exactly as given
pub async fn seed_raw_record(
    pool: &SqlitePool,
    day: NaiveDate,
    source_id: &str,
    started_at: DateTime<Utc>,
    content: String,
) -> Uuid {
    let record = NewConversationRecord {
        namespace: "test".to_string(),
        source_id: source_id.to_string(),
        day,
        title: Some(format!("Conversation {}", source_id)),
        content,
        started_at,
        ended_at: None,
    };
    records::upsert_record(pool, &record).await.unwrap()
}

/// Config with short timeouts for tests
pub fn test_config() -> DedupConfig {
    DedupConfig {
        compute_timeout_secs: 5,
        ..DedupConfig::default()
    }
}

/// Crew over a fresh database and a mock provider
pub struct TestCrew {
    pub _dir: TempDir,
    pub pool: SqlitePool,
    pub provider: Arc<MockProvider>,
    pub event_bus: EventBus,
    pub crew: Arc<CleanUpCrew>,
}

impl TestCrew {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: DedupConfig) -> Self {
        let (dir, pool) = create_test_db().await;
        let provider = Arc::new(MockProvider::new());
        let embeddings = Arc::new(EmbeddingCache::new(provider.clone()));
        let event_bus = EventBus::new(100);
        let crew = Arc::new(CleanUpCrew::new(
            pool.clone(),
            config,
            embeddings,
            Arc::new(ProgressChannel::new()),
            event_bus.clone(),
        ));
        Self {
            _dir: dir,
            pool,
            provider,
            event_bus,
            crew,
        }
    }

    /// Seed the heat conversation: two near-duplicates and one unrelated line
    pub async fn seed_heat_day(&self, day: NaiveDate) -> Uuid {
        self.provider.set_topic("wow it is really hot", 0);
        self.provider.set_topic("i hate this heat", 0);
        seed_record(
            &self.pool,
            day,
            &format!("heat-{}", day),
            at(day, 12, 0),
            &[
                ("John", "wow it is really hot"),
                ("John", "i hate this heat"),
                ("Sarah", "let's go inside"),
            ],
        )
        .await
    }
}
