//! Services for lifelog-cc

pub mod clusterer;
pub mod embedding;
pub mod line_extractor;
pub mod orchestrator;
pub mod progress;
pub mod projector;
pub mod scheduler;

pub use clusterer::{cluster_lines, ClusterParams, LineCluster};
pub use embedding::{EmbeddingCache, EmbeddingProvider, HttpEmbeddingProvider, ItemEmbedding};
pub use orchestrator::{CleanUpCrew, DayRunOutcome};
pub use progress::{ProgressChannel, ProgressEvent, ProgressSubscription};
pub use projector::{build_projection, recover_original};
pub use scheduler::{BackgroundScheduler, SchedulerHandle, SchedulerRunReport};
