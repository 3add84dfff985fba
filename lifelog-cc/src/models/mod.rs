//! Data models for lifelog-cc (Clean Up Crew)

pub mod cluster;
pub mod conversation;
pub mod projection;
pub mod status;

pub use cluster::{LineClusterMembership, SemanticCluster};
pub use conversation::{ConversationRecord, LineId, NewConversationRecord, SpokenLine};
pub use projection::{DayProjection, DisplayKind, DisplayLine, ProjectionResult, WaitMode};
pub use status::{parse_day, DayStatus, Priority, ProcessingStatus};
