//! Spoken line extraction
//!
//! Turns a raw conversation record into its ordered spoken lines. Content is
//! either a JSON array of content nodes (only `blockquote` nodes carry speech)
//! or a plain transcript with one `Speaker: text` per line.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::{ConversationRecord, LineId, SpokenLine};

/// Speaker used when a node or transcript line names nobody
pub const UNKNOWN_SPEAKER: &str = "Unknown";

/// Speaker label for nodes attributed to the device owner
pub const USER_SPEAKER: &str = "You";

const SPOKEN_NODE_TYPE: &str = "blockquote";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentNode {
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    speaker_name: Option<String>,
    #[serde(default)]
    speaker_identifier: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
}

/// All spoken lines of a record, indexed by position within the record
pub fn extract_lines(record: &ConversationRecord) -> Vec<SpokenLine> {
    let raw = record.content.trim();
    match serde_json::from_str::<Vec<ContentNode>>(raw) {
        Ok(nodes) => lines_from_nodes(record, nodes),
        Err(_) if raw.starts_with('[') => {
            tracing::warn!(
                record_id = %record.id,
                "Content looks like JSON but is not a node array; reading as transcript"
            );
            lines_from_transcript(record, raw)
        }
        Err(_) => lines_from_transcript(record, raw),
    }
}

/// Lines of a whole day, records in chronological order
pub fn extract_day(records: &[ConversationRecord]) -> Vec<SpokenLine> {
    records.iter().flat_map(extract_lines).collect()
}

fn lines_from_nodes(record: &ConversationRecord, nodes: Vec<ContentNode>) -> Vec<SpokenLine> {
    let mut lines = Vec::new();
    let mut last_timestamp = record.started_at;

    for node in nodes {
        if node.node_type != SPOKEN_NODE_TYPE {
            continue;
        }
        let Some(text) = node.content.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
            continue;
        };

        // Lines without a start time inherit the previous line's
        let timestamp = node
            .start_time
            .as_deref()
            .and_then(parse_node_time)
            .unwrap_or(last_timestamp);
        last_timestamp = timestamp;

        lines.push(SpokenLine {
            id: LineId {
                record_id: record.id,
                line_index: lines.len() as u32,
            },
            speaker: node_speaker(node.speaker_name.as_deref(), node.speaker_identifier.as_deref()),
            text: text.to_string(),
            timestamp,
        });
    }

    lines
}

fn node_speaker(name: Option<&str>, identifier: Option<&str>) -> String {
    match (name.map(str::trim).filter(|n| !n.is_empty()), identifier) {
        (Some(name), _) => name.to_string(),
        (None, Some("user")) => USER_SPEAKER.to_string(),
        _ => UNKNOWN_SPEAKER.to_string(),
    }
}

fn parse_node_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn lines_from_transcript(record: &ConversationRecord, raw: &str) -> Vec<SpokenLine> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(idx, line)| {
            let (speaker, text) = split_speaker(line);
            SpokenLine {
                id: LineId {
                    record_id: record.id,
                    line_index: idx as u32,
                },
                speaker,
                text,
                timestamp: record.started_at,
            }
        })
        .collect()
}

/// `Speaker: text`; a colon deep inside the text is not a speaker separator
fn split_speaker(line: &str) -> (String, String) {
    if let Some((speaker, text)) = line.split_once(':') {
        let speaker = speaker.trim();
        let text = text.trim();
        if !speaker.is_empty() && speaker.split_whitespace().count() <= 4 && !text.is_empty() {
            return (speaker.to_string(), text.to_string());
        }
    }
    (UNKNOWN_SPEAKER.to_string(), line.to_string())
}
