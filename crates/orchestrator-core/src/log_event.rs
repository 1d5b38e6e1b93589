use crate::execution::ExecutionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A line as reported by a runner's log platform, before indexing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawLogLine {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub message: String,
    #[serde(default)]
    pub event_id: Option<String>,
}

impl RawLogLine {
    pub fn new(timestamp: i64, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
            event_id: None,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

/// A stored, indexed log line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEvent {
    pub execution_id: ExecutionId,
    /// 1-based, per execution, never renumbered.
    pub index: u64,
    /// Delivery timestamp in epoch milliseconds. Non-decreasing in index order.
    pub timestamp: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Arrival ordinal among id-less lines sharing a platform timestamp.
    #[serde(default)]
    pub sequence: u32,
    /// Platform timestamp when it was earlier than `timestamp` (late arrival).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_timestamp: Option<i64>,
}

impl LogEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(
            self.origin_timestamp.unwrap_or(self.timestamp),
            self.event_id.as_deref(),
            self.sequence,
        )
    }
}

/// Identity of a log line: platform timestamp plus platform event id, or the
/// arrival sequence when the platform supplies no id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKey {
    Id { timestamp: i64, event_id: String },
    Seq { timestamp: i64, sequence: u32 },
}

impl EventKey {
    pub fn new(timestamp: i64, event_id: Option<&str>, sequence: u32) -> Self {
        match event_id {
            Some(id) => EventKey::Id {
                timestamp,
                event_id: id.to_string(),
            },
            None => EventKey::Seq {
                timestamp,
                sequence,
            },
        }
    }
}

/// A raw line annotated with its identity, ready to be indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedLine {
    pub line: RawLogLine,
    pub sequence: u32,
}

impl SequencedLine {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.line.timestamp, self.line.event_id.as_deref(), self.sequence)
    }
}

/// Order a full raw line set by timestamp (stable, so arrival order breaks
/// ties) and number id-less lines within each timestamp.
pub fn sequence_lines(mut lines: Vec<RawLogLine>) -> Vec<SequencedLine> {
    lines.sort_by_key(|l| l.timestamp);
    let mut seen: HashMap<i64, u32> = HashMap::new();
    lines
        .into_iter()
        .map(|line| {
            let sequence = if line.event_id.is_none() {
                let counter = seen.entry(line.timestamp).or_insert(0);
                let seq = *counter;
                *counter += 1;
                seq
            } else {
                0
            };
            SequencedLine { line, sequence }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_lines_orders_and_numbers_ties() {
        let lines = vec![
            RawLogLine::new(20, "c"),
            RawLogLine::new(10, "a"),
            RawLogLine::new(20, "d"),
            RawLogLine::new(10, "b").with_event_id("x"),
        ];
        let seq = sequence_lines(lines);
        let messages: Vec<_> = seq.iter().map(|s| s.line.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b", "c", "d"]);
        assert_eq!(seq[2].sequence, 0);
        assert_eq!(seq[3].sequence, 1);
        assert_eq!(
            seq[1].key(),
            EventKey::Id {
                timestamp: 10,
                event_id: "x".into()
            }
        );
    }
}
