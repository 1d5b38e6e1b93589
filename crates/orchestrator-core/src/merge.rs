use std::collections::HashSet;

use crate::execution::ExecutionId;
use crate::log_event::{sequence_lines, EventKey, LogEvent, RawLogLine};

/// Turn a runner's full raw line set into the events not yet stored,
/// indexed from `max_index + 1` in timestamp order.
///
/// A line older than the newest stored event keeps its platform timestamp in
/// `origin_timestamp` and is delivered at the newest stored timestamp, so
/// index order and timestamp order never disagree.
pub fn index_new_lines(
    execution_id: &ExecutionId,
    stored: &[LogEvent],
    max_index: u64,
    raw: Vec<RawLogLine>,
) -> Vec<LogEvent> {
    let known: HashSet<EventKey> = stored.iter().map(|e| e.key()).collect();
    let mut last_timestamp = stored.last().map(|e| e.timestamp);
    let mut next_index = max_index + 1;

    sequence_lines(raw)
        .into_iter()
        .filter(|line| !known.contains(&line.key()))
        .map(|sequenced| {
            let platform_ts = sequenced.line.timestamp;
            let (timestamp, origin_timestamp) = match last_timestamp {
                Some(prev) if platform_ts < prev => (prev, Some(platform_ts)),
                _ => (platform_ts, None),
            };
            last_timestamp = Some(timestamp);
            let event = LogEvent {
                execution_id: execution_id.clone(),
                index: next_index,
                timestamp,
                message: sequenced.line.message,
                event_id: sequenced.line.event_id,
                sequence: sequenced.sequence,
                origin_timestamp,
            };
            next_index += 1;
            event
        })
        .collect()
}
