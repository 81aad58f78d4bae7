use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

const TIMESTAMP_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "<<"),
            Direction::Outbound => write!(f, ">>"),
        }
    }
}

/// One line of traffic. Fields are private so an entry cannot change after
/// it has been recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    topic: String,
    payload: String,
    timestamp: String,
    direction: Direction,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.timestamp, self.direction, self.topic, self.payload
        )
    }
}

impl HistoryEntry {
    pub fn new(topic: String, payload: String, direction: Direction, at: DateTime<Local>) -> Self {
        HistoryEntry {
            topic,
            payload,
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            direction,
        }
    }

    /// Inbound entry from the raw bytes received; invalid UTF-8 is replaced.
    pub fn inbound(topic: String, payload: &[u8]) -> Self {
        Self::new(
            topic,
            String::from_utf8_lossy(payload).into_owned(),
            Direction::Inbound,
            Local::now(),
        )
    }

    pub fn outbound(topic: String, raw_message: String) -> Self {
        Self::new(topic, raw_message, Direction::Outbound, Local::now())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Append-only record of inbound and outbound traffic
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Vec<HistoryEntry>,
    generation: u64,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.generation += 1;
    }

    /// Number of times the log has been cleared
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn entries_render_with_direction_marker() {
        let entry = HistoryEntry::new(
            "home/temp".to_string(),
            "21.5".to_string(),
            Direction::Inbound,
            at(9, 5, 7),
        );
        assert_eq!(entry.to_string(), "[09:05:07] << home/temp: 21.5");
    }

    #[test]
    fn inbound_decodes_invalid_utf8_lossily() {
        let entry = HistoryEntry::inbound("raw".to_string(), &[0x68, 0xff, 0x69]);
        assert_eq!(entry.payload(), "h\u{fffd}i");
        assert_eq!(entry.direction(), Direction::Inbound);
    }

    #[test]
    fn record_appends_in_order_and_clear_empties() {
        let mut log = MessageLog::new();
        log.record(HistoryEntry::outbound("a".to_string(), "1".to_string()));
        log.record(HistoryEntry::inbound("b".to_string(), b"2"));

        let topics: Vec<_> = log.entries().iter().map(|e| e.topic()).collect();
        assert_eq!(topics, vec!["a", "b"]);

        log.clear();
        assert!(log.is_empty());
        assert!(log.entries().is_empty());
        assert_eq!(log.generation(), 1);

        log.record(HistoryEntry::inbound("c".to_string(), b"3"));
        assert_eq!(log.len(), 1);
    }
}
