use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
    /// Attempt number the event belongs to, if any
    pub attempt: Option<u32>,
}

/// Bounded in-memory log of installer events for status queries
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn add_log(&self, level: &str, message: impl Into<String>, attempt: Option<u32>) {
        let entry = LogEntry {
            timestamp: Utc::now().timestamp(),
            level: level.to_string(),
            message: message.into(),
            attempt,
        };

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Most recent `limit` entries, oldest first
    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        let skip = limit.map_or(0, |n| buffer.len().saturating_sub(n));
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}
