//! Server-push frames.
//!
//! Wire format, one frame per event:
//!
//! ```text
//! id: 1718000000
//! event: message
//! data: {"id":"T1","status":"running","result":""}
//!
//! ```

use std::fmt;

use serde_json::{json, Value};

use crate::types::TaskRecord;

/// Frame tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTag {
    /// A task record.
    Message,
    /// The task is unknown or has expired. Always the last frame.
    NotFound,
}

impl EventTag {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One server-push event.
///
/// # Examples
///
/// ```
/// use taskcast::stream::SseFrame;
/// use taskcast::TaskRecord;
///
/// let frame = SseFrame::message(1_700_000_000, &TaskRecord::pending("T1"));
/// assert_eq!(
///     frame.encode(),
///     "id: 1700000000\nevent: message\ndata: {\"id\":\"T1\",\"status\":\"pending\",\"result\":\"\"}\n\n"
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    /// Unix seconds; never decreases within one stream.
    pub id: u64,
    /// Frame tag.
    pub event: EventTag,
    /// JSON payload.
    pub data: Value,
}

impl SseFrame {
    /// A `message` frame carrying `record`.
    pub fn message(id: u64, record: &TaskRecord) -> Self {
        Self {
            id,
            event: EventTag::Message,
            data: serde_json::to_value(record).unwrap_or(Value::Null),
        }
    }

    /// A `not_found` frame for `task_id`.
    pub fn not_found(id: u64, task_id: &str) -> Self {
        Self {
            id,
            event: EventTag::NotFound,
            data: json!({ "id": task_id }),
        }
    }

    /// Decodes the payload of a `message` frame.
    pub fn record(&self) -> Option<TaskRecord> {
        match self.event {
            EventTag::Message => serde_json::from_value(self.data.clone()).ok(),
            EventTag::NotFound => None,
        }
    }

    /// `true` if nothing can follow this frame: `not_found`, or a record in a
    /// terminal status.
    pub fn is_terminal(&self) -> bool {
        match self.event {
            EventTag::NotFound => true,
            EventTag::Message => self.record().is_some_and(|r| r.is_terminal()),
        }
    }

    /// Encodes the frame for the wire.
    pub fn encode(&self) -> String {
        format!("id: {}\nevent: {}\ndata: {}\n\n", self.id, self.event, self.data)
    }
}

impl fmt::Display for SseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Issues frame ids from the wall clock, clamped so they never go
/// backwards.
#[derive(Debug, Default, Clone)]
pub struct FrameClock {
    last: u64,
}

impl FrameClock {
    /// A clock that has issued nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id from the current wall clock.
    pub fn next_id(&mut self) -> u64 {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
        self.next_id_at(now)
    }

    /// Next id given a wall-clock reading in unix seconds.
    pub fn next_id_at(&mut self, now: u64) -> u64 {
        self.last = self.last.max(now);
        self.last
    }
}
