use crate::condition::Value;
use ahash::HashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Attribute record carried by every event.
pub type Payload = HashMap<String, Value>;

/// A single event of the input stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The declared type of this event; leaves subscribe by this symbol.
    pub event_type: String,
    pub timestamp: u64,
    pub payload: Payload,
    /// Arrival index in the input stream, unique per event.
    pub id: u64,
}

impl Event {
    pub fn new(event_type: impl Into<String>, timestamp: u64, payload: Payload, id: u64) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp,
            payload,
            id,
        }
    }
}

impl Eq for Event {}

impl PartialEq<Self> for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
