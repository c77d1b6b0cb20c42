use crate::event::Event;
use itertools::Itertools;
use std::cmp::Ordering;
use std::fmt;
use std::fmt::Formatter;
use std::hash::{Hash, Hasher};
use std::iter::zip;
use std::rc::Rc;

/// Complete pattern match.
#[derive(Clone, Debug)]
pub struct PatternMatch {
    /// Matched events, ordered as required by the pattern operator.
    pub events: Vec<Rc<Event>>,
    /// The timestamp of the latest event; indicating "current time".
    pub latest_time: u64,
    /// The timestamp of the earliest event; for determining expiry of this match.
    pub earliest_time: u64,
}

impl PatternMatch {
    pub fn new(events: Vec<Rc<Event>>) -> Self {
        let mut earliest_time = u64::MAX;
        let mut latest_time = u64::MIN;
        for event in &events {
            earliest_time = u64::min(earliest_time, event.timestamp);
            latest_time = u64::max(latest_time, event.timestamp);
        }

        Self {
            events,
            latest_time,
            earliest_time,
        }
    }
}

impl fmt::Display for PatternMatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.events.iter().map(|e| e.id).join(", "))
    }
}

impl Eq for PatternMatch {}

impl PartialEq for PatternMatch {
    fn eq(&self, other: &Self) -> bool {
        self.events.len() == other.events.len()
            && zip(&self.events, &other.events).all(|(a, b)| a.id.eq(&b.id))
    }
}

impl Hash for PatternMatch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for event in &self.events {
            event.id.hash(state);
        }
    }
}

/// Helper structure that implements `PartialEq`, `Ord`, `PartialOrd` traits for `PatternMatch`.
///
/// *Earliest* refers to `PatternMatch.earliest_time`.
#[derive(Clone)]
pub struct EarliestFirst(pub PatternMatch);
impl Eq for EarliestFirst {}

impl PartialEq<Self> for EarliestFirst {
    fn eq(&self, other: &Self) -> bool {
        self.0.earliest_time.eq(&other.0.earliest_time)
    }
}

impl Ord for EarliestFirst {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.earliest_time.cmp(&other.0.earliest_time).reverse()
    }
}

impl PartialOrd<Self> for EarliestFirst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
