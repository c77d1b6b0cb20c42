use crate::event::Event;
use std::rc::Rc;

/// An immutable run of events filling a subset of the pattern's placeholders.
///
/// The event order follows the event definitions of the node that produced
/// the match. Timestamps are computed once, at construction.
#[derive(Debug, Clone)]
pub struct PartialMatch {
    pub events: Vec<Rc<Event>>,
    /// The timestamp of the earliest event; for determining expiry.
    pub first_timestamp: u64,
    /// The timestamp of the latest event; indicating "current time".
    pub last_timestamp: u64,
}

impl PartialMatch {
    /// Build from a non-empty event list.
    pub fn new(events: Vec<Rc<Event>>) -> Self {
        let mut first = u64::MAX;
        let mut last = u64::MIN;
        for event in &events {
            first = u64::min(first, event.timestamp);
            last = u64::max(last, event.timestamp);
        }

        Self {
            events,
            first_timestamp: first,
            last_timestamp: last,
        }
    }

    pub fn singleton(event: Rc<Event>) -> Self {
        let timestamp = event.timestamp;
        Self {
            events: vec![event],
            first_timestamp: timestamp,
            last_timestamp: timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;

    fn event(id: u64, timestamp: u64) -> Rc<Event> {
        Rc::new(Event::new("A", timestamp, Payload::default(), id))
    }

    #[test]
    fn test_timestamps_span_the_event_list() {
        let pm = PartialMatch::new(vec![event(0, 7), event(1, 3), event(2, 5)]);
        assert_eq!(pm.first_timestamp, 3);
        assert_eq!(pm.last_timestamp, 7);

        let pm = PartialMatch::singleton(event(3, 11));
        assert_eq!(pm.first_timestamp, 11);
        assert_eq!(pm.last_timestamp, 11);
    }
}
