use crate::event::Event;
use crate::pattern_match::PatternMatch;
use crate::tree::{EvalError, EvalTree, NodeId};
use ahash::HashMap;
use log::debug;
use std::collections::VecDeque;
use std::rc::Rc;

/// Drives an event stream through an evaluation tree and yields the
/// pattern matches surfacing at its root.
///
/// Matches are drained after every leaf update, and the matches still
/// withheld for a possible trailing negative are released once the stream
/// is exhausted. A fatal evaluation error is yielded once; afterwards the
/// engine is done.
pub struct Engine<S> {
    stream: S,
    tree: EvalTree,
    /// Leaves subscribed to each event type.
    listeners: HashMap<String, Vec<NodeId>>,
    ready: VecDeque<PatternMatch>,
    eof_flushed: bool,
    failed: bool,
}

impl<S> Engine<S> {
    pub fn new(stream: S, tree: EvalTree) -> Self {
        let mut listeners: HashMap<String, Vec<NodeId>> = HashMap::default();
        for (id, event_type) in tree.leaves() {
            listeners.entry(event_type.to_string()).or_default().push(id);
        }

        Self {
            stream,
            tree,
            listeners,
            ready: VecDeque::new(),
            eof_flushed: false,
            failed: false,
        }
    }
}

impl<S> Iterator for Engine<S>
where
    S: Iterator<Item = Event>,
{
    type Item = Result<PatternMatch, EvalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if let Some(pattern_match) = self.ready.pop_front() {
                return Some(Ok(pattern_match));
            }

            match self.stream.next() {
                Some(event) => {
                    let Some(ids) = self.listeners.get(&event.event_type) else {
                        continue;
                    };
                    let ids = ids.clone();
                    let event = Rc::new(event);
                    for id in ids {
                        if let Err(error) = self.tree.handle_event(id, &event) {
                            self.failed = true;
                            return Some(Err(error));
                        }
                        self.tree.consume_matches(&mut self.ready);
                    }
                }
                None => {
                    if !self.eof_flushed {
                        self.eof_flushed = true;
                        self.ready.extend(self.tree.flush_eof());
                        continue;
                    }
                    debug!("event stream exhausted");
                    return None;
                }
            }
        }
    }
}
