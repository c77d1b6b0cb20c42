//! An exhaustive reference matcher.
//!
//! Enumerates every positional combination of input events, with none of
//! the incremental machinery of the evaluation tree. Far too slow for real
//! streams, but its output is easy to trust; the tree is tested against it.

use crate::condition::{Binding, Condition, ConditionError};
use crate::event::Event;
use crate::pattern::{Pattern, PatternOperator, Placeholder, WINDOW_UNBOUNDED};
use crate::pattern_match::{EarliestFirst, PatternMatch};
use std::collections::BinaryHeap;
use std::collections::HashSet;
use std::rc::Rc;

/// Invalidation probe for one negated placeholder.
struct NegationCheck {
    name: String,
    event_type: String,
    position: usize,
    condition: Condition,
}

struct Enumerator<'p> {
    positives: Vec<(usize, &'p Placeholder)>,
    pools: Vec<Vec<Rc<Event>>>,
    events: Vec<Rc<Event>>,
    positive_condition: Condition,
    checks: Vec<NegationCheck>,
    is_seq: bool,
    window: u64,
}

/// All matches of `pattern` in `events`, earliest first.
pub fn find_matches(
    pattern: &Pattern,
    events: &[Event],
) -> Result<Vec<PatternMatch>, ConditionError> {
    let positives: Vec<(usize, &Placeholder)> = pattern.positives().collect();
    let positive_names: HashSet<String> = positives.iter().map(|(_, p)| p.name.clone()).collect();

    let events: Vec<Rc<Event>> = events.iter().cloned().map(Rc::new).collect();
    let pools = positives
        .iter()
        .map(|(_, placeholder)| {
            events
                .iter()
                .filter(|e| e.event_type == placeholder.event_type)
                .cloned()
                .collect()
        })
        .collect();

    let checks = pattern
        .negatives()
        .map(|(position, placeholder)| {
            let mut names = positive_names.clone();
            names.insert(placeholder.name.clone());
            NegationCheck {
                name: placeholder.name.clone(),
                event_type: placeholder.event_type.clone(),
                position,
                condition: pattern.condition.project(&names).unwrap_or_default(),
            }
        })
        .collect();

    let enumerator = Enumerator {
        positives,
        pools,
        events,
        positive_condition: pattern
            .condition
            .project(&positive_names)
            .unwrap_or_default(),
        checks,
        is_seq: pattern.operator == PatternOperator::Seq,
        window: pattern.window,
    };

    let mut found = Vec::new();
    enumerator.recurse(0, &mut Vec::new(), &mut found)?;

    // report earliest matches first
    let heap: BinaryHeap<EarliestFirst> = found.into_iter().map(EarliestFirst).collect();
    Ok(heap.into_sorted_vec().into_iter().rev().map(|m| m.0).collect())
}

impl Enumerator<'_> {
    fn recurse(
        &self,
        depth: usize,
        chosen: &mut Vec<Rc<Event>>,
        out: &mut Vec<PatternMatch>,
    ) -> Result<(), ConditionError> {
        if depth == self.positives.len() {
            let binding = self.binding(chosen);
            if self.positive_condition.eval(&binding)? && !self.invalidated(chosen, &binding)? {
                out.push(PatternMatch::new(chosen.clone()));
            }
            return Ok(());
        }

        for event in &self.pools[depth] {
            if self.window != WINDOW_UNBOUNDED {
                let mut first = event.timestamp;
                let mut last = event.timestamp;
                for e in chosen.iter() {
                    first = u64::min(first, e.timestamp);
                    last = u64::max(last, e.timestamp);
                }
                if last - first > self.window {
                    continue;
                }
            }
            if self.is_seq {
                if let Some(previous) = chosen.last() {
                    if previous.timestamp > event.timestamp {
                        continue;
                    }
                }
            }

            chosen.push(event.clone());
            self.recurse(depth + 1, chosen, out)?;
            chosen.pop();
        }
        Ok(())
    }

    fn binding<'a>(&'a self, chosen: &'a [Rc<Event>]) -> Binding<'a> {
        let mut binding = Binding::default();
        for ((_, placeholder), event) in self.positives.iter().zip(chosen) {
            binding.insert(placeholder.name.as_str(), &event.payload);
        }
        binding
    }

    /// Does any negative event land inside this match?
    fn invalidated<'a>(
        &'a self,
        chosen: &'a [Rc<Event>],
        binding: &Binding<'a>,
    ) -> Result<bool, ConditionError> {
        for check in &self.checks {
            for event in self.events.iter().filter(|e| e.event_type == check.event_type) {
                if self.window != WINDOW_UNBOUNDED {
                    let mut first = event.timestamp;
                    let mut last = event.timestamp;
                    for e in chosen {
                        first = u64::min(first, e.timestamp);
                        last = u64::max(last, e.timestamp);
                    }
                    if last - first > self.window {
                        continue;
                    }
                }

                if self.is_seq && !self.respects_positions(chosen, event, check.position) {
                    continue;
                }

                let mut extended = binding.clone();
                extended.insert(check.name.as_str(), &event.payload);
                if check.condition.eval(&extended)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Would inserting `event` at the negated placeholder's source position
    /// keep the sequence's timestamps non-decreasing?
    fn respects_positions(&self, chosen: &[Rc<Event>], event: &Event, position: usize) -> bool {
        for ((positive_position, _), positive) in self.positives.iter().zip(chosen) {
            if *positive_position < position {
                if positive.timestamp > event.timestamp {
                    return false;
                }
            } else if positive.timestamp < event.timestamp {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{CmpOp, Term};
    use crate::event::Payload;
    use crate::pattern::Placeholder;

    fn event(id: u64, event_type: &str, timestamp: u64, v: i64) -> Event {
        let mut payload = Payload::default();
        payload.insert("v".to_string(), v.into());
        Event::new(event_type, timestamp, payload, id)
    }

    fn ids(matches: &[PatternMatch]) -> Vec<Vec<u64>> {
        matches
            .iter()
            .map(|m| m.events.iter().map(|e| e.id).collect())
            .collect()
    }

    #[test]
    fn test_simple_sequence() {
        let pattern = Pattern::new(
            PatternOperator::Seq,
            vec![Placeholder::new("A", "a"), Placeholder::new("B", "b")],
            Condition::cmp(CmpOp::Lt, Term::attr("a", "v"), Term::attr("b", "v")),
            10,
        );
        let events = vec![
            event(0, "A", 0, 1),
            event(1, "B", 3, 2),
            event(2, "B", 5, 0),
        ];

        let matches = find_matches(&pattern, &events).unwrap();
        assert_eq!(ids(&matches), vec![vec![0, 1]]);
    }

    #[test]
    fn test_negative_event_suppresses_the_match() {
        let pattern = Pattern::new(
            PatternOperator::Seq,
            vec![Placeholder::negated("A", "x"), Placeholder::new("B", "b")],
            Condition::True,
            5,
        );

        let blocked = vec![event(0, "A", 0, 0), event(1, "B", 3, 0)];
        assert!(find_matches(&pattern, &blocked).unwrap().is_empty());

        // the negative is too old to share a window with B
        let free = vec![event(0, "A", 0, 0), event(1, "B", 9, 0)];
        assert_eq!(ids(&find_matches(&pattern, &free).unwrap()), vec![vec![1]]);
    }
}
