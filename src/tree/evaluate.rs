//! The runtime half of the evaluation tree: event intake, the join
//! protocol between sibling subtrees, negation handling in both modes,
//! and window-driven expiration.

use super::node::{EventDef, JoinOp, NodeKind};
use super::{EvalError, EvalTree, NodeId};
use crate::condition::Binding;
use crate::event::Event;
use crate::partial_match::PartialMatch;
use crate::pattern::{NegationMode, PatternOperator, WINDOW_UNBOUNDED};
use log::debug;
use std::iter::zip;
use std::rc::Rc;

impl EvalTree {
    /// Feed one event into a leaf. Everything the event triggers — joins,
    /// expirations, re-admissions — completes before this returns.
    pub(crate) fn handle_event(&mut self, leaf: NodeId, event: &Rc<Event>) -> Result<(), EvalError> {
        self.expire(leaf, event.timestamp)?;

        let accepted = {
            let node = &self.nodes[leaf];
            let NodeKind::Leaf(l) = &node.kind else {
                return Err(EvalError::Invariant("handle_event on a non-leaf node"));
            };
            let mut binding = Binding::default();
            binding.insert(l.def.name.as_str(), &event.payload);
            node.condition.eval(&binding)?
        };
        if !accepted {
            return Ok(());
        }

        debug!("event {} accepted at leaf {}", event.id, leaf);
        let pm = Rc::new(PartialMatch::singleton(event.clone()));
        self.nodes[leaf].add_partial_match(pm);
        if let Some(parent) = self.nodes[leaf].parent {
            self.handle_new_partial_match(parent, leaf)?;
        }
        Ok(())
    }

    /// A child has queued a new partial match; consume it and join.
    fn handle_new_partial_match(&mut self, id: NodeId, source: NodeId) -> Result<(), EvalError> {
        match &self.nodes[id].kind {
            NodeKind::Leaf(_) => Err(EvalError::Invariant("a leaf has no child matches to join")),
            NodeKind::Internal(_) => self.internal_handle_new(id, source),
            NodeKind::Negation(_) => self.negation_handle_new(id, source),
        }
    }

    fn pop_unhandled(&mut self, source: NodeId) -> Result<Rc<PartialMatch>, EvalError> {
        self.nodes[source]
            .unhandled
            .pop_front()
            .ok_or(EvalError::Invariant("child notified without a queued match"))
    }

    fn internal_handle_new(&mut self, id: NodeId, source: NodeId) -> Result<(), EvalError> {
        let NodeKind::Internal(internal) = &self.nodes[id].kind else {
            return Err(EvalError::Invariant("join on a non-internal node"));
        };
        let other = if source == internal.left {
            internal.right
        } else if source == internal.right {
            internal.left
        } else {
            return Err(EvalError::Invariant("match source is not a child of this node"));
        };

        let new_pm = self.pop_unhandled(source)?;
        let new_defs = self.visible_defs(source).to_vec();

        self.expire(other, new_pm.last_timestamp)?;
        let candidates = self.nodes[other].partial_matches.clone();
        let other_defs = self.visible_defs(other).to_vec();
        self.expire(id, new_pm.last_timestamp)?;

        for other_pm in &candidates {
            self.try_combine(id, &new_pm, other_pm, &new_defs, &other_defs)?;
        }
        Ok(())
    }

    /// Check window, order and condition for one candidate pair; on success
    /// store the combined match and notify the parent.
    fn try_combine(
        &mut self,
        id: NodeId,
        new_pm: &Rc<PartialMatch>,
        other_pm: &Rc<PartialMatch>,
        new_defs: &[EventDef],
        other_defs: &[EventDef],
    ) -> Result<(), EvalError> {
        let Some(merged) = self.merged_if_valid(id, new_pm, other_pm, new_defs, other_defs)? else {
            return Ok(());
        };

        let pm = PartialMatch::new(merged);
        let threshold = self.nodes[id].threshold;
        if threshold != 0 && pm.last_timestamp < threshold {
            return Ok(());
        }

        let pm = Rc::new(pm);
        self.nodes[id].add_partial_match(pm);
        if let Some(parent) = self.nodes[id].parent {
            self.handle_new_partial_match(parent, id)?;
        }
        Ok(())
    }

    fn merged_if_valid(
        &self,
        id: NodeId,
        new_pm: &PartialMatch,
        other_pm: &PartialMatch,
        new_defs: &[EventDef],
        other_defs: &[EventDef],
    ) -> Result<Option<Vec<Rc<Event>>>, EvalError> {
        let node = &self.nodes[id];
        if node.window != WINDOW_UNBOUNDED
            && new_pm.last_timestamp.abs_diff(other_pm.first_timestamp) > node.window
        {
            return Ok(None);
        }

        let NodeKind::Internal(internal) = &node.kind else {
            return Err(EvalError::Invariant("join on a non-internal node"));
        };

        let merged: Vec<Rc<Event>> = match internal.op {
            JoinOp::And => {
                if internal.event_defs[0].slot == new_defs[0].slot {
                    new_pm.events.iter().chain(&other_pm.events).cloned().collect()
                } else if internal.event_defs[0].slot == other_defs[0].slot {
                    other_pm.events.iter().chain(&new_pm.events).cloned().collect()
                } else {
                    return Err(EvalError::Invariant(
                        "arrival slots of the children do not line up with the join",
                    ));
                }
            }
            JoinOp::Seq => merge_events(new_defs, other_defs, &new_pm.events, &other_pm.events, |d| {
                d.slot
            }),
        };

        if internal.op == JoinOp::Seq && !timestamps_sorted(&merged) {
            return Ok(None);
        }

        let binding = build_binding(&internal.event_defs, &merged)?;
        if !node.condition.eval(&binding)? {
            return Ok(None);
        }
        Ok(Some(merged))
    }

    /// Would this negative event complete an invalidation against the given
    /// positive match? The combined events must fit the window, keep the
    /// source-position order, and satisfy the negation node's condition.
    ///
    /// `positive_defs` may describe a larger subtree than the node's own
    /// left child: an ancestor's stored match is tested under the ancestor's
    /// slot layout, where the order constraint can come out differently.
    fn negation_invalidates(
        &self,
        id: NodeId,
        positive: &PartialMatch,
        positive_defs: &[EventDef],
        negative: &PartialMatch,
        negative_defs: &[EventDef],
    ) -> Result<bool, EvalError> {
        let node = &self.nodes[id];
        let first = u64::min(positive.first_timestamp, negative.first_timestamp);
        let last = u64::max(positive.last_timestamp, negative.last_timestamp);
        if node.window != WINDOW_UNBOUNDED && last - first > node.window {
            return Ok(false);
        }

        let NodeKind::Negation(negation) = &node.kind else {
            return Err(EvalError::Invariant("negation join on a non-negation node"));
        };

        let merged = merge_events(
            positive_defs,
            negative_defs,
            &positive.events,
            &negative.events,
            |d| d.position,
        );
        match negation.top_op {
            PatternOperator::Seq => {
                if !timestamps_sorted(&merged) {
                    return Ok(false);
                }
            }
            _ => {
                return Err(EvalError::Invariant(
                    "negation join requires a sequence pattern",
                ))
            }
        }

        let merged_defs = merge_defs(positive_defs, negative_defs, |d| d.position);
        let binding = build_binding(&merged_defs, &merged)?;
        Ok(node.condition.eval(&binding)?)
    }

    fn negation_handle_new(&mut self, id: NodeId, source: NodeId) -> Result<(), EvalError> {
        let (mode, left, right, is_first, is_last) = {
            let Some(negation) = self.nodes[id].as_negation() else {
                return Err(EvalError::Invariant("negation handling on a non-negation node"));
            };
            (
                negation.mode,
                negation.left,
                negation.right,
                negation.is_first,
                negation.is_last,
            )
        };

        if source == left {
            self.negation_handle_positive(id, left, right, mode, is_first, is_last)
        } else if source == right {
            self.negation_handle_negative(id, left, right, mode, is_first, is_last)
        } else {
            Err(EvalError::Invariant("match source is not a child of this node"))
        }
    }

    /// A positive partial match arrived from the left subtree.
    fn negation_handle_positive(
        &mut self,
        id: NodeId,
        left: NodeId,
        right: NodeId,
        mode: NegationMode,
        is_first: bool,
        is_last: bool,
    ) -> Result<(), EvalError> {
        let new_pm = self.pop_unhandled(left)?;

        if is_last {
            // only negative placeholders remain; the match stands unless a
            // future negative event lands inside its window
            if let Some(negation) = self.nodes[id].as_negation_mut() {
                negation.waiting_for_timeout.push(new_pm);
            }
            return Ok(());
        }

        let left_defs = self.visible_defs(left).to_vec();
        self.expire(right, new_pm.last_timestamp)?;
        let negatives = self.nodes[right].partial_matches.clone();
        let right_defs = self.visible_defs(right).to_vec();
        self.expire(id, new_pm.last_timestamp)?;

        let mut blocker = None;
        for negative in &negatives {
            if self.negation_invalidates(id, &new_pm, &left_defs, negative, &right_defs)? {
                blocker = Some(negative.clone());
                break;
            }
        }

        match blocker {
            None => {
                // when this node holds the re-admission threshold, a match
                // still inside the expired negative's window stops here
                let threshold = self.nodes[id].threshold;
                if threshold != 0 && new_pm.last_timestamp < threshold {
                    return Ok(());
                }
                self.nodes[id].add_partial_match(new_pm);
                if let Some(parent) = self.nodes[id].parent {
                    self.handle_new_partial_match(parent, id)?;
                }
            }
            Some(negative) => {
                debug!("positive match blocked by negative event at node {}", id);
                if is_first && mode == NegationMode::FirstChance {
                    // the blocked match becomes valid again once the
                    // negative has aged out of the window
                    let expiry = negative.last_timestamp.saturating_add(self.nodes[id].window);
                    if let Some(negation) = self.nodes[id].as_negation_mut() {
                        negation.check_expired.push((expiry, new_pm));
                    }
                }
            }
        }
        Ok(())
    }

    /// A negative event arrived from the right leaf.
    fn negation_handle_negative(
        &mut self,
        id: NodeId,
        left: NodeId,
        right: NodeId,
        mode: NegationMode,
        is_first: bool,
        is_last: bool,
    ) -> Result<(), EvalError> {
        if is_last {
            return self.trailing_negation_check(id, right);
        }

        if mode == NegationMode::PostProcessing || is_first {
            // nothing stored here can be invalidated retroactively; the
            // negative stays in its leaf and blocks future positives
            let _ = self.nodes[right].unhandled.pop_front();
            return Ok(());
        }

        // first-chance, mid-pattern: retract every stored match the new
        // negative invalidates
        let new_negative = self.pop_unhandled(right)?;
        let right_defs = self.visible_defs(right).to_vec();
        self.expire(left, new_negative.last_timestamp)?;
        self.expire(id, new_negative.last_timestamp)?;

        // The invalidated combination may already be folded into larger
        // joins further up, so every ancestor's store is tested against the
        // new negative under that ancestor's own slot layout.
        let mut current = Some(id);
        while let Some(node_id) = current {
            let defs: Vec<EventDef> = match &self.nodes[node_id].kind {
                NodeKind::Internal(internal) => internal.event_defs.clone(),
                _ => self.visible_defs(node_id).to_vec(),
            };

            let stored = self.nodes[node_id].partial_matches.clone();
            let mut victims = Vec::new();
            for pm in &stored {
                if self.negation_invalidates(id, pm, &defs, &new_negative, &right_defs)? {
                    victims.push(pm.clone());
                }
            }
            if !victims.is_empty() {
                debug!(
                    "negative event {} invalidates {} matches at node {}",
                    new_negative.events[0].id,
                    victims.len(),
                    node_id
                );
                self.nodes[node_id].remove_partial_matches(&victims);
            }

            // matches withheld at a trailing negation node are at risk too
            let waiting = match self.nodes[node_id].as_negation() {
                Some(negation) => negation.waiting_for_timeout.clone(),
                None => Vec::new(),
            };
            if !waiting.is_empty() {
                let mut keep = Vec::with_capacity(waiting.len());
                for pm in waiting {
                    if !self.negation_invalidates(id, &pm, &defs, &new_negative, &right_defs)? {
                        keep.push(pm);
                    }
                }
                if let Some(negation) = self.nodes[node_id].as_negation_mut() {
                    negation.waiting_for_timeout = keep;
                }
            }

            current = self.nodes[node_id].parent;
        }
        Ok(())
    }

    /// A negative event arrived at a trailing negation node: weed out the
    /// withheld matches it invalidates.
    fn trailing_negation_check(&mut self, id: NodeId, right: NodeId) -> Result<(), EvalError> {
        let holder = self.first_last_negative_node(id);
        let new_negative = self.pop_unhandled(right)?;
        let right_defs = self.visible_defs(right).to_vec();

        self.expire(holder, new_negative.last_timestamp)?;
        let waiting = match self.nodes[holder].as_negation() {
            Some(negation) => negation.waiting_for_timeout.clone(),
            None => return Err(EvalError::Invariant("withheld matches on a non-negation node")),
        };
        let holder_defs = self.visible_defs(holder).to_vec();
        self.expire(id, new_negative.last_timestamp)?;

        let mut keep = Vec::with_capacity(waiting.len());
        for pm in waiting {
            if !self.negation_invalidates(id, &pm, &holder_defs, &new_negative, &right_defs)? {
                keep.push(pm);
            }
        }
        if let Some(negation) = self.nodes[holder].as_negation_mut() {
            negation.waiting_for_timeout = keep;
        }
        Ok(())
    }

    /// Window-driven cleanup at `cutoff` (the current stream time):
    /// drop expired partial matches, move withheld matches that can no
    /// longer be invalidated to the end-of-stream list, and give matches
    /// blocked by now-expired leading negatives another chance to ascend.
    pub(crate) fn expire(&mut self, id: NodeId, cutoff: u64) -> Result<(), EvalError> {
        if self.nodes[id].window == WINDOW_UNBOUNDED {
            return Ok(());
        }
        self.nodes[id].expire_store(cutoff);

        let horizon = cutoff.saturating_sub(self.nodes[id].window);
        if let Some(negation) = self.nodes[id].as_negation_mut() {
            if negation.is_last {
                negation
                    .waiting_for_timeout
                    .sort_by_key(|pm| pm.first_timestamp);
                let count = negation
                    .waiting_for_timeout
                    .partition_point(|pm| pm.first_timestamp < horizon);
                let released = negation.waiting_for_timeout.drain(..count);
                self.matches_to_handle_at_eof.extend(released);
            }
        }

        let start = self.nodes[id].parent.unwrap_or(id);
        let mut first_chance_nodes = Vec::new();
        self.collect_first_chance_nodes(start, &mut first_chance_nodes);

        for fc in first_chance_nodes {
            if self.nodes[fc].window == WINDOW_UNBOUNDED {
                break;
            }
            let (left, right) = match self.nodes[fc].as_negation() {
                Some(negation) => (negation.left, negation.right),
                None => continue,
            };
            self.nodes[right].expire_store(cutoff);

            let due: Vec<Rc<PartialMatch>> = match self.nodes[fc].as_negation() {
                Some(negation) => negation
                    .check_expired
                    .iter()
                    .filter(|(expiry, _)| *expiry < cutoff)
                    .map(|(_, pm)| pm.clone())
                    .collect(),
                None => continue,
            };

            for pm in due {
                // a nested sweep triggered by a previous re-admission may
                // already have handled this entry
                let Some(negation) = self.nodes[fc].as_negation_mut() else {
                    break;
                };
                let before = negation.check_expired.len();
                negation.check_expired.retain(|(_, p)| !Rc::ptr_eq(p, &pm));
                if negation.check_expired.len() == before {
                    continue;
                }

                // While the re-admitted match climbs, matches that would
                // still fall inside the expired negative's window must not
                // be accepted at the top. The bound lives on the root, or
                // below any trailing negation nodes sitting on it.
                let mut holder = self.root;
                while let Some(negation) = self.nodes[holder].as_negation() {
                    if negation.is_last {
                        holder = negation.left;
                    } else {
                        break;
                    }
                }

                debug!("re-admitting match blocked by an expired negative at node {fc}");
                self.nodes[holder].threshold = cutoff;
                self.nodes[left].unhandled.push_back(pm);
                let result = self.handle_new_partial_match(fc, left);
                self.nodes[holder].threshold = 0;
                result?;
            }
        }
        Ok(())
    }

    /// All first-chance nodes for leading negations in the subtree of `id`.
    fn collect_first_chance_nodes(&self, id: NodeId, out: &mut Vec<NodeId>) {
        match &self.nodes[id].kind {
            NodeKind::Leaf(_) => {}
            NodeKind::Internal(internal) => {
                self.collect_first_chance_nodes(internal.left, out);
                self.collect_first_chance_nodes(internal.right, out);
            }
            NodeKind::Negation(negation) => {
                self.collect_first_chance_nodes(negation.left, out);
                if negation.mode == NegationMode::FirstChance && negation.is_first {
                    out.push(id);
                }
            }
        }
    }
}

fn build_binding<'a>(
    defs: &'a [EventDef],
    events: &'a [Rc<Event>],
) -> Result<Binding<'a>, EvalError> {
    if defs.len() != events.len() {
        return Err(EvalError::Invariant(
            "event definitions do not line up with the merged events",
        ));
    }
    let mut binding = Binding::default();
    for (def, event) in zip(defs, events) {
        binding.insert(def.name.as_str(), &event.payload);
    }
    Ok(binding)
}

/// Merge two runs of event definitions, ordered by `key`.
pub(crate) fn merge_defs<K: Ord>(
    a: &[EventDef],
    b: &[EventDef],
    key: impl Fn(&EventDef) -> K,
) -> Vec<EventDef> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if key(&a[i]) < key(&b[j]) {
            out.push(a[i].clone());
            i += 1;
        } else {
            out.push(b[j].clone());
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Weave two event runs together, driven by the merge order of their
/// definitions.
fn merge_events<K: Ord>(
    a_defs: &[EventDef],
    b_defs: &[EventDef],
    a_events: &[Rc<Event>],
    b_events: &[Rc<Event>],
    key: impl Fn(&EventDef) -> K,
) -> Vec<Rc<Event>> {
    debug_assert_eq!(a_defs.len(), a_events.len());
    debug_assert_eq!(b_defs.len(), b_events.len());

    let mut out = Vec::with_capacity(a_events.len() + b_events.len());
    let (mut i, mut j) = (0, 0);
    while i < a_defs.len() && j < b_defs.len() {
        if key(&a_defs[i]) < key(&b_defs[j]) {
            out.push(a_events[i].clone());
            i += 1;
        } else {
            out.push(b_events[j].clone());
            j += 1;
        }
    }
    out.extend(a_events[i..].iter().cloned());
    out.extend(b_events[j..].iter().cloned());
    out
}

fn timestamps_sorted(events: &[Rc<Event>]) -> bool {
    events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp)
}
