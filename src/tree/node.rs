use crate::condition::Condition;
use crate::partial_match::PartialMatch;
use crate::pattern::{NegationMode, PatternOperator, WINDOW_UNBOUNDED};
use std::collections::VecDeque;
use std::rc::Rc;

/// Index of a node in the tree arena.
pub(crate) type NodeId = usize;

/// Describes which placeholder one slot of a partial match is filled by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EventDef {
    /// Arrival slot, unique across the leaves of the tree. For positive
    /// placeholders this is the index used by the tree shape.
    pub slot: usize,
    /// Position of the placeholder in the source pattern.
    pub position: usize,
    pub event_type: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinOp {
    And,
    Seq,
}

#[derive(Debug)]
pub(crate) struct LeafNode {
    pub def: EventDef,
}

/// Binary join of two subtrees.
#[derive(Debug)]
pub(crate) struct InternalNode {
    pub op: JoinOp,
    pub left: NodeId,
    pub right: NodeId,
    /// Slot descriptors of this subtree, in partial-match order.
    pub event_defs: Vec<EventDef>,
}

/// Join whose right child is a leaf for a negated placeholder.
///
/// To the rest of the tree this node is transparent: its visible event
/// definitions are those of its left (positive) subtree.
#[derive(Debug)]
pub(crate) struct NegationNode {
    pub mode: NegationMode,
    pub top_op: PatternOperator,
    pub left: NodeId,
    pub right: NodeId,
    /// Left-subtree definitions plus the negated leaf, merged by source
    /// position; used when joining a positive match with a negative event.
    pub event_defs: Vec<EventDef>,
    /// No positive placeholder precedes the negated one in the source pattern.
    pub is_first: bool,
    /// No positive placeholder follows the negated one in the source pattern.
    pub is_last: bool,
    /// Matches that satisfy the pattern but can still be invalidated by a
    /// negative event arriving inside the window.
    pub waiting_for_timeout: Vec<Rc<PartialMatch>>,
    /// First-chance only: `(expiry, pm)` pairs for matches blocked by a
    /// leading negative event; once the negative has aged past `expiry` the
    /// match is given another chance to ascend.
    pub check_expired: Vec<(u64, Rc<PartialMatch>)>,
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    Leaf(LeafNode),
    Internal(InternalNode),
    Negation(NegationNode),
}

#[derive(Debug)]
pub(crate) struct Node {
    pub parent: Option<NodeId>,
    pub window: u64,
    pub condition: Condition,
    /// Partial matches sorted by `first_timestamp`, earliest first.
    pub partial_matches: Vec<Rc<PartialMatch>>,
    /// Matches added here but not yet consumed by the parent's join.
    pub unhandled: VecDeque<Rc<PartialMatch>>,
    /// When non-zero, a merged match is accepted only if its last timestamp
    /// reaches this bound. Set transiently while a previously blocked match
    /// re-ascends, see `EvalTree::expire`.
    pub threshold: u64,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(window: u64, kind: NodeKind) -> Self {
        Self {
            parent: None,
            window,
            condition: Condition::True,
            partial_matches: Vec::new(),
            unhandled: VecDeque::new(),
            threshold: 0,
            kind,
        }
    }

    /// Insert keeping the store sorted by `first_timestamp`; entries with an
    /// equal key go after the existing ones. When the node has a parent the
    /// match is also queued for the parent's join.
    pub fn add_partial_match(&mut self, pm: Rc<PartialMatch>) {
        let at = self
            .partial_matches
            .partition_point(|m| m.first_timestamp <= pm.first_timestamp);
        self.partial_matches.insert(at, pm.clone());
        if self.parent.is_some() {
            self.unhandled.push_back(pm);
        }
    }

    /// Drop the prefix of partial matches whose earliest timestamp violates
    /// the window at time `cutoff`.
    pub fn expire_store(&mut self, cutoff: u64) {
        if self.window == WINDOW_UNBOUNDED {
            return;
        }
        let horizon = cutoff.saturating_sub(self.window);
        let count = self
            .partial_matches
            .partition_point(|m| m.first_timestamp < horizon);
        self.partial_matches.drain(..count);
    }

    /// Pop the earliest partial match. Used on the root to drain full matches.
    pub fn consume_first(&mut self) -> Option<Rc<PartialMatch>> {
        if self.partial_matches.is_empty() {
            None
        } else {
            Some(self.partial_matches.remove(0))
        }
    }

    /// Remove the given matches, compared by identity.
    pub fn remove_partial_matches(&mut self, victims: &[Rc<PartialMatch>]) {
        self.partial_matches
            .retain(|m| !victims.iter().any(|v| Rc::ptr_eq(m, v)));
    }

    pub fn as_negation(&self) -> Option<&NegationNode> {
        match &self.kind {
            NodeKind::Negation(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_negation_mut(&mut self) -> Option<&mut NegationNode> {
        match &mut self.kind {
            NodeKind::Negation(n) => Some(n),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Payload};

    fn node(window: u64) -> Node {
        Node::new(
            window,
            NodeKind::Leaf(LeafNode {
                def: EventDef {
                    slot: 0,
                    position: 0,
                    event_type: "A".to_string(),
                    name: "a".to_string(),
                },
            }),
        )
    }

    fn pm(id: u64, timestamp: u64) -> Rc<PartialMatch> {
        Rc::new(PartialMatch::singleton(Rc::new(Event::new(
            "A",
            timestamp,
            Payload::default(),
            id,
        ))))
    }

    fn stored_ids(node: &Node) -> Vec<u64> {
        node.partial_matches
            .iter()
            .map(|m| m.events[0].id)
            .collect()
    }

    #[test]
    fn test_insertion_is_sorted_and_stable() {
        let mut node = node(100);
        node.add_partial_match(pm(0, 5));
        node.add_partial_match(pm(1, 2));
        node.add_partial_match(pm(2, 9));
        node.add_partial_match(pm(3, 5));

        assert_eq!(stored_ids(&node), [1, 0, 3, 2]);
        // no parent, so nothing is queued for a join
        assert!(node.unhandled.is_empty());
    }

    #[test]
    fn test_expiration_drops_the_stale_prefix() {
        let mut node = node(10);
        for (id, ts) in [(0, 1), (1, 4), (2, 8)] {
            node.add_partial_match(pm(id, ts));
        }

        node.expire_store(11);
        assert_eq!(stored_ids(&node), [0, 1, 2]);

        node.expire_store(12);
        assert_eq!(stored_ids(&node), [1, 2]);

        // expiring twice with the same cutoff changes nothing
        node.expire_store(12);
        assert_eq!(stored_ids(&node), [1, 2]);
    }

    #[test]
    fn test_unbounded_window_never_expires() {
        let mut node = node(WINDOW_UNBOUNDED);
        node.add_partial_match(pm(0, 1));
        node.expire_store(u64::MAX);
        assert_eq!(stored_ids(&node), [0]);
    }

    #[test]
    fn test_consume_first_pops_earliest() {
        let mut node = node(100);
        node.add_partial_match(pm(0, 7));
        node.add_partial_match(pm(1, 3));

        assert_eq!(node.consume_first().unwrap().events[0].id, 1);
        assert_eq!(node.consume_first().unwrap().events[0].id, 0);
        assert!(node.consume_first().is_none());
    }

    #[test]
    fn test_remove_by_identity() {
        let mut node = node(100);
        let a = pm(0, 1);
        let twin = pm(0, 1);
        node.add_partial_match(a.clone());
        node.add_partial_match(twin.clone());

        node.remove_partial_matches(&[a]);
        assert_eq!(node.partial_matches.len(), 1);
        assert!(Rc::ptr_eq(&node.partial_matches[0], &twin));
    }
}
