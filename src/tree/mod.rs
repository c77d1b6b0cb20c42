mod evaluate;
mod node;


use crate::condition::{Condition, ConditionError};
use crate::partial_match::PartialMatch;
use crate::pattern::{NegationMode, Pattern, PatternOperator, Placeholder, TreeShape};
use crate::pattern_match::PatternMatch;
use evaluate::merge_defs;
use log::debug;
pub(crate) use node::NodeId;
use node::{EventDef, InternalNode, JoinOp, LeafNode, NegationNode, Node, NodeKind};
use slab::Slab;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use thiserror::Error;

/// A pattern or tree-shape input the tree cannot be built from.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tree shape references positive placeholder index {0}, which is out of range")]
    ShapeIndexOutOfRange(usize),

    #[error("tree shape uses positive placeholder index {0} more than once")]
    ShapeDuplicateIndex(usize),

    #[error("tree shape covers {used} of {total} positive placeholders")]
    ShapeIncomplete { used: usize, total: usize },

    #[error("pattern has no positive placeholders")]
    NoPositivePlaceholders,

    #[error("placeholder name {0:?} is used more than once")]
    DuplicatePlaceholderName(String),

    #[error("operator {0:?} is not supported by the evaluation tree")]
    UnsupportedOperator(PatternOperator),

    #[error("negated placeholders are only supported in sequence patterns")]
    NegationRequiresSeq,
}

/// A fatal failure while evaluating events against the tree.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("condition evaluation failed: {0}")]
    Condition(#[from] ConditionError),

    #[error("evaluation invariant violated: {0}")]
    Invariant(&'static str),
}

/// The evaluation tree of a single pattern.
///
/// Nodes live in an arena and refer to each other by index, so negation
/// insertion can re-parent subtrees after construction. Leaves accept events,
/// internal nodes join the partial matches of their subtrees, and full
/// matches accumulate at the root.
#[derive(Debug)]
pub struct EvalTree {
    nodes: Slab<Node>,
    root: NodeId,
    /// Matches released from a `waiting_for_timeout` list because their
    /// window elapsed; they are reported once the stream ends.
    matches_to_handle_at_eof: Vec<Rc<PartialMatch>>,
}

impl EvalTree {
    pub fn new(
        pattern: &Pattern,
        shape: &TreeShape,
        negation_mode: NegationMode,
    ) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        for placeholder in &pattern.placeholders {
            if !names.insert(placeholder.name.as_str()) {
                return Err(ConfigError::DuplicatePlaceholderName(
                    placeholder.name.clone(),
                ));
            }
        }

        if pattern.operator == PatternOperator::Or {
            return Err(ConfigError::UnsupportedOperator(pattern.operator));
        }

        let positives: Vec<(usize, &Placeholder)> = pattern.positives().collect();
        if positives.is_empty() {
            return Err(ConfigError::NoPositivePlaceholders);
        }
        if pattern.negatives().next().is_some() && pattern.operator != PatternOperator::Seq {
            return Err(ConfigError::NegationRequiresSeq);
        }

        Self::validate_shape(shape, positives.len())?;

        let op = match pattern.operator {
            PatternOperator::Seq => JoinOp::Seq,
            _ => JoinOp::And,
        };

        let mut tree = EvalTree {
            nodes: Slab::new(),
            root: 0,
            matches_to_handle_at_eof: Vec::new(),
        };
        tree.root = tree.build_positive(shape, &positives, pattern.window, op);
        let root = tree.root;
        tree.apply_condition(root, &pattern.condition);
        tree.insert_negations(pattern, negation_mode);

        Ok(tree)
    }

    fn validate_shape(shape: &TreeShape, num_positives: usize) -> Result<(), ConfigError> {
        let mut indices = Vec::new();
        shape.leaf_indices(&mut indices);

        let mut used = vec![false; num_positives];
        for &index in &indices {
            if index >= num_positives {
                return Err(ConfigError::ShapeIndexOutOfRange(index));
            }
            if used[index] {
                return Err(ConfigError::ShapeDuplicateIndex(index));
            }
            used[index] = true;
        }
        if indices.len() != num_positives {
            return Err(ConfigError::ShapeIncomplete {
                used: indices.len(),
                total: num_positives,
            });
        }

        Ok(())
    }

    /// Build the tree over the positive placeholders by recursive descent
    /// over the shape. Indices are validated beforehand.
    fn build_positive(
        &mut self,
        shape: &TreeShape,
        positives: &[(usize, &Placeholder)],
        window: u64,
        op: JoinOp,
    ) -> NodeId {
        match shape {
            TreeShape::Leaf(index) => {
                let (position, placeholder) = positives[*index];
                let def = EventDef {
                    slot: *index,
                    position,
                    event_type: placeholder.event_type.clone(),
                    name: placeholder.name.clone(),
                };
                self.nodes
                    .insert(Node::new(window, NodeKind::Leaf(LeafNode { def })))
            }
            TreeShape::Branch(left, right) => {
                let left = self.build_positive(left, positives, window, op);
                let right = self.build_positive(right, positives, window, op);

                let event_defs = match op {
                    JoinOp::And => {
                        let mut defs = self.visible_defs(left).to_vec();
                        defs.extend_from_slice(self.visible_defs(right));
                        defs
                    }
                    JoinOp::Seq => merge_defs(
                        self.visible_defs(left),
                        self.visible_defs(right),
                        |def| def.slot,
                    ),
                };

                let id = self.nodes.insert(Node::new(
                    window,
                    NodeKind::Internal(InternalNode {
                        op,
                        left,
                        right,
                        event_defs,
                    }),
                ));
                self.nodes[left].parent = Some(id);
                self.nodes[right].parent = Some(id);
                id
            }
        }
    }

    /// Distribute the pattern condition: every node keeps the projection
    /// onto its own placeholder names, and children project from their
    /// parent's (already projected) condition.
    fn apply_condition(&mut self, id: NodeId, condition: &Condition) {
        let names = self.def_names(id);
        let projected = condition.project(&names).unwrap_or_default();
        self.nodes[id].condition = projected;

        let children = match &self.nodes[id].kind {
            NodeKind::Leaf(_) => None,
            NodeKind::Internal(node) => Some((node.left, node.right)),
            NodeKind::Negation(node) => Some((node.left, node.right)),
        };
        if let Some((left, right)) = children {
            let condition = self.nodes[id].condition.clone();
            self.apply_condition(left, &condition);
            self.apply_condition(right, &condition);
        }
    }

    /// Splice one negation node per negated placeholder, in source order.
    ///
    /// Post-processing stacks them on top of the root. First-chance anchors
    /// each one at the deepest subtree already containing the placeholder's
    /// dependencies, then climbs past negation nodes already sitting there.
    fn insert_negations(&mut self, pattern: &Pattern, mode: NegationMode) {
        let positive_names: HashSet<String> = pattern
            .positives()
            .map(|(_, p)| p.name.clone())
            .collect();
        let num_positives = positive_names.len();

        for (neg_index, (position, placeholder)) in pattern.negatives().enumerate() {
            let mut deps = pattern.condition.co_occurring(&placeholder.name);
            if pattern.operator == PatternOperator::Seq {
                for (pos, p) in pattern.positives() {
                    if pos < position {
                        deps.insert(p.name.clone());
                    }
                }
            }
            // only names present in the positive tree can anchor the node
            deps.retain(|name| positive_names.contains(name));

            let attach = match mode {
                NegationMode::PostProcessing => self.root,
                NegationMode::FirstChance => {
                    let mut node = self.deepest_leaf(self.root);
                    while !self.contains_names(node, &deps) {
                        match self.nodes[node].parent {
                            Some(parent) => node = parent,
                            None => break,
                        }
                    }
                    while let Some(parent) = self.nodes[node].parent {
                        if self.nodes[parent].as_negation().is_some() {
                            node = parent;
                        } else {
                            break;
                        }
                    }
                    node
                }
            };

            debug!(
                "negation node for {:?} attached above node {}",
                placeholder.name, attach
            );

            let leaf_def = EventDef {
                slot: num_positives + neg_index,
                position,
                event_type: placeholder.event_type.clone(),
                name: placeholder.name.clone(),
            };
            let mut leaf = Node::new(
                pattern.window,
                NodeKind::Leaf(LeafNode {
                    def: leaf_def.clone(),
                }),
            );
            let leaf_names: HashSet<String> = [placeholder.name.clone()].into();
            leaf.condition = pattern.condition.project(&leaf_names).unwrap_or_default();
            let leaf_id = self.nodes.insert(leaf);

            let event_defs = merge_defs(
                self.visible_defs(attach),
                std::slice::from_ref(&leaf_def),
                |def| def.position,
            );
            let def_names: HashSet<String> =
                event_defs.iter().map(|def| def.name.clone()).collect();

            let old_parent = self.nodes[attach].parent;
            let mut node = Node::new(
                pattern.window,
                NodeKind::Negation(NegationNode {
                    mode,
                    top_op: pattern.operator,
                    left: attach,
                    right: leaf_id,
                    event_defs,
                    is_first: pattern.no_positive_before(position),
                    is_last: pattern.no_positive_after(position),
                    waiting_for_timeout: Vec::new(),
                    check_expired: Vec::new(),
                }),
            );
            node.condition = pattern.condition.project(&def_names).unwrap_or_default();
            node.parent = old_parent;
            let neg_id = self.nodes.insert(node);

            self.nodes[attach].parent = Some(neg_id);
            self.nodes[leaf_id].parent = Some(neg_id);
            match old_parent {
                Some(parent) => self.replace_child(parent, attach, neg_id),
                None => self.root = neg_id,
            }
        }
    }

    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) {
        let (left, right) = match &mut self.nodes[parent].kind {
            NodeKind::Internal(node) => (&mut node.left, &mut node.right),
            NodeKind::Negation(node) => (&mut node.left, &mut node.right),
            NodeKind::Leaf(_) => {
                debug_assert!(false, "leaf cannot be a parent");
                return;
            }
        };
        if *left == old {
            *left = new;
        } else if *right == old {
            *right = new;
        } else {
            debug_assert!(false, "re-parented node was not a child of its parent");
        }
    }

    fn deepest_leaf(&self, id: NodeId) -> NodeId {
        let mut node = id;
        loop {
            match &self.nodes[node].kind {
                NodeKind::Leaf(_) => return node,
                NodeKind::Internal(n) => node = n.left,
                NodeKind::Negation(n) => node = n.left,
            }
        }
    }

    /// The event definitions a node exposes to joins above it. Negation
    /// nodes are transparent and expose their positive subtree.
    fn visible_defs(&self, id: NodeId) -> &[EventDef] {
        let mut node = id;
        loop {
            match &self.nodes[node].kind {
                NodeKind::Leaf(leaf) => return std::slice::from_ref(&leaf.def),
                NodeKind::Internal(internal) => return &internal.event_defs,
                NodeKind::Negation(negation) => node = negation.left,
            }
        }
    }

    /// Names this node's own condition may mention.
    fn def_names(&self, id: NodeId) -> HashSet<String> {
        let defs = match &self.nodes[id].kind {
            NodeKind::Leaf(leaf) => std::slice::from_ref(&leaf.def),
            NodeKind::Internal(internal) => &internal.event_defs,
            NodeKind::Negation(negation) => &negation.event_defs,
        };
        defs.iter().map(|def| def.name.clone()).collect()
    }

    fn contains_names(&self, id: NodeId, names: &HashSet<String>) -> bool {
        let defs = self.visible_defs(id);
        names
            .iter()
            .all(|name| defs.iter().any(|def| &def.name == name))
    }

    /// The deepest trailing negation node under `id`; this is where matches
    /// waiting out their window are buffered.
    fn first_last_negative_node(&self, id: NodeId) -> NodeId {
        let mut node = id;
        while let Some(negation) = self.nodes[node].as_negation() {
            match self.nodes[negation.left].as_negation() {
                Some(left) if left.is_last => node = negation.left,
                _ => return node,
            }
        }
        node
    }

    /// All leaves, with the event type each one subscribes to.
    pub(crate) fn leaves(&self) -> impl Iterator<Item = (NodeId, &str)> + '_ {
        self.nodes.iter().filter_map(|(id, node)| match &node.kind {
            NodeKind::Leaf(leaf) => Some((id, leaf.def.event_type.as_str())),
            _ => None,
        })
    }

    /// Move the full matches buffered at the root into `out`.
    pub fn consume_matches(&mut self, out: &mut VecDeque<PatternMatch>) {
        while let Some(pm) = self.nodes[self.root].consume_first() {
            out.push_back(PatternMatch::new(pm.events.clone()));
        }
    }

    /// Release the matches that were withheld because a trailing negative
    /// event could still have invalidated them. Called once, at end of
    /// stream.
    pub fn flush_eof(&mut self) -> Vec<PatternMatch> {
        let trailing_root = self.nodes[self.root]
            .as_negation()
            .map_or(false, |negation| negation.is_last);
        if !trailing_root {
            return Vec::new();
        }

        let mut out: Vec<PatternMatch> = self
            .matches_to_handle_at_eof
            .drain(..)
            .map(|pm| PatternMatch::new(pm.events.clone()))
            .collect();

        let holder = self.first_last_negative_node(self.root);
        if let Some(negation) = self.nodes[holder].as_negation_mut() {
            for pm in std::mem::take(&mut negation.waiting_for_timeout) {
                out.push(PatternMatch::new(pm.events.clone()));
            }
        }

        debug!("end of stream released {} withheld matches", out.len());
        out
    }
}
