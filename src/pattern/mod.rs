pub mod parser;

use crate::condition::Condition;
use std::str::FromStr;

/// Window value meaning "no time bound".
pub const WINDOW_UNBOUNDED: u64 = u64::MAX;

/// The operator combining the placeholders of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOperator {
    Seq,
    And,
    Or,
}

impl FromStr for PatternOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "seq" => Ok(PatternOperator::Seq),
            "and" => Ok(PatternOperator::And),
            "or" => Ok(PatternOperator::Or),
            _ => Err(format!("unknown pattern operator {:?}", s)),
        }
    }
}

/// How negated placeholders are evaluated by the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegationMode {
    /// Negatives are checked only at the top of the tree.
    PostProcessing,
    /// Negatives are checked as soon as a positive partial match reaches
    /// their node.
    FirstChance,
}

impl FromStr for NegationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "post-processing" => Ok(NegationMode::PostProcessing),
            "first-chance" => Ok(NegationMode::FirstChance),
            _ => Err(format!("unknown negation mode {:?}", s)),
        }
    }
}

/// A named, typed slot of the pattern, filled by exactly one event per match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub event_type: String,
    pub name: String,
    /// A negated placeholder requires the *absence* of a matching event.
    pub negated: bool,
}

impl Placeholder {
    pub fn new(event_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            name: name.into(),
            negated: false,
        }
    }

    pub fn negated(event_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            name: name.into(),
            negated: true,
        }
    }
}

/// The declarative pattern evaluated by the tree.
///
/// The position of a placeholder in `placeholders` is its position in the
/// source pattern; sequence order and the negation flags derive from it.
#[derive(Debug)]
pub struct Pattern {
    pub operator: PatternOperator,
    pub placeholders: Vec<Placeholder>,
    pub condition: Condition,
    /// Sliding window in milliseconds; `WINDOW_UNBOUNDED` disables expiry.
    pub window: u64,
}

impl Pattern {
    pub fn new(
        operator: PatternOperator,
        placeholders: Vec<Placeholder>,
        condition: Condition,
        window: u64,
    ) -> Self {
        Self {
            operator,
            placeholders,
            condition,
            window,
        }
    }

    /// Positive placeholders with their source-pattern positions.
    pub fn positives(&self) -> impl Iterator<Item = (usize, &Placeholder)> + '_ {
        self.placeholders
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.negated)
    }

    /// Negated placeholders with their source-pattern positions.
    pub fn negatives(&self) -> impl Iterator<Item = (usize, &Placeholder)> + '_ {
        self.placeholders
            .iter()
            .enumerate()
            .filter(|(_, p)| p.negated)
    }

    pub fn num_positives(&self) -> usize {
        self.positives().count()
    }

    pub fn no_positive_before(&self, position: usize) -> bool {
        !self.placeholders[..position].iter().any(|p| !p.negated)
    }

    pub fn no_positive_after(&self, position: usize) -> bool {
        !self.placeholders[position + 1..].iter().any(|p| !p.negated)
    }
}

/// The join shape over the positive placeholders of a pattern.
///
/// Leaves carry positive-placeholder indices, i.e. positions in the
/// sequence of positive placeholders rather than in the full pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeShape {
    Leaf(usize),
    Branch(Box<TreeShape>, Box<TreeShape>),
}

impl TreeShape {
    pub fn branch(left: TreeShape, right: TreeShape) -> Self {
        TreeShape::Branch(Box::new(left), Box::new(right))
    }

    /// The default shape: `(((0, 1), 2), ...)`.
    pub fn left_deep(count: usize) -> Self {
        let mut shape = TreeShape::Leaf(0);
        for index in 1..count {
            shape = TreeShape::branch(shape, TreeShape::Leaf(index));
        }
        shape
    }

    pub fn leaf_indices(&self, out: &mut Vec<usize>) {
        match self {
            TreeShape::Leaf(index) => out.push(*index),
            TreeShape::Branch(left, right) => {
                left.leaf_indices(out);
                right.leaf_indices(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_deep_shape() {
        assert_eq!(TreeShape::left_deep(1), TreeShape::Leaf(0));
        assert_eq!(
            TreeShape::left_deep(3),
            TreeShape::branch(
                TreeShape::branch(TreeShape::Leaf(0), TreeShape::Leaf(1)),
                TreeShape::Leaf(2)
            )
        );

        let mut indices = Vec::new();
        TreeShape::left_deep(4).leaf_indices(&mut indices);
        assert_eq!(indices, [0, 1, 2, 3]);
    }

    #[test]
    fn test_operator_and_mode_parsing() {
        assert_eq!("SEQ".parse::<PatternOperator>(), Ok(PatternOperator::Seq));
        assert_eq!("and".parse::<PatternOperator>(), Ok(PatternOperator::And));
        assert!("xor".parse::<PatternOperator>().is_err());

        assert_eq!(
            "first-chance".parse::<NegationMode>(),
            Ok(NegationMode::FirstChance)
        );
        assert_eq!(
            "POST_PROCESSING".parse::<NegationMode>(),
            Ok(NegationMode::PostProcessing)
        );
        assert!("lazy".parse::<NegationMode>().is_err());
    }

    #[test]
    fn test_negation_flags_follow_source_positions() {
        let pattern = Pattern::new(
            PatternOperator::Seq,
            vec![
                Placeholder::negated("A", "x"),
                Placeholder::new("B", "b"),
                Placeholder::negated("C", "y"),
            ],
            Condition::True,
            10,
        );

        assert_eq!(pattern.num_positives(), 1);
        assert!(pattern.no_positive_before(0));
        assert!(!pattern.no_positive_after(0));
        assert!(!pattern.no_positive_before(2));
        assert!(pattern.no_positive_after(2));
    }
}
