//! A tree-based complex event processing engine.
//!
//! A declarative pattern — typed placeholders combined by SEQ/AND, an
//! attribute condition, a sliding window, optionally negated placeholders —
//! is compiled into an evaluation tree ([`tree::EvalTree`]); the
//! [`engine::Engine`] drives an event stream through it and yields every
//! matching event combination.

pub mod condition;
pub mod engine;
pub mod event;
pub mod naive;
pub mod partial_match;
pub mod pattern;
pub mod pattern_match;
pub mod stream;
pub mod tree;

pub use engine::Engine;
pub use event::Event;
pub use pattern::{NegationMode, Pattern, PatternOperator, Placeholder, TreeShape};
pub use pattern_match::PatternMatch;
pub use tree::{ConfigError, EvalError, EvalTree};
