use crate::event::Payload;
use ahash::HashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// An attribute value inside an event payload.
///
/// Numeric values compare across `Int`/`Float` by coercion to `f64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl PartialEq<Self> for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

#[derive(Error, Debug)]
pub enum ConditionError {
    #[error("name {0:?} is not bound to a value")]
    UnboundName(String),

    #[error("attribute {attr:?} missing on event {event:?}")]
    MissingAttribute { event: String, attr: String },

    #[error("values of incompatible kinds in condition")]
    TypeError,
}

/// Name-to-payload binding a condition is evaluated against.
pub type Binding<'a> = HashMap<&'a str, &'a Payload>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

/// One side of an atomic comparison.
#[derive(Debug, Clone)]
pub enum Term {
    Const(Value),
    /// An attribute of the event bound to a placeholder name.
    Attr { event: String, attr: String },
    BinOp {
        op: Arith,
        lhs: Box<Term>,
        rhs: Box<Term>,
    },
}

impl Term {
    pub fn attr(event: impl Into<String>, attr: impl Into<String>) -> Self {
        Term::Attr {
            event: event.into(),
            attr: attr.into(),
        }
    }

    fn eval(&self, binding: &Binding) -> Result<Value, ConditionError> {
        match self {
            Term::Const(v) => Ok(v.clone()),
            Term::Attr { event, attr } => {
                let payload = binding
                    .get(event.as_str())
                    .ok_or_else(|| ConditionError::UnboundName(event.clone()))?;
                payload
                    .get(attr)
                    .cloned()
                    .ok_or_else(|| ConditionError::MissingAttribute {
                        event: event.clone(),
                        attr: attr.clone(),
                    })
            }
            Term::BinOp { op, lhs, rhs } => {
                let l = lhs.eval(binding)?;
                let r = rhs.eval(binding)?;
                apply_arith(*op, &l, &r)
            }
        }
    }

    /// True when every identifier in this term is one of `names`.
    fn bound_by(&self, names: &HashSet<String>) -> bool {
        match self {
            Term::Const(_) => true,
            Term::Attr { event, .. } => names.contains(event),
            Term::BinOp { lhs, rhs, .. } => lhs.bound_by(names) && rhs.bound_by(names),
        }
    }

    fn collect_names(&self, out: &mut HashSet<String>) {
        match self {
            Term::Const(_) => {}
            Term::Attr { event, .. } => {
                out.insert(event.clone());
            }
            Term::BinOp { lhs, rhs, .. } => {
                lhs.collect_names(out);
                rhs.collect_names(out);
            }
        }
    }
}

fn apply_arith(op: Arith, lhs: &Value, rhs: &Value) -> Result<Value, ConditionError> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        if op != Arith::Div {
            return Ok(Value::Int(match op {
                Arith::Add => a + b,
                Arith::Sub => a - b,
                Arith::Mul => a * b,
                Arith::Div => unreachable!(),
            }));
        }
    }

    let (a, b) = match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(ConditionError::TypeError),
    };
    Ok(Value::Float(match op {
        Arith::Add => a + b,
        Arith::Sub => a - b,
        Arith::Mul => a * b,
        Arith::Div => a / b,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn eval(self, lhs: &Value, rhs: &Value) -> Result<bool, ConditionError> {
        match self {
            CmpOp::Eq => Ok(lhs == rhs),
            CmpOp::Ne => Ok(lhs != rhs),
            _ => {
                let ord = lhs.partial_cmp(rhs).ok_or(ConditionError::TypeError)?;
                Ok(match self {
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Le => ord != Ordering::Greater,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Ge => ord != Ordering::Less,
                    CmpOp::Eq | CmpOp::Ne => unreachable!(),
                })
            }
        }
    }
}

/// Boolean formula over placeholder attributes.
///
/// A condition supports the three capabilities the evaluation tree needs:
/// evaluation against a binding, projection onto a subset of placeholder
/// names, and listing the names co-occurring with a given placeholder.
#[derive(Debug, Clone, Default)]
pub enum Condition {
    /// The tautology; holds for every binding.
    #[default]
    True,
    Cmp {
        op: CmpOp,
        lhs: Term,
        rhs: Term,
    },
    All(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn cmp(op: CmpOp, lhs: Term, rhs: Term) -> Self {
        Condition::Cmp { op, lhs, rhs }
    }

    /// Conjunction, collapsing the tautology.
    pub fn and(self, other: Condition) -> Condition {
        match (self, other) {
            (Condition::True, c) | (c, Condition::True) => c,
            (a, b) => Condition::All(Box::new(a), Box::new(b)),
        }
    }

    pub fn eval(&self, binding: &Binding) -> Result<bool, ConditionError> {
        match self {
            Condition::True => Ok(true),
            Condition::Cmp { op, lhs, rhs } => {
                let l = lhs.eval(binding)?;
                let r = rhs.eval(binding)?;
                op.eval(&l, &r)
            }
            Condition::All(a, b) => Ok(a.eval(binding)? && b.eval(binding)?),
        }
    }

    /// The sub-condition mentioning only `names`, or `None` when nothing
    /// survives the projection.
    pub fn project(&self, names: &HashSet<String>) -> Option<Condition> {
        match self {
            Condition::True => None,
            Condition::Cmp { lhs, rhs, .. } => {
                (lhs.bound_by(names) && rhs.bound_by(names)).then(|| self.clone())
            }
            Condition::All(a, b) => match (a.project(names), b.project(names)) {
                (Some(x), Some(y)) => Some(Condition::All(Box::new(x), Box::new(y))),
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            },
        }
    }

    /// Placeholder names appearing in the same atomic comparison as `name`,
    /// `name` itself included.
    pub fn co_occurring(&self, name: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        match self {
            Condition::True => {}
            Condition::Cmp { lhs, rhs, .. } => {
                let mut atom = HashSet::new();
                lhs.collect_names(&mut atom);
                rhs.collect_names(&mut atom);
                if atom.contains(name) {
                    out.extend(atom);
                }
            }
            Condition::All(a, b) => {
                out.extend(a.co_occurring(name));
                out.extend(b.co_occurring(name));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, Value)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_eval_comparison() {
        let cond = Condition::cmp(CmpOp::Lt, Term::attr("a", "v"), Term::attr("b", "v"));
        let pa = payload(&[("v", Value::Int(1))]);
        let pb = payload(&[("v", Value::Float(2.5))]);

        let mut binding = Binding::default();
        binding.insert("a", &pa);
        binding.insert("b", &pb);
        assert!(cond.eval(&binding).unwrap());

        let cond = Condition::cmp(CmpOp::Ge, Term::attr("a", "v"), Term::attr("b", "v"));
        assert!(!cond.eval(&binding).unwrap());
    }

    #[test]
    fn test_eval_arithmetic() {
        let cond = Condition::cmp(
            CmpOp::Eq,
            Term::BinOp {
                op: Arith::Add,
                lhs: Box::new(Term::attr("a", "v")),
                rhs: Box::new(Term::Const(Value::Int(2))),
            },
            Term::Const(Value::Int(3)),
        );
        let pa = payload(&[("v", Value::Int(1))]);
        let mut binding = Binding::default();
        binding.insert("a", &pa);
        assert!(cond.eval(&binding).unwrap());
    }

    #[test]
    fn test_unbound_name_is_an_error() {
        let cond = Condition::cmp(CmpOp::Eq, Term::attr("a", "v"), Term::Const(Value::Int(1)));
        let binding = Binding::default();
        assert!(matches!(
            cond.eval(&binding),
            Err(ConditionError::UnboundName(name)) if name == "a"
        ));
    }

    #[test]
    fn test_project_keeps_bound_atoms() {
        let cond = Condition::cmp(CmpOp::Lt, Term::attr("a", "v"), Term::attr("b", "v")).and(
            Condition::cmp(CmpOp::Gt, Term::attr("a", "v"), Term::Const(Value::Int(0))),
        );

        let projected = cond.project(&names(&["a"])).unwrap();
        let pa = payload(&[("v", Value::Int(5))]);
        let mut binding = Binding::default();
        binding.insert("a", &pa);
        // only the a-local atom survives, so evaluation must not need b
        assert!(projected.eval(&binding).unwrap());

        assert!(cond.project(&names(&["c"])).is_none());
        assert!(Condition::True.project(&names(&["a"])).is_none());
    }

    #[test]
    fn test_co_occurring_unions_atoms() {
        let cond = Condition::cmp(CmpOp::Lt, Term::attr("a", "v"), Term::attr("b", "v")).and(
            Condition::cmp(CmpOp::Eq, Term::attr("b", "k"), Term::attr("c", "k")),
        );

        let co = cond.co_occurring("b");
        assert_eq!(co, names(&["a", "b", "c"]));
        assert_eq!(cond.co_occurring("a"), names(&["a", "b"]));
        assert!(cond.co_occurring("z").is_empty());
    }
}
