use super::{NegationMode, Pattern, PatternOperator, Placeholder, TreeShape, WINDOW_UNBOUNDED};
use crate::condition::{CmpOp, Condition, Term, Value};
use log::info;
use serde_json::Value as Json;
use std::fs::File;
use std::io::Read;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatternParsingError {
    #[error("IO Error")]
    IoError(#[from] std::io::Error),

    #[error("Json format error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Key not found or the type is unexpected: {0}")]
    KeyError(&'static str),

    #[error("Pattern format error: {0}")]
    FormatError(String),
}

/// The content of a pattern file: the pattern itself plus the optional
/// evaluation inputs it may pin down.
#[derive(Debug)]
pub struct PatternFile {
    pub pattern: Pattern,
    pub tree_shape: Option<TreeShape>,
    pub negation_mode: Option<NegationMode>,
}

impl PatternFile {
    pub fn parse(pattern_file: &str) -> Result<PatternFile, PatternParsingError> {
        info!("Parsing pattern file: {pattern_file}");
        let mut file = File::open(pattern_file)?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        let json_obj: Json = serde_json::from_slice(&content)?;

        PatternFile::parse_json(&json_obj)
    }

    fn parse_json(json_obj: &Json) -> Result<PatternFile, PatternParsingError> {
        let operator = json_obj["Operator"]
            .as_str()
            .ok_or(PatternParsingError::KeyError("Operator"))?
            .parse::<PatternOperator>()
            .map_err(PatternParsingError::FormatError)?;

        let window = if json_obj["Window"].is_null() {
            WINDOW_UNBOUNDED
        } else {
            json_obj["Window"]
                .as_u64()
                .ok_or(PatternParsingError::KeyError("Window"))?
        };

        let placeholders_json = json_obj["Placeholders"]
            .as_array()
            .ok_or(PatternParsingError::KeyError("Placeholders"))?;
        let placeholders = parse_placeholders(placeholders_json)?;

        let condition = if json_obj["Conditions"].is_null() {
            Condition::True
        } else {
            let conditions_json = json_obj["Conditions"]
                .as_array()
                .ok_or(PatternParsingError::KeyError("Conditions"))?;
            parse_conditions(conditions_json)?
        };

        let tree_shape = if json_obj["TreeShape"].is_null() {
            None
        } else {
            Some(parse_shape(&json_obj["TreeShape"])?)
        };

        let negation_mode = if json_obj["NegationMode"].is_null() {
            None
        } else {
            let mode = json_obj["NegationMode"]
                .as_str()
                .ok_or(PatternParsingError::KeyError("NegationMode"))?;
            Some(
                mode.parse::<NegationMode>()
                    .map_err(PatternParsingError::FormatError)?,
            )
        };

        Ok(PatternFile {
            pattern: Pattern::new(operator, placeholders, condition, window),
            tree_shape,
            negation_mode,
        })
    }
}

fn parse_placeholders(placeholders_json: &[Json]) -> Result<Vec<Placeholder>, PatternParsingError> {
    let mut placeholders = vec![];
    for placeholder in placeholders_json {
        let name = placeholder["Name"]
            .as_str()
            .ok_or(PatternParsingError::KeyError("Name"))?
            .to_string();
        let event_type = placeholder["EventType"]
            .as_str()
            .ok_or(PatternParsingError::KeyError("EventType"))?
            .to_string();
        let negated = placeholder["Negated"].as_bool().unwrap_or(false);
        placeholders.push(Placeholder {
            event_type,
            name,
            negated,
        });
    }

    Ok(placeholders)
}

fn parse_conditions(conditions_json: &[Json]) -> Result<Condition, PatternParsingError> {
    let mut condition = Condition::True;
    for comparison in conditions_json {
        let op = parse_cmp_op(
            comparison["Op"]
                .as_str()
                .ok_or(PatternParsingError::KeyError("Op"))?,
        )?;
        let lhs = parse_term(&comparison["Lhs"])?;
        let rhs = parse_term(&comparison["Rhs"])?;
        condition = condition.and(Condition::cmp(op, lhs, rhs));
    }

    Ok(condition)
}

fn parse_cmp_op(op: &str) -> Result<CmpOp, PatternParsingError> {
    match op {
        "==" | "=" => Ok(CmpOp::Eq),
        "!=" => Ok(CmpOp::Ne),
        "<" => Ok(CmpOp::Lt),
        "<=" => Ok(CmpOp::Le),
        ">" => Ok(CmpOp::Gt),
        ">=" => Ok(CmpOp::Ge),
        _ => Err(PatternParsingError::FormatError(format!(
            "unknown comparison operator {:?}",
            op
        ))),
    }
}

fn parse_term(term_json: &Json) -> Result<Term, PatternParsingError> {
    if !term_json["Const"].is_null() {
        return Ok(Term::Const(parse_value(&term_json["Const"])?));
    }

    let event = term_json["Event"]
        .as_str()
        .ok_or(PatternParsingError::KeyError("Event"))?;
    let attr = term_json["Attr"]
        .as_str()
        .ok_or(PatternParsingError::KeyError("Attr"))?;
    Ok(Term::attr(event, attr))
}

fn parse_value(value_json: &Json) -> Result<Value, PatternParsingError> {
    if let Some(v) = value_json.as_i64() {
        Ok(Value::Int(v))
    } else if let Some(v) = value_json.as_f64() {
        Ok(Value::Float(v))
    } else if let Some(v) = value_json.as_str() {
        Ok(Value::Str(v.to_string()))
    } else if let Some(v) = value_json.as_bool() {
        Ok(Value::Bool(v))
    } else {
        Err(PatternParsingError::FormatError(format!(
            "unsupported constant {}",
            value_json
        )))
    }
}

fn parse_shape(shape_json: &Json) -> Result<TreeShape, PatternParsingError> {
    if let Some(index) = shape_json.as_u64() {
        return Ok(TreeShape::Leaf(index as usize));
    }

    let pair = shape_json
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or(PatternParsingError::KeyError("TreeShape"))?;
    Ok(TreeShape::branch(
        parse_shape(&pair[0])?,
        parse_shape(&pair[1])?,
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sample_pattern() {
        let json_obj = json!({
            "Operator": "SEQ",
            "Window": 10000,
            "NegationMode": "first-chance",
            "Placeholders": [
                { "Name": "a", "EventType": "A" },
                { "Name": "x", "EventType": "X", "Negated": true },
                { "Name": "b", "EventType": "B" }
            ],
            "Conditions": [
                { "Lhs": { "Event": "a", "Attr": "v" }, "Op": "<", "Rhs": { "Event": "b", "Attr": "v" } },
                { "Lhs": { "Event": "a", "Attr": "v" }, "Op": ">=", "Rhs": { "Const": 0 } }
            ],
            "TreeShape": [0, 1]
        });

        let parsed = PatternFile::parse_json(&json_obj).unwrap();

        let pattern = &parsed.pattern;
        assert_eq!(pattern.operator, PatternOperator::Seq);
        assert_eq!(pattern.window, 10000);
        assert_eq!(pattern.placeholders.len(), 3);
        assert!(pattern.placeholders[1].negated);
        assert_eq!(pattern.num_positives(), 2);

        assert_eq!(
            parsed.tree_shape,
            Some(TreeShape::branch(TreeShape::Leaf(0), TreeShape::Leaf(1)))
        );
        assert_eq!(parsed.negation_mode, Some(NegationMode::FirstChance));
    }

    #[test]
    fn test_missing_key_is_reported() {
        let json_obj = json!({
            "Operator": "SEQ",
            "Placeholders": [ { "Name": "a" } ]
        });

        assert!(matches!(
            PatternFile::parse_json(&json_obj),
            Err(PatternParsingError::KeyError("EventType"))
        ));
    }

    #[test]
    fn test_defaults() {
        let json_obj = json!({
            "Operator": "AND",
            "Placeholders": [
                { "Name": "a", "EventType": "A" },
                { "Name": "b", "EventType": "B" }
            ]
        });

        let parsed = PatternFile::parse_json(&json_obj).unwrap();
        assert_eq!(parsed.pattern.window, WINDOW_UNBOUNDED);
        assert!(matches!(parsed.pattern.condition, Condition::True));
        assert!(parsed.tree_shape.is_none());
        assert!(parsed.negation_mode.is_none());
    }
}
