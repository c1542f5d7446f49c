use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use lantern_bridge::ScriptValue;
use serde_json::Value;

/// Command-line value typed the way scripts expect it: anything that parses
/// as a number is pushed as a number, everything else as a string.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
}

impl Literal {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(number) if number.is_finite() => Literal::Number(number),
            _ => Literal::Text(raw.to_string()),
        }
    }
}

impl From<&Literal> for ScriptValue {
    fn from(literal: &Literal) -> Self {
        match literal {
            Literal::Number(number) => ScriptValue::Number(*number),
            Literal::Text(text) => ScriptValue::String(text.clone()),
        }
    }
}

/// `NAME=VALUE` pair from `--set`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub name: String,
    pub value: Literal,
}

pub fn parse_assignment(raw: &str) -> Result<Assignment, String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing global name in {raw:?}"));
    }
    Ok(Assignment {
        name: name.to_string(),
        value: Literal::parse(value),
    })
}

/// Flattens a JSON object into string parameters. Numbers and booleans are
/// stringified; nested values are rejected.
pub fn parse_params(raw: &str) -> Result<BTreeMap<String, String>> {
    let value: Value = serde_json::from_str(raw).context("parsing --params JSON")?;
    let Value::Object(object) = value else {
        bail!("--params must be a JSON object");
    };
    let mut params = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            Value::Null => continue,
            Value::Array(_) | Value::Object(_) => {
                bail!("parameter {key} must be a string, number or boolean")
            }
        };
        params.insert(key, text);
    }
    Ok(params)
}
