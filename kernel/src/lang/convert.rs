//! Conversions between interpreter values and JSON.
//!
//! JSON is the kernel's wire and storage shape; evaluated code sees the
//! interpreter's value universe. Functions do not cross the boundary.

use std::collections::BTreeMap;

use crate::lang::eval::EvalError;
use crate::lang::value::Value;

pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Vector(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), json_to_value(v));
            }
            Value::Map(out)
        }
    }
}

pub fn value_to_json(value: &Value) -> Result<serde_json::Value, EvalError> {
    Ok(match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(x) => serde_json::Number::from_f64(*x)
            .map(serde_json::Value::Number)
            .ok_or_else(|| EvalError::Type("non-finite float cannot cross to JSON".into()))?,
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Keyword(k) => serde_json::Value::String(format!(":{}", k)),
        Value::Vector(items) => serde_json::Value::Array(
            items.iter().map(value_to_json).collect::<Result<_, _>>()?,
        ),
        Value::Map(m) => {
            let mut out = serde_json::Map::new();
            for (k, v) in m {
                out.insert(k.clone(), value_to_json(v)?);
            }
            serde_json::Value::Object(out)
        }
        Value::Fn(_) => {
            return Err(EvalError::Type(
                "functions cannot cross the kernel boundary".into(),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn json_round_trips_through_values() {
        let json = serde_json::json!({
            "allowed": true,
            "cost": 3,
            "nested": {"items": [1, 2.5, "x", null]}
        });
        let value = json_to_value(&json);
        assert_eq!(value_to_json(&value).unwrap(), json);
    }

    #[test]
    fn keywords_render_with_colon() {
        let json = value_to_json(&Value::Keyword("read".into())).unwrap();
        assert_eq!(json, serde_json::json!(":read"));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        assert!(value_to_json(&Value::Float(f64::NAN)).is_err());
    }
}
