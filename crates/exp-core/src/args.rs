use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ExperimentError, Result};

pub type Args = BTreeMap<String, Value>;

/// Converts any serializable argument struct (typically a parsed clap struct)
/// into an [`Args`] mapping. The value must serialize to a JSON object.
pub fn args_from<T: Serialize + ?Sized>(value: &T) -> Result<Args> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(other) => Err(ExperimentError::InvalidArgs(format!(
            "expected an object, got {}",
            type_name(&other)
        ))),
        Err(e) => Err(ExperimentError::InvalidArgs(e.to_string())),
    }
}

pub fn differing_keys(a: &Args, b: &Args, ignore: &[String]) -> Vec<String> {
    let keys: BTreeSet<&String> = a
        .keys()
        .chain(b.keys())
        .filter(|k| !ignore.contains(k))
        .collect();
    keys.into_iter()
        .filter(|k| a.get(*k) != b.get(*k))
        .cloned()
        .collect()
}

pub fn args_equal(a: &Args, b: &Args, ignore: &[String]) -> bool {
    differing_keys(a, b, ignore).is_empty()
}

/// The "interesting" subset of `all_args`: every key missing from `defaults`
/// or holding a different value. Without defaults every argument is kept.
/// A string argument matches a non-string default with the same text, so
/// `"42"` equals a recorded default of `42`.
pub fn non_default_args(all_args: &Args, defaults: Option<&Args>) -> Args {
    let Some(defaults) = defaults else {
        return all_args.clone();
    };
    all_args
        .iter()
        .filter(|(k, v)| !defaults.get(*k).is_some_and(|d| matches_default(v, d)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn matches_default(value: &Value, default: &Value) -> bool {
    match (value, default) {
        (Value::String(text), Value::Number(_) | Value::Bool(_)) => *text == display_value(default),
        _ => value == default,
    }
}

pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Args {
        args_from(&value).expect("object")
    }

    #[test]
    fn non_default_args_keeps_changed_and_unknown_keys() {
        let all = args(json!({"lr": 0.1, "epochs": 5, "name": "x"}));
        let defaults = args(json!({"lr": 0.01, "epochs": 5}));
        assert_eq!(
            non_default_args(&all, Some(&defaults)),
            args(json!({"lr": 0.1, "name": "x"}))
        );
        assert_eq!(non_default_args(&all, None), all);
        assert_eq!(non_default_args(&all, Some(&Args::new())), all);
    }

    #[test]
    fn string_args_match_defaults_by_text() {
        let all = args(json!({"tag": "42", "flag": "true", "name": "7", "lr": 0.1}));
        let defaults = args(json!({"tag": 42, "flag": true, "name": 8, "lr": "0.1"}));
        assert_eq!(
            non_default_args(&all, Some(&defaults)),
            args(json!({"name": "7", "lr": 0.1}))
        );
    }

    #[test]
    fn equality_is_order_independent_and_honours_ignore_set() {
        let a = args(json!({"lr": 0.1, "seed": 1, "layers": [1, 2]}));
        let b = args(json!({"layers": [1, 2], "seed": 2, "lr": 0.1}));
        assert!(!args_equal(&a, &b, &[]));
        assert!(args_equal(&a, &b, &["seed".to_string()]));
        assert_eq!(differing_keys(&a, &b, &[]), vec!["seed".to_string()]);
    }

    #[test]
    fn missing_key_counts_as_difference() {
        let a = args(json!({"lr": 0.1}));
        let b = args(json!({"lr": 0.1, "extra": null}));
        assert_eq!(differing_keys(&a, &b, &[]), vec!["extra".to_string()]);
    }

    #[test]
    fn args_from_rejects_non_objects() {
        let err = args_from(&vec![1, 2]).expect_err("array is not an object");
        assert!(err.to_string().contains("array"), "{}", err);
    }

    #[test]
    fn display_value_strips_string_quotes() {
        assert_eq!(display_value(&json!("adam")), "adam");
        assert_eq!(display_value(&json!(0.5)), "0.5");
        assert_eq!(display_value(&json!([1, 2])), "[1,2]");
    }
}
