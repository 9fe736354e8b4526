//! Dot-path expressions.
//!
//! A path like `"user.tags.0"` resolves segment by segment from an owner's
//! root state. Records are read through their tracked accessors, so a path
//! expression depends on every field along the way. Resolution yields
//! `Undefined` at the first segment that does not exist.

use std::rc::Rc;

use super::owner::Owner;
use super::value::Value;
use super::watcher::Getter;
use crate::error::EvalError;

/// Accepts only ASCII word characters, `$` and `.`.
pub fn is_valid_path(path: &str) -> bool {
    path.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.'))
}

/// Split a path into segments, or `None` if it contains anything a dot
/// path may not.
pub fn parse_path(path: &str) -> Option<Vec<String>> {
    is_valid_path(path).then(|| path.split('.').map(str::to_owned).collect())
}

/// Walk `segments` from `root`.
///
/// Sequences accept numeric segments and `length`.
pub fn resolve(root: &Value, segments: &[String]) -> Value {
    let mut current = root.clone();
    for segment in segments {
        current = match &current {
            Value::Record(record) => record.get(segment),
            Value::Sequence(sequence) => {
                if segment == "length" {
                    Value::from(sequence.len())
                } else {
                    match segment.parse::<usize>() {
                        Ok(index) => sequence.get(index),
                        Err(_) => Value::Undefined,
                    }
                }
            }
            _ => return Value::Undefined,
        };
    }
    current
}

/// Compile a path into a getter over the owner's root state, or `None` if
/// the path is invalid.
pub(crate) fn compile(path: &str) -> Option<Getter> {
    let segments = parse_path(path)?;
    Some(Rc::new(move |owner: &Owner| -> Result<Value, EvalError> {
        Ok(resolve(&Value::Record(owner.state().clone()), &segments))
    }))
}

/// Getter for a path that failed to compile.
pub(crate) fn undefined() -> Getter {
    Rc::new(|_: &Owner| -> Result<Value, EvalError> { Ok(Value::Undefined) })
}
