//! Deep traversal.
//!
//! [`touch`] reads everything reachable from a value through the tracked
//! accessors, so a deep watcher depends on every nested field. Each
//! container is visited once per call; cycles terminate.

use std::collections::HashSet;

use super::subject::SubjectId;
use super::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Visited {
    Observed(SubjectId),
    Plain(usize),
}

/// Recursively read every field and element reachable from `value`.
///
/// Non-containers, frozen containers and raw containers are skipped.
pub fn touch(value: &Value) {
    let mut seen = HashSet::new();
    visit(value, &mut seen);
}

fn visit(value: &Value, seen: &mut HashSet<Visited>) {
    if !value.is_container() || value.is_frozen() || is_raw(value) {
        return;
    }
    let key = match value.observer() {
        Some(observer) => Visited::Observed(observer.subject().id()),
        None => match value.container_addr() {
            Some(addr) => Visited::Plain(addr),
            None => return,
        },
    };
    if !seen.insert(key) {
        return;
    }

    match value {
        Value::Record(record) => {
            for key in record.keys() {
                visit(&record.get(&key), seen);
            }
        }
        Value::Sequence(sequence) => {
            for item in sequence.to_vec() {
                visit(&item, seen);
            }
        }
        _ => {}
    }
}

fn is_raw(value: &Value) -> bool {
    match value {
        Value::Record(record) => record.is_raw(),
        Value::Sequence(sequence) => sequence.is_raw(),
        _ => false,
    }
}
