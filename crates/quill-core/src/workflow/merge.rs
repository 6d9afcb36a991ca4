//! Pure state merge engine.
//!
//! `merge` folds one delta into a document according to the field policies.
//! `merge_all` folds a whole fan-in batch in ascending branch-index order so
//! replays are deterministic. Nothing here performs I/O or touches the
//! document's identity or step counter.

use quill_types::state::{FieldPolicies, MergePolicy, StateDelta, StateDocument};
use serde_json::{Map, Value};

/// Merge `delta` into a copy of `base`. Fields absent from `delta` are untouched.
pub fn merge(base: &StateDocument, delta: &StateDelta, policies: &FieldPolicies) -> StateDocument {
    let mut next = base.clone();
    apply(&mut next, delta, policies);
    next
}

/// Merge a fan-in batch. `deltas` must already be in branch-index order.
pub fn merge_all<'a>(
    base: &StateDocument,
    deltas: impl IntoIterator<Item = &'a StateDelta>,
    policies: &FieldPolicies,
) -> StateDocument {
    let mut next = base.clone();
    for delta in deltas {
        apply(&mut next, delta, policies);
    }
    next
}

/// In-place variant of [`merge`].
pub fn apply(doc: &mut StateDocument, delta: &StateDelta, policies: &FieldPolicies) {
    let fields = doc.fields_mut();
    for (field, incoming) in delta.iter() {
        let policy = policies.policy_for(field);
        let existing = fields.remove(field.as_str());
        let merged = merge_value(existing, incoming, policy);
        fields.insert(field.clone(), merged);
    }
}

/// Combine two deltas into one so that applying the result equals applying
/// `first` then `second`.
pub fn reduce_deltas(first: &StateDelta, second: &StateDelta, policies: &FieldPolicies) -> StateDelta {
    let mut combined: Map<String, Value> = first.clone().into_inner();

    for (field, later) in second.iter() {
        let policy = policies.policy_for(field);
        let value = match (combined.remove(field.as_str()), policy) {
            (None, _) => later.clone(),
            (Some(_), MergePolicy::Replace) => later.clone(),
            (Some(earlier), MergePolicy::Append) => {
                let mut items = into_items(earlier);
                items.extend(into_items(later.clone()));
                Value::Array(items)
            }
            (Some(Value::Object(mut earlier)), MergePolicy::ShallowMerge) => match later {
                Value::Object(entries) => {
                    for (k, v) in entries {
                        earlier.insert(k.clone(), v.clone());
                    }
                    Value::Object(earlier)
                }
                other => other.clone(),
            },
            (Some(_), MergePolicy::ShallowMerge) => later.clone(),
        };
        combined.insert(field.clone(), value);
    }

    StateDelta::from(combined)
}

fn merge_value(existing: Option<Value>, incoming: &Value, policy: MergePolicy) -> Value {
    match policy {
        MergePolicy::Replace => incoming.clone(),
        MergePolicy::Append => {
            let mut items = match existing {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items,
                Some(scalar) => vec![scalar],
            };
            items.extend(into_items(incoming.clone()));
            Value::Array(items)
        }
        MergePolicy::ShallowMerge => match (existing, incoming) {
            (Some(Value::Object(mut current)), Value::Object(entries)) => {
                for (k, v) in entries {
                    current.insert(k.clone(), v.clone());
                }
                Value::Object(current)
            }
            (_, other) => other.clone(),
        },
    }
}

/// Array values contribute their elements; anything else is one element.
fn into_items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}
