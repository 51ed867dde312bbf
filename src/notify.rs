use std::sync::Arc;

use serde_json::{Number, Value};

use crate::session::{FieldKey, SessionSnapshot, ValueRecord};

/// One discrete change event: a single field whose value differs from the
/// previous record, together with the session snapshot taken right after the
/// mutation landed.
#[derive(Clone, Debug)]
pub struct FieldChange {
    pub field: FieldKey,
    pub value: Option<Value>,
    pub prev_value: Option<Value>,
    pub form: SessionSnapshot,
}

pub type ChangeObserverFn = Arc<dyn Fn(&FieldChange) + Send + Sync>;

/// Keys of the current record whose value differs from the previous record.
/// Keys removed from the record are not reported.
pub(crate) fn changed_keys(previous: &ValueRecord, current: &ValueRecord) -> Vec<FieldKey> {
    current
        .iter()
        .filter(|&(key, value)| {
            !matches!(previous.get(key), Some(prev) if same_value(prev, value))
        })
        .map(|(key, _)| key.clone())
        .collect()
}

/// Value identity in the `Object.is` sense: numbers compare by numeric
/// identity (`+0` and `-0` differ, an integer equals the float of the same
/// magnitude), everything else by structural equality.
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => same_number(a, b),
        _ => a == b,
    }
}

fn same_number(a: &Number, b: &Number) -> bool {
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a == b;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.to_bits() == b.to_bits(),
        _ => false,
    }
}
