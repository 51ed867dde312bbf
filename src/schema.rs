use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::session::{FieldKey, ValueRecord};

pub type BoxedValidationFuture<'a, E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'a>>;

/// One failing field from a full-record validation, in reporting order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldFailure {
    pub path: FieldKey,
    pub message: String,
}

/// Full-record validation failure: every failing field, not just the first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordInvalid {
    pub inner: Vec<FieldFailure>,
}

impl Display for RecordInvalid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "record validation failed on {} field(s)", self.inner.len())
    }
}

impl std::error::Error for RecordInvalid {}

/// Single-field validation failure: the field's messages in rule order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FieldInvalid {
    pub errors: Vec<String>,
}

impl Display for FieldInvalid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.errors.first() {
            Some(message) => f.write_str(message),
            None => f.write_str("field validation failed"),
        }
    }
}

impl std::error::Error for FieldInvalid {}

/// Capability interface for the external schema validator. Substituting a
/// different validation library means preserving exactly these success and
/// failure shapes.
pub trait SchemaValidator: Send + Sync {
    /// Whether the schema declares any rule for the key. Undeclared keys are
    /// never validated.
    fn declares(&self, key: &FieldKey) -> bool;

    /// Validates the whole record without aborting on the first failure.
    fn validate_record<'a>(
        &'a self,
        record: &'a ValueRecord,
    ) -> BoxedValidationFuture<'a, RecordInvalid>;

    /// Validates a single key against the supplied record.
    fn validate_field<'a>(
        &'a self,
        key: &'a FieldKey,
        record: &'a ValueRecord,
    ) -> BoxedValidationFuture<'a, FieldInvalid>;
}

type RuleFn = Arc<dyn Fn(Option<&Value>, &ValueRecord) -> Result<(), String> + Send + Sync>;

/// Rule-based schema: an ordered list of closures per declared key. Each rule
/// sees the field's current value (absent keys read as `None`) and the whole
/// record, for cross-field rules.
#[derive(Clone, Default)]
pub struct RuleSchema {
    rules: BTreeMap<FieldKey, Vec<RuleFn>>,
}

impl RuleSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(
        mut self,
        key: impl Into<FieldKey>,
        rule: impl Fn(Option<&Value>, &ValueRecord) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.rules.entry(key.into()).or_default().push(Arc::new(rule));
        self
    }

    /// Fails when the key is absent, null, or an empty string.
    pub fn required(self, key: impl Into<FieldKey>) -> Self {
        let key = key.into();
        let message = format!("{key} is required");
        self.rule(key, move |value, _record| match value {
            None | Some(Value::Null) => Err(message.clone()),
            Some(Value::String(text)) if text.is_empty() => Err(message.clone()),
            _ => Ok(()),
        })
    }
}

impl SchemaValidator for RuleSchema {
    fn declares(&self, key: &FieldKey) -> bool {
        self.rules.contains_key(key)
    }

    fn validate_record<'a>(
        &'a self,
        record: &'a ValueRecord,
    ) -> BoxedValidationFuture<'a, RecordInvalid> {
        Box::pin(async move {
            let mut inner = Vec::new();
            for (key, rules) in &self.rules {
                let value = record.get(key);
                for rule in rules {
                    if let Err(message) = rule(value, record) {
                        inner.push(FieldFailure {
                            path: key.clone(),
                            message,
                        });
                    }
                }
            }
            if inner.is_empty() {
                Ok(())
            } else {
                Err(RecordInvalid { inner })
            }
        })
    }

    fn validate_field<'a>(
        &'a self,
        key: &'a FieldKey,
        record: &'a ValueRecord,
    ) -> BoxedValidationFuture<'a, FieldInvalid> {
        Box::pin(async move {
            let Some(rules) = self.rules.get(key) else {
                return Ok(());
            };
            let value = record.get(key);
            let errors = rules
                .iter()
                .filter_map(|rule| rule(value, record).err())
                .collect::<Vec<_>>();
            if errors.is_empty() {
                Ok(())
            } else {
                Err(FieldInvalid { errors })
            }
        })
    }
}
