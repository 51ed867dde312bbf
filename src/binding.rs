use std::sync::Mutex;

use serde_json::Value;

use crate::notify::same_value;
use crate::session::{FieldKey, FormSession, SessionError, SessionResult};

/// Per-field facade over a session: the current value, the error gated by the
/// touched flag, and single-key mutators. The binding is a cheap clone of the
/// session handle, so its identity is stable for the session's lifetime and a
/// binding built on an inert session degrades to reads of empty defaults and
/// no-op writes.
#[derive(Clone)]
pub struct FieldBinding {
    session: FormSession,
    key: FieldKey,
}

impl FieldBinding {
    pub fn new(session: &FormSession, key: impl Into<FieldKey>) -> Self {
        Self {
            session: session.clone(),
            key: key.into(),
        }
    }

    pub fn key(&self) -> &FieldKey {
        &self.key
    }

    pub fn value(&self) -> SessionResult<Option<Value>> {
        self.session.field_value(&self.key)
    }

    pub fn touched(&self) -> SessionResult<bool> {
        self.session.field_touched(&self.key)
    }

    /// The raw error entry, regardless of interaction state.
    pub fn error(&self) -> SessionResult<Option<String>> {
        self.session.field_error(&self.key)
    }

    /// The error as it should be presented: hidden until the field has been
    /// touched, so latent errors never show before user interaction.
    pub fn display_error(&self) -> SessionResult<Option<String>> {
        if !self.session.field_touched(&self.key)? {
            return Ok(None);
        }
        self.session.field_error(&self.key)
    }

    pub async fn set_value(&self, value: Value) -> SessionResult<()> {
        self.session.set_field_value(self.key.clone(), value).await
    }

    pub fn set_touched(&self, touched: bool) -> SessionResult<()> {
        self.session.set_field_touched(self.key.clone(), touched)
    }

    pub fn set_error(&self, message: impl Into<String>) -> SessionResult<()> {
        self.session.set_field_error(self.key.clone(), message)
    }

    pub fn clear_error(&self) -> SessionResult<()> {
        self.session.clear_field_error(&self.key)
    }
}

/// Inputs a field widget renders from. `error` is already gated by touched and
/// empty when nothing should be presented.
#[derive(Clone, Debug, Default)]
pub struct FieldProps {
    pub value: Option<Value>,
    pub error: String,
    pub touched: bool,
    pub disabled: bool,
}

impl FieldProps {
    fn matches(&self, other: &Self) -> bool {
        self.error == other.error
            && self.touched == other.touched
            && self.disabled == other.disabled
            && match (&self.value, &other.value) {
                (Some(a), Some(b)) => same_value(a, b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// External contract for a renderable field widget.
pub trait FieldWidget: Send + Sync {
    type Rendered: Clone + Send;

    fn render(&self, props: &FieldProps, field: &FieldBinding) -> Self::Rendered;
}

/// A widget bound to one field, re-rendered only when value, presented error,
/// touched, or the disabled flag changes. All other session updates return the
/// cached output.
pub struct BoundField<W: FieldWidget> {
    binding: FieldBinding,
    widget: W,
    disabled: bool,
    cache: Mutex<Option<(FieldProps, W::Rendered)>>,
}

impl<W: FieldWidget> BoundField<W> {
    pub fn new(binding: FieldBinding, widget: W) -> Self {
        Self {
            binding,
            widget,
            disabled: false,
            cache: Mutex::new(None),
        }
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn binding(&self) -> &FieldBinding {
        &self.binding
    }

    pub fn render(&self) -> SessionResult<W::Rendered> {
        let props = FieldProps {
            value: self.binding.value()?,
            error: self.binding.display_error()?.unwrap_or_default(),
            touched: self.binding.touched()?,
            disabled: self.disabled,
        };
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| SessionError::StatePoisoned("rendering bound field"))?;
        if let Some((cached, rendered)) = cache.as_ref() {
            if cached.matches(&props) {
                return Ok(rendered.clone());
            }
        }
        let rendered = self.widget.render(&props, &self.binding);
        *cache = Some((props, rendered.clone()));
        Ok(rendered)
    }
}
