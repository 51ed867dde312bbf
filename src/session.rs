use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures_timer::Delay;
use serde_json::Value;

use crate::notify::{ChangeObserverFn, FieldChange, changed_keys, same_value};
use crate::schema::SchemaValidator;

/// Ordered, cheap-to-clone field name. Keys are dynamic because validator
/// failure paths arrive as plain strings.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldKey(Arc<str>);

impl FieldKey {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FieldKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FieldKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

pub type ValueRecord = BTreeMap<FieldKey, Value>;
pub type ErrorRecord = BTreeMap<FieldKey, String>;
pub type TouchedRecord = BTreeMap<FieldKey, bool>;

/// Per-key generation stamp for asynchronous validation. A completion whose
/// ticket is no longer the latest for its key is discarded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValidationTicket(pub u64);

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionError {
    StatePoisoned(&'static str),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::StatePoisoned(context) => {
                write!(f, "session state lock poisoned while {context}")
            }
        }
    }
}

impl std::error::Error for SessionError {}

pub type SessionResult<T> = Result<T, SessionError>;

pub type SubmitHandler = Arc<dyn Fn(&ValueRecord, &SubmitContext) + Send + Sync>;

/// Capabilities handed to a submit handler, currently limited to folding
/// server-side failures back into the session.
#[derive(Clone)]
pub struct SubmitContext {
    session: FormSession,
}

impl SubmitContext {
    pub fn set_errors(&self, errors: ErrorRecord) -> SessionResult<()> {
        self.session.set_errors(errors)
    }
}

#[derive(Clone, Default)]
pub struct SessionOptions {
    pub initial_values: ValueRecord,
    pub validate_on_mount: bool,
    pub validate_on_change: bool,
    pub initial_touched: bool,
    pub enable_reinitialize: bool,
    /// Delay applied before validate-on-change field validation. A newer edit
    /// during the delay abandons the pending validation.
    pub validate_debounce_ms: u64,
    pub validations: Option<Arc<dyn SchemaValidator>>,
    pub on_submit: Option<SubmitHandler>,
    pub on_form_value_change: Option<ChangeObserverFn>,
}

/// Published view of a session at one point in time.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub values: ValueRecord,
    pub errors: ErrorRecord,
    pub touched: TouchedRecord,
    pub is_valid: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            values: ValueRecord::new(),
            errors: ErrorRecord::new(),
            touched: TouchedRecord::new(),
            is_valid: true,
        }
    }
}

struct SessionState {
    initial_values: ValueRecord,
    values: ValueRecord,
    errors: ErrorRecord,
    touched: TouchedRecord,
    is_valid: bool,
    tickets: BTreeMap<FieldKey, ValidationTicket>,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            values: self.values.clone(),
            errors: self.errors.clone(),
            touched: self.touched.clone(),
            is_valid: self.is_valid,
        }
    }

    fn recompute_validity(&mut self) {
        self.is_valid = self.errors.values().all(|message| message.is_empty());
    }

    fn take_ticket(&mut self, key: &FieldKey) -> ValidationTicket {
        let next = ValidationTicket(self.tickets.get(key).map_or(0, |ticket| ticket.0) + 1);
        self.tickets.insert(key.clone(), next);
        next
    }
}

struct SessionCore {
    validate_on_mount: bool,
    validate_on_change: bool,
    initial_touched: bool,
    enable_reinitialize: bool,
    debounce: Duration,
    schema: Option<Arc<dyn SchemaValidator>>,
    on_submit: Option<SubmitHandler>,
    state: RwLock<SessionState>,
    observers: RwLock<Vec<ChangeObserverFn>>,
}

/// One mounted form session: the value/error/touched records, the validation
/// protocol against the injected schema, and change distribution to observers.
///
/// The handle is cheap to clone; every clone addresses the same session. The
/// inert variant (`FormSession::inert`) satisfies the same API with no state
/// behind it, so field bindings mounted outside any session degrade to no-ops
/// instead of failing.
#[derive(Clone)]
pub struct FormSession {
    inner: SessionInner,
}

#[derive(Clone)]
enum SessionInner {
    Active(Arc<SessionCore>),
    Inert,
}

impl Default for FormSession {
    fn default() -> Self {
        Self::inert()
    }
}

impl FormSession {
    pub fn new(options: SessionOptions) -> Self {
        let observers = options
            .on_form_value_change
            .into_iter()
            .collect::<Vec<_>>();
        let core = SessionCore {
            validate_on_mount: options.validate_on_mount,
            validate_on_change: options.validate_on_change,
            initial_touched: options.initial_touched,
            enable_reinitialize: options.enable_reinitialize,
            debounce: Duration::from_millis(options.validate_debounce_ms),
            schema: options.validations,
            on_submit: options.on_submit,
            state: RwLock::new(SessionState {
                initial_values: options.initial_values.clone(),
                values: options.initial_values,
                errors: ErrorRecord::new(),
                touched: TouchedRecord::new(),
                is_valid: true,
                tickets: BTreeMap::new(),
            }),
            observers: RwLock::new(observers),
        };
        Self {
            inner: SessionInner::Active(Arc::new(core)),
        }
    }

    /// Builds the session and runs the mount-time validation pass when
    /// `validate_on_mount` is set: with `initial_touched`, every current key is
    /// marked touched first, then the whole record is validated once.
    pub async fn mount(options: SessionOptions) -> SessionResult<Self> {
        let session = Self::new(options);
        session.run_mount_validation().await?;
        Ok(session)
    }

    async fn run_mount_validation(&self) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        if !core.validate_on_mount {
            return Ok(());
        }
        let values = {
            let mut state = write_lock(&core.state, "preparing mount validation")?;
            if core.initial_touched {
                let keys = state.values.keys().cloned().collect::<Vec<_>>();
                for key in keys {
                    state.touched.insert(key, true);
                }
            }
            state.values.clone()
        };
        self.run_record_validation(values, None).await?;
        Ok(())
    }

    /// The null-session variant: all reads yield empty defaults, all mutators
    /// and validations resolve without effect.
    pub fn inert() -> Self {
        Self {
            inner: SessionInner::Inert,
        }
    }

    fn core(&self) -> Option<&Arc<SessionCore>> {
        match &self.inner {
            SessionInner::Active(core) => Some(core),
            SessionInner::Inert => None,
        }
    }

    pub fn values(&self) -> SessionResult<ValueRecord> {
        let Some(core) = self.core() else {
            return Ok(ValueRecord::new());
        };
        Ok(read_lock(&core.state, "reading values")?.values.clone())
    }

    pub fn errors(&self) -> SessionResult<ErrorRecord> {
        let Some(core) = self.core() else {
            return Ok(ErrorRecord::new());
        };
        Ok(read_lock(&core.state, "reading errors")?.errors.clone())
    }

    pub fn touched(&self) -> SessionResult<TouchedRecord> {
        let Some(core) = self.core() else {
            return Ok(TouchedRecord::new());
        };
        Ok(read_lock(&core.state, "reading touched flags")?.touched.clone())
    }

    pub fn is_valid(&self) -> SessionResult<bool> {
        let Some(core) = self.core() else {
            return Ok(true);
        };
        Ok(read_lock(&core.state, "reading validity")?.is_valid)
    }

    pub fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        let Some(core) = self.core() else {
            return Ok(SessionSnapshot::default());
        };
        Ok(read_lock(&core.state, "creating session snapshot")?.snapshot())
    }

    pub fn field_value(&self, key: &FieldKey) -> SessionResult<Option<Value>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        Ok(read_lock(&core.state, "reading field value")?
            .values
            .get(key)
            .cloned())
    }

    pub fn field_error(&self, key: &FieldKey) -> SessionResult<Option<String>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        Ok(read_lock(&core.state, "reading field error")?
            .errors
            .get(key)
            .cloned())
    }

    pub fn field_touched(&self, key: &FieldKey) -> SessionResult<bool> {
        let Some(core) = self.core() else {
            return Ok(false);
        };
        Ok(read_lock(&core.state, "reading field touched flag")?
            .touched
            .get(key)
            .copied()
            .unwrap_or(false))
    }

    /// Registers an observer invoked once per changed key immediately after
    /// every value mutation, outside the state lock.
    pub fn observe(
        &self,
        observer: impl Fn(&FieldChange) + Send + Sync + 'static,
    ) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let mut observers = write_lock(&core.observers, "registering change observer")?;
        observers.push(Arc::new(observer));
        Ok(())
    }

    /// Writes one field: marks it touched, merges the value, notifies
    /// observers, then runs validate-on-change field validation against the
    /// updated record.
    pub async fn set_field_value(
        &self,
        key: impl Into<FieldKey>,
        value: Value,
    ) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let key = key.into();
        let (changes, updated) = {
            let mut state = write_lock(&core.state, "writing field value")?;
            let previous = state.values.clone();
            state.touched.insert(key.clone(), true);
            state.values.insert(key.clone(), value);
            (collect_changes(&previous, &state), state.values.clone())
        };
        self.notify_observers(core, changes)?;
        if core.validate_on_change {
            self.validate_field_with(&key, updated).await?;
        }
        Ok(())
    }

    /// Merges multiple keys in one update, marks each supplied key touched,
    /// then validates the whole record unconditionally (no submit).
    pub async fn set_values(&self, partial: ValueRecord) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let (changes, updated) = {
            let mut state = write_lock(&core.state, "merging values")?;
            let previous = state.values.clone();
            for (key, value) in partial {
                state.touched.insert(key.clone(), true);
                state.values.insert(key, value);
            }
            (collect_changes(&previous, &state), state.values.clone())
        };
        self.notify_observers(core, changes)?;
        self.run_record_validation(updated, None).await?;
        Ok(())
    }

    /// Replaces the value record entirely, replaces touched flags with exactly
    /// the supplied keys, clears all errors, then validates the record only
    /// when validate-on-change is enabled.
    pub async fn reset_values(&self, replacement: ValueRecord) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let (changes, updated) = {
            let mut state = write_lock(&core.state, "resetting values")?;
            let previous = state.values.clone();
            state.touched = replacement.keys().map(|key| (key.clone(), true)).collect();
            state.errors.clear();
            state.values = replacement;
            (collect_changes(&previous, &state), state.values.clone())
        };
        self.notify_observers(core, changes)?;
        if core.validate_on_change {
            self.run_record_validation(updated, None).await?;
        }
        Ok(())
    }

    pub fn set_errors(&self, partial: ErrorRecord) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let mut state = write_lock(&core.state, "merging errors")?;
        state.errors.extend(partial);
        Ok(())
    }

    pub fn set_touched(&self, partial: TouchedRecord) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let mut state = write_lock(&core.state, "merging touched flags")?;
        state.touched.extend(partial);
        Ok(())
    }

    pub fn set_field_error(
        &self,
        key: impl Into<FieldKey>,
        message: impl Into<String>,
    ) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let mut state = write_lock(&core.state, "writing field error")?;
        state.errors.insert(key.into(), message.into());
        Ok(())
    }

    pub fn clear_field_error(&self, key: &FieldKey) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let mut state = write_lock(&core.state, "clearing field error")?;
        state.errors.remove(key);
        Ok(())
    }

    pub fn set_field_touched(&self, key: impl Into<FieldKey>, touched: bool) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let mut state = write_lock(&core.state, "writing field touched flag")?;
        state.touched.insert(key.into(), touched);
        Ok(())
    }

    /// Replaces the value record when the caller-supplied initial values have
    /// changed since they were last supplied, compared positionally by value
    /// rather than by identity. Errors and touched flags are kept as-is.
    pub async fn reinitialize(&self, initial: ValueRecord) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        if !core.enable_reinitialize {
            return Ok(());
        }
        let changes = {
            let mut state = write_lock(&core.state, "reinitializing values")?;
            if same_value_list(&state.initial_values, &initial) {
                return Ok(());
            }
            let previous = state.values.clone();
            state.initial_values = initial.clone();
            state.values = initial;
            collect_changes(&previous, &state)
        };
        self.notify_observers(core, changes)
    }

    /// Validates one field against the current record. No-op when no schema is
    /// configured or the schema declares no rule for the key.
    pub async fn validate_field(&self, key: impl Into<FieldKey>) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let key = key.into();
        let record = read_lock(&core.state, "reading record for field validation")?
            .values
            .clone();
        self.validate_field_with(&key, record).await
    }

    /// Validates the whole record without submitting. Returns whether the
    /// record settled as valid.
    pub async fn validate_form(&self) -> SessionResult<bool> {
        let Some(core) = self.core() else {
            return Ok(true);
        };
        let values = read_lock(&core.state, "reading record for form validation")?
            .values
            .clone();
        self.run_record_validation(values, None).await
    }

    /// Runs full-record validation over the current values and, only when it
    /// succeeds, invokes the configured submit handler exactly once.
    pub async fn handle_submit(&self) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let values = read_lock(&core.state, "reading record for submit")?
            .values
            .clone();
        let submit = core.on_submit.clone();
        self.run_record_validation(values, submit).await?;
        Ok(())
    }

    async fn validate_field_with(&self, key: &FieldKey, record: ValueRecord) -> SessionResult<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let Some(schema) = core.schema.as_ref() else {
            return Ok(());
        };
        if !schema.declares(key) {
            return Ok(());
        }

        let ticket = write_lock(&core.state, "starting field validation")?.take_ticket(key);
        if !core.debounce.is_zero() {
            Delay::new(core.debounce).await;
            if !self.is_latest_ticket(core, key, ticket)? {
                return Ok(());
            }
        }

        let result = schema.validate_field(key, &record).await;
        let mut state = write_lock(&core.state, "applying field validation result")?;
        if state.tickets.get(key).copied() != Some(ticket) {
            return Ok(());
        }
        match result {
            Ok(()) => {
                state.errors.remove(key);
                state.recompute_validity();
            }
            Err(invalid) => {
                let message = invalid.errors.into_iter().next().unwrap_or_default();
                state.errors.insert(key.clone(), message);
                state.is_valid = false;
            }
        }
        Ok(())
    }

    async fn run_record_validation(
        &self,
        values: ValueRecord,
        submit: Option<SubmitHandler>,
    ) -> SessionResult<bool> {
        let Some(core) = self.core() else {
            return Ok(true);
        };
        let outcome = match core.schema.as_ref() {
            Some(schema) => schema.validate_record(&values).await,
            None => Ok(()),
        };
        match outcome {
            Ok(()) => {
                {
                    let mut state = write_lock(&core.state, "applying form validation success")?;
                    state.errors.clear();
                    state.is_valid = true;
                }
                if let Some(submit) = submit {
                    let context = SubmitContext {
                        session: self.clone(),
                    };
                    submit(&values, &context);
                }
                Ok(true)
            }
            Err(invalid) => {
                let mut state = write_lock(&core.state, "applying form validation failure")?;
                // Rebuilt from scratch; a repeated path keeps its last message.
                state.errors = invalid
                    .inner
                    .into_iter()
                    .map(|failure| (failure.path, failure.message))
                    .collect();
                state.is_valid = false;
                Ok(false)
            }
        }
    }

    fn is_latest_ticket(
        &self,
        core: &SessionCore,
        key: &FieldKey,
        ticket: ValidationTicket,
    ) -> SessionResult<bool> {
        Ok(read_lock(&core.state, "checking latest validation ticket")?
            .tickets
            .get(key)
            .copied()
            == Some(ticket))
    }

    fn notify_observers(
        &self,
        core: &SessionCore,
        changes: Vec<FieldChange>,
    ) -> SessionResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let observers = read_lock(&core.observers, "reading change observers")?.clone();
        for change in &changes {
            for observer in &observers {
                observer(change);
            }
        }
        Ok(())
    }
}

// One entry per current-record key whose value differs from the previous
// record. Removed keys are not reported.
fn collect_changes(previous: &ValueRecord, state: &SessionState) -> Vec<FieldChange> {
    let changed = changed_keys(previous, &state.values);
    if changed.is_empty() {
        return Vec::new();
    }
    let form = state.snapshot();
    changed
        .into_iter()
        .map(|key| FieldChange {
            value: state.values.get(&key).cloned(),
            prev_value: previous.get(&key).cloned(),
            form: form.clone(),
            field: key,
        })
        .collect()
}

fn same_value_list(current: &ValueRecord, next: &ValueRecord) -> bool {
    current.len() == next.len()
        && current
            .values()
            .zip(next.values())
            .all(|(a, b)| same_value(a, b))
}

pub(crate) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> SessionResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| SessionError::StatePoisoned(context))
}

pub(crate) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> SessionResult<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| SessionError::StatePoisoned(context))
}
