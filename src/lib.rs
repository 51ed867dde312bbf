mod binding;
mod notify;
mod schema;
mod session;


pub use binding::{BoundField, FieldBinding, FieldProps, FieldWidget};
pub use notify::{ChangeObserverFn, FieldChange, same_value};
pub use schema::{
    BoxedValidationFuture, FieldFailure, FieldInvalid, RecordInvalid, RuleSchema, SchemaValidator,
};
pub use session::{
    ErrorRecord, FieldKey, FormSession, SessionError, SessionOptions, SessionResult,
    SessionSnapshot, SubmitContext, SubmitHandler, TouchedRecord, ValidationTicket, ValueRecord,
};
