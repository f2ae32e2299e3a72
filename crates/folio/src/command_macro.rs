//! Macros for reducing command boilerplate.

/// Implement `Command::idempotency_key()` from a field.
///
/// Use `idempotency_key_field!(name)` for a `String` field and
/// `idempotency_key_field!(optional name)` for an `Option<String>` field.
///
/// # Example
///
/// ```ignore
/// use folio_core::{idempotency_key_field, Command};
///
/// struct CreateBook {
///     idempotency_key: String,
///     title: String,
/// }
///
/// impl Command for CreateBook {
///     idempotency_key_field!(idempotency_key);
/// }
/// ```
#[macro_export]
macro_rules! idempotency_key_field {
    (optional $field:ident) => {
        fn idempotency_key(&self) -> Option<&str> {
            self.$field.as_deref()
        }
    };
    ($field:ident) => {
        fn idempotency_key(&self) -> Option<&str> {
            Some(self.$field.as_str())
        }
    };
}

/// Implement `Command::upload()` from an `Option<Upload>` field.
#[macro_export]
macro_rules! upload_field {
    ($field:ident) => {
        fn upload(&mut self) -> Option<&mut $crate::Upload> {
            self.$field.as_mut()
        }
    };
}
