//! Application errors and their translation into user facing GraphQL errors.
//!
//! Services fail with an [`AppError`] (or several at once via [`AppErrors`])
//! wrapped in an `anyhow::Error`. Each carries a stable key that is looked up
//! in the [`Catalog`] at the API boundary. Everything else that reaches the
//! boundary is a "foreign" error and is shown to the user as a generic
//! message. Underlying causes are only ever logged.

use std::fmt;

use crate::prelude::*;

mod catalog;
mod translate;

pub(crate) use self::{
    catalog::{Catalog, LangKey},
    translate::{FieldMap, Translator},
};


pub(crate) const STATUS_BAD_REQUEST: u16 = 400;
pub(crate) const STATUS_NOT_FOUND: u16 = 404;
pub(crate) const STATUS_INTERNAL: u16 = 500;

/// An error with a lookup key for the message shown to the user.
#[derive(Debug)]
pub(crate) struct AppError {
    pub(crate) key: &'static str,

    /// Name of the input field this error is about, if any. Renamed to its
    /// public name via the field map when translating.
    pub(crate) field: Option<&'static str>,

    /// HTTP-like status code, sent as extension.
    pub(crate) status: Option<u16>,

    /// What actually went wrong. Only logged, never sent to the user.
    pub(crate) source: Option<anyhow::Error>,
}

impl AppError {
    /// Something failed that the user cannot do anything about.
    pub(crate) fn internal(key: &'static str, err: impl Into<anyhow::Error>) -> Self {
        Self::with_status(key, err, STATUS_INTERNAL)
    }

    pub(crate) fn with_status(key: &'static str, err: impl Into<anyhow::Error>, status: u16) -> Self {
        Self {
            key,
            field: None,
            status: Some(status),
            source: Some(err.into()),
        }
    }

    /// The user supplied a bad value for `field`.
    pub(crate) fn for_field(key: &'static str, field: &'static str, status: u16) -> Self {
        Self {
            key,
            field: Some(field),
            status: Some(status),
            source: None,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key {}", self.key)?;
        if let Some(status) = self.status {
            write!(f, " (status {status})")?;
        }
        if let Some(field) = self.field {
            write!(f, " on field '{field}'")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}


/// Several application errors reported together, e.g. all failed
/// validations of one input.
#[derive(Debug, Default)]
pub(crate) struct AppErrors(pub(crate) Vec<AppError>);

impl AppErrors {
    pub(crate) fn push(&mut self, err: AppError) {
        self.0.push(err);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &AppError> {
        self.0.iter()
    }

    /// `Ok` if no error was collected, `Err(self)` otherwise.
    pub(crate) fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for AppErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppErrors {}


/// Extension to tag unexpected errors with a key.
pub(crate) trait ResultExt<T> {
    /// Wraps the error into an internal `AppError` with the given key, unless
    /// it already is an `AppError` or `AppErrors`, which are passed on
    /// unchanged.
    fn or_internal(self, key: &'static str) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn or_internal(self, key: &'static str) -> Result<T> {
        self.map_err(|e| {
            let e = e.into();
            if e.is::<AppError>() || e.is::<AppErrors>() {
                e
            } else {
                AppError::internal(key, e).into()
            }
        })
    }
}
