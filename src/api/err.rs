//! Reporting errors of resolvers.
//!
//! Resolvers do not return `Result`s. Instead, errors are translated into one
//! or more GraphQL errors which are pushed onto the error list of the
//! response, and the field resolves to `null`. That way a single failing
//! operation can report several problems at once, e.g. all invalid input
//! fields.

use juniper::Executor;

use crate::{apperr::FieldMap, prelude::*};
use super::Context;


/// Returns the value of `result`, or reports its error and returns `None`.
pub(crate) fn report<T>(
    executor: &Executor<'_, '_, Context>,
    result: Result<T>,
    field_map: FieldMap<'_>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            let context = executor.context();
            let errors = context.services.translator.translate(&e, context.lang, field_map);
            for err in errors {
                executor.push_error(err.into_field_error());
            }
            None
        }
    }
}
