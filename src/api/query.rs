use juniper::{DefaultScalarValue, Executor, graphql_object};

use crate::notes::Note;
use super::{Context, err::report};


/// The root query object.
pub(crate) struct Query;

#[graphql_object(context = Context, scalar = DefaultScalarValue)]
impl Query {
    /// Returns all notes, in no particular order.
    async fn notes(executor: &Executor<'_, '_, Context>) -> Option<Vec<Note>> {
        let context = executor.context();
        let result = context.services.notes.all_notes(&context.scope).await;
        report(executor, result, &[])
    }
}
