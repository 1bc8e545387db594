use juniper::{DefaultScalarValue, Executor, graphql_object};

use crate::notes::{NewNoteInput, Note, UpdateNoteInput};
use super::{Context, err::report};


/// Public names of the fields of note inputs.
const NOTE_INPUT_FIELDS: &[(&str, &str)] = &[
    ("title", "input.title"),
    ("content", "input.content"),
];

/// The root mutation object.
pub(crate) struct Mutation;

#[graphql_object(context = Context, scalar = DefaultScalarValue)]
impl Mutation {
    /// Creates a new note and returns it.
    async fn create_new_note(
        input: NewNoteInput,
        executor: &Executor<'_, '_, Context>,
    ) -> Option<Note> {
        let context = executor.context();
        let result = context.services.notes.save_new_note(&context.scope, input).await;
        report(executor, result, NOTE_INPUT_FIELDS)
    }

    /// Replaces title and content of an existing note.
    async fn update_note(
        id: String,
        input: UpdateNoteInput,
        executor: &Executor<'_, '_, Context>,
    ) -> Option<Note> {
        let context = executor.context();
        let result = context.services.notes.update_note(&context.scope, id, input).await;
        report(executor, result, NOTE_INPUT_FIELDS)
    }
}
