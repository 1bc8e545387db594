use std::sync::Arc;
use deadpool_postgres::Pool;

use crate::{
    apperr::{LangKey, Translator},
    db::{Scope, Transaction},
    notes::{NoteService, PgNoteRepository},
};


/// Everything that is shared between all requests. Created once on startup.
pub(crate) struct Services {
    pub(crate) notes: NoteService<Pool, PgNoteRepository>,
    pub(crate) translator: Translator,
}

/// The context that is accessible to every resolver in our API.
pub(crate) struct Context {
    /// Transaction scope of this request. Starts out without transaction,
    /// services open their own where needed.
    pub(crate) scope: Scope<Transaction>,
    pub(crate) services: Arc<Services>,

    /// Language error messages are translated to.
    pub(crate) lang: LangKey,
}

impl juniper::Context for Context {}

impl Context {
    pub(crate) fn new(services: Arc<Services>, lang: LangKey) -> Self {
        Self {
            scope: Scope::detached(),
            services,
            lang,
        }
    }
}
