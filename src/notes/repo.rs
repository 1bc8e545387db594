use std::future::Future;
use deadpool_postgres::Pool;

use crate::{
    db::{Scope, Transaction, util::FromRow},
    prelude::*,
};
use super::Note;


/// Storage of notes. All methods take the scope of the caller so that they
/// can join its transaction.
pub(crate) trait NoteRepository<Tx>: Send + Sync {
    fn insert(&self, scope: &Scope<Tx>, note: &Note) -> impl Future<Output = Result<()>> + Send;
    fn all(&self, scope: &Scope<Tx>) -> impl Future<Output = Result<Vec<Note>>> + Send;
    fn update(&self, scope: &Scope<Tx>, note: &Note) -> impl Future<Output = Result<()>> + Send;
    fn exists(&self, scope: &Scope<Tx>, id: &str) -> impl Future<Output = Result<bool>> + Send;
}


/// Stores notes in the table `notes`.
pub(crate) struct PgNoteRepository {
    pool: Pool,
}

impl PgNoteRepository {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl NoteRepository<Transaction> for PgNoteRepository {
    async fn insert(&self, scope: &Scope<Transaction>, note: &Note) -> Result<()> {
        let tx = scope.existing_or_begin(&self.pool).await?;
        let res = tx.get()
            .client()
            .execute(
                "insert into notes (id, title, content) values ($1, $2, $3)",
                &[&note.id, &note.title, &note.content],
            )
            .await;
        let affected = tx.settle(&self.pool, res).await?;

        debug!("Inserted note '{}' ({affected} rows affected)", note.id);
        Ok(())
    }

    async fn all(&self, scope: &Scope<Transaction>) -> Result<Vec<Note>> {
        let query = format!("select {} from notes", Note::COLUMNS);
        let notes = scope.client(&self.pool)
            .await?
            .query_mapped(&query, dbargs![], |row| Note::from_row(&row))
            .await?;

        Ok(notes)
    }

    async fn update(&self, scope: &Scope<Transaction>, note: &Note) -> Result<()> {
        let tx = scope.existing_or_begin(&self.pool).await?;
        let res = tx.get()
            .client()
            .execute(
                "update notes set title = $1, content = $2 where id = $3",
                &[&note.title, &note.content, &note.id],
            )
            .await;
        let affected = tx.settle(&self.pool, res).await?;

        debug!("Updated note '{}' ({affected} rows affected)", note.id);
        Ok(())
    }

    async fn exists(&self, scope: &Scope<Transaction>, id: &str) -> Result<bool> {
        let row = scope.client(&self.pool)
            .await?
            .query_one("select exists(select id from notes where id = $1)", &[&id])
            .await?;

        Ok(row.get::<_, bool>(0))
    }
}
