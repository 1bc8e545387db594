//! The notes resource: model, validation and the service that ties
//! validation, transactions and the repository together.

use rand::Rng;

use crate::{
    apperr::{AppError, AppErrors, ResultExt as _, STATUS_BAD_REQUEST, STATUS_NOT_FOUND},
    db::{Scope, TxManager, TxSource, util::FromRow},
    prelude::*,
};

mod repo;

pub(crate) use self::repo::{NoteRepository, PgNoteRepository};


pub(crate) const ERROR_UNKNOWN_WHILE_SAVING_NEW_NOTE: &str = "errorUnknownWhileSavingNewNote";
pub(crate) const ERROR_FETCHING_ALL_NOTES: &str = "errorFetchingAllNotes";
pub(crate) const ERROR_UNKNOWN_WHILE_UPDATING_NOTE: &str = "errorUnknownWhileUpdatingNote";
pub(crate) const ERROR_NOTE_NOT_FOUND: &str = "errorNoteNotFound";
pub(crate) const ERROR_NOTE_TITLE_REQUIRED: &str = "errorNoteTitleRequired";
pub(crate) const ERROR_NOTE_TITLE_TOO_LONG: &str = "errorNoteTitleTooLong";
pub(crate) const ERROR_NOTE_CONTENT_TOO_LONG: &str = "errorNoteContentTooLong";

/// Maximum length of a title, in characters.
pub(crate) const MAX_TITLE_LEN: usize = 200;

/// Maximum length of the content, in characters.
pub(crate) const MAX_CONTENT_LEN: usize = 10_000;


#[derive(Debug, Clone, PartialEq, Eq, juniper::GraphQLObject)]
pub(crate) struct Note {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) content: String,
}

impl FromRow for Note {
    const COLUMNS: &'static str = "id, title, content";

    fn from_row(row: &tokio_postgres::Row) -> Self {
        Self {
            id: row.get(0),
            title: row.get(1),
            content: row.get(2),
        }
    }
}

#[derive(Debug, Clone, juniper::GraphQLInputObject)]
pub(crate) struct NewNoteInput {
    pub(crate) title: String,
    pub(crate) content: String,
}

#[derive(Debug, Clone, juniper::GraphQLInputObject)]
pub(crate) struct UpdateNoteInput {
    pub(crate) title: String,
    pub(crate) content: String,
}


/// Characters used in note IDs. Digits and letters without the easily
/// confused `0`, `1`, `I`, `O` and `l`.
const ID_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// 22 characters of a 57 character alphabet are a bit more than 128 bits.
const ID_LEN: usize = 22;

/// Creates a new random note ID.
pub(crate) fn new_id() -> String {
    fn generate(mut rng: impl Rng) -> String {
        (0..ID_LEN)
            .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
            .collect()
    }

    generate(rand::rng())
}

/// Checks title and content, reporting all problems at once.
fn validate(title: &str, content: &str) -> Result<(), AppErrors> {
    let mut errors = AppErrors::default();
    if title.trim().is_empty() {
        errors.push(AppError::for_field(ERROR_NOTE_TITLE_REQUIRED, "title", STATUS_BAD_REQUEST));
    } else if title.chars().count() > MAX_TITLE_LEN {
        errors.push(AppError::for_field(ERROR_NOTE_TITLE_TOO_LONG, "title", STATUS_BAD_REQUEST));
    }
    if content.chars().count() > MAX_CONTENT_LEN {
        errors.push(AppError::for_field(ERROR_NOTE_CONTENT_TOO_LONG, "content", STATUS_BAD_REQUEST));
    }

    errors.into_result()
}


/// All operations on notes. Each writing operation runs in one transaction
/// that is joined if the given scope already carries one.
pub(crate) struct NoteService<S: TxSource, R> {
    tx: TxManager<S>,
    repo: R,
}

impl<S: TxSource, R: NoteRepository<S::Tx>> NoteService<S, R> {
    pub(crate) fn new(source: S, repo: R) -> Self {
        Self { tx: TxManager::new(source), repo }
    }

    /// Validates the input and stores a new note with a fresh ID. Returns the
    /// note as it was constructed, it is not read back from the database.
    pub(crate) async fn save_new_note(
        &self,
        scope: &Scope<S::Tx>,
        input: NewNoteInput,
    ) -> Result<Note> {
        validate(&input.title, &input.content)?;

        let note = Note {
            id: new_id(),
            title: input.title,
            content: input.content,
        };

        let note_ref = &note;
        self.tx.within_transaction(scope, |scope| async move {
            self.repo.insert(&scope, note_ref).await
        }).await.or_internal(ERROR_UNKNOWN_WHILE_SAVING_NEW_NOTE)?;

        debug!("Saved note with ID '{}'", note.id);
        Ok(note)
    }

    /// Returns all notes, in no particular order.
    pub(crate) async fn all_notes(&self, scope: &Scope<S::Tx>) -> Result<Vec<Note>> {
        self.repo.all(scope).await.or_internal(ERROR_FETCHING_ALL_NOTES)
    }

    /// Overwrites title and content of the note with ID `id`.
    pub(crate) async fn update_note(
        &self,
        scope: &Scope<S::Tx>,
        id: String,
        input: UpdateNoteInput,
    ) -> Result<Note> {
        validate(&input.title, &input.content)?;

        let note = Note {
            id,
            title: input.title,
            content: input.content,
        };

        let note_ref = &note;
        self.tx.within_transaction(scope, |scope| async move {
            if !self.repo.exists(&scope, &note_ref.id).await? {
                return Err(AppError::for_field(ERROR_NOTE_NOT_FOUND, "id", STATUS_NOT_FOUND).into());
            }
            self.repo.update(&scope, note_ref).await
        }).await.or_internal(ERROR_UNKNOWN_WHILE_UPDATING_NOTE)?;

        debug!("Updated note with ID '{}'", note.id);
        Ok(note)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{Mutex, atomic::{AtomicBool, Ordering}};

    use crate::{
        apperr::{AppError, AppErrors},
        db::{FakeSource, FakeTx, Scope},
        prelude::*,
    };
    use super::{
        ID_ALPHABET, ID_LEN, NewNoteInput, Note, NoteRepository, NoteService,
        UpdateNoteInput, new_id,
    };

    /// Keeps notes in memory. Writes are only allowed inside a transaction.
    #[derive(Default)]
    struct MemoryRepo {
        notes: Mutex<Vec<Note>>,
        fail: AtomicBool,
    }

    impl MemoryRepo {
        fn check(&self, scope: &Scope<FakeTx>) -> Result<()> {
            if scope.transaction().is_none() {
                bail!("write outside of transaction");
            }
            if self.fail.load(Ordering::SeqCst) {
                bail!("disk on fire");
            }
            Ok(())
        }
    }

    impl NoteRepository<FakeTx> for MemoryRepo {
        async fn insert(&self, scope: &Scope<FakeTx>, note: &Note) -> Result<()> {
            self.check(scope)?;
            self.notes.lock().unwrap().push(note.clone());
            Ok(())
        }

        async fn all(&self, _: &Scope<FakeTx>) -> Result<Vec<Note>> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("disk on fire");
            }
            Ok(self.notes.lock().unwrap().clone())
        }

        async fn update(&self, scope: &Scope<FakeTx>, note: &Note) -> Result<()> {
            self.check(scope)?;
            let mut notes = self.notes.lock().unwrap();
            if let Some(existing) = notes.iter_mut().find(|n| n.id == note.id) {
                *existing = note.clone();
            }
            Ok(())
        }

        async fn exists(&self, _: &Scope<FakeTx>, id: &str) -> Result<bool> {
            Ok(self.notes.lock().unwrap().iter().any(|n| n.id == id))
        }
    }

    fn service() -> NoteService<FakeSource, MemoryRepo> {
        NoteService::new(FakeSource::default(), MemoryRepo::default())
    }

    fn input(title: &str, content: &str) -> NewNoteInput {
        NewNoteInput { title: title.into(), content: content.into() }
    }

    fn keys(err: &anyhow::Error) -> Vec<&'static str> {
        match err.downcast_ref::<AppErrors>() {
            Some(errs) => errs.iter().map(|e| e.key).collect(),
            None => vec![err.downcast_ref::<AppError>().expect("not an app error").key],
        }
    }

    #[test]
    fn ids_are_random_and_well_formed() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), ID_LEN);
        assert!(a.bytes().all(|c| ID_ALPHABET.contains(&c)));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn save_new_note() {
        let service = service();
        let note = service.save_new_note(&Scope::detached(), input("A", "B")).await.unwrap();

        assert!(!note.id.is_empty());
        assert_eq!(note.title, "A");
        assert_eq!(note.content, "B");
        assert_eq!(service.tx.source().committed(), vec![0]);
        assert_eq!(service.all_notes(&Scope::detached()).await.unwrap(), vec![note]);
    }

    #[tokio::test]
    async fn no_notes_is_empty_list() {
        let notes = service().all_notes(&Scope::detached()).await.unwrap();
        assert!(notes.is_empty());
    }

    #[tokio::test]
    async fn invalid_input_reports_all_errors() {
        let service = service();
        let long_content = "x".repeat(super::MAX_CONTENT_LEN + 1);
        let err = service.save_new_note(&Scope::detached(), input("  ", &long_content))
            .await
            .unwrap_err();

        assert_eq!(keys(&err), ["errorNoteTitleRequired", "errorNoteContentTooLong"]);
        let fields = err.downcast_ref::<AppErrors>().unwrap()
            .iter()
            .map(|e| (e.field, e.status))
            .collect::<Vec<_>>();
        assert_eq!(fields, [(Some("title"), Some(400)), (Some("content"), Some(400))]);
        assert_eq!(service.tx.source().begun(), 0);

        let long_title = "ä".repeat(super::MAX_TITLE_LEN + 1);
        let err = service.save_new_note(&Scope::detached(), input(&long_title, ""))
            .await
            .unwrap_err();
        assert_eq!(keys(&err), ["errorNoteTitleTooLong"]);

        let ok_title = "ä".repeat(super::MAX_TITLE_LEN);
        service.save_new_note(&Scope::detached(), input(&ok_title, "")).await.unwrap();
    }

    #[tokio::test]
    async fn failed_save_is_rolled_back_and_tagged() {
        let service = service();
        service.repo.fail.store(true, Ordering::SeqCst);
        let err = service.save_new_note(&Scope::detached(), input("A", "B")).await.unwrap_err();

        let app = err.downcast_ref::<AppError>().unwrap();
        assert_eq!(app.key, "errorUnknownWhileSavingNewNote");
        assert_eq!(app.status, Some(500));
        assert!(format!("{:#}", app.source.as_ref().unwrap()).contains("disk on fire"));
        assert_eq!(service.tx.source().rolled_back(), vec![0]);
        assert!(service.tx.source().committed().is_empty());
    }

    #[tokio::test]
    async fn failed_listing_is_tagged() {
        let service = service();
        service.repo.fail.store(true, Ordering::SeqCst);
        let err = service.all_notes(&Scope::detached()).await.unwrap_err();
        assert_eq!(keys(&err), ["errorFetchingAllNotes"]);
    }

    #[tokio::test]
    async fn update_note() {
        let service = service();
        let scope = Scope::detached();
        let note = service.save_new_note(&scope, input("A", "B")).await.unwrap();

        let update = UpdateNoteInput { title: "C".into(), content: "D".into() };
        let updated = service.update_note(&scope, note.id.clone(), update).await.unwrap();
        assert_eq!(updated, Note { id: note.id, title: "C".into(), content: "D".into() });
        assert_eq!(service.all_notes(&scope).await.unwrap(), vec![updated]);
        assert_eq!(service.tx.source().committed(), vec![0, 1]);
    }

    #[tokio::test]
    async fn update_of_missing_note_is_not_found() {
        let service = service();
        let update = UpdateNoteInput { title: "C".into(), content: "D".into() };
        let err = service.update_note(&Scope::detached(), "nope".into(), update)
            .await
            .unwrap_err();

        let app = err.downcast_ref::<AppError>().unwrap();
        assert_eq!(app.key, "errorNoteNotFound");
        assert_eq!(app.field, Some("id"));
        assert_eq!(app.status, Some(404));
        assert_eq!(service.tx.source().rolled_back(), vec![0]);
    }

    #[tokio::test]
    async fn operations_join_transaction_of_caller() {
        let service = service();
        let outer = crate::db::TxManager::new(FakeSource::default());
        let s = &service;

        // The service's own source must not be used when joining.
        outer.within_transaction(&Scope::detached(), |scope| async move {
            s.save_new_note(&scope, input("A", "B")).await?;
            s.save_new_note(&scope, input("C", "D")).await
        }).await.unwrap();

        assert_eq!(service.tx.source().begun(), 0);
        assert_eq!(outer.source().committed(), vec![0]);
        assert_eq!(service.all_notes(&Scope::detached()).await.unwrap().len(), 2);
    }
}
