//! Transactions and the request scope that carries them.
//!
//! Code that wants to run something atomically calls
//! [`TxManager::within_transaction`]. The closure receives a [`Scope`] that
//! carries the open transaction. Passing that scope down to repositories
//! makes them join the transaction instead of opening their own, so that a
//! whole service operation is committed or rolled back as one unit.

use std::{
    future::Future,
    sync::{Arc, atomic::{AtomicU32, Ordering}},
};
use deadpool_postgres::{ClientWrapper, Pool};
use postgres_types::{BorrowToSql, ToSql};
use tokio_postgres::{Row, RowStream};

use crate::prelude::*;
use super::{DbConnection, DbError};


/// Something transactions can be started on. Implemented by the connection
/// pool and by test doubles.
pub(crate) trait TxSource: Send + Sync {
    type Tx: Send + Sync + 'static;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, DbError>> + Send;
    fn commit(&self, tx: Self::Tx) -> impl Future<Output = Result<(), DbError>> + Send;
    fn rollback(&self, tx: Self::Tx) -> impl Future<Output = Result<(), DbError>> + Send;
}


/// Request-scoped value that carries at most one open transaction.
///
/// A scope without transaction is called "detached". Every API request starts
/// with a detached scope. `TxManager::within_transaction` derives a scope
/// carrying a transaction from it.
pub(crate) struct Scope<Tx> {
    tx: Option<Arc<Tx>>,
}

impl<Tx> Clone for Scope<Tx> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<Tx> Scope<Tx> {
    pub(crate) fn detached() -> Self {
        Self { tx: None }
    }

    /// Returns the transaction bound to this scope, if any.
    pub(crate) fn transaction(&self) -> Option<&Arc<Tx>> {
        self.tx.as_ref()
    }

    fn with_transaction(&self, tx: Arc<Tx>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Returns the transaction of this scope if there is one, or starts a new
    /// one on `source` otherwise.
    ///
    /// A newly started transaction is not managed by anyone: the caller has
    /// to settle it via [`Acquired::settle`].
    pub(crate) async fn existing_or_begin<S>(&self, source: &S) -> Result<Acquired<Tx>, DbError>
    where
        S: TxSource<Tx = Tx>,
    {
        match &self.tx {
            Some(tx) => Ok(Acquired::Joined(Arc::clone(tx))),
            None => {
                trace!("No transaction in scope, starting a new one");
                source.begin().await.map(Acquired::Began)
            }
        }
    }
}

/// Result of [`Scope::existing_or_begin`].
#[must_use = "a newly started transaction has to be settled"]
pub(crate) enum Acquired<Tx> {
    /// The transaction of the scope, settled by whoever started it.
    Joined(Arc<Tx>),

    /// A fresh transaction owned by the caller.
    Began(Tx),
}

impl<Tx> Acquired<Tx> {
    pub(crate) fn get(&self) -> &Tx {
        match self {
            Self::Joined(tx) => tx,
            Self::Began(tx) => tx,
        }
    }

    /// Finishes the work done on this transaction. A joined transaction is
    /// left alone and `result` is returned as is. A transaction started by
    /// the caller is committed or rolled back depending on `result`, just
    /// like `within_transaction` does.
    pub(crate) async fn settle<S, T, E>(self, source: &S, result: Result<T, E>) -> Result<T, E>
    where
        S: TxSource<Tx = Tx>,
        E: From<DbError>,
    {
        match self {
            Self::Joined(_) => result,
            Self::Began(tx) => finish(source, tx, result).await,
        }
    }
}


/// Runs logic inside of a single database transaction.
pub(crate) struct TxManager<S> {
    source: S,
}

impl<S: TxSource> TxManager<S> {
    pub(crate) fn new(source: S) -> Self {
        Self { source }
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    /// Runs `f` with a scope carrying a transaction.
    ///
    /// If `scope` already has a transaction, `f` simply joins it and nothing
    /// is committed or rolled back here. Otherwise a new transaction is
    /// started. If `f` returns `Err`, it is rolled back and exactly that
    /// error is returned, even if the rollback fails. If `f` returns `Ok`, it
    /// is committed and a commit failure is returned instead of the value.
    pub(crate) async fn within_transaction<F, Fut, T, E>(
        &self,
        scope: &Scope<S::Tx>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Scope<S::Tx>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if scope.transaction().is_some() {
            return f(scope.clone()).await;
        }

        let tx = match self.source.begin().await {
            Ok(tx) => Arc::new(tx),
            Err(e) => {
                error!("Failed to begin transaction: {e}");
                return Err(e.into());
            }
        };

        let out = f(scope.with_transaction(Arc::clone(&tx))).await;

        // All scopes handed to `f` must be gone by now. If not, the
        // transaction is dropped, and an error of `f` still takes precedence.
        let tx = match Arc::try_unwrap(tx) {
            Ok(tx) => tx,
            Err(_) => {
                error!("BUG: transaction scope outlived `within_transaction`. \
                    Dropping transaction without commit.");
                return out.and(Err(DbError::ScopeLeaked.into()));
            }
        };

        finish(&self.source, tx, out).await
    }
}

/// Commits `tx` if `result` is `Ok`, and rolls back otherwise.
async fn finish<S, T, E>(source: &S, tx: S::Tx, result: Result<T, E>) -> Result<T, E>
where
    S: TxSource,
    E: From<DbError>,
{
    match result {
        Ok(v) => match source.commit(tx).await {
            Ok(()) => Ok(v),
            Err(e) => {
                error!("Failed to commit transaction: {e}");
                Err(e.into())
            }
        },
        Err(e) => {
            // A failed rollback never replaces the error of `f`.
            if let Err(rollback_err) = source.rollback(tx).await {
                error!("Failed to roll back transaction: {rollback_err}");
            }
            Err(e)
        }
    }
}


/// A database transaction on a connection checked out from the pool.
///
/// The connection is returned to the pool after `commit` or `rollback`. If
/// the transaction is dropped without either (e.g. because the request future
/// was cancelled), the connection is detached from the pool and closed, which
/// makes the server roll back.
pub(crate) struct Transaction {
    conn: Option<DbConnection>,
    num_queries: AtomicU32,
}

impl Transaction {
    pub(crate) async fn begin(conn: DbConnection) -> Result<Self, DbError> {
        conn.batch_execute("begin").await?;
        Ok(Self { conn: Some(conn), num_queries: AtomicU32::new(0) })
    }

    pub(crate) async fn commit(mut self) -> Result<(), DbError> {
        let conn = self.take_conn();
        trace!("Committing transaction after {} queries", self.num_queries());
        match conn.batch_execute("commit").await {
            Ok(()) => Ok(()),
            Err(e) => {
                // We don't know what state the connection is in.
                drop(DbConnection::take(conn));
                Err(e.into())
            }
        }
    }

    pub(crate) async fn rollback(mut self) -> Result<(), DbError> {
        let conn = self.take_conn();
        trace!("Rolling back transaction after {} queries", self.num_queries());
        match conn.batch_execute("rollback").await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(DbConnection::take(conn));
                Err(e.into())
            }
        }
    }

    pub(crate) fn num_queries(&self) -> u32 {
        self.num_queries.load(Ordering::SeqCst)
    }

    /// Returns a client that executes on this transaction.
    pub(crate) fn client(&self) -> DbClient<'_> {
        DbClient::Tx(self)
    }

    fn conn(&self) -> &ClientWrapper {
        self.conn.as_ref().expect("connection is only taken when settling the transaction")
    }

    fn take_conn(&mut self) -> DbConnection {
        self.conn.take().expect("transaction settled twice")
    }

    fn increase_num_queries(&self) {
        self.num_queries.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("Transaction dropped without commit or rollback, closing its connection");
            drop(DbConnection::take(conn));
        }
    }
}

impl TxSource for Pool {
    type Tx = Transaction;

    async fn begin(&self) -> Result<Transaction, DbError> {
        let conn = self.get().await?;
        Transaction::begin(conn).await
    }

    async fn commit(&self, tx: Transaction) -> Result<(), DbError> {
        tx.commit().await
    }

    async fn rollback(&self, tx: Transaction) -> Result<(), DbError> {
        tx.rollback().await
    }
}


impl Scope<Transaction> {
    /// Returns a client that executes on the transaction of this scope, or on
    /// a connection freshly checked out from `pool` if there is none. Callers
    /// do not need to care which one it is.
    pub(crate) async fn client(&self, pool: &Pool) -> Result<DbClient<'_>, DbError> {
        match self.transaction() {
            Some(tx) => Ok(tx.client()),
            None => Ok(DbClient::Pooled(pool.get().await?)),
        }
    }
}

/// Executes queries either on a transaction or directly on a connection.
///
/// All queries go through the statement cache of the connection. That costs
/// a lock and a hashmap lookup per query, but is a lot cheaper than preparing
/// the statement again each time.
pub(crate) enum DbClient<'a> {
    Tx(&'a Transaction),
    Pooled(DbConnection),
}

impl DbClient<'_> {
    fn raw(&self) -> &ClientWrapper {
        match self {
            Self::Tx(tx) => {
                tx.increase_num_queries();
                tx.conn()
            }
            Self::Pooled(conn) => &**conn,
        }
    }

    pub(crate) async fn query_one(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, DbError> {
        trace!("Executing SQL query: \"{}\" with {:?}", query, params);
        let client = self.raw();
        let statement = client.prepare_cached(query).await?;
        Ok(client.query_one(&statement, params).await?)
    }

    pub(crate) async fn query_raw<P, I>(&self, query: &str, params: I) -> Result<RowStream, DbError>
    where
        P: BorrowToSql,
        I: IntoIterator<Item = P> + std::fmt::Debug,
        I::IntoIter: ExactSizeIterator,
    {
        trace!("Executing SQL query: \"{}\" with {:?}", query, params);
        let client = self.raw();
        let statement = client.prepare_cached(query).await?;
        Ok(client.query_raw(&statement, params).await?)
    }

    /// Runs `query` and maps every returned row with `f`. Returns an empty
    /// `Vec` if there are no rows.
    pub(crate) async fn query_mapped<P, I, F, T>(
        &self,
        query: &str,
        params: I,
        f: F,
    ) -> Result<Vec<T>, DbError>
    where
        P: BorrowToSql,
        I: IntoIterator<Item = P> + std::fmt::Debug,
        I::IntoIter: ExactSizeIterator,
        F: FnMut(Row) -> T,
    {
        let mut f = f;
        self.query_raw(query, params)
            .await?
            .map_ok(|row| f(row))
            .try_collect()
            .await
            .map_err(DbError::from)
    }

    pub(crate) async fn execute(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, DbError> {
        trace!("Executing SQL query: \"{}\" with {:?}", query, params);
        let client = self.raw();
        let statement = client.prepare_cached(query).await?;
        Ok(client.execute(&statement, params).await?)
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex, atomic::{AtomicBool, AtomicUsize, Ordering}};
    use deadpool_postgres::PoolError;

    use super::{Acquired, DbError, Scope, TxManager, TxSource};


    /// Transaction handle of `FakeSource`.
    #[derive(Debug)]
    pub(crate) struct FakeTx {
        pub(crate) id: usize,
    }

    /// A `TxSource` that only records what happens.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        next_id: AtomicUsize,
        pub(crate) fail_begin: AtomicBool,
        pub(crate) fail_commit: AtomicBool,
        pub(crate) fail_rollback: AtomicBool,
        pub(crate) committed: Mutex<Vec<usize>>,
        pub(crate) rolled_back: Mutex<Vec<usize>>,
    }

    impl FakeSource {
        pub(crate) fn begun(&self) -> usize {
            self.next_id.load(Ordering::SeqCst)
        }

        pub(crate) fn committed(&self) -> Vec<usize> {
            self.committed.lock().unwrap().clone()
        }

        pub(crate) fn rolled_back(&self) -> Vec<usize> {
            self.rolled_back.lock().unwrap().clone()
        }
    }

    impl TxSource for FakeSource {
        type Tx = FakeTx;

        async fn begin(&self) -> Result<FakeTx, DbError> {
            if self.fail_begin.load(Ordering::SeqCst) {
                return Err(PoolError::Closed.into());
            }
            Ok(FakeTx { id: self.next_id.fetch_add(1, Ordering::SeqCst) })
        }

        async fn commit(&self, tx: FakeTx) -> Result<(), DbError> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(PoolError::Closed.into());
            }
            self.committed.lock().unwrap().push(tx.id);
            Ok(())
        }

        async fn rollback(&self, tx: FakeTx) -> Result<(), DbError> {
            if self.fail_rollback.load(Ordering::SeqCst) {
                return Err(PoolError::Closed.into());
            }
            self.rolled_back.lock().unwrap().push(tx.id);
            Ok(())
        }
    }

    #[derive(Debug)]
    enum TestError {
        Logic(u32),
        Db(DbError),
    }

    impl From<DbError> for TestError {
        fn from(e: DbError) -> Self {
            Self::Db(e)
        }
    }

    fn manager() -> TxManager<FakeSource> {
        TxManager::new(FakeSource::default())
    }

    #[tokio::test]
    async fn scope_carries_transaction() {
        let manager = manager();
        let scope = Scope::detached();
        assert!(scope.transaction().is_none());

        let id = manager.within_transaction(&scope, |scope| async move {
            let tx = scope.transaction().expect("no transaction in scope");
            Ok::<_, TestError>(tx.id)
        }).await.unwrap();

        assert_eq!(manager.source().committed(), vec![id]);
        assert!(manager.source().rolled_back().is_empty());
    }

    #[tokio::test]
    async fn error_of_closure_is_returned_unchanged() {
        let manager = manager();
        let res = manager.within_transaction(&Scope::detached(), |_| async {
            Err::<(), _>(TestError::Logic(7))
        }).await;

        assert!(matches!(res, Err(TestError::Logic(7))));
        assert_eq!(manager.source().rolled_back(), vec![0]);
        assert!(manager.source().committed().is_empty());
    }

    #[tokio::test]
    async fn rollback_failure_does_not_mask_error() {
        let manager = manager();
        manager.source().fail_rollback.store(true, Ordering::SeqCst);
        let res = manager.within_transaction(&Scope::detached(), |_| async {
            Err::<(), _>(TestError::Logic(3))
        }).await;

        assert!(matches!(res, Err(TestError::Logic(3))));
    }

    #[tokio::test]
    async fn commit_failure_is_returned() {
        let manager = manager();
        manager.source().fail_commit.store(true, Ordering::SeqCst);
        let res = manager.within_transaction(&Scope::detached(), |_| async {
            Ok::<_, TestError>(42)
        }).await;

        assert!(matches!(res, Err(TestError::Db(DbError::Pool(PoolError::Closed)))));
    }

    #[tokio::test]
    async fn begin_failure_skips_closure() {
        let manager = manager();
        manager.source().fail_begin.store(true, Ordering::SeqCst);
        let called = AtomicBool::new(false);
        let res = manager.within_transaction(&Scope::detached(), |_| async {
            called.store(true, Ordering::SeqCst);
            Ok::<_, TestError>(())
        }).await;

        assert!(matches!(res, Err(TestError::Db(_))));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn nested_calls_join_outer_transaction() {
        let manager = manager();
        let m = &manager;
        manager.within_transaction(&Scope::detached(), |outer| async move {
            let outer_tx = Arc::clone(outer.transaction().unwrap());

            m.within_transaction(&outer, |inner| async move {
                assert!(Arc::ptr_eq(inner.transaction().unwrap(), &outer_tx));
                Ok::<_, TestError>(())
            }).await?;

            let a = outer.existing_or_begin(m.source()).await?;
            let b = outer.existing_or_begin(m.source()).await?;
            match (&a, &b) {
                (Acquired::Joined(a), Acquired::Joined(b)) => assert!(Arc::ptr_eq(a, b)),
                _ => panic!("expected to join the existing transaction"),
            }
            a.settle(m.source(), Ok::<_, TestError>(())).await?;
            b.settle(m.source(), Ok::<_, TestError>(())).await
        }).await.unwrap();

        // Only the outer transaction was ever started and committed.
        assert_eq!(manager.source().begun(), 1);
        assert_eq!(manager.source().committed(), vec![0]);
    }

    #[tokio::test]
    async fn nested_error_rolls_back_outer_once() {
        let manager = manager();
        let m = &manager;
        let res = manager.within_transaction(&Scope::detached(), |outer| async move {
            m.within_transaction(&outer, |_| async { Err::<(), _>(TestError::Logic(1)) })
                .await
        }).await;

        assert!(matches!(res, Err(TestError::Logic(1))));
        assert_eq!(manager.source().begun(), 1);
        assert_eq!(manager.source().rolled_back(), vec![0]);
    }

    #[tokio::test]
    async fn detached_scope_begins_unmanaged_transaction() {
        let source = FakeSource::default();
        let scope = Scope::detached();

        let acquired = scope.existing_or_begin(&source).await.unwrap();
        assert!(matches!(acquired, Acquired::Began(_)));
        acquired.settle(&source, Ok::<_, TestError>(())).await.unwrap();
        assert_eq!(source.committed(), vec![0]);

        let acquired = scope.existing_or_begin(&source).await.unwrap();
        let res = acquired.settle(&source, Err::<(), _>(TestError::Logic(2))).await;
        assert!(matches!(res, Err(TestError::Logic(2))));
        assert_eq!(source.rolled_back(), vec![1]);
    }

    #[tokio::test]
    async fn leaked_scope_is_reported() {
        let manager = manager();
        let stash = Mutex::new(None);
        let stash_ref = &stash;
        let res = manager.within_transaction(&Scope::detached(), |scope| async move {
            *stash_ref.lock().unwrap() = Some(scope);
            Ok::<_, TestError>(())
        }).await;

        assert!(matches!(res, Err(TestError::Db(DbError::ScopeLeaked))));
        assert!(manager.source().committed().is_empty());
    }

    #[tokio::test]
    async fn error_wins_over_leaked_scope() {
        let manager = manager();
        let stash = Mutex::new(None);
        let stash_ref = &stash;
        let res = manager.within_transaction(&Scope::detached(), |scope| async move {
            *stash_ref.lock().unwrap() = Some(scope);
            Err::<(), _>(TestError::Logic(5))
        }).await;

        assert!(matches!(res, Err(TestError::Logic(5))));
        assert!(manager.source().committed().is_empty());
        assert!(manager.source().rolled_back().is_empty());
    }
}
