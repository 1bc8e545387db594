use tokio_postgres::Row;


/// Helper macro to pass arguments to `query_raw` and similar calls.
///
/// Helps you with casting to `&dyn ToSql` and type inference. Note: use `[]` for
/// the macro invocation, e.g. `dbargs![]`.
macro_rules! dbargs {
    () => {
        [] as [&(dyn postgres_types::ToSql + Sync); 0]
    };
    ($($arg:expr),+ $(,)?) => {
        [$($arg as &(dyn postgres_types::ToSql + Sync)),+]
    };
}

pub(crate) use dbargs;


/// Something that can be loaded from one DB row. `COLUMNS` is the selection
/// (to be put between `select` and `from`) that `from_row` expects, in that
/// order.
pub(crate) trait FromRow: Sized {
    const COLUMNS: &'static str;

    fn from_row(row: &Row) -> Self;
}

/// Quotes `ident` so that it can be used as identifier in SQL, e.g. a table
/// or role name.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
