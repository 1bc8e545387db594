use std::{
    convert::Infallible,
    io,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::Command,
};
use deadpool_postgres::ClientWrapper;
use secrecy::ExposeSecret;
use tokio_postgres::{IsolationLevel, config::Host};

use crate::{prelude::*, config::Config};
use super::{DbConfig, create_pool, query, util::quote_ident};


#[derive(Debug, clap::Subcommand)]
pub(crate) enum DbCommand {
    /// Drops all notes and tables by recreating the `public` schema. Asks for
    /// confirmation first.
    Clear,

    /// Executes the statements of an SQL file on the configured database.
    Script {
        /// The `.sql` file to execute.
        script: PathBuf,
    },

    /// Brings the schema up to date. `serve` does this on startup as well.
    Migrate,

    /// Opens an interactive `psql` session on the configured database.
    /// `psql` has to be installed and in your `PATH`.
    Console,

    /// `db clear` and `db migrate` in one go.
    Reset,
}

/// Entry point for `db` commands.
pub(crate) async fn run(cmd: &DbCommand, config: &Config) -> Result<()> {
    if let DbCommand::Console = cmd {
        return console(&config.db).map(|_| ());
    }

    let pool = create_pool(&config.db).await?;
    let mut db = pool.get().await?;

    match cmd {
        DbCommand::Clear => clear(&mut db, &config.db).await?,
        DbCommand::Migrate => super::migrate(&mut db).await?,
        DbCommand::Reset => {
            clear(&mut db, &config.db).await?;
            super::migrate(&mut db).await?;
        }
        DbCommand::Script { script } => run_script(&db, script).await?,
        DbCommand::Console => unreachable!("handled above"),
    }

    Ok(())
}


/// Recreates the `public` schema after the user confirmed which database is
/// about to be wiped.
async fn clear(db: &mut ClientWrapper, config: &DbConfig) -> Result<()> {
    let pg_config = config.pg_config()?;
    let tx = db.build_transaction()
        .isolation_level(IsolationLevel::Serializable)
        .start()
        .await?;

    warn!("About to drop the 'public' schema, including all notes!");

    println!();
    if let Ok(Ok(hostname)) = hostname::get().map(|n| n.into_string()) {
        println!("Running on: {hostname}");
    }
    println!("Target: {}", describe_target(&pg_config));
    println!();

    let tables = query::all_table_names(&*tx).await?;
    if tables.is_empty() {
        println!("The schema contains no tables.");
    } else {
        println!("Tables that will be dropped:");
        for name in &tables {
            let num_rows = query::row_count(&*tx, name).await?;
            println!(" - {name} ({num_rows} rows)");
        }
    }

    println!();
    println!("Type 'yes' to drop everything in this database.");
    crate::cmd::prompt_for_yes()?;

    for statement in reset_schema_statements(pg_config.get_user()) {
        tx.batch_execute(&statement).await
            .with_context(|| format!("failed to execute '{statement}'"))?;
    }
    tx.commit().await.context("failed to commit clear transaction")?;

    info!("Dropped and recreated schema 'public'");
    Ok(())
}

/// Human readable description of the database `pg_config` points to.
fn describe_target(pg_config: &tokio_postgres::Config) -> String {
    let hosts = pg_config.get_hosts().iter()
        .map(|h| match h {
            Host::Tcp(host) => host.clone(),
            Host::Unix(path) => path.display().to_string(),
        })
        .collect::<Vec<_>>();
    let host = if hosts.is_empty() { "<default host>".to_owned() } else { hosts.join(",") };

    format!(
        "database '{}' as user '{}' on {host}",
        pg_config.get_dbname().unwrap_or("<default>"),
        pg_config.get_user().unwrap_or("<default>"),
    )
}

/// Statements that drop the `public` schema and recreate it empty, with
/// privileges for `user` and everyone.
fn reset_schema_statements(user: Option<&str>) -> Vec<String> {
    let mut out = vec![
        "drop schema public cascade".to_owned(),
        "create schema public".to_owned(),
    ];
    if let Some(user) = user {
        out.push(format!("grant all on schema public to {}", quote_ident(user)));
    }
    out.push("grant all on schema public to public".to_owned());
    out
}

async fn run_script(db: &ClientWrapper, script_path: &Path) -> Result<()> {
    let script = tokio::fs::read_to_string(script_path)
        .await
        .with_context(|| format!("failed to read '{}'", script_path.display()))?;

    debug!("Executing script '{}'", script_path.display());
    db.batch_execute(&script).await.context("failed to execute script")?;
    info!("Executed '{}'", script_path.display());

    Ok(())
}

/// Replaces this process with `psql`. Only returns on error.
fn console(config: &DbConfig) -> Result<Infallible> {
    let error = psql_command(config)?.exec();
    let message = match error.kind() {
        io::ErrorKind::NotFound => "`psql` was not found in your `PATH`",
        io::ErrorKind::PermissionDenied => "not allowed to execute `psql`",
        _ => "failed to execute `psql`",
    };
    Err(error).context(message)
}

fn psql_command(config: &DbConfig) -> Result<Command> {
    let url = config.url.as_ref().ok_or_else(|| anyhow!("`db.url` is not set"))?;
    let mut cmd = Command::new("psql");
    cmd.arg(url.expose_secret());
    Ok(cmd)
}
