use chrono::{DateTime, NaiveDateTime, Utc, offset::TimeZone};
use deadpool_postgres::{ClientWrapper, Transaction};
use once_cell::sync::Lazy;
use std::{collections::BTreeMap, time::Duration, num::NonZeroU64};
use tokio_postgres::{IsolationLevel, error::SqlState};

use crate::prelude::*;


/// Describes the actions needed to bring the database into a state that we
/// expect.
pub(crate) enum MigrationPlan {
    /// The database is completely empty: we need to create the meta table and
    /// apply all migrations.
    EmptyDb,

    /// The database is completely up to date and all migrations match.
    UpToDate,

    /// The DB can be migrated to the state we expect by applying that many new
    /// migrations.
    Migrate {
        new_migrations: NonZeroU64,
    },
}

impl MigrationPlan {
    /// Builds a migration plan by querying the current state of the DB. If the
    /// DB is in a state that we cannot fix, `Err` is returned. Does not modify
    /// the DB.
    pub(crate) async fn build(tx: &Transaction<'_>) -> Result<Self> {
        if !super::query::does_table_exist(&**tx, "__db_migrations").await? {
            // Check if there are any other tables in the database, which would be fishy.
            let tables = super::query::all_table_names(&**tx).await?;
            if !tables.is_empty() {
                bail!(
                    "migration table '__db_migrations' does not exist, but some other \
                        tables ({}) do exist. This should not happen.",
                    tables.join(", "),
                );
            }

            return Ok(Self::EmptyDb);
        }

        /// The migration data from the DB.
        #[derive(Debug)]
        struct RawMigration {
            name: String,
            applied_on: DateTime<Utc>,
            script: String,
        }

        debug!("Checking DB migrations");

        let active_migrations = tx
            .query_raw("select id, name, applied_on, script from __db_migrations", dbargs![])
            .await
            .context("failed to query meta migrations table")?
            .map_ok(|row| (
                row.get::<_, i64>("id") as u64,
                RawMigration {
                    name: row.get("name"),
                    applied_on: Utc.from_utc_datetime(&row.get::<_, NaiveDateTime>("applied_on")),
                    script: row.get("script"),
                }
            ))
            .try_collect::<BTreeMap<_, _>>()
            .await?;

        check_active_migrations(&active_migrations.iter()
            .map(|(id, m)| (*id, (m.name.as_str(), m.script.as_str(), m.applied_on)))
            .collect())?;

        // We already know that `MIGRATIONS` contains at least as many elements
        // as `active_migrations`, therefore we can subtract here.
        match NonZeroU64::new(MIGRATIONS.len() as u64 - active_migrations.len() as u64) {
            None => Ok(Self::UpToDate),
            Some(new_migrations) => Ok(Self::Migrate { new_migrations }),
        }
    }

    /// Executes this plan on the database, bringing it into the state we expect.
    pub(crate) async fn execute(&self, tx: &Transaction<'_>) -> Result<()> {
        let new_migrations = match self {
            Self::UpToDate => {
                info!("All migrations are already applied: database schema is up to date.");
                return Ok(());
            }
            Self::EmptyDb => {
                info!("Database is empty. Creating table '__db_migrations'...");
                tx.batch_execute(include_str!("db-migrations.sql"))
                    .await
                    .context("could not create migrations meta table")?;
                MIGRATIONS.len() as u64
            }
            Self::Migrate { new_migrations } => new_migrations.get(),
        };

        // Apply missing migrations in order.
        info!("The database is missing {new_migrations} migrations. Applying them now.");
        for (id, migration) in MIGRATIONS.range(MIGRATIONS.len() as u64 - new_migrations + 1..) {
            debug!("Applying migration '{}-{}' ...", id, migration.name);
            trace!("Executing:\n{}", migration.script);

            tx.batch_execute(migration.script)
                .await
                .context(format!("failed to run script for '{}-{}'", id, migration.name))?;

            let query = "insert into __db_migrations (id, name, applied_on, script) \
                values ($1, $2, now() at time zone 'utc', $3)";
            tx.execute(query, &[&(*id as i64), &migration.name, &migration.script])
                .await
                .context("failed to update __db_migrations")?;
        }

        info!("Applied {new_migrations} migrations. DB is up to date now.");

        Ok(())
    }
}

/// Makes sure the migrations found in the DB are exactly a prefix of the ones
/// this application knows about.
fn check_active_migrations(
    active: &BTreeMap<u64, (&str, &str, DateTime<Utc>)>,
) -> Result<()> {
    if !active.keys().copied().eq(1..active.len() as u64 + 1) {
        bail!("The IDs of the active migrations are not consecutive. This is unexpected.");
    }

    for (id, (name, script, applied_on)) in active {
        let expected = MIGRATIONS.get(id).ok_or_else(|| anyhow!(
            "The migration '{id}-{name}' is active in the database (applied on {applied_on}), \
                but no such migration is known to this application. This is unexpected.",
        ))?;

        if *script != expected.script {
            debug!("Expected script for '{id}-{}':\n{}", expected.name, expected.script);
            debug!("Actual (in database) script for '{id}-{name}':\n{script}");

            bail!(
                "The script of active migration '{id}-{name}' (applied on {applied_on}) does \
                    not match the expected script for that migration. This is unexpected.",
            );
        }
    }

    Ok(())
}


/// Makes sure the database schema is up to date by checking the active
/// migrations and applying all missing ones.
///
/// If anything unexpected is noticed, an error is returned to notify the user
/// they have to manually deal with it.
pub(crate) async fn migrate(db: &mut ClientWrapper) -> Result<()> {
    // The whole migration process is wrapped in one serializable transaction.
    // This guarantees that only one node ever does the migrations.
    //
    // Serializable transactions can fail when committing them, so we retry.
    // In the second iteration we expect to observe the migrations committed
    // by the other node.
    loop {
        let tx = db.build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await?;

        let plan = MigrationPlan::build(&tx).await?;
        plan.execute(&tx).await?;

        match tx.commit().await {
            Ok(_) => return Ok(()),

            Err(e) if e.code() == Some(&SqlState::T_R_SERIALIZATION_FAILURE) => {
                let backoff_duration = Duration::from_millis(500);
                warn!(
                    "Database migration transaction failed to commit. This is likely because \
                    another node executed the same transaction concurrently. \
                    Will try again in {:?}.",
                    backoff_duration,
                );

                tokio::time::sleep(backoff_duration).await;
                continue;
            }

            Err(e) => Err(e)?,
        }
    }
}

// Helper macro to include migrations in the `migations` folder and add them to
// a map.
macro_rules! include_migrations {
    ( $( $id:literal : $name:literal ,)+ ) => {
        Lazy::new(|| {
            let mut m = BTreeMap::new();
            $(
                let prev = m.insert($id, Migration {
                    name: $name,
                    script: include_str!(
                        concat!("migrations/", stringify!($id), "-", $name, ".sql")
                    ),
                });

                assert!(prev.is_none(), "duplicate key in `include_migrations!`");
            )+

            if !m.keys().copied().eq(1..m.len() as u64 + 1) {
                panic!("migration IDs in `include_migrations!` are not consecutive");
            }

            m
        })

    };
}

#[derive(Debug)]
struct Migration {
    name: &'static str,
    script: &'static str,
}

static MIGRATIONS: Lazy<BTreeMap<u64, Migration>> = include_migrations![
    01: "notes",
];


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use chrono::Utc;

    use super::{MIGRATIONS, check_active_migrations};

    #[test]
    fn known_migrations_are_consecutive() {
        assert!(MIGRATIONS.keys().copied().eq(1..MIGRATIONS.len() as u64 + 1));
        assert!(MIGRATIONS[&1].script.contains("create table notes"));
    }

    #[test]
    fn matching_prefix_is_accepted() {
        let m = &MIGRATIONS[&1];
        let active = BTreeMap::from([(1, (m.name, m.script, Utc::now()))]);
        check_active_migrations(&active).unwrap();
        check_active_migrations(&BTreeMap::new()).unwrap();
    }

    #[test]
    fn changed_script_is_rejected() {
        let active = BTreeMap::from([(1, ("notes", "create table foo ();", Utc::now()))]);
        check_active_migrations(&active).unwrap_err();
    }

    #[test]
    fn unknown_or_gapped_migrations_are_rejected() {
        let m = &MIGRATIONS[&1];
        let gap = BTreeMap::from([(2, (m.name, m.script, Utc::now()))]);
        check_active_migrations(&gap).unwrap_err();

        let unknown = BTreeMap::from([
            (1, (m.name, m.script, Utc::now())),
            (2, ("future", "select 1;", Utc::now())),
        ]);
        check_active_migrations(&unknown).unwrap_err();
    }
}
