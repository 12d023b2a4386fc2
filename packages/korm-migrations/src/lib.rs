//! SQL script migrations: script discovery, options and the history table.
//! The runner that locks and drives these lives in `korm::infra`.

pub mod error;
pub mod history;
pub mod options;
pub mod providers;
pub mod script;

pub use error::ScriptError;
pub use history::{AppliedMigration, HISTORY_TABLE};
pub use options::{MigrationOptions, PlaceholderStrategy, ScriptStrategy, ScriptsProvider};
pub use providers::{DirectoryScriptsProvider, EmbeddedScriptsProvider};
pub use script::MigrationScript;

use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, TransactionTrait};

/// Outcome of [`apply_pending`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<AppliedMigration>,
    pub last_id: Option<i64>,
}

/// Scripts newer than the last applied migration, in id order.
pub fn pending_scripts(
    scripts: Vec<MigrationScript>,
    last_applied: Option<i64>,
) -> Vec<MigrationScript> {
    scripts
        .into_iter()
        .filter(|s| last_applied.is_none_or(|last| s.id > last))
        .collect()
}

/// Apply every pending script. Each script runs in its own transaction
/// together with its history row; the first failure stops the run.
pub async fn apply_pending(
    db: &DatabaseConnection,
    options: &MigrationOptions,
) -> Result<MigrationReport, ScriptError> {
    let scripts = options.collect_scripts()?;
    let defined = scripts.len();

    history::ensure_history_table(db).await?;
    let applied = history::applied_migrations(db).await?;
    let last_applied = applied.last().map(|m| m.id);
    let pending = pending_scripts(scripts, last_applied);

    tracing::info!(
        "▶ profile={:?} defined={} applied={} pending={}",
        db.get_database_backend(),
        defined,
        applied.len(),
        pending.len()
    );

    let mut report = MigrationReport {
        applied: Vec::with_capacity(pending.len()),
        last_id: last_applied,
    };

    for script in &pending {
        let txn = db.begin().await?;

        if let Err(source) = txn.execute_unprepared(&script.sql).await {
            tracing::error!("❌ migration {} '{}' failed: {source}", script.id, script.name);
            return Err(ScriptError::Apply {
                id: script.id,
                name: script.name.clone(),
                source,
            });
        }
        history::record_migration(&txn, script).await?;
        txn.commit().await?;

        tracing::info!(migration_id = script.id, name = %script.name, "migration applied");
        report.applied.push(AppliedMigration {
            id: script.id,
            name: script.name.clone(),
        });
        report.last_id = Some(script.id);
    }

    tracing::info!("✅ {} migration(s) applied", report.applied.len());
    Ok(report)
}

/// True when the history table exists and already covers the newest script.
pub async fn is_up_to_date(
    db: &DatabaseConnection,
    options: &MigrationOptions,
) -> Result<bool, ScriptError> {
    if !history::history_table_exists(db).await? {
        return Ok(false);
    }

    let expected_last = options.collect_scripts()?.last().map(|s| s.id);
    let current_last = latest_applied_migration(db).await?.map(|m| m.id);

    Ok(match (expected_last, current_last) {
        (None, _) => true,
        (Some(expected), Some(current)) => current >= expected,
        (Some(_), None) => false,
    })
}

/// Number of applied migrations; 0 when the history table does not exist yet.
pub async fn count_applied_migrations(db: &DatabaseConnection) -> Result<usize, DbErr> {
    if !history::history_table_exists(db).await? {
        return Ok(0);
    }
    Ok(history::applied_migrations(db).await?.len())
}

/// The newest applied migration, if any.
pub async fn latest_applied_migration(
    db: &DatabaseConnection,
) -> Result<Option<AppliedMigration>, DbErr> {
    if !history::history_table_exists(db).await? {
        return Ok(None);
    }
    Ok(history::applied_migrations(db).await?.pop())
}
