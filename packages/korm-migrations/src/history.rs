use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr};
use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_query::{ColumnDef, Order, Query, Table};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::script::MigrationScript;

pub const HISTORY_TABLE: &str = "__korm_migrations_history";

/// Written to every history row so a database records which tool applied it.
pub const PRODUCT_INFO: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

#[derive(Iden)]
enum KormMigrationsHistory {
    #[iden = "__korm_migrations_history"]
    Table,
    MigrationId,
    MigrationName,
    ProductInfo,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub id: i64,
    pub name: String,
}

pub async fn history_table_exists(db: &DatabaseConnection) -> Result<bool, DbErr> {
    SchemaManager::new(db).has_table(HISTORY_TABLE).await
}

pub async fn ensure_history_table(db: &DatabaseConnection) -> Result<(), DbErr> {
    SchemaManager::new(db)
        .create_table(
            Table::create()
                .table(KormMigrationsHistory::Table)
                .if_not_exists()
                .col(
                    ColumnDef::new(KormMigrationsHistory::MigrationId)
                        .big_integer()
                        .not_null()
                        .primary_key(),
                )
                .col(
                    ColumnDef::new(KormMigrationsHistory::MigrationName)
                        .string()
                        .not_null(),
                )
                .col(
                    ColumnDef::new(KormMigrationsHistory::ProductInfo)
                        .string()
                        .not_null(),
                )
                .col(
                    ColumnDef::new(KormMigrationsHistory::Updated)
                        .string()
                        .not_null(),
                )
                .to_owned(),
        )
        .await
}

/// Applied migrations ordered by id.
pub async fn applied_migrations<C>(db: &C) -> Result<Vec<AppliedMigration>, DbErr>
where
    C: ConnectionTrait,
{
    let select = Query::select()
        .columns([
            KormMigrationsHistory::MigrationId,
            KormMigrationsHistory::MigrationName,
        ])
        .from(KormMigrationsHistory::Table)
        .order_by(KormMigrationsHistory::MigrationId, Order::Asc)
        .to_owned();

    let backend = db.get_database_backend();
    db.query_all(backend.build(&select))
        .await?
        .iter()
        .map(|row| {
            Ok(AppliedMigration {
                id: row.try_get("", "migration_id")?,
                name: row.try_get("", "migration_name")?,
            })
        })
        .collect()
}

pub async fn record_migration<C>(db: &C, script: &MigrationScript) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let updated = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| DbErr::Custom(format!("failed to format migration timestamp: {e}")))?;

    let mut insert = Query::insert();
    insert
        .into_table(KormMigrationsHistory::Table)
        .columns([
            KormMigrationsHistory::MigrationId,
            KormMigrationsHistory::MigrationName,
            KormMigrationsHistory::ProductInfo,
            KormMigrationsHistory::Updated,
        ])
        .values([
            script.id.into(),
            script.name.clone().into(),
            PRODUCT_INFO.into(),
            updated.into(),
        ])
        .map_err(|e| DbErr::Custom(format!("failed to build history insert: {e}")))?;

    let backend = db.get_database_backend();
    db.execute(backend.build(&insert)).await?;
    Ok(())
}
