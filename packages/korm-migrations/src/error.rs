use std::path::PathBuf;

use sea_orm::DbErr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("invalid migration script name '{name}': expected '<id>_<name>.sql'")]
    InvalidName { name: String },
    #[error("duplicate migration id {id}: '{first}' and '{second}'")]
    DuplicateId {
        id: i64,
        first: String,
        second: String,
    },
    #[error("failed to read migration scripts from '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("migration {id} '{name}' failed: {source}")]
    Apply {
        id: i64,
        name: String,
        #[source]
        source: DbErr,
    },
    #[error(transparent)]
    Db(#[from] DbErr),
}
