use crate::error::ScriptError;

/// A single migration: a numeric id that orders it, a human readable name and
/// the SQL to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub id: i64,
    pub name: String,
    pub sql: String,
}

impl MigrationScript {
    pub fn new(id: i64, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            sql: sql.into(),
        }
    }

    /// Parse a script from its file name (`<id>_<name>.sql`) and contents.
    pub fn from_file_name(file_name: &str, sql: impl Into<String>) -> Result<Self, ScriptError> {
        let invalid = || ScriptError::InvalidName {
            name: file_name.to_string(),
        };

        let stem = match file_name.rsplit_once('.') {
            Some((stem, ext)) if ext.eq_ignore_ascii_case("sql") => stem,
            _ => return Err(invalid()),
        };
        let (id, name) = stem.split_once('_').ok_or_else(invalid)?;
        let id = id.parse::<i64>().map_err(|_| invalid())?;

        if name.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(id, name, sql))
    }
}
