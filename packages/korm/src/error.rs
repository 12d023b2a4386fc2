use korm_migrations::ScriptError;
use sea_orm::DbErr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KormError {
    #[error("Argument '{name}' is missing")]
    ArgumentMissing { name: &'static str },
    #[error("Configuration section '{section}' is missing")]
    ConfigurationSectionMissing { section: String },
    #[error("Configuration error: {message}")]
    Configuration { message: String },
    #[error("Unsupported database provider '{provider}'")]
    UnsupportedProvider { provider: String },
    #[error("Service '{service}' is not registered")]
    ServiceNotRegistered { service: &'static str },
    #[error("Lock error: {message}")]
    Lock { message: String },
    #[error("Migration timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u128 },
    #[error(transparent)]
    Migration(#[from] ScriptError),
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KormError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }

    pub fn section_missing(section: impl Into<String>) -> Self {
        Self::ConfigurationSectionMissing {
            section: section.into(),
        }
    }
}
