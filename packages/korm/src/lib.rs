//! KORM startup wiring: database handle, ID generator bootstrap and SQL
//! script migrations, registered into a service collection.

pub mod builder;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod id_generator;
pub mod infra;
pub mod services;

pub use builder::{KormBuilder, MigrateStatus};
pub use cache::MemoryCache;
pub use config::{Configuration, ConfigurationBuilder, ConnectionSettings, DbProvider};
pub use database::{DatabaseBuilder, DatabaseConfiguration, DatabaseOptions, KormDatabase};
pub use error::KormError;
pub use id_generator::{IdGenerator, IdGeneratorFactories, IdGeneratorFactory};
pub use infra::runner::{MigrationsRunner, SqlMigrationsRunner};
pub use services::{ServiceCollection, ServiceLifetime, ServiceProvider};

pub use korm_migrations as migrations;
