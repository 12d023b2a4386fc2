//! Test support for the korm crates
//!
//! Unified logging initialization and throwaway SQLite databases.

pub mod sqlite;
pub mod test_logging;
