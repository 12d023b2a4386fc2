//! Shared tracing setup for KORM tests
//!
//! Unit tests and the integration suites under `tests/` call the same
//! `init()`, so log output looks the same wherever a test runs.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Install the test subscriber once per process.
///
/// Safe to call from every test, including tests running in parallel. The
/// filter is taken from the first of:
///
/// 1. `TEST_LOG` (lets test runs differ from the app's `RUST_LOG`)
/// 2. `RUST_LOG`
/// 3. `"warn"`
///
/// Output goes through `with_test_writer()` so the harness only shows it for
/// failing tests. Timestamps are dropped to keep captured logs diffable.
pub fn init() {
    INITIALIZED.get_or_init(|| {
        let filter = std::env::var("TEST_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new("warn"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .try_init()
            // another crate's tests may have installed a global subscriber
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_no_op() {
        init();
        init();
        assert!(INITIALIZED.get().is_some());
    }
}
