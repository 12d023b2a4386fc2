use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ScriptError;
use crate::providers::{DirectoryScriptsProvider, EmbeddedScriptsProvider};
use crate::script::MigrationScript;

/// Upper bound for a single migration run once the bootstrap lock is held.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Source of migration scripts.
pub trait ScriptsProvider: Send + Sync {
    /// Short label used in logs.
    fn describe(&self) -> String;

    fn scripts(&self) -> Result<Vec<MigrationScript>, ScriptError>;
}

/// Rewrites a script before it is executed.
pub trait ScriptStrategy: Send + Sync {
    fn prepare(&self, script: MigrationScript) -> MigrationScript;
}

/// Script providers and strategies used by a migrations runner.
#[derive(Clone)]
pub struct MigrationOptions {
    providers: Vec<Arc<dyn ScriptsProvider>>,
    strategies: Vec<Arc<dyn ScriptStrategy>>,
    timeout: Duration,
}

impl MigrationOptions {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            strategies: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn add_scripts_provider(&mut self, provider: impl ScriptsProvider + 'static) -> &mut Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Scripts compiled into the binary, usually via `include_str!`.
    pub fn add_embedded_scripts<I>(&mut self, scripts: I) -> &mut Self
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        self.add_scripts_provider(EmbeddedScriptsProvider::new(scripts))
    }

    pub fn add_directory_scripts(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.add_scripts_provider(DirectoryScriptsProvider::new(dir))
    }

    pub fn add_strategy(&mut self, strategy: impl ScriptStrategy + 'static) -> &mut Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn providers(&self) -> &[Arc<dyn ScriptsProvider>] {
        &self.providers
    }

    pub fn strategies(&self) -> &[Arc<dyn ScriptStrategy>] {
        &self.strategies
    }

    /// Gather the scripts of every provider, run them through the strategies
    /// and return them ordered by id. Two scripts sharing an id is an error.
    pub fn collect_scripts(&self) -> Result<Vec<MigrationScript>, ScriptError> {
        let mut scripts = Vec::new();
        for provider in &self.providers {
            let found = provider.scripts()?;
            tracing::debug!(
                provider = %provider.describe(),
                count = found.len(),
                "migration scripts discovered"
            );
            scripts.extend(found);
        }

        let mut scripts: Vec<MigrationScript> = scripts
            .into_iter()
            .map(|script| {
                self.strategies
                    .iter()
                    .fold(script, |script, strategy| strategy.prepare(script))
            })
            .collect();
        scripts.sort_by_key(|s| s.id);

        if let Some(pair) = scripts.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(ScriptError::DuplicateId {
                id: pair[0].id,
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }

        Ok(scripts)
    }
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MigrationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers: Vec<String> = self.providers.iter().map(|p| p.describe()).collect();
        f.debug_struct("MigrationOptions")
            .field("providers", &providers)
            .field("strategies", &self.strategies.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Replaces `${key}` tokens in script bodies.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderStrategy {
    values: BTreeMap<String, String>,
}

impl PlaceholderStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ScriptStrategy for PlaceholderStrategy {
    fn prepare(&self, mut script: MigrationScript) -> MigrationScript {
        for (key, value) in &self.values {
            script.sql = script.sql.replace(&format!("${{{key}}}"), value);
        }
        script
    }
}
