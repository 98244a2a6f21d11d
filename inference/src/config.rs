//! I define [`InferenceConfig`], the settings of an [`InferenceRepository`](crate::repository::InferenceRepository),
//! loadable from TOML.
//!
//! ```toml
//! inferred_context_prefix = "urn:x-inferred:"
//! max_concurrent_rules = 4
//! data_dir = "/var/lib/my-store"
//! update_closure_on_commit = true
//!
//! [parameters]
//! maxDepth = "3"
//! schema = "<http://example.org/schema>"
//! ```
use std::{
    collections::BTreeMap,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Deserialize;
use sophia_store::{
    binding::BindingSet,
    term::{iri, string, Value},
};

use crate::InferenceError;

/// Default prefix of the contexts holding inferred statements
pub const DEFAULT_INFERRED_PREFIX: &str = "urn:x-sophia:inferred:";

/// Settings of an inference repository.
///
/// Every field has a default, so any subset may be given.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    /// Prefix of the IRIs of the contexts holding inferred statements
    pub inferred_context_prefix: String,
    /// Maximum number of rules evaluated concurrently (default: available parallelism)
    pub max_concurrent_rules: Option<usize>,
    /// Whether to provide inferencers with a thread pool
    pub parallel: bool,
    /// Directory where the closure metadata is persisted (none: not persisted)
    pub data_dir: Option<PathBuf>,
    /// How long cached closure metadata is trusted, in seconds (0 disables the cache)
    pub cache_ttl_secs: u64,
    /// Whether transactions see and maintain the materialized closure by default
    pub forward: bool,
    /// Whether transactions rewrite queries and updates by default
    pub backward: bool,
    /// Whether committing a transaction brings its closure up to date first
    pub update_closure_on_commit: bool,
    /// Timeout of queries evaluated by inferencers, in milliseconds
    pub query_timeout_ms: Option<u64>,
    /// Values of the ruleset parameters: `<iri>` for an IRI, anything else for a string
    pub parameters: BTreeMap<String, String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            inferred_context_prefix: DEFAULT_INFERRED_PREFIX.to_string(),
            max_concurrent_rules: None,
            parallel: true,
            data_dir: None,
            cache_ttl_secs: 60,
            forward: true,
            backward: false,
            update_closure_on_commit: false,
            query_timeout_ms: None,
            parameters: BTreeMap::new(),
        }
    }
}

impl InferenceConfig {
    /// Parse a configuration from TOML.
    pub fn from_toml_str(txt: &str) -> Result<Self, InferenceError> {
        toml::from_str(txt).map_err(|e| InferenceError::Configuration(e.to_string()))
    }

    /// Load a configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        let txt = fs::read_to_string(path)?;
        toml::from_str(&txt)
            .map_err(|e| InferenceError::Configuration(format!("{}: {e}", path.display())))
    }

    /// The maximum number of rules evaluated concurrently
    pub fn max_concurrent_rules(&self) -> usize {
        match self.max_concurrent_rules {
            Some(n) => n.max(1),
            None => thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }

    /// The timeout of inferencer queries
    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    /// How long cached closure metadata is trusted
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// The configured parameter values, as bindings.
    pub fn parameter_bindings(&self) -> BindingSet {
        let mut ret = BindingSet::new();
        for (name, txt) in &self.parameters {
            ret.insert(name.as_str(), parse_value(txt));
        }
        ret
    }

    /// The default options of transactions
    pub fn options(&self) -> InferenceOptions {
        InferenceOptions {
            forward: self.forward,
            backward: self.backward,
        }
    }

    /// Build the thread pool handed to inferencers, if [`parallel`](Self::parallel) is set.
    pub fn build_pool(&self) -> Result<Option<ThreadPool>, InferenceError> {
        if !self.parallel {
            return Ok(None);
        }
        ThreadPoolBuilder::new()
            .num_threads(self.max_concurrent_rules())
            .thread_name(|i| format!("sophia-inference-{i}"))
            .build()
            .map(Some)
            .map_err(|e| InferenceError::Configuration(format!("could not build thread pool: {e}")))
    }
}

fn parse_value(txt: &str) -> Value {
    match txt.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        Some(i) => iri(i),
        None => string(txt),
    }
}

/// Which kinds of reasoning a transaction performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InferenceOptions {
    /// See and maintain the materialized closure
    pub forward: bool,
    /// Rewrite queries and updates
    pub backward: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        InferenceOptions {
            forward: true,
            backward: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = InferenceConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, InferenceConfig::default());
        assert_eq!(cfg.inferred_context_prefix, DEFAULT_INFERRED_PREFIX);
        assert!(cfg.max_concurrent_rules() >= 1);
        assert_eq!(cfg.options(), InferenceOptions::default());
        assert!(cfg.query_timeout().is_none());
    }

    #[test]
    fn full() {
        let cfg = InferenceConfig::from_toml_str(
            r#"
            inferred_context_prefix = "urn:inf:"
            max_concurrent_rules = 0
            parallel = false
            data_dir = "/tmp/x"
            cache_ttl_secs = 0
            backward = true
            update_closure_on_commit = true
            query_timeout_ms = 1500

            [parameters]
            depth = "3"
            schema = "<http://example.org/s>"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.inferred_context_prefix, "urn:inf:");
        assert_eq!(cfg.max_concurrent_rules(), 1);
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/tmp/x")));
        assert!(cfg.cache_ttl().is_zero());
        assert_eq!(
            cfg.options(),
            InferenceOptions {
                forward: true,
                backward: true
            }
        );
        assert_eq!(cfg.query_timeout(), Some(Duration::from_millis(1500)));
        assert!(cfg.build_pool().unwrap().is_none());

        let params = cfg.parameter_bindings();
        assert_eq!(params.get("depth"), Some(&string("3")));
        assert_eq!(params.get("schema"), Some(&iri("http://example.org/s")));
    }

    #[test]
    fn invalid() {
        assert!(matches!(
            InferenceConfig::from_toml_str("parallel = 3"),
            Err(InferenceError::Configuration(_))
        ));
    }

    #[test]
    fn pool() {
        let cfg = InferenceConfig {
            max_concurrent_rules: Some(2),
            ..InferenceConfig::default()
        };
        let pool = cfg.build_pool().unwrap().unwrap();
        assert_eq!(pool.current_num_threads(), 2);
    }
}
