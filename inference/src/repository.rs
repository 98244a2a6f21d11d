//! I define [`InferenceRepository`], which decorates a [`Store`] with an [`Inferencer`].
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{debug, info, warn};
use rayon::ThreadPool;
use sophia_store::{Store, Transaction};

use crate::{
    cache::ClosureStatusCache,
    config::{InferenceConfig, InferenceOptions},
    inferencer::Inferencer,
    status::ClosureMetadata,
    transaction::InferenceTransaction,
    InferenceError,
};

/// Name of the closure metadata file, in the data directory
pub const CLOSURE_STATUS_FILE: &str = "closure-status";

/// A store whose transactions maintain the closure of their statements
/// with respect to an [`Inferencer`].
pub struct InferenceRepository<S> {
    store: S,
    shared: Arc<Shared>,
    options: InferenceOptions,
}

/// What all transactions of a repository share.
pub(crate) struct Shared {
    pub(crate) inferencer: Box<dyn Inferencer>,
    pub(crate) prefix: Arc<str>,
    pub(crate) scheduler: Option<Arc<ThreadPool>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) update_closure_on_commit: bool,
    cache: ClosureStatusCache,
    metadata_path: Option<PathBuf>,
}

impl Shared {
    fn cache_key(&self) -> &Path {
        self.metadata_path
            .as_deref()
            .unwrap_or(Path::new(CLOSURE_STATUS_FILE))
    }

    /// Persist `record` (if there is a data directory) and cache it.
    pub(crate) fn record(&self, record: &ClosureMetadata) -> Result<(), InferenceError> {
        let key = self.cache_key();
        if let Some(path) = &self.metadata_path {
            if let Err(e) = record.write(path) {
                self.cache.invalidate(key);
                return Err(e);
            }
        }
        self.cache.put(key, record.clone());
        Ok(())
    }

    /// The last known record, from the cache or else from the metadata file.
    ///
    /// A malformed file counts as no record.
    fn last_record(&self) -> Result<Option<ClosureMetadata>, InferenceError> {
        let key = self.cache_key();
        if let Some(record) = self.cache.get(key) {
            return Ok(Some(record));
        }
        let Some(path) = &self.metadata_path else {
            return Ok(None);
        };
        let record = match ClosureMetadata::read(path) {
            Ok(record) => record,
            Err(InferenceError::Metadata(msg)) => {
                warn!("ignoring unreadable {}: {msg}", path.display());
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(record) = &record {
            self.cache.put(key, record.clone());
        }
        Ok(record)
    }
}

impl<S: Store> InferenceRepository<S>
where
    S::Transaction: 'static,
{
    /// Decorate `store` with `inferencer`, which gets initialized.
    pub fn new<I: Inferencer + 'static>(
        store: S,
        mut inferencer: I,
        config: &InferenceConfig,
    ) -> Result<Self, InferenceError> {
        inferencer.initialize(&config.inferred_context_prefix)?;
        let scheduler = config.build_pool()?.map(Arc::new);
        let metadata_path = config
            .data_dir
            .as_ref()
            .map(|dir| dir.join(CLOSURE_STATUS_FILE));
        info!(
            "inference repository ready (mode {:?}, configuration {})",
            inferencer.inference_mode(),
            inferencer.configuration_digest()
        );
        Ok(InferenceRepository {
            store,
            shared: Arc::new(Shared {
                inferencer: Box::new(inferencer),
                prefix: config.inferred_context_prefix.as_str().into(),
                scheduler,
                timeout: config.query_timeout(),
                update_closure_on_commit: config.update_closure_on_commit,
                cache: ClosureStatusCache::new(config.cache_ttl()),
                metadata_path,
            }),
            options: config.options(),
        })
    }

    /// The decorated store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The inferencer of this repository
    pub fn inferencer(&self) -> &dyn Inferencer {
        self.shared.inferencer.as_ref()
    }

    /// Where the closure metadata is persisted, if anywhere
    pub fn metadata_path(&self) -> Option<&Path> {
        self.shared.metadata_path.as_deref()
    }

    /// The cache of closure metadata
    pub fn cache(&self) -> &ClosureStatusCache {
        &self.shared.cache
    }

    /// Start a transaction with the default options of this repository.
    pub fn begin(&self) -> Result<InferenceTransaction<S::Transaction>, InferenceError> {
        self.begin_with(self.options)
    }

    /// Start a transaction with the given options.
    ///
    /// Its initial closure status is the last recorded one,
    /// unless that record was made with a different configuration
    /// or when the store was in a different emptiness state,
    /// in which case it is [`Stale`](crate::status::ClosureStatus::Stale).
    pub fn begin_with(
        &self,
        options: InferenceOptions,
    ) -> Result<InferenceTransaction<S::Transaction>, InferenceError> {
        let tx = self.store.begin()?;
        let is_empty = tx.size(&[])? == 0;
        let record = self.shared.last_record()?;
        let status = ClosureMetadata::initial_status(
            record.as_ref(),
            self.shared.inferencer.configuration_digest(),
            is_empty,
        );
        debug!("{}: last record {record:?}, assuming {status}", tx.id());
        Ok(InferenceTransaction::new(
            tx,
            self.shared.clone(),
            options,
            status,
            is_empty,
        ))
    }

    /// Release the resources of the inferencer.
    pub fn close(self) -> Result<(), InferenceError> {
        self.shared.inferencer.close()
    }
}

impl<S> std::fmt::Debug for InferenceRepository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceRepository")
            .field("prefix", &self.shared.prefix)
            .field("metadata_path", &self.shared.metadata_path)
            .field("options", &self.options)
            .finish()
    }
}
