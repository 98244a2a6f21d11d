//! I define the contract between the transaction layer and inference engines:
//! [`Inferencer`] (a thread-safe factory of sessions),
//! [`Session`] (the per-transaction engine state),
//! and [`Context`] (what the store exposes to a session).
use std::{
    sync::{atomic::{AtomicBool, Ordering}, Arc},
    time::Duration,
};

use rayon::ThreadPool;
use sophia_store::{
    algebra::{Query, QueryDataset, Update},
    binding::BindingSet,
    term::{GraphName, Value},
    Statement,
};

use crate::{status::ClosureStatus, InferenceError};

/// The kinds of reasoning an [`Inferencer`] supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InferenceMode {
    /// No reasoning at all
    None,
    /// Materialization of the closure
    Forward,
    /// Rewriting of queries and updates
    Backward,
    /// Both forward and backward reasoning
    Combined,
}

impl InferenceMode {
    /// Whether this mode includes forward reasoning
    pub fn has_forward(self) -> bool {
        matches!(self, InferenceMode::Forward | InferenceMode::Combined)
    }

    /// Whether this mode includes backward reasoning
    pub fn has_backward(self) -> bool {
        matches!(self, InferenceMode::Backward | InferenceMode::Combined)
    }
}

/// An inference engine, shared by all the transactions of a repository.
pub trait Inferencer: Send + Sync {
    /// Prepare this inferencer for use with a repository
    /// whose inferred statements live in contexts starting with `inferred_context_prefix`.
    ///
    /// Fails with [`InferenceError::Configuration`] if the engine is badly configured.
    fn initialize(&mut self, inferred_context_prefix: &str) -> Result<(), InferenceError>;

    /// The kinds of reasoning supported.
    fn inference_mode(&self) -> InferenceMode;

    /// A digest of everything the closure depends on, besides the explicit statements.
    ///
    /// Only meaningful after [`initialize`](Inferencer::initialize).
    fn configuration_digest(&self) -> &str;

    /// Start a session for the given transaction.
    fn new_session(
        &self,
        transaction_id: &str,
        status: ClosureStatus,
        context: Arc<dyn Context>,
    ) -> Result<Box<dyn Session>, InferenceError>;

    /// Release the resources held by this inferencer.
    fn close(&self) -> Result<(), InferenceError> {
        Ok(())
    }
}

/// The state of an [`Inferencer`] for one transaction.
///
/// Sessions are not shared between threads;
/// all calls are serialized by the transaction layer.
pub trait Session: Send {
    /// Explicit statements were added (`None`: which ones is unknown).
    fn statements_added(
        &mut self,
        statements: Option<&[Statement]>,
        contexts: &[GraphName],
    ) -> Result<(), InferenceError>;

    /// Explicit statements were removed (`None`: which ones is unknown).
    fn statements_removed(
        &mut self,
        statements: Option<&[Statement]>,
        contexts: &[GraphName],
    ) -> Result<(), InferenceError>;

    /// All statements, or all inferred statements only, were removed.
    fn statements_cleared(&mut self, only_closure: bool) -> Result<(), InferenceError>;

    /// Rewrite `query` for backward reasoning; `None` means that it has no solution.
    fn rewrite_query(
        &mut self,
        query: Query,
        status: ClosureStatus,
        forward_enabled: bool,
    ) -> Result<Option<Query>, InferenceError>;

    /// Rewrite `update` for backward reasoning; `None` means that it has no effect.
    fn rewrite_update(
        &mut self,
        update: Update,
        status: ClosureStatus,
        forward_enabled: bool,
    ) -> Result<Option<Update>, InferenceError>;

    /// Bring the materialized closure from `status` to [`ClosureStatus::Current`].
    fn update_closure(&mut self, status: ClosureStatus) -> Result<(), InferenceError>;

    /// End this session.
    fn close(&mut self, committing: bool) -> Result<(), InferenceError>;
}

/// What a [`Session`] may do with the underlying transaction.
///
/// Reads take an `include_closure` flag: when false, inferred contexts are hidden.
/// Writes only ever reach inferred contexts.
pub trait Context: Send + Sync {
    /// Evaluate `query`.
    fn query(
        &self,
        query: &Query,
        dataset: Option<&QueryDataset>,
        bindings: Option<&BindingSet>,
        include_closure: bool,
        timeout: Option<Duration>,
    ) -> Result<Cursor<BindingSet>, InferenceError>;

    /// The statements matching the given subject, predicate and object, in the given contexts.
    fn statements(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        include_closure: bool,
        contexts: &[GraphName],
    ) -> Result<Cursor<Statement>, InferenceError>;

    /// Whether any statement matches.
    fn has_statement(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        include_closure: bool,
        contexts: &[GraphName],
    ) -> Result<bool, InferenceError>;

    /// The names of the non-empty named graphs.
    fn context_ids(&self, include_closure: bool) -> Result<Vec<Value>, InferenceError>;

    /// The number of statements in the given contexts (all if empty).
    fn size(&self, include_closure: bool, contexts: &[GraphName]) -> Result<usize, InferenceError>;

    /// Add inferred statements.
    ///
    /// If `contexts` is empty, each statement goes to its own context.
    fn add_inferred(
        &self,
        statements: &[Statement],
        contexts: &[GraphName],
    ) -> Result<(), InferenceError>;

    /// Remove inferred statements.
    fn remove_inferred(
        &self,
        statements: &[Statement],
        contexts: &[GraphName],
    ) -> Result<(), InferenceError>;

    /// Remove inferred statements matching the given subject, predicate and object.
    ///
    /// If `contexts` is empty, all inferred contexts are addressed.
    fn remove_inferred_matching(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<(), InferenceError>;

    /// The thread pool available for parallel evaluation, if any.
    fn scheduler(&self) -> Option<Arc<ThreadPool>>;
}

/// An iterator over results handed out by a [`Context`].
///
/// A cursor still open when its context is locked again gets closed;
/// its next call to `next` then yields [`InferenceError::CursorClosed`].
#[derive(Debug)]
pub struct Cursor<T> {
    items: std::vec::IntoIter<T>,
    closed: Arc<AtomicBool>,
    reported: bool,
}

impl<T> Cursor<T> {
    /// A cursor over `items`, closed when `closed` is set.
    pub fn new(items: Vec<T>, closed: Arc<AtomicBool>) -> Self {
        Cursor {
            items: items.into_iter(),
            closed,
            reported: false,
        }
    }

    /// A cursor independent of any context.
    pub fn detached(items: Vec<T>) -> Self {
        Self::new(items, Arc::new(AtomicBool::new(false)))
    }

    /// Whether this cursor has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close this cursor.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.reported = true;
    }
}

impl<T> Iterator for Cursor<T> {
    type Item = Result<T, InferenceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_closed() {
            if self.reported {
                return None;
            }
            self.reported = true;
            return Some(Err(InferenceError::CursorClosed));
        }
        match self.items.next() {
            Some(item) => Some(Ok(item)),
            None => {
                self.close();
                None
            }
        }
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}
