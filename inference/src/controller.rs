//! I define [`InferenceController`], which owns the [`Session`] of one transaction
//! and mediates every call made to it.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, trace};
use sophia_store::{
    algebra::{Query, Update},
    term::GraphName,
    Statement,
    Transaction,
};

use crate::{
    context::InferenceContext,
    inferencer::{Inferencer, Session},
    status::ClosureStatus,
    InferenceError,
};

/// The owner of a ([`Session`], [`InferenceContext`]) pair.
///
/// Each call to the session is made with the context unlocked,
/// and the context is locked again as soon as the call returns.
/// Notifications arriving while the context is unlocked come from the session's own writes,
/// and are not forwarded.
pub struct InferenceController<T> {
    session: Mutex<Box<dyn Session>>,
    context: Arc<InferenceContext<T>>,
}

impl<T: Transaction + 'static> InferenceController<T> {
    /// Start a session of `inferencer` over `context`.
    pub fn new(
        inferencer: &dyn Inferencer,
        transaction_id: &str,
        status: ClosureStatus,
        context: Arc<InferenceContext<T>>,
    ) -> Result<Self, InferenceError> {
        let session = inferencer
            .new_session(transaction_id, status, context.clone())
            .map_err(|e| InferenceError::Session(Box::new(e)))?;
        trace!("inference session started for {transaction_id}");
        Ok(InferenceController {
            session: Mutex::new(session),
            context,
        })
    }

    /// The context shared with the session
    pub fn context(&self) -> &Arc<InferenceContext<T>> {
        &self.context
    }

    /// Notify the session that statements were added.
    ///
    /// Failures are logged, never returned.
    pub fn statements_added(&self, statements: Option<&[Statement]>, contexts: &[GraphName]) {
        self.notify("statements_added", |s| s.statements_added(statements, contexts));
    }

    /// Notify the session that statements were removed.
    ///
    /// Failures are logged, never returned.
    pub fn statements_removed(&self, statements: Option<&[Statement]>, contexts: &[GraphName]) {
        self.notify("statements_removed", |s| {
            s.statements_removed(statements, contexts)
        });
    }

    /// Notify the session that statements were cleared.
    ///
    /// Failures are logged, never returned.
    pub fn statements_cleared(&self, only_closure: bool) {
        self.notify("statements_cleared", |s| s.statements_cleared(only_closure));
    }

    /// Rewrite `query` through the session.
    pub fn rewrite_query(
        &self,
        query: Query,
        status: ClosureStatus,
        forward_enabled: bool,
    ) -> Result<Option<Query>, InferenceError> {
        self.call(false, |s| s.rewrite_query(query, status, forward_enabled))
            .map_err(|e| InferenceError::Rewrite("query", Box::new(e)))
    }

    /// Rewrite `update` through the session.
    pub fn rewrite_update(
        &self,
        update: Update,
        status: ClosureStatus,
        forward_enabled: bool,
    ) -> Result<Option<Update>, InferenceError> {
        self.call(false, |s| s.rewrite_update(update, status, forward_enabled))
            .map_err(|e| InferenceError::Rewrite("update", Box::new(e)))
    }

    /// Have the session bring the closure from `status` to [`ClosureStatus::Current`].
    pub fn update_closure(&self, status: ClosureStatus) -> Result<(), InferenceError> {
        self.call(true, |s| s.update_closure(status))
            .map_err(|e| InferenceError::Session(Box::new(e)))
    }

    /// Close the session.
    ///
    /// When rolling back, failures are logged and ignored.
    pub fn close(self, committing: bool) -> Result<(), InferenceError> {
        let res = self.call(false, |s| s.close(committing));
        match res {
            Err(e) if !committing => {
                error!("error while closing inference session on rollback: {e}");
                Ok(())
            }
            other => other,
        }
    }

    fn session(&self) -> MutexGuard<'_, Box<dyn Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call<R, F>(&self, writable: bool, f: F) -> Result<R, InferenceError>
    where
        F: FnOnce(&mut dyn Session) -> Result<R, InferenceError>,
    {
        let _unlocked = self.context.unlock(writable)?;
        let mut session = self.session();
        f(session.as_mut())
    }

    fn notify<F>(&self, what: &str, f: F)
    where
        F: FnOnce(&mut dyn Session) -> Result<(), InferenceError>,
    {
        if self.context.is_unlocked() {
            trace!("{what} ignored: originates from the inference session");
            return;
        }
        if let Err(e) = self.call(false, f) {
            error!("inference session failed to handle {what}: {e}");
        }
    }
}

impl<T> std::fmt::Debug for InferenceController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceController")
            .field("context", &self.context)
            .finish()
    }
}
