//! I define [`InferenceTransaction`], a transaction of an
//! [`InferenceRepository`](crate::repository::InferenceRepository),
//! keeping track of the [`ClosureStatus`] of the store as statements are written.
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::{debug, error, trace, warn};
use sophia_store::{
    algebra::{Query, QueryDataset, Update},
    binding::BindingSet,
    term::{graph_has_prefix, has_prefix, GraphName, Value},
    QueryResult,
    Statement,
    StoreError,
    Transaction,
};

use crate::{
    config::InferenceOptions,
    context::InferenceContext,
    controller::InferenceController,
    repository::Shared,
    status::{ClosureMetadata, ClosureStatus},
    InferenceError,
};

/// A transaction decorated with inference.
///
/// With forward reasoning enabled, the materialized closure (statements in contexts under
/// the inferred prefix) is visible, and can be brought up to date with
/// [`update_closure`](InferenceTransaction::update_closure).
/// With forward reasoning disabled, inferred contexts are hidden from every read.
///
/// A transaction dropped without being [ended](InferenceTransaction::end) is rolled back.
pub struct InferenceTransaction<T: Transaction + 'static> {
    id: String,
    transaction: Arc<Mutex<T>>,
    shared: Arc<Shared>,
    forward: bool,
    backward: bool,
    initial_status: ClosureStatus,
    initially_empty: bool,
    status: ClosureStatus,
    controller: OnceLock<InferenceController<T>>,
    closed: bool,
}

impl<T: Transaction + 'static> InferenceTransaction<T> {
    pub(crate) fn new(
        transaction: T,
        shared: Arc<Shared>,
        options: InferenceOptions,
        status: ClosureStatus,
        initially_empty: bool,
    ) -> Self {
        let mode = shared.inferencer.inference_mode();
        let forward = options.forward && mode.has_forward();
        let backward = options.backward && mode.has_backward();
        let id = transaction.id().to_string();
        debug!("{id}: begin (closure {status}, forward: {forward}, backward: {backward})");
        InferenceTransaction {
            id,
            transaction: Arc::new(Mutex::new(transaction)),
            shared,
            forward,
            backward,
            initial_status: status,
            initially_empty,
            status,
            controller: OnceLock::new(),
            closed: false,
        }
    }

    /// The identifier of the underlying transaction
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current status of the closure
    pub fn status(&self) -> ClosureStatus {
        self.status
    }

    /// Whether the materialized closure is visible and maintained
    pub fn forward_enabled(&self) -> bool {
        self.forward
    }

    /// Whether queries and updates are rewritten
    pub fn backward_enabled(&self) -> bool {
        self.backward
    }

    /// The prefix of inferred contexts
    pub fn inferred_prefix(&self) -> &str {
        &self.shared.prefix
    }

    /// Evaluate `query`.
    ///
    /// See [`Transaction::query`].
    pub fn query(
        &self,
        query: &Query,
        dataset: Option<&QueryDataset>,
        bindings: Option<&BindingSet>,
    ) -> Result<QueryResult, InferenceError> {
        match self.prepare(query.clone(), dataset)? {
            Some((q, ds)) => Ok(self.tx().query(&q, ds.as_ref(), bindings, None)?),
            None => Ok(QueryResult::empty_for(query)),
        }
    }

    /// Execute `update`.
    ///
    /// As the affected statements are unknown,
    /// the closure status advances as if statements were removed (if `update` deletes any)
    /// and added (if it inserts any).
    pub fn update(
        &mut self,
        update: &Update,
        dataset: Option<&QueryDataset>,
        bindings: Option<&BindingSet>,
    ) -> Result<(), InferenceError> {
        let Some((u, ds)) = self.prepare(update.clone(), dataset)? else {
            return Ok(());
        };
        let controller = self.controller()?;
        let res = self.tx().update(&u, ds.as_ref(), bindings, None);
        let removed = !u.delete.is_empty();
        let added = !u.insert.is_empty();
        if removed {
            controller.statements_removed(None, &[]);
        }
        if added {
            controller.statements_added(None, &[]);
        }
        if removed {
            self.status = self.status.after_removed();
        }
        if added {
            self.status = self.status.after_added();
        }
        Ok(res?)
    }

    /// The statements matching the given subject, predicate and object.
    pub fn statements(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<Vec<Statement>, InferenceError> {
        let tx = self.tx();
        match self.visible_contexts(&tx, contexts)? {
            Some(contexts) => Ok(tx.statements(s, p, o, &contexts)?),
            None => Ok(vec![]),
        }
    }

    /// Whether any statement matches the given subject, predicate and object.
    pub fn has_statement(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<bool, InferenceError> {
        let tx = self.tx();
        match self.visible_contexts(&tx, contexts)? {
            Some(contexts) => Ok(tx.has_statement(s, p, o, &contexts)?),
            None => Ok(false),
        }
    }

    /// The names of the non-empty named graphs.
    pub fn context_ids(&self) -> Result<Vec<Value>, InferenceError> {
        let mut ids = self.tx().context_ids()?;
        if !self.forward {
            ids.retain(|g| !has_prefix(g, &self.shared.prefix));
        }
        Ok(ids)
    }

    /// The number of statements in the given contexts (all if empty).
    pub fn size(&self, contexts: &[GraphName]) -> Result<usize, InferenceError> {
        let tx = self.tx();
        match self.visible_contexts(&tx, contexts)? {
            Some(contexts) => Ok(tx.size(&contexts)?),
            None => Ok(0),
        }
    }

    /// Add explicit statements.
    ///
    /// See [`Transaction::add`].
    pub fn add(
        &mut self,
        statements: &[Statement],
        contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        let controller = self.controller()?;
        let res = self.tx().add(statements, contexts);
        match res {
            Ok(()) => controller.statements_added(Some(statements), contexts),
            Err(_) => controller.statements_added(None, contexts),
        }
        self.status = self.status.after_added();
        Ok(res?)
    }

    /// Remove explicit statements.
    ///
    /// See [`Transaction::remove`].
    pub fn remove(
        &mut self,
        statements: &[Statement],
        contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        let controller = self.controller()?;
        let res = self.tx().remove(statements, contexts);
        match res {
            Ok(()) => controller.statements_removed(Some(statements), contexts),
            Err(_) => controller.statements_removed(None, contexts),
        }
        self.status = self.status.after_removed();
        Ok(res?)
    }

    /// Remove all statements matching the given subject, predicate and object.
    pub fn remove_matching(
        &mut self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        let controller = self.controller()?;
        let res = self.tx().remove_matching(s, p, o, contexts);
        controller.statements_removed(None, contexts);
        self.status = self.status.after_removed();
        Ok(res?)
    }

    /// Bring the closure up to date, if forward reasoning is enabled.
    pub fn update_closure(&mut self) -> Result<(), InferenceError> {
        if !self.forward || self.status == ClosureStatus::Current {
            trace!("{}: no closure update needed ({})", self.id, self.status);
            return Ok(());
        }
        self.controller()?.update_closure(self.status)?;
        self.status = ClosureStatus::Current;
        Ok(())
    }

    /// Remove all inferred statements.
    pub fn clear_closure(&mut self) -> Result<(), InferenceError> {
        let controller = self.controller()?;
        let res = clear_prefix(&mut *self.tx(), &self.shared.prefix);
        match res {
            Ok(()) => {
                controller.statements_cleared(true);
                self.status = if self.forward {
                    ClosureStatus::PossiblyIncomplete
                } else {
                    ClosureStatus::Current
                };
                Ok(())
            }
            Err(e) => {
                controller.statements_removed(None, &[]);
                self.status = self.status.after_removed();
                Err(e.into())
            }
        }
    }

    /// Commit (`commit == true`) or roll back this transaction.
    ///
    /// On commit, if the closure status or the emptiness of the store has changed,
    /// a `STALE` metadata record is written before the underlying commit,
    /// and the actual record after it.
    pub fn end(&mut self, commit: bool) -> Result<(), InferenceError> {
        if self.closed {
            return Err(StoreError::Closed(self.id.clone()).into());
        }
        if commit && self.shared.update_closure_on_commit {
            if let Err(e) = self.update_closure() {
                error!("{}: closure update failed, rolling back: {e}", self.id);
                self.abort();
                return Err(e);
            }
        }
        self.closed = true;
        if let Some(controller) = self.controller.take() {
            if let Err(e) = controller.close(commit) {
                self.rollback();
                return Err(e);
            }
        }
        if !commit {
            debug!("{}: rollback", self.id);
            return Ok(self.tx().end(false)?);
        }
        let size = self.tx().size(&[]);
        let was_empty = match size {
            Ok(n) => n == 0,
            Err(e) => {
                self.rollback();
                return Err(e.into());
            }
        };
        if self.status == self.initial_status && was_empty == self.initially_empty {
            debug!("{}: commit (closure still {})", self.id, self.status);
            return Ok(self.tx().end(true)?);
        }

        let record = ClosureMetadata {
            status: self.status,
            digest: self.shared.inferencer.configuration_digest().to_string(),
            was_empty,
        };
        let pending = ClosureMetadata {
            status: ClosureStatus::Stale,
            ..record.clone()
        };
        if let Err(e) = self.shared.record(&pending) {
            self.rollback();
            return Err(e);
        }
        self.tx().end(true)?;
        debug!("{}: commit (closure {})", self.id, self.status);
        self.shared.record(&record)
    }

    fn abort(&mut self) {
        self.closed = true;
        if let Some(controller) = self.controller.take() {
            // never fails on rollback
            let _ = controller.close(false);
        }
        self.rollback();
    }

    fn rollback(&self) {
        if let Err(e) = self.tx().end(false) {
            error!("{}: rollback failed: {e}", self.id);
        }
    }

    fn tx(&self) -> MutexGuard<'_, T> {
        self.transaction.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn controller(&self) -> Result<&InferenceController<T>, InferenceError> {
        if let Some(controller) = self.controller.get() {
            return Ok(controller);
        }
        let context = Arc::new(InferenceContext::new(
            self.transaction.clone(),
            self.shared.prefix.clone(),
            self.shared.scheduler.clone(),
            self.shared.timeout,
        ));
        let controller = InferenceController::new(
            self.shared.inferencer.as_ref(),
            &self.id,
            self.status,
            context,
        )?;
        Ok(self.controller.get_or_init(|| controller))
    }

    /// The contexts a read may address, `None` if none is left.
    fn visible_contexts(
        &self,
        tx: &T,
        contexts: &[GraphName],
    ) -> Result<Option<Vec<GraphName>>, StoreError> {
        if self.forward {
            return Ok(Some(contexts.to_vec()));
        }
        let prefix = &self.shared.prefix;
        let visible: Vec<GraphName> = if contexts.is_empty() {
            let mut visible = vec![None];
            visible.extend(
                tx.context_ids()?
                    .into_iter()
                    .filter(|g| !has_prefix(g, prefix))
                    .map(Some),
            );
            visible
        } else {
            contexts
                .iter()
                .filter(|g| !graph_has_prefix(g, prefix))
                .cloned()
                .collect()
        };
        Ok(if visible.is_empty() { None } else { Some(visible) })
    }

    /// Adapt `op` to the reasoning options, or return `None` if it can have no result.
    fn prepare<O: Operation>(
        &self,
        op: O,
        dataset: Option<&QueryDataset>,
    ) -> Result<Option<(O, Option<QueryDataset>)>, InferenceError> {
        let mut op = op;
        let mut dataset = dataset.cloned();
        if self.backward || !self.forward {
            if let Some(ds) = dataset.take() {
                op = op.pinned(ds);
            }
        }
        if self.backward {
            match op.rewritten(self.controller()?, self.status, self.forward)? {
                Some(rewritten) => op = rewritten,
                None => {
                    trace!("{}: {} has no solution after rewriting", self.id, O::KIND);
                    return Ok(None);
                }
            }
        }
        if !self.forward {
            match op.hiding(&self.shared.prefix) {
                Some(hidden) => op = hidden,
                None => {
                    trace!("{}: {} only reads inferred contexts", self.id, O::KIND);
                    return Ok(None);
                }
            }
        }
        Ok(Some((op, dataset)))
    }
}

impl<T: Transaction + 'static> Drop for InferenceTransaction<T> {
    fn drop(&mut self) {
        if !self.closed {
            warn!("{}: dropped without being ended; rolling back", self.id);
            self.abort();
        }
    }
}

impl<T: Transaction + 'static> std::fmt::Debug for InferenceTransaction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceTransaction")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("forward", &self.forward)
            .field("backward", &self.backward)
            .finish()
    }
}

fn clear_prefix<T: Transaction>(tx: &mut T, prefix: &str) -> Result<(), StoreError> {
    let inferred: Vec<GraphName> = tx
        .context_ids()?
        .into_iter()
        .filter(|g| has_prefix(g, prefix))
        .map(Some)
        .collect();
    if inferred.is_empty() {
        return Ok(());
    }
    tx.remove_matching(None, None, None, &inferred)
}

/// What queries and updates have in common, as far as rewriting is concerned.
trait Operation: Sized {
    const KIND: &'static str;

    fn pinned(self, dataset: QueryDataset) -> Self;

    fn hiding(self, prefix: &str) -> Option<Self>;

    fn rewritten<T: Transaction + 'static>(
        self,
        controller: &InferenceController<T>,
        status: ClosureStatus,
        forward: bool,
    ) -> Result<Option<Self>, InferenceError>;
}

impl Operation for Query {
    const KIND: &'static str = "query";

    fn pinned(self, dataset: QueryDataset) -> Self {
        self.with_dataset(dataset)
    }

    fn hiding(self, prefix: &str) -> Option<Self> {
        self.excluding_prefix(prefix)
    }

    fn rewritten<T: Transaction + 'static>(
        self,
        controller: &InferenceController<T>,
        status: ClosureStatus,
        forward: bool,
    ) -> Result<Option<Self>, InferenceError> {
        controller.rewrite_query(self, status, forward)
    }
}

impl Operation for Update {
    const KIND: &'static str = "update";

    fn pinned(self, dataset: QueryDataset) -> Self {
        self.with_dataset(dataset)
    }

    fn hiding(self, prefix: &str) -> Option<Self> {
        self.excluding_prefix(prefix)
    }

    fn rewritten<T: Transaction + 'static>(
        self,
        controller: &InferenceController<T>,
        status: ClosureStatus,
        forward: bool,
    ) -> Result<Option<Self>, InferenceError> {
        controller.rewrite_update(self, status, forward)
    }
}
