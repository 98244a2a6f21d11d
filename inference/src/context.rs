//! I define [`InferenceContext`], the lockable [`Context`] through which
//! a [`Session`](crate::inferencer::Session) accesses its transaction.
use std::{
    sync::{atomic::{AtomicBool, AtomicU8, Ordering}, Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{trace, warn};
use rayon::ThreadPool;
use sophia_store::{
    algebra::{Query, QueryDataset},
    binding::BindingSet,
    term::{graph_has_prefix, has_prefix, GraphName, Value},
    QueryResult,
    Statement,
    Transaction,
};

use crate::{
    inferencer::{Context, Cursor},
    InferenceError,
};

const LOCKED: u8 = 0;
const READ_ONLY: u8 = 1;
const WRITABLE: u8 = 2;

/// The [`Context`] handed to sessions by an [`InferenceController`](crate::controller::InferenceController).
///
/// It starts locked; every access fails with [`InferenceError::ContextLocked`]
/// until it is [unlocked](InferenceContext::unlock) for the duration of a session call.
pub struct InferenceContext<T> {
    transaction: Arc<Mutex<T>>,
    prefix: Arc<str>,
    scheduler: Option<Arc<ThreadPool>>,
    timeout: Option<Duration>,
    state: AtomicU8,
    cursors: Mutex<Vec<Arc<AtomicBool>>>,
    warned: AtomicBool,
}

impl<T: Transaction> InferenceContext<T> {
    /// A locked context over `transaction`,
    /// allowing writes in contexts whose IRI starts with `prefix`.
    pub fn new(
        transaction: Arc<Mutex<T>>,
        prefix: Arc<str>,
        scheduler: Option<Arc<ThreadPool>>,
        timeout: Option<Duration>,
    ) -> Self {
        InferenceContext {
            transaction,
            prefix,
            scheduler,
            timeout,
            state: AtomicU8::new(LOCKED),
            cursors: Mutex::new(vec![]),
            warned: AtomicBool::new(false),
        }
    }

    /// The prefix of inferred contexts
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether a session call is in progress.
    pub fn is_unlocked(&self) -> bool {
        self.state.load(Ordering::Acquire) != LOCKED
    }

    /// Make this context accessible until the returned guard is dropped.
    ///
    /// Fails with [`InferenceError::Fatal`] if it is already unlocked.
    pub fn unlock(&self, writable: bool) -> Result<Unlocked<'_, T>, InferenceError> {
        let mode = if writable { WRITABLE } else { READ_ONLY };
        self.state
            .compare_exchange(LOCKED, mode, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| InferenceError::Fatal("inference context is already unlocked".into()))?;
        Ok(Unlocked { context: self })
    }

    fn lock(&self) {
        let leaked = {
            let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
            cursors
                .drain(..)
                .filter(|closed| !closed.swap(true, Ordering::AcqRel))
                .count()
        };
        if leaked > 0 {
            warn!("closed {leaked} cursor(s) left open by the inference session");
        }
        self.state.store(LOCKED, Ordering::Release);
    }

    fn check_read(&self) -> Result<(), InferenceError> {
        if self.state.load(Ordering::Acquire) == LOCKED {
            Err(InferenceError::ContextLocked("reading"))
        } else {
            Ok(())
        }
    }

    fn check_write(&self) -> Result<(), InferenceError> {
        if self.state.load(Ordering::Acquire) == WRITABLE {
            Ok(())
        } else {
            Err(InferenceError::ContextLocked("writing"))
        }
    }

    fn transaction(&self) -> MutexGuard<'_, T> {
        self.transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cursor<I>(&self, items: Vec<I>) -> Cursor<I> {
        let flag = Arc::new(AtomicBool::new(false));
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(flag.clone());
        Cursor::new(items, flag)
    }

    fn is_inferred(&self, g: &GraphName) -> bool {
        graph_has_prefix(g, &self.prefix)
    }

    fn warn_filtered(&self) {
        if !self.warned.swap(true, Ordering::AcqRel) {
            warn!(
                "inference session attempted to write outside of <{}*>; ignored",
                self.prefix
            );
        }
    }

    /// The explicit contexts to read from when the closure is excluded.
    fn explicit_contexts(
        &self,
        tx: &T,
        contexts: &[GraphName],
    ) -> Result<Vec<GraphName>, InferenceError> {
        if contexts.is_empty() {
            let mut ret: Vec<GraphName> = vec![None];
            ret.extend(
                tx.context_ids()?
                    .into_iter()
                    .filter(|g| !has_prefix(g, &self.prefix))
                    .map(Some),
            );
            Ok(ret)
        } else {
            Ok(contexts
                .iter()
                .filter(|g| !self.is_inferred(g))
                .cloned()
                .collect())
        }
    }

    /// The inferred contexts among `contexts` (all inferred contexts if empty),
    /// or `None` if nothing is addressed.
    fn inferred_contexts(
        &self,
        tx: &T,
        contexts: &[GraphName],
    ) -> Result<Option<Vec<GraphName>>, InferenceError> {
        let kept: Vec<GraphName> = if contexts.is_empty() {
            tx.context_ids()?
                .into_iter()
                .filter(|g| has_prefix(g, &self.prefix))
                .map(Some)
                .collect()
        } else {
            let kept: Vec<GraphName> = contexts
                .iter()
                .filter(|g| self.is_inferred(g))
                .cloned()
                .collect();
            if kept.len() < contexts.len() {
                self.warn_filtered();
            }
            kept
        };
        Ok(if kept.is_empty() { None } else { Some(kept) })
    }

    /// Apply `write` to the statements and contexts surviving the namespace filter.
    fn filtered_write<F>(
        &self,
        statements: &[Statement],
        contexts: &[GraphName],
        write: F,
    ) -> Result<(), InferenceError>
    where
        F: FnOnce(&mut T, &[Statement], &[GraphName]) -> Result<(), sophia_store::StoreError>,
    {
        self.check_write()?;
        if contexts.is_empty() {
            let kept: Vec<Statement> = statements
                .iter()
                .filter(|st| self.is_inferred(st.c()))
                .cloned()
                .collect();
            if kept.len() < statements.len() {
                self.warn_filtered();
            }
            if kept.is_empty() {
                return Ok(());
            }
            return Ok(write(&mut *self.transaction(), &kept, &[])?);
        }
        let kept: Vec<GraphName> = contexts
            .iter()
            .filter(|g| self.is_inferred(g))
            .cloned()
            .collect();
        if kept.len() < contexts.len() {
            self.warn_filtered();
        }
        if kept.is_empty() {
            return Ok(());
        }
        Ok(write(&mut *self.transaction(), statements, &kept)?)
    }
}

impl<T: Transaction> Context for InferenceContext<T> {
    fn query(
        &self,
        query: &Query,
        dataset: Option<&QueryDataset>,
        bindings: Option<&BindingSet>,
        include_closure: bool,
        timeout: Option<Duration>,
    ) -> Result<Cursor<BindingSet>, InferenceError> {
        self.check_read()?;
        let timeout = timeout.or(self.timeout);
        let result = if include_closure {
            self.transaction().query(query, dataset, bindings, timeout)?
        } else {
            let mut q = query.clone();
            if let Some(ds) = dataset {
                q = q.with_dataset(ds.clone());
            }
            match q.excluding_prefix(&self.prefix) {
                Some(q) => self.transaction().query(&q, None, bindings, timeout)?,
                None => QueryResult::empty_for(query),
            }
        };
        Ok(self.cursor(result.into_bindings()))
    }

    fn statements(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        include_closure: bool,
        contexts: &[GraphName],
    ) -> Result<Cursor<Statement>, InferenceError> {
        self.check_read()?;
        let tx = self.transaction();
        let found = if include_closure {
            tx.statements(s, p, o, contexts)?
        } else {
            let contexts = self.explicit_contexts(&tx, contexts)?;
            if contexts.is_empty() {
                vec![]
            } else {
                tx.statements(s, p, o, &contexts)?
            }
        };
        drop(tx);
        Ok(self.cursor(found))
    }

    fn has_statement(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        include_closure: bool,
        contexts: &[GraphName],
    ) -> Result<bool, InferenceError> {
        self.check_read()?;
        let tx = self.transaction();
        if include_closure {
            return Ok(tx.has_statement(s, p, o, contexts)?);
        }
        let contexts = self.explicit_contexts(&tx, contexts)?;
        Ok(!contexts.is_empty() && tx.has_statement(s, p, o, &contexts)?)
    }

    fn context_ids(&self, include_closure: bool) -> Result<Vec<Value>, InferenceError> {
        self.check_read()?;
        let mut ids = self.transaction().context_ids()?;
        if !include_closure {
            ids.retain(|g| !has_prefix(g, &self.prefix));
        }
        Ok(ids)
    }

    fn size(&self, include_closure: bool, contexts: &[GraphName]) -> Result<usize, InferenceError> {
        self.check_read()?;
        let tx = self.transaction();
        if include_closure {
            return Ok(tx.size(contexts)?);
        }
        let contexts = self.explicit_contexts(&tx, contexts)?;
        if contexts.is_empty() {
            Ok(0)
        } else {
            Ok(tx.size(&contexts)?)
        }
    }

    fn add_inferred(
        &self,
        statements: &[Statement],
        contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        trace!("adding {} inferred statement(s)", statements.len());
        self.filtered_write(statements, contexts, |tx, st, c| tx.add(st, c))
    }

    fn remove_inferred(
        &self,
        statements: &[Statement],
        contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        trace!("removing {} inferred statement(s)", statements.len());
        self.filtered_write(statements, contexts, |tx, st, c| tx.remove(st, c))
    }

    fn remove_inferred_matching(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        self.check_write()?;
        let mut tx = self.transaction();
        match self.inferred_contexts(&tx, contexts)? {
            Some(contexts) => Ok(tx.remove_matching(s, p, o, &contexts)?),
            None => Ok(()),
        }
    }

    fn scheduler(&self) -> Option<Arc<ThreadPool>> {
        self.scheduler.clone()
    }
}

impl<T> std::fmt::Debug for InferenceContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceContext")
            .field("prefix", &self.prefix)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

/// Keeps an [`InferenceContext`] unlocked while alive.
///
/// Dropping it locks the context again, and closes all cursors left open.
pub struct Unlocked<'a, T: Transaction> {
    context: &'a InferenceContext<T>,
}

impl<T: Transaction> Drop for Unlocked<'_, T> {
    fn drop(&mut self) {
        self.context.lock();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sophia_store::{
        algebra::{PatternTerm, QuadPattern},
        memory::{MemoryStore, MemoryTransaction},
        term::iri,
        Store,
    };

    const PREFIX: &str = "urn:inferred:";

    fn st(s: &str, o: &str, g: Option<&str>) -> Statement {
        Statement::new(iri(s), iri("x:p"), iri(o), g.map(iri))
    }

    fn context() -> InferenceContext<MemoryTransaction> {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.add(
            &[
                st("x:a", "x:b", None),
                st("x:b", "x:c", Some("x:g")),
                st("x:a", "x:c", Some("urn:inferred:rdfs")),
            ],
            &[],
        )
        .unwrap();
        InferenceContext::new(Arc::new(Mutex::new(tx)), PREFIX.into(), None, None)
    }

    #[test]
    fn locked_by_default() {
        let ctx = context();
        assert!(matches!(ctx.size(true, &[]), Err(InferenceError::ContextLocked(_))));
        {
            let _guard = ctx.unlock(false).unwrap();
            assert!(ctx.is_unlocked());
            assert_eq!(ctx.size(true, &[]).unwrap(), 3);
            assert!(matches!(
                ctx.add_inferred(&[], &[]),
                Err(InferenceError::ContextLocked(_))
            ));
            assert!(matches!(ctx.unlock(true), Err(InferenceError::Fatal(_))));
        }
        assert!(!ctx.is_unlocked());
        assert!(matches!(ctx.size(true, &[]), Err(InferenceError::ContextLocked(_))));
    }

    #[test]
    fn closure_can_be_hidden() {
        let ctx = context();
        let _guard = ctx.unlock(false).unwrap();
        assert_eq!(ctx.size(false, &[]).unwrap(), 2);
        assert_eq!(ctx.context_ids(false).unwrap(), vec![iri("x:g")]);
        assert!(!ctx
            .has_statement(None, None, Some(&iri("x:c")), false, &[Some(iri("urn:inferred:rdfs"))])
            .unwrap());
        let q = Query::select(vec![QuadPattern::new(
            PatternTerm::var("s"),
            iri("x:p"),
            iri("x:c"),
        )]);
        let all: Vec<_> = ctx.query(&q, None, None, true, None).unwrap().collect();
        assert_eq!(all.len(), 2);
        let explicit: Vec<_> = ctx.query(&q, None, None, false, None).unwrap().collect();
        assert_eq!(explicit.len(), 1);
    }

    #[test]
    fn writes_are_filtered() {
        let ctx = context();
        let _guard = ctx.unlock(true).unwrap();
        ctx.add_inferred(
            &[st("x:x", "x:y", None), st("x:x", "x:y", Some("urn:inferred:rdfs"))],
            &[],
        )
        .unwrap();
        assert_eq!(ctx.size(true, &[None]).unwrap(), 1);
        assert_eq!(ctx.size(true, &[Some(iri("urn:inferred:rdfs"))]).unwrap(), 2);

        ctx.add_inferred(&[st("x:z", "x:z", None)], &[Some(iri("x:g")), None])
            .unwrap();
        assert_eq!(ctx.size(true, &[]).unwrap(), 4);

        ctx.remove_inferred(&[st("x:a", "x:b", None)], &[]).unwrap();
        assert_eq!(ctx.size(true, &[None]).unwrap(), 1);

        ctx.remove_inferred_matching(None, None, None, &[]).unwrap();
        assert_eq!(ctx.size(true, &[]).unwrap(), 2);
        assert_eq!(ctx.size(false, &[]).unwrap(), 2);
    }

    #[test]
    fn leaked_cursors_are_closed() {
        let ctx = context();
        let mut leaked = {
            let _guard = ctx.unlock(false).unwrap();
            let mut c = ctx.statements(None, None, None, true, &[]).unwrap();
            assert!(matches!(c.next(), Some(Ok(_))));
            c
        };
        assert!(leaked.is_closed());
        assert!(matches!(leaked.next(), Some(Err(InferenceError::CursorClosed))));
    }
}
