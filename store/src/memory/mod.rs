//! An in-memory implementation of [`Store`].
//!
//! Each transaction works on its own copy-on-write snapshot of the store;
//! committing publishes that snapshot, overwriting concurrent commits (last writer wins).
use std::{
    collections::HashMap,
    sync::{atomic::{AtomicU64, Ordering}, Arc, RwLock},
    time::Duration,
};

use log::{debug, trace};

use crate::{
    algebra::{Query, QueryDataset, Update},
    binding::BindingSet,
    term::{GraphName, Value},
    QueryResult,
    Statement,
    Store,
    StoreError,
    Transaction,
};

mod _eval;
use _eval::Evaluator;
mod _index;
use _index::{QuadIndex, DEFAULT_GRAPH};

/// Interned terms plus quad indexes.
#[derive(Clone, Debug, Default)]
struct State {
    i2t: Vec<Value>,
    t2i: HashMap<Value, usize>,
    quads: QuadIndex,
}

impl State {
    fn get_index(&self, t: &Value) -> Option<usize> {
        self.t2i.get(t).copied()
    }

    fn get_or_make_index(&mut self, t: &Value) -> usize {
        if let Some(i) = self.t2i.get(t) {
            return *i;
        }
        let i = self.i2t.len();
        self.i2t.push(t.clone());
        self.t2i.insert(t.clone(), i);
        i
    }

    fn get_term(&self, i: usize) -> &Value {
        &self.i2t[i]
    }

    /// The key of graph `g`, or `None` if `g` is a named graph unknown to the store.
    fn graph_key(&self, g: &GraphName) -> Option<usize> {
        match g {
            None => Some(DEFAULT_GRAPH),
            Some(g) => self.get_index(g),
        }
    }

    fn graph_name(&self, key: usize) -> GraphName {
        if key == DEFAULT_GRAPH {
            None
        } else {
            Some(self.get_term(key).clone())
        }
    }

    fn statement(&self, [s, p, o, g]: [usize; 4]) -> Statement {
        Statement::new(
            self.get_term(s).clone(),
            self.get_term(p).clone(),
            self.get_term(o).clone(),
            self.graph_name(g),
        )
    }

    fn insert(&mut self, st: &Statement, g: &GraphName) -> bool {
        let s = self.get_or_make_index(st.s());
        let p = self.get_or_make_index(st.p());
        let o = self.get_or_make_index(st.o());
        let g = match g {
            None => DEFAULT_GRAPH,
            Some(g) => self.get_or_make_index(g),
        };
        self.quads.insert([s, p, o, g])
    }

    fn remove(&mut self, st: &Statement, g: &GraphName) -> bool {
        let key = (|| {
            Some([
                self.get_index(st.s())?,
                self.get_index(st.p())?,
                self.get_index(st.o())?,
                self.graph_key(g)?,
            ])
        })();
        match key {
            Some(q) => self.quads.remove(q),
            None => false,
        }
    }

    /// Matching quads, as indices, in the given contexts (all contexts if empty).
    fn matching(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Vec<[usize; 4]> {
        let key = |t: Option<&Value>| -> Option<Option<usize>> {
            match t {
                None => Some(None),
                Some(t) => self.get_index(t).map(Some),
            }
        };
        let (Some(s), Some(p), Some(o)) = (key(s), key(p), key(o)) else {
            return vec![];
        };
        if contexts.is_empty() {
            return self.quads.matching([s, p, o, None]);
        }
        let mut keys: Vec<usize> = contexts.iter().filter_map(|g| self.graph_key(g)).collect();
        keys.sort_unstable();
        keys.dedup();
        keys.into_iter()
            .flat_map(|g| self.quads.matching([s, p, o, Some(g)]))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: RwLock<Arc<State>>,
    counter: AtomicU64,
}

/// A thread-safe in-memory quad store.
///
/// Cloning a `MemoryStore` gives another handle on the same data.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Shared>,
}

impl MemoryStore {
    /// A new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of committed statements.
    pub fn len(&self) -> usize {
        self.snapshot().quads.len()
    }

    /// Whether the store contains no committed statement.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<State> {
        match self.inner.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Store for MemoryStore {
    type Transaction = MemoryTransaction;

    fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("mem-{n}");
        trace!("begin {id}");
        Ok(MemoryTransaction {
            id,
            shared: self.inner.clone(),
            state: self.snapshot(),
            closed: false,
        })
    }
}

/// A transaction on a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTransaction {
    id: String,
    shared: Arc<Shared>,
    state: Arc<State>,
    closed: bool,
}

impl MemoryTransaction {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    fn state_mut(&mut self) -> Result<&mut State, StoreError> {
        self.check_open()?;
        Ok(Arc::make_mut(&mut self.state))
    }
}

impl Transaction for MemoryTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    fn query(
        &self,
        query: &Query,
        dataset: Option<&QueryDataset>,
        bindings: Option<&BindingSet>,
        timeout: Option<Duration>,
    ) -> Result<QueryResult, StoreError> {
        self.check_open()?;
        trace!("{} query: {query}", self.id);
        Evaluator::new(&self.state, query, dataset, timeout).query(query, bindings)
    }

    fn update(
        &mut self,
        update: &Update,
        dataset: Option<&QueryDataset>,
        bindings: Option<&BindingSet>,
        timeout: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        trace!("{} update: {update}", self.id);
        let solutions = Evaluator::new(&self.state, &update.pattern, dataset, timeout)
            .solutions(&update.pattern, bindings)?;
        let to_delete: Vec<Statement> = solutions
            .iter()
            .flat_map(|b| update.delete.iter().filter_map(|t| t.instantiate(b)))
            .collect();
        let to_insert: Vec<Statement> = solutions
            .iter()
            .flat_map(|b| update.insert.iter().filter_map(|t| t.instantiate(b)))
            .collect();
        let state = self.state_mut()?;
        for st in &to_delete {
            state.remove(st, st.c());
        }
        for st in &to_insert {
            state.insert(st, st.c());
        }
        Ok(())
    }

    fn statements(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<Vec<Statement>, StoreError> {
        self.check_open()?;
        Ok(self
            .state
            .matching(s, p, o, contexts)
            .into_iter()
            .map(|q| self.state.statement(q))
            .collect())
    }

    fn context_ids(&self) -> Result<Vec<Value>, StoreError> {
        self.check_open()?;
        Ok(self
            .state
            .quads
            .graphs()
            .into_iter()
            .filter(|g| *g != DEFAULT_GRAPH)
            .map(|g| self.state.get_term(g).clone())
            .collect())
    }

    fn size(&self, contexts: &[GraphName]) -> Result<usize, StoreError> {
        self.check_open()?;
        if contexts.is_empty() {
            Ok(self.state.quads.len())
        } else {
            Ok(self.state.matching(None, None, None, contexts).len())
        }
    }

    fn add(&mut self, statements: &[Statement], contexts: &[GraphName]) -> Result<(), StoreError> {
        let state = self.state_mut()?;
        for st in statements {
            if contexts.is_empty() {
                state.insert(st, st.c());
            } else {
                for g in contexts {
                    state.insert(st, g);
                }
            }
        }
        Ok(())
    }

    fn remove(
        &mut self,
        statements: &[Statement],
        contexts: &[GraphName],
    ) -> Result<(), StoreError> {
        let state = self.state_mut()?;
        for st in statements {
            if contexts.is_empty() {
                state.remove(st, st.c());
            } else {
                for g in contexts {
                    state.remove(st, g);
                }
            }
        }
        Ok(())
    }

    fn remove_matching(
        &mut self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let matching = self.state.matching(s, p, o, contexts);
        if matching.is_empty() {
            return Ok(());
        }
        let state = self.state_mut()?;
        for q in matching {
            state.quads.remove(q);
        }
        Ok(())
    }

    fn end(&mut self, commit: bool) -> Result<(), StoreError> {
        self.check_open()?;
        self.closed = true;
        if commit {
            let mut guard = match self.shared.state.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = self.state.clone();
            debug!("{} committed ({} statements)", self.id, self.state.quads.len());
        } else {
            debug!("{} rolled back", self.id);
        }
        Ok(())
    }
}
