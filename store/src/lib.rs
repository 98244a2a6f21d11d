//! This crate is part of [Sophia],
//! an [RDF] and [Linked Data] toolkit in Rust.
//!
//! It defines the transactional quad-store interface that the
//! [inference layer](https://docs.rs/sophia_inference) decorates:
//! a value model ([`Value`](term::Value), [`Statement`]),
//! a small conjunctive query algebra ([`Query`](algebra::Query), [`Update`](algebra::Update)),
//! the [`Store`] and [`Transaction`] traits,
//! and an in-memory backend, [`MemoryStore`](memory::MemoryStore).
//!
//! [Sophia]: https://docs.rs/sophia/latest/sophia/
//! [RDF]: https://www.w3.org/TR/rdf-primer/
//! [Linked Data]: http://linkeddata.org/
#![deny(missing_docs)]

use std::time::Duration;

pub mod algebra;
pub mod binding;
pub mod expression;
pub mod memory;
pub mod term;

mod error;
pub use error::StoreError;
mod statement;
pub use statement::Statement;

use algebra::{Query, QueryDataset, Update};
use binding::BindingSet;
use term::{GraphName, Value};

/// The result of evaluating a [`Query`].
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    /// The solutions of a `SELECT` query
    Bindings(Vec<BindingSet>),
    /// The answer to an `ASK` query
    Boolean(bool),
}

impl QueryResult {
    /// The trivial result of `query` when no solution is possible.
    pub fn empty_for(query: &Query) -> Self {
        if query.is_ask() {
            QueryResult::Boolean(false)
        } else {
            QueryResult::Bindings(vec![])
        }
    }

    /// Get this result as solutions.
    ///
    /// A boolean result is seen as a single empty solution (`true`) or no solution (`false`).
    pub fn into_bindings(self) -> Vec<BindingSet> {
        match self {
            QueryResult::Bindings(b) => b,
            QueryResult::Boolean(true) => vec![BindingSet::new()],
            QueryResult::Boolean(false) => vec![],
        }
    }

    /// Get this result as a boolean, i.e. whether there is at least one solution.
    pub fn into_boolean(self) -> bool {
        match self {
            QueryResult::Bindings(b) => !b.is_empty(),
            QueryResult::Boolean(b) => b,
        }
    }
}

/// A quad store able to start [transactions](Transaction).
pub trait Store: Send + Sync {
    /// The type of transactions of this store
    type Transaction: Transaction;

    /// Start a new transaction.
    fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

/// A transaction on a quad store.
///
/// Methods taking a `contexts` slice address all contexts when the slice is empty,
/// otherwise only the listed ones (`None` being the default graph).
pub trait Transaction: Send {
    /// A identifier of this transaction, unique within its store
    fn id(&self) -> &str;

    /// Evaluate `query`.
    ///
    /// `dataset`, if provided, overrides the dataset of the query;
    /// `bindings` pre-bind variables of the query, and are part of every solution.
    fn query(
        &self,
        query: &Query,
        dataset: Option<&QueryDataset>,
        bindings: Option<&BindingSet>,
        timeout: Option<Duration>,
    ) -> Result<QueryResult, StoreError>;

    /// Execute `update`.
    fn update(
        &mut self,
        update: &Update,
        dataset: Option<&QueryDataset>,
        bindings: Option<&BindingSet>,
        timeout: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// The statements matching the given subject, predicate, object (`None` matches anything).
    fn statements(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<Vec<Statement>, StoreError>;

    /// Whether any statement matches the given subject, predicate, object.
    fn has_statement(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<bool, StoreError> {
        Ok(!self.statements(s, p, o, contexts)?.is_empty())
    }

    /// The names of all non-empty named graphs.
    fn context_ids(&self) -> Result<Vec<Value>, StoreError>;

    /// The number of statements in the given contexts.
    fn size(&self, contexts: &[GraphName]) -> Result<usize, StoreError>;

    /// Add statements.
    ///
    /// If `contexts` is empty, each statement goes to its own context,
    /// otherwise each statement is added to every listed context.
    fn add(&mut self, statements: &[Statement], contexts: &[GraphName]) -> Result<(), StoreError>;

    /// Remove statements.
    ///
    /// If `contexts` is empty, each statement is removed from its own context,
    /// otherwise it is removed from every listed context.
    fn remove(&mut self, statements: &[Statement], contexts: &[GraphName])
    -> Result<(), StoreError>;

    /// Remove all statements matching the given subject, predicate, object.
    fn remove_matching(
        &mut self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<(), StoreError>;

    /// Commit (`commit == true`) or roll back this transaction.
    ///
    /// Any further call on this transaction fails with [`StoreError::Closed`].
    fn end(&mut self, commit: bool) -> Result<(), StoreError>;
}
