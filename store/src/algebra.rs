//! A small conjunctive query algebra.
//!
//! [`Query`] and [`Update`] are what rules, closure plans and applications
//! hand to a [`Transaction`](crate::Transaction) for evaluation.
use std::{collections::BTreeSet, fmt, sync::Arc};

use sophia_api::term::Term;

use crate::{
    binding::BindingSet,
    expression::Expression,
    statement::Statement,
    term::{graph_has_prefix, has_prefix, is_resource, GraphName, Nt, Value},
};

/// One position of a [`QuadPattern`].
#[derive(Clone, Debug, PartialEq)]
pub enum PatternTerm {
    /// A variable, bound by matching
    Var(Arc<str>),
    /// A constant value
    Const(Value),
}

impl PatternTerm {
    /// A variable pattern term
    pub fn var<N: Into<Arc<str>>>(name: N) -> Self {
        PatternTerm::Var(name.into())
    }

    /// The variable name, if this is a variable
    pub fn variable(&self) -> Option<&Arc<str>> {
        match self {
            PatternTerm::Var(v) => Some(v),
            PatternTerm::Const(_) => None,
        }
    }

    /// The value of this pattern term under `b`, if it is a constant or a bound variable
    pub fn resolve<'a>(&'a self, b: &'a BindingSet) -> Option<&'a Value> {
        match self {
            PatternTerm::Var(v) => b.get(v),
            PatternTerm::Const(c) => Some(c),
        }
    }
}

impl From<Value> for PatternTerm {
    fn from(value: Value) -> Self {
        PatternTerm::Const(value)
    }
}

impl fmt::Display for PatternTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternTerm::Var(v) => write!(f, "?{v}"),
            PatternTerm::Const(c) => write!(f, "{}", Nt(c)),
        }
    }
}

/// A statement pattern.
///
/// A pattern without graph matches the default graph of the query dataset;
/// a pattern with a graph matches named graphs only.
#[derive(Clone, Debug, PartialEq)]
pub struct QuadPattern {
    /// Subject pattern
    pub s: PatternTerm,
    /// Predicate pattern
    pub p: PatternTerm,
    /// Object pattern
    pub o: PatternTerm,
    /// Graph pattern, if any
    pub g: Option<PatternTerm>,
}

impl QuadPattern {
    /// A pattern over the default graph
    pub fn new<S, P, O>(s: S, p: P, o: O) -> Self
    where
        S: Into<PatternTerm>,
        P: Into<PatternTerm>,
        O: Into<PatternTerm>,
    {
        Self {
            s: s.into(),
            p: p.into(),
            o: o.into(),
            g: None,
        }
    }

    /// This pattern, restricted to named graphs matching `g`
    pub fn in_graph<G: Into<PatternTerm>>(mut self, g: G) -> Self {
        self.g = Some(g.into());
        self
    }

    /// The four positions of this pattern (graph last, if any)
    pub fn positions(&self) -> impl Iterator<Item = &PatternTerm> + '_ {
        [&self.s, &self.p, &self.o].into_iter().chain(self.g.as_ref())
    }

    /// The variables used in this pattern
    pub fn variables(&self) -> impl Iterator<Item = &Arc<str>> + '_ {
        self.positions().filter_map(PatternTerm::variable)
    }

    /// Build the statement described by this pattern under `b`.
    ///
    /// Return `None` if a position is unbound,
    /// or if the result would not be a valid statement.
    pub fn instantiate(&self, b: &BindingSet) -> Option<Statement> {
        let s = self.s.resolve(b)?;
        let p = self.p.resolve(b)?;
        let o = self.o.resolve(b)?;
        let g = match &self.g {
            None => None,
            Some(g) => Some(g.resolve(b)?.clone()),
        };
        if !is_resource(s) || !p.is_iri() || g.as_ref().is_some_and(|g| !is_resource(g)) {
            return None;
        }
        Some(Statement::new(s.clone(), p.clone(), o.clone(), g))
    }
}

impl fmt::Display for QuadPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.g {
            None => write!(f, "{} {} {} .", self.s, self.p, self.o),
            Some(g) => write!(f, "GRAPH {g} {{ {} {} {} . }}", self.s, self.p, self.o),
        }
    }
}

/// Templates used by [`Update`] are plain quad patterns,
/// instantiated with each solution of the update's `WHERE` clause.
pub type QuadTemplate = QuadPattern;

/// Which graphs of the store a query may read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryDataset {
    /// Graphs merged into the default graph (`None`: all graphs, including the store's default graph)
    pub default: Option<Vec<GraphName>>,
    /// Graphs visible to `GRAPH` patterns (`None`: all named graphs)
    pub named: Option<Vec<Value>>,
    /// Named graphs whose IRI starts with one of these prefixes are never read
    pub excluded_prefixes: Vec<Arc<str>>,
}

impl QueryDataset {
    /// A dataset whose default graph is the merge of `graphs`
    pub fn with_default(graphs: Vec<GraphName>) -> Self {
        Self {
            default: Some(graphs),
            ..Self::default()
        }
    }

    /// Whether graph `g` is readable as part of the default graph
    pub fn in_default(&self, g: &GraphName) -> bool {
        !self.is_excluded(g)
            && self
                .default
                .as_ref()
                .map(|graphs| graphs.contains(g))
                .unwrap_or(true)
    }

    /// Whether graph `g` is readable through a `GRAPH` pattern
    pub fn in_named(&self, g: &Value) -> bool {
        let gn = Some(g.clone());
        !self.is_excluded(&gn)
            && self
                .named
                .as_ref()
                .map(|graphs| graphs.contains(g))
                .unwrap_or(true)
    }

    /// Whether `g` falls under one of the excluded prefixes
    pub fn is_excluded(&self, g: &GraphName) -> bool {
        self.excluded_prefixes
            .iter()
            .any(|prefix| graph_has_prefix(g, prefix))
    }

    /// Add `prefix` to the excluded prefixes and drop the listed graphs it covers.
    pub fn exclude_prefix(&mut self, prefix: &str) {
        if let Some(default) = &mut self.default {
            default.retain(|g| !graph_has_prefix(g, prefix));
        }
        if let Some(named) = &mut self.named {
            named.retain(|g| !has_prefix(g, prefix));
        }
        if !self.excluded_prefixes.iter().any(|p| p.as_ref() == prefix) {
            self.excluded_prefixes.push(prefix.into());
        }
    }
}

impl fmt::Display for QueryDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for g in self.default.iter().flatten() {
            match g {
                Some(g) => write!(f, "FROM {} ", Nt(g))?,
                None => f.write_str("FROM DEFAULT ")?,
            }
        }
        for g in self.named.iter().flatten() {
            write!(f, "FROM NAMED {} ", Nt(g))?;
        }
        for prefix in &self.excluded_prefixes {
            write!(f, "EXCLUDING <{prefix}> ")?;
        }
        Ok(())
    }
}

/// The kind of result a [`Query`] produces.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryForm {
    /// Produce solution rows
    Select {
        /// The variables to keep (`None`: all)
        projection: Option<Vec<Arc<str>>>,
        /// Whether to remove duplicate rows
        distinct: bool,
    },
    /// Produce whether a solution exists
    Ask,
}

/// A conjunctive query: a list of quad patterns joined in order, then filtered.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// The result form
    pub form: QueryForm,
    /// Patterns, joined in the given order
    pub patterns: Vec<QuadPattern>,
    /// Conditions every solution must satisfy
    pub filters: Vec<Expression>,
    /// Dataset pinned by the query itself, if any
    pub dataset: Option<QueryDataset>,
}

impl Query {
    /// A `SELECT *` query over the given patterns
    pub fn select(patterns: Vec<QuadPattern>) -> Self {
        Self {
            form: QueryForm::Select {
                projection: None,
                distinct: false,
            },
            patterns,
            filters: vec![],
            dataset: None,
        }
    }

    /// An `ASK` query over the given patterns
    pub fn ask(patterns: Vec<QuadPattern>) -> Self {
        Self {
            form: QueryForm::Ask,
            ..Self::select(patterns)
        }
    }

    /// Add a filter to this query
    pub fn filter(mut self, condition: Expression) -> Self {
        self.filters.push(condition);
        self
    }

    /// Restrict the variables returned by this query
    pub fn project<N: Into<Arc<str>>, I: IntoIterator<Item = N>>(mut self, variables: I) -> Self {
        if let QueryForm::Select { projection, .. } = &mut self.form {
            *projection = Some(variables.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Make this query return distinct rows
    pub fn distinct(mut self) -> Self {
        if let QueryForm::Select { distinct, .. } = &mut self.form {
            *distinct = true;
        }
        self
    }

    /// Whether this is an `ASK` query
    pub fn is_ask(&self) -> bool {
        matches!(self.form, QueryForm::Ask)
    }

    /// All variables bound by the patterns of this query
    pub fn variables(&self) -> BTreeSet<Arc<str>> {
        self.patterns
            .iter()
            .flat_map(QuadPattern::variables)
            .cloned()
            .collect()
    }

    /// This query, with `dataset` pinned explicitly.
    pub fn with_dataset(mut self, dataset: QueryDataset) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// This query, prevented from reading graphs whose IRI starts with `prefix`.
    ///
    /// Return `None` if the query can not produce any solution once these graphs are hidden.
    pub fn excluding_prefix(mut self, prefix: &str) -> Option<Self> {
        let mut dataset = self.dataset.take().unwrap_or_default();
        dataset.exclude_prefix(prefix);
        let default_empty = matches!(&dataset.default, Some(d) if d.is_empty());
        let named_empty = matches!(&dataset.named, Some(n) if n.is_empty());
        for tp in &self.patterns {
            match &tp.g {
                None if default_empty => return None,
                Some(_) if named_empty => return None,
                Some(PatternTerm::Const(g)) if has_prefix(g, prefix) => return None,
                _ => {}
            }
        }
        self.dataset = Some(dataset);
        Some(self)
    }

    fn write_where(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WHERE { ")?;
        for tp in &self.patterns {
            write!(f, "{tp} ")?;
        }
        for e in &self.filters {
            write!(f, "FILTER({e}) ")?;
        }
        f.write_str("}")
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.form {
            QueryForm::Ask => f.write_str("ASK ")?,
            QueryForm::Select {
                projection,
                distinct,
            } => {
                f.write_str("SELECT ")?;
                if *distinct {
                    f.write_str("DISTINCT ")?;
                }
                match projection {
                    None => f.write_str("* ")?,
                    Some(vars) => {
                        for v in vars {
                            write!(f, "?{v} ")?;
                        }
                    }
                }
            }
        }
        if let Some(ds) = &self.dataset {
            write!(f, "{ds}")?;
        }
        self.write_where(f)
    }
}

/// A `DELETE { .. } INSERT { .. } WHERE { .. }` update.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    /// Templates of the statements to remove
    pub delete: Vec<QuadTemplate>,
    /// Templates of the statements to add
    pub insert: Vec<QuadTemplate>,
    /// The `WHERE` clause (its form is ignored)
    pub pattern: Query,
}

impl Update {
    /// An update inserting `insert` for each solution of `pattern`
    pub fn insert(insert: Vec<QuadTemplate>, pattern: Query) -> Self {
        Self {
            delete: vec![],
            insert,
            pattern,
        }
    }

    /// An update deleting `delete` for each solution of `pattern`
    pub fn delete(delete: Vec<QuadTemplate>, pattern: Query) -> Self {
        Self {
            delete,
            insert: vec![],
            pattern,
        }
    }

    /// An update inserting ground statements
    pub fn insert_data(statements: Vec<QuadTemplate>) -> Self {
        Self::insert(statements, Query::select(vec![]))
    }

    /// This update, with `dataset` pinned explicitly
    pub fn with_dataset(mut self, dataset: QueryDataset) -> Self {
        self.pattern = self.pattern.with_dataset(dataset);
        self
    }

    /// This update, prevented from reading graphs whose IRI starts with `prefix`.
    ///
    /// Return `None` if the `WHERE` clause can not produce any solution once these graphs are hidden,
    /// i.e. if the update can have no effect.
    pub fn excluding_prefix(mut self, prefix: &str) -> Option<Self> {
        self.pattern = self.pattern.excluding_prefix(prefix)?;
        Some(self)
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.delete.is_empty() {
            f.write_str("DELETE { ")?;
            for tp in &self.delete {
                write!(f, "{tp} ")?;
            }
            f.write_str("} ")?;
        }
        if !self.insert.is_empty() {
            f.write_str("INSERT { ")?;
            for tp in &self.insert {
                write!(f, "{tp} ")?;
            }
            f.write_str("} ")?;
        }
        if let Some(ds) = &self.pattern.dataset {
            write!(f, "{ds}")?;
        }
        self.pattern.write_where(f)
    }
}
