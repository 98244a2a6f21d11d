// Evaluation of conjunctive queries over a memory snapshot.

use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use crate::{
    algebra::{PatternTerm, QuadPattern, Query, QueryDataset, QueryForm},
    binding::BindingSet,
    QueryResult,
    StoreError,
};

use super::{_index::DEFAULT_GRAPH, State};

pub struct Evaluator<'a> {
    state: &'a State,
    dataset: QueryDataset,
    timeout: Option<(Instant, Duration)>,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        state: &'a State,
        query: &Query,
        dataset: Option<&QueryDataset>,
        timeout: Option<Duration>,
    ) -> Self {
        let dataset = dataset
            .or(query.dataset.as_ref())
            .cloned()
            .unwrap_or_default();
        let timeout = timeout.map(|d| (Instant::now() + d, d));
        Evaluator {
            state,
            dataset,
            timeout,
        }
    }

    pub fn query(
        &self,
        query: &Query,
        bindings: Option<&BindingSet>,
    ) -> Result<QueryResult, StoreError> {
        let rows = self.solutions(query, bindings)?;
        Ok(match &query.form {
            QueryForm::Ask => QueryResult::Boolean(!rows.is_empty()),
            QueryForm::Select {
                projection,
                distinct,
            } => {
                let mut rows = match projection {
                    None => rows,
                    Some(vars) => rows.into_iter().map(|b| b.project(vars.as_slice())).collect(),
                };
                if *distinct {
                    let mut seen = HashSet::new();
                    rows.retain(|b| seen.insert(b.clone()));
                }
                QueryResult::Bindings(rows)
            }
        })
    }

    /// All solutions of the patterns and filters of `query`, ignoring its form.
    pub fn solutions(
        &self,
        query: &Query,
        bindings: Option<&BindingSet>,
    ) -> Result<Vec<BindingSet>, StoreError> {
        let mut rows = vec![];
        let b = bindings.cloned().unwrap_or_default();
        self.bgp_rec(&query.patterns, &mut rows, b)?;
        rows.retain(|b| query.filters.iter().all(|f| f.is_satisfied(b)));
        Ok(rows)
    }

    fn check_deadline(&self) -> Result<(), StoreError> {
        match self.timeout {
            Some((deadline, duration)) if Instant::now() > deadline => {
                Err(StoreError::Timeout(duration))
            }
            _ => Ok(()),
        }
    }

    fn bgp_rec(
        &self,
        patterns: &[QuadPattern],
        bs: &mut Vec<BindingSet>,
        b: BindingSet,
    ) -> Result<(), StoreError> {
        let [first, remaining @ ..] = patterns else {
            // empty BGP, always succeeds
            bs.push(b);
            return Ok(());
        };
        self.check_deadline()?;
        let Some(keys) = self.bound_keys(first, &b) else {
            // a bound term is unknown to the store, no match for this pattern
            return Ok(());
        };
        // the default graph is a merge, so a triple held by several graphs matches once
        let mut seen = HashSet::new();
        for [si, pi, oi, gi] in self.state.quads.matching(keys) {
            if !self.graph_visible(first, gi) {
                continue;
            }
            if first.g.is_none() && !seen.insert([si, pi, oi]) {
                continue;
            }
            let mut b = b.clone();
            let positions = [Some(&first.s), Some(&first.p), Some(&first.o), first.g.as_ref()];
            let mut ok = true;
            for (pat, idx) in positions.into_iter().zip([si, pi, oi, gi]) {
                let Some(PatternTerm::Var(v)) = pat else {
                    continue;
                };
                let value = self.state.get_term(idx);
                match b.get(v) {
                    Some(bound) if bound != value => {
                        ok = false;
                        break;
                    }
                    Some(_) => {}
                    None => {
                        b.insert(v.clone(), value.clone());
                    }
                }
            }
            if ok {
                self.bgp_rec(remaining, bs, b)?;
            }
        }
        Ok(())
    }

    /// The term indices of the bound positions of `tp`, or `None` if one of them is not in the store.
    fn bound_keys(&self, tp: &QuadPattern, b: &BindingSet) -> Option<[Option<usize>; 4]> {
        let key = |pt: &PatternTerm| -> Option<Option<usize>> {
            match pt.resolve(b) {
                None => Some(None),
                Some(t) => self.state.get_index(t).map(Some),
            }
        };
        let g = match &tp.g {
            None => match &self.dataset.default {
                Some(graphs) if graphs.len() == 1 => Some(self.state.graph_key(&graphs[0])?),
                _ => None,
            },
            Some(pt) => key(pt)?,
        };
        Some([key(&tp.s)?, key(&tp.p)?, key(&tp.o)?, g])
    }

    fn graph_visible(&self, tp: &QuadPattern, gi: usize) -> bool {
        match &tp.g {
            None => self.dataset.in_default(&self.state.graph_name(gi)),
            Some(_) => gi != DEFAULT_GRAPH && self.dataset.in_named(self.state.get_term(gi)),
        }
    }
}
