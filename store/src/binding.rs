//! Variable bindings, as produced by query evaluation and consumed by rules.
use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt,
    sync::Arc,
};

use crate::term::{Nt, Value};

/// An assignment of variables to values, i.e. one row of a query result.
///
/// Variables are kept sorted, so that two binding sets with the same content
/// compare (and hash) equal regardless of how they were built.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BindingSet {
    v: BTreeMap<Arc<str>, Value>,
}

impl BindingSet {
    /// An empty binding set
    pub fn new() -> Self {
        Self::default()
    }

    /// The value bound to `name`, if any
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.v.get(name)
    }

    /// Whether `name` is bound
    pub fn contains(&self, name: &str) -> bool {
        self.v.contains_key(name)
    }

    /// Bind `name` to `value`, returning the previous value if any
    pub fn insert<N: Into<Arc<str>>>(&mut self, name: N, value: Value) -> Option<Value> {
        self.v.insert(name.into(), value)
    }

    /// Bind `name` to `value` in a copy of `self`
    pub fn with<N: Into<Arc<str>>>(mut self, name: N, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    /// Unbind `name`
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.v.remove(name)
    }

    /// Number of bound variables
    pub fn len(&self) -> usize {
        self.v.len()
    }

    /// Whether no variable is bound
    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    /// Iterate over (variable, value) pairs, sorted by variable name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.v.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// Iterate over bound variable names
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.v.keys().map(AsRef::as_ref)
    }

    /// Return a copy of `base` where all bindings of `self` have been added,
    /// overriding those of `base` for variables bound in both.
    pub fn overlay(&self, base: &BindingSet) -> BindingSet {
        let mut ret = base.clone();
        for (k, v) in &self.v {
            ret.v.insert(k.clone(), v.clone());
        }
        ret
    }

    /// Return whether `self` and `other` agree on all the variables they both bind.
    pub fn compatible(&self, other: &BindingSet) -> bool {
        other
            .v
            .iter()
            .all(|(k, v)| self.v.get(k).map(|mine| mine == v).unwrap_or(true))
    }

    /// Merge `other` into `self` if they are compatible.
    pub fn merge_if_compatible(mut self, other: &BindingSet) -> Option<BindingSet> {
        for (k, v) in &other.v {
            match self.v.entry(k.clone()) {
                Entry::Occupied(e) => {
                    if e.get() != v {
                        return None;
                    }
                }
                Entry::Vacant(e) => {
                    e.insert(v.clone());
                }
            }
        }
        Some(self)
    }

    /// Keep only the given variables.
    pub fn project<S: AsRef<str>>(mut self, variables: &[S]) -> BindingSet {
        self.v
            .retain(|k, _| variables.iter().any(|i| i.as_ref() == k.as_ref()));
        self
    }
}

impl<N: Into<Arc<str>>> FromIterator<(N, Value)> for BindingSet {
    fn from_iter<I: IntoIterator<Item = (N, Value)>>(iter: I) -> Self {
        Self {
            v: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl fmt::Display for BindingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.v.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "?{k}={}", Nt(v))?;
        }
        f.write_str("}")
    }
}
