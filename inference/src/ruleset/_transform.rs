use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use sophia_api::term::Term;
use sophia_store::{binding::BindingSet, expression::Expression, term::Value};

use crate::InferenceError;

/// A named post-processing of the rows produced by a rule body.
pub trait Transform: Send + Sync {
    /// Transform `rows`; `args` are evaluated from the rule bindings.
    fn apply(
        &self,
        rows: Vec<BindingSet>,
        args: &[Value],
    ) -> Result<Vec<BindingSet>, InferenceError>;
}

/// The invocation of a [`Transform`] by a rule.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformCall {
    /// Name of the transform in the [`TransformRegistry`]
    pub name: Arc<str>,
    /// Arguments, evaluated against the bindings the rule is fired with
    pub args: Vec<Expression>,
}

impl TransformCall {
    /// Call transform `name` with the given arguments
    pub fn new<N: Into<Arc<str>>>(name: N, args: Vec<Expression>) -> Self {
        TransformCall {
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for TransformCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, a) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{a}")?;
        }
        f.write_str(")")
    }
}

/// The transforms available to rules, by name.
#[derive(Clone)]
pub struct TransformRegistry {
    transforms: HashMap<Arc<str>, Arc<dyn Transform>>,
}

impl TransformRegistry {
    /// A registry without any transform.
    pub fn empty() -> Self {
        TransformRegistry {
            transforms: HashMap::new(),
        }
    }

    /// Register `transform` under `name`, replacing any previous one.
    pub fn register<N: Into<Arc<str>>, T: Transform + 'static>(&mut self, name: N, transform: T) {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    /// Whether a transform is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Apply `call` to `rows`, evaluating its arguments against `bindings`.
    pub fn apply(
        &self,
        call: &TransformCall,
        rows: Vec<BindingSet>,
        bindings: &BindingSet,
    ) -> Result<Vec<BindingSet>, InferenceError> {
        let transform = self
            .transforms
            .get(&call.name)
            .ok_or_else(|| InferenceError::Fatal(format!("unknown transform {}", call.name)))?;
        let args = call
            .args
            .iter()
            .map(|a| {
                a.eval(bindings).ok_or_else(|| {
                    InferenceError::Fatal(format!("argument {a} of {} has no value", call.name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        transform.apply(rows, &args)
    }
}

/// The default registry contains [`TransitiveReduction`] as `transitive-reduction`.
impl Default for TransformRegistry {
    fn default() -> Self {
        let mut ret = Self::empty();
        ret.register(TRANSITIVE_REDUCTION, TransitiveReduction);
        ret
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.transforms.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry")
            .field("transforms", &names)
            .finish()
    }
}

/// Name of the [`TransitiveReduction`] transform in the default registry
pub const TRANSITIVE_REDUCTION: &str = "transitive-reduction";

/// Keep only the rows whose edge is not implied by a longer path.
///
/// Arguments are the names (as literals) of the variables holding
/// the source and the target of the edge. Rows not binding both are kept.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransitiveReduction;

impl Transform for TransitiveReduction {
    fn apply(
        &self,
        rows: Vec<BindingSet>,
        args: &[Value],
    ) -> Result<Vec<BindingSet>, InferenceError> {
        let [src, dst] = args else {
            return Err(InferenceError::Fatal(format!(
                "{TRANSITIVE_REDUCTION} expects 2 arguments, got {}",
                args.len()
            )));
        };
        let (Some(src), Some(dst)) = (src.lexical_form(), dst.lexical_form()) else {
            return Err(InferenceError::Fatal(format!(
                "{TRANSITIVE_REDUCTION} expects variable names as literals"
            )));
        };
        let edge = |row: &BindingSet| Some((row.get(&src)?.clone(), row.get(&dst)?.clone()));

        let mut succ: BTreeMap<Value, HashSet<Value>> = BTreeMap::new();
        for (s, o) in rows.iter().filter_map(edge) {
            if s != o {
                succ.entry(s).or_default().insert(o);
            }
        }
        let reachable_without = |from: &Value, to: &Value| -> bool {
            let mut seen: HashSet<&Value> = HashSet::new();
            let mut stack: Vec<&Value> = succ
                .get(from)
                .into_iter()
                .flatten()
                .filter(|n| *n != to)
                .collect();
            while let Some(n) = stack.pop() {
                if n == to {
                    return true;
                }
                if n == from || !seen.insert(n) {
                    continue;
                }
                stack.extend(succ.get(n).into_iter().flatten());
            }
            false
        };
        Ok(rows
            .into_iter()
            .filter(|row| match edge(row) {
                Some((s, o)) => s == o || !reachable_without(&s, &o),
                None => true,
            })
            .collect())
    }
}
