//! I define [`Ruleset`], a validated collection of [`Rule`]s
//! together with the [`ClosureTask`] plan computing their closure.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use log::debug;
use sophia_store::{
    binding::BindingSet,
    term::{Nt, Value},
};

use crate::{_digest::Digester, InferenceError};

mod _rule;
pub use _rule::*;
mod _task;
pub use _task::*;
mod _transform;
pub use _transform::*;

/// An immutable, validated set of rules, with their closure plan.
///
/// Rulesets are built with a [`RulesetBuilder`].
#[derive(Clone, Debug)]
pub struct Ruleset {
    id: Arc<str>,
    base: Option<String>,
    namespaces: BTreeMap<String, String>,
    parameters: BTreeMap<Arc<str>, Option<Value>>,
    rules: Vec<Rule>,
    index: HashMap<Arc<str>, usize>,
    plan: ClosureTask,
    backward: BTreeSet<Arc<str>>,
    digest: String,
}

impl Ruleset {
    /// Start building a ruleset with the given identifier.
    pub fn builder<I: Into<Arc<str>>>(id: I) -> RulesetBuilder {
        RulesetBuilder {
            id: id.into(),
            base: None,
            namespaces: BTreeMap::new(),
            parameters: vec![],
            rules: vec![],
            plan: None,
            backward: BTreeSet::new(),
        }
    }

    /// The identifier of this ruleset
    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    /// The base IRI of this ruleset, if any
    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    /// The namespaces declared by this ruleset, by prefix
    pub fn namespaces(&self) -> &BTreeMap<String, String> {
        &self.namespaces
    }

    /// The declared parameters, with their default values
    pub fn parameters(&self) -> &BTreeMap<Arc<str>, Option<Value>> {
        &self.parameters
    }

    /// The rules, in declaration order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The rule with the given identifier
    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.index.get(id).map(|i| &self.rules[*i])
    }

    /// The identifiers of all rules usable for forward reasoning
    pub fn forward_rule_ids(&self) -> BTreeSet<Arc<str>> {
        self.rules.iter().map(|r| r.id().clone()).collect()
    }

    /// The identifiers of the rules usable for backward reasoning
    pub fn backward_rule_ids(&self) -> &BTreeSet<Arc<str>> {
        &self.backward
    }

    /// The root of the closure plan
    pub fn plan(&self) -> &ClosureTask {
        &self.plan
    }

    /// A digest of the rules, parameters and plan of this ruleset
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The value of every parameter, given explicit `values`.
    ///
    /// Explicit values override defaults;
    /// undeclared names in `values` are rejected,
    /// declared parameters without any value are left unbound.
    pub fn parameter_bindings(&self, values: &BindingSet) -> Result<BindingSet, InferenceError> {
        if let Some(name) = values.names().find(|n| !self.parameters.contains_key(*n)) {
            return Err(InferenceError::Configuration(format!(
                "ruleset {} has no parameter {name}",
                self.id
            )));
        }
        let mut ret = BindingSet::new();
        for (name, default) in &self.parameters {
            match values.get(name).or(default.as_ref()) {
                Some(v) => {
                    ret.insert(name.clone(), v.clone());
                }
                None => debug!("parameter {name} of ruleset {} left unbound", self.id),
            }
        }
        Ok(ret)
    }

    /// A new builder, initialized with a copy of this ruleset.
    pub fn to_builder(&self) -> RulesetBuilder {
        RulesetBuilder {
            id: self.id.clone(),
            base: self.base.clone(),
            namespaces: self.namespaces.clone(),
            parameters: self
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            rules: self.rules.clone(),
            plan: Some(self.plan.clone()),
            backward: self.backward.clone(),
        }
    }
}

/// A mutable description of a [`Ruleset`].
#[derive(Clone, Debug)]
pub struct RulesetBuilder {
    id: Arc<str>,
    base: Option<String>,
    namespaces: BTreeMap<String, String>,
    parameters: Vec<(Arc<str>, Option<Value>)>,
    rules: Vec<Rule>,
    plan: Option<ClosureTask>,
    backward: BTreeSet<Arc<str>>,
}

impl RulesetBuilder {
    /// Set the base IRI.
    pub fn base<B: Into<String>>(mut self, base: B) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Declare a namespace.
    pub fn namespace<P: Into<String>, N: Into<String>>(mut self, prefix: P, ns: N) -> Self {
        self.namespaces.insert(prefix.into(), ns.into());
        self
    }

    /// Declare a parameter, with an optional default value.
    pub fn parameter<N: Into<Arc<str>>>(mut self, name: N, default: Option<Value>) -> Self {
        self.parameters.push((name.into(), default));
        self
    }

    /// Add a rule.
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Set the closure plan.
    ///
    /// If none is set, the plan evaluates all rules until a fixpoint is reached.
    pub fn plan(mut self, plan: ClosureTask) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Mark rules as usable for backward reasoning.
    pub fn backward<I, N>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Arc<str>>,
    {
        self.backward.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Validate this description and build the corresponding [`Ruleset`].
    pub fn build(self) -> Result<Ruleset, InferenceError> {
        let config_err =
            |msg: String| InferenceError::Configuration(format!("ruleset {}: {msg}", self.id));

        let mut parameters = BTreeMap::new();
        for (name, default) in &self.parameters {
            if parameters.insert(name.clone(), default.clone()).is_some() {
                return Err(config_err(format!("duplicate parameter {name}")));
            }
        }
        let mut index = HashMap::new();
        for (i, rule) in self.rules.iter().enumerate() {
            if index.insert(rule.id().clone(), i).is_some() {
                return Err(config_err(format!("duplicate rule {}", rule.id())));
            }
        }
        let plan = match &self.plan {
            Some(plan) => plan.clone(),
            None => ClosureTask::fixpoint(
                "closure",
                ClosureTask::eval("all", self.rules.iter().map(|r| r.id().clone())),
            ),
        };
        plan.validate(|id| index.contains_key(id))?;
        if let Some(id) = self.backward.iter().find(|id| !index.contains_key(*id)) {
            return Err(config_err(format!("unknown backward rule {id}")));
        }

        let mut rule_digests: Vec<&str> = self.rules.iter().map(Rule::digest).collect();
        rule_digests.sort_unstable();
        let mut d = Digester::new();
        for rd in rule_digests {
            d.update(rd);
        }
        for (name, default) in &parameters {
            match default {
                Some(v) => d.update(format!("?{name}={}", Nt(v))),
                None => d.update(format!("?{name}")),
            };
        }
        for id in &self.backward {
            d.update(format!("backward {id}"));
        }
        d.update(plan.digest());
        let digest = d.finalize();

        Ok(Ruleset {
            id: self.id,
            base: self.base,
            namespaces: self.namespaces,
            parameters,
            rules: self.rules,
            index,
            plan,
            backward: self.backward,
            digest,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sophia_store::{
        algebra::{PatternTerm, QuadPattern, Query},
        term::{integer, iri},
    };

    fn rule(id: &str) -> Rule {
        let v = PatternTerm::var;
        Rule::builder(id)
            .body(Query::select(vec![QuadPattern::new(v("s"), iri("x:p"), v("o"))]))
            .head(HeadAtom::new(v("o"), iri(format!("x:{id}")), v("s")))
            .build()
            .unwrap()
    }

    #[test]
    fn default_plan() {
        let rs = Ruleset::builder("rs").rule(rule("r1")).rule(rule("r2")).build().unwrap();
        assert_eq!(rs.plan().to_string(), "closure:fixpoint(all:eval(r1 r2))");
        assert!(rs.rule("r2").is_some());
        assert!(rs.rule("r3").is_none());
        assert_eq!(rs.forward_rule_ids().len(), 2);
    }

    #[test]
    fn validation() {
        let dup_rule = Ruleset::builder("rs").rule(rule("r1")).rule(rule("r1")).build();
        assert!(matches!(dup_rule, Err(InferenceError::Configuration(_))));

        let dup_param = Ruleset::builder("rs")
            .parameter("n", None)
            .parameter("n", Some(integer(1)))
            .build();
        assert!(matches!(dup_param, Err(InferenceError::Configuration(_))));

        let dangling = Ruleset::builder("rs")
            .rule(rule("r1"))
            .plan(ClosureTask::eval("e", ["r1", "r2"]))
            .build();
        assert!(matches!(dangling, Err(InferenceError::Configuration(_))));

        let backward = Ruleset::builder("rs").rule(rule("r1")).backward(["r9"]).build();
        assert!(matches!(backward, Err(InferenceError::Configuration(_))));
    }

    #[test]
    fn digest_ignores_rule_order() {
        let rs1 = Ruleset::builder("rs")
            .rule(rule("r1"))
            .rule(rule("r2"))
            .plan(ClosureTask::eval("e", ["r1", "r2"]))
            .build()
            .unwrap();
        let rs2 = Ruleset::builder("rs")
            .rule(rule("r2"))
            .rule(rule("r1"))
            .plan(ClosureTask::eval("e", ["r1", "r2"]))
            .build()
            .unwrap();
        assert_eq!(rs1.digest(), rs2.digest());
        let rs3 = rs1.to_builder().parameter("n", None).build().unwrap();
        assert_ne!(rs1.digest(), rs3.digest());
    }

    #[test]
    fn parameters() {
        let rs = Ruleset::builder("rs")
            .rule(rule("r1"))
            .parameter("a", Some(integer(1)))
            .parameter("b", None)
            .parameter("c", Some(integer(3)))
            .build()
            .unwrap();
        let got = rs
            .parameter_bindings(&BindingSet::new().with("c", integer(30)))
            .unwrap();
        assert_eq!(got.get("a"), Some(&integer(1)));
        assert_eq!(got.get("b"), None);
        assert_eq!(got.get("c"), Some(&integer(30)));
        assert!(rs
            .parameter_bindings(&BindingSet::new().with("z", integer(0)))
            .is_err());
    }
}
