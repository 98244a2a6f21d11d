use std::{collections::BTreeSet, fmt, sync::Arc};

use sophia_api::term::Term;
use sophia_store::{
    algebra::{PatternTerm, Query},
    binding::BindingSet,
    expression::{effective_boolean_value, Expression},
    term::{is_resource, Value},
    Statement,
};

use super::TransformCall;
use crate::{_digest::Digester, InferenceError};

/// One output atom of a [`Rule`] head.
#[derive(Clone, Debug, PartialEq)]
pub struct HeadAtom {
    /// Subject
    pub s: PatternTerm,
    /// Predicate
    pub p: PatternTerm,
    /// Object
    pub o: PatternTerm,
    /// Context; if `None`, the default inferred context of the session is used
    pub context: Option<PatternTerm>,
    /// If set, the atom is only produced for rows where this variable is true
    pub emit: Option<Arc<str>>,
}

impl HeadAtom {
    /// An unconditional atom, in the default inferred context
    pub fn new<S, P, O>(s: S, p: P, o: O) -> Self
    where
        S: Into<PatternTerm>,
        P: Into<PatternTerm>,
        O: Into<PatternTerm>,
    {
        HeadAtom {
            s: s.into(),
            p: p.into(),
            o: o.into(),
            context: None,
            emit: None,
        }
    }

    /// This atom, produced in the given context
    pub fn in_context<C: Into<PatternTerm>>(mut self, context: C) -> Self {
        self.context = Some(context.into());
        self
    }

    /// This atom, guarded by the boolean variable `emit`
    pub fn when<N: Into<Arc<str>>>(mut self, emit: N) -> Self {
        self.emit = Some(emit.into());
        self
    }

    /// The statement produced by this atom for `row`, if any.
    pub fn instantiate(&self, row: &BindingSet, default_context: &Value) -> Option<Statement> {
        if let Some(emit) = &self.emit {
            if row.get(emit).and_then(effective_boolean_value) != Some(true) {
                return None;
            }
        }
        let s = self.s.resolve(row)?;
        let p = self.p.resolve(row)?;
        let o = self.o.resolve(row)?;
        let c = match &self.context {
            Some(c) => c.resolve(row)?,
            None => default_context,
        };
        if !is_resource(s) || !p.is_iri() || !is_resource(c) {
            return None;
        }
        Some(Statement::new(
            s.clone(),
            p.clone(),
            o.clone(),
            Some(c.clone()),
        ))
    }
}

impl fmt::Display for HeadAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(g) = &self.context {
            write!(f, "GRAPH {g} {{ {} {} {} . }}", self.s, self.p, self.o)?;
        } else {
            write!(f, "{} {} {} .", self.s, self.p, self.o)?;
        }
        if let Some(emit) = &self.emit {
            write!(f, " IF ?{emit}")?;
        }
        Ok(())
    }
}

/// An inference rule, ready to be used by an inferencer.
///
/// Rules are built with a [`RuleBuilder`], and are immutable afterwards.
#[derive(Clone, Debug)]
pub struct Rule {
    id: Arc<str>,
    body: Query,
    head: Vec<HeadAtom>,
    condition: Option<Expression>,
    transform: Option<TransformCall>,
    triggers: Option<BTreeSet<Arc<str>>>,
    digest: String,
}

impl Rule {
    /// Start building a rule with the given identifier.
    pub fn builder<I: Into<Arc<str>>>(id: I) -> RuleBuilder {
        RuleBuilder {
            id: id.into(),
            body: Query::select(vec![]),
            head: vec![],
            condition: None,
            transform: None,
            triggers: None,
        }
    }

    /// The identifier of this rule
    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    /// The query producing the rows this rule maps to its head
    pub fn body(&self) -> &Query {
        &self.body
    }

    /// The output atoms
    pub fn head(&self) -> &[HeadAtom] {
        &self.head
    }

    /// The condition gating whether the rule runs at all
    pub fn condition(&self) -> Option<&Expression> {
        self.condition.as_ref()
    }

    /// The post-processing applied to the body rows
    pub fn transform(&self) -> Option<&TransformCall> {
        self.transform.as_ref()
    }

    /// The rules to re-activate when this one fires (`None`: all rules)
    pub fn triggers(&self) -> Option<&BTreeSet<Arc<str>>> {
        self.triggers.as_ref()
    }

    /// Whether this rule may run under `bindings`.
    pub fn is_enabled(&self, bindings: &BindingSet) -> bool {
        self.condition
            .as_ref()
            .map(|c| c.is_satisfied(bindings))
            .unwrap_or(true)
    }

    /// A content digest of this rule
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// A new builder, initialized with a copy of this rule.
    pub fn to_builder(&self) -> RuleBuilder {
        RuleBuilder {
            id: self.id.clone(),
            body: self.body.clone(),
            head: self.head.clone(),
            condition: self.condition.clone(),
            transform: self.transform.clone(),
            triggers: self.triggers.clone(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_rule(
            f,
            &self.id,
            &self.body,
            &self.head,
            self.condition.as_ref(),
            self.transform.as_ref(),
            self.triggers.as_ref(),
        )
    }
}

fn write_rule(
    f: &mut fmt::Formatter<'_>,
    id: &str,
    body: &Query,
    head: &[HeadAtom],
    condition: Option<&Expression>,
    transform: Option<&TransformCall>,
    triggers: Option<&BTreeSet<Arc<str>>>,
) -> fmt::Result {
    write!(f, "RULE {id} ")?;
    if let Some(c) = condition {
        write!(f, "IF ({c}) ")?;
    }
    f.write_str("HEAD { ")?;
    for atom in head {
        write!(f, "{atom} ")?;
    }
    write!(f, "}} BODY {{ {body} }}")?;
    if let Some(t) = transform {
        write!(f, " TRANSFORM {t}")?;
    }
    if let Some(triggers) = triggers {
        f.write_str(" TRIGGERS (")?;
        for (i, t) in triggers.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(t)?;
        }
        f.write_str(")")?;
    }
    Ok(())
}

/// A mutable description of a [`Rule`].
#[derive(Clone, Debug)]
pub struct RuleBuilder {
    id: Arc<str>,
    body: Query,
    head: Vec<HeadAtom>,
    condition: Option<Expression>,
    transform: Option<TransformCall>,
    triggers: Option<BTreeSet<Arc<str>>>,
}

impl RuleBuilder {
    /// Set the body query.
    pub fn body(mut self, body: Query) -> Self {
        self.body = body;
        self
    }

    /// Add a head atom.
    pub fn head(mut self, atom: HeadAtom) -> Self {
        self.head.push(atom);
        self
    }

    /// Set the activation condition.
    pub fn condition(mut self, condition: Expression) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Set the transform applied to body rows.
    pub fn transform(mut self, transform: TransformCall) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Set the rules triggered by this one (an empty set triggers nothing).
    pub fn triggers<I, N>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Arc<str>>,
    {
        self.triggers = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Validate this description and build the corresponding [`Rule`].
    pub fn build(self) -> Result<Rule, InferenceError> {
        if self.id.is_empty() || self.id.chars().any(char::is_whitespace) {
            return Err(InferenceError::Configuration(format!(
                "invalid rule id {:?}",
                self.id
            )));
        }
        if self.head.is_empty() {
            return Err(InferenceError::Configuration(format!(
                "rule {} has an empty head",
                self.id
            )));
        }
        let text = Wrap(&self).to_string();
        let mut digester = Digester::new();
        digester.update(&text);
        Ok(Rule {
            id: self.id,
            body: self.body,
            head: self.head,
            condition: self.condition,
            transform: self.transform,
            triggers: self.triggers,
            digest: digester.finalize(),
        })
    }
}

struct Wrap<'a>(&'a RuleBuilder);

impl fmt::Display for Wrap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write_rule(
            f,
            &b.id,
            &b.body,
            &b.head,
            b.condition.as_ref(),
            b.transform.as_ref(),
            b.triggers.as_ref(),
        )
    }
}
