//! Filter and binding expressions, evaluated against a [`BindingSet`].
use std::{cmp::Ordering, collections::BTreeSet, fmt, sync::Arc};

use sophia_api::term::Term;

use crate::{
    binding::BindingSet,
    term::{self, lex_dt, xsd, Nt, Value},
};

/// An expression over the variables of a binding set.
///
/// Evaluation follows the SPARQL conventions:
/// a type error or an unbound variable makes the evaluation fail (`None`),
/// and [`Or`](Expression::Or)/[`And`](Expression::And) can recover from a failing operand.
#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    /// A variable, evaluating to its bound value
    Variable(Arc<str>),
    /// A constant value
    Constant(Value),
    /// Whether a variable is bound
    Bound(Arc<str>),
    /// Logical negation
    Not(Box<Self>),
    /// Logical conjunction
    And(Box<Self>, Box<Self>),
    /// Logical disjunction
    Or(Box<Self>, Box<Self>),
    /// Value equality (numeric values are compared by value)
    Equal(Box<Self>, Box<Self>),
    /// Negated value equality
    NotEqual(Box<Self>, Box<Self>),
    /// Term identity
    SameTerm(Box<Self>, Box<Self>),
    /// Strictly lower (numeric, otherwise lexical)
    Less(Box<Self>, Box<Self>),
    /// Strictly greater (numeric, otherwise lexical)
    Greater(Box<Self>, Box<Self>),
    /// Whether the operand is an IRI
    IsIri(Box<Self>),
    /// Whether the operand is a blank node
    IsBlank(Box<Self>),
    /// Whether the operand is a literal
    IsLiteral(Box<Self>),
    /// Whether the string form of the first operand starts with that of the second
    StrStarts(Box<Self>, Box<Self>),
    /// Whether the first operand is equal to one of the others
    In(Box<Self>, Vec<Self>),
}

impl Expression {
    /// A variable expression
    pub fn var<N: Into<Arc<str>>>(name: N) -> Self {
        Expression::Variable(name.into())
    }

    /// A constant expression
    pub fn constant(value: Value) -> Self {
        Expression::Constant(value)
    }

    /// `BOUND(?name)`
    pub fn bound<N: Into<Arc<str>>>(name: N) -> Self {
        Expression::Bound(name.into())
    }

    /// `!self`
    pub fn not(self) -> Self {
        Expression::Not(Box::new(self))
    }

    /// `self && other`
    pub fn and(self, other: Self) -> Self {
        Expression::And(Box::new(self), Box::new(other))
    }

    /// `self || other`
    pub fn or(self, other: Self) -> Self {
        Expression::Or(Box::new(self), Box::new(other))
    }

    /// `self = other`
    pub fn equal(self, other: Self) -> Self {
        Expression::Equal(Box::new(self), Box::new(other))
    }

    /// `self != other`
    pub fn not_equal(self, other: Self) -> Self {
        Expression::NotEqual(Box::new(self), Box::new(other))
    }

    /// `sameTerm(self, other)`
    pub fn same_term(self, other: Self) -> Self {
        Expression::SameTerm(Box::new(self), Box::new(other))
    }

    /// `self < other`
    pub fn less(self, other: Self) -> Self {
        Expression::Less(Box::new(self), Box::new(other))
    }

    /// `self > other`
    pub fn greater(self, other: Self) -> Self {
        Expression::Greater(Box::new(self), Box::new(other))
    }

    /// `isIRI(self)`
    pub fn is_iri(self) -> Self {
        Expression::IsIri(Box::new(self))
    }

    /// `isBlank(self)`
    pub fn is_blank(self) -> Self {
        Expression::IsBlank(Box::new(self))
    }

    /// `isLiteral(self)`
    pub fn is_literal(self) -> Self {
        Expression::IsLiteral(Box::new(self))
    }

    /// `STRSTARTS(STR(self), STR(prefix))`
    pub fn str_starts(self, prefix: Self) -> Self {
        Expression::StrStarts(Box::new(self), Box::new(prefix))
    }

    /// `self IN (values...)`
    pub fn is_in(self, values: Vec<Self>) -> Self {
        Expression::In(Box::new(self), values)
    }

    /// Evaluate this expression against `b`.
    ///
    /// Return `None` if the evaluation raises an error.
    pub fn eval(&self, b: &BindingSet) -> Option<Value> {
        use Expression::*;
        match self {
            Variable(v) => b.get(v).cloned(),
            Constant(c) => Some(c.clone()),
            Bound(v) => Some(term::boolean(b.contains(v))),
            Not(e) => Some(term::boolean(!e.eval_ebv(b)?)),
            And(lhs, rhs) => {
                let lhs = lhs.eval_ebv(b);
                let rhs = rhs.eval_ebv(b);
                match (lhs, rhs) {
                    (Some(a), Some(b)) => Some(a && b),
                    (Some(false), None) | (None, Some(false)) => Some(false),
                    _ => None,
                }
                .map(term::boolean)
            }
            Or(lhs, rhs) => {
                let lhs = lhs.eval_ebv(b);
                let rhs = rhs.eval_ebv(b);
                match (lhs, rhs) {
                    (Some(a), Some(b)) => Some(a || b),
                    (Some(true), None) | (None, Some(true)) => Some(true),
                    _ => None,
                }
                .map(term::boolean)
            }
            Equal(lhs, rhs) => {
                let eq = values_equal(&lhs.eval(b)?, &rhs.eval(b)?);
                Some(term::boolean(eq))
            }
            NotEqual(lhs, rhs) => {
                let eq = values_equal(&lhs.eval(b)?, &rhs.eval(b)?);
                Some(term::boolean(!eq))
            }
            SameTerm(lhs, rhs) => Some(term::boolean(lhs.eval(b)? == rhs.eval(b)?)),
            Less(lhs, rhs) => {
                let ord = compare_values(&lhs.eval(b)?, &rhs.eval(b)?)?;
                Some(term::boolean(ord == Ordering::Less))
            }
            Greater(lhs, rhs) => {
                let ord = compare_values(&lhs.eval(b)?, &rhs.eval(b)?)?;
                Some(term::boolean(ord == Ordering::Greater))
            }
            IsIri(e) => Some(term::boolean(e.eval(b)?.is_iri())),
            IsBlank(e) => Some(term::boolean(e.eval(b)?.is_blank_node())),
            IsLiteral(e) => Some(term::boolean(e.eval(b)?.is_literal())),
            StrStarts(e, prefix) => {
                let s = string_form(&e.eval(b)?)?;
                let prefix = string_form(&prefix.eval(b)?)?;
                Some(term::boolean(s.starts_with(&prefix)))
            }
            In(e, values) => {
                let v = e.eval(b)?;
                let mut error = false;
                for candidate in values {
                    match candidate.eval(b) {
                        Some(c) if values_equal(&v, &c) => return Some(term::boolean(true)),
                        Some(_) => {}
                        None => error = true,
                    }
                }
                if error {
                    None
                } else {
                    Some(term::boolean(false))
                }
            }
        }
    }

    /// Evaluate this expression and compute its effective boolean value.
    pub fn eval_ebv(&self, b: &BindingSet) -> Option<bool> {
        effective_boolean_value(&self.eval(b)?)
    }

    /// Whether this expression evaluates to `true` under `b` (errors count as `false`).
    pub fn is_satisfied(&self, b: &BindingSet) -> bool {
        self.eval_ebv(b).unwrap_or(false)
    }

    /// All variables mentioned in this expression.
    pub fn variables(&self) -> BTreeSet<Arc<str>> {
        let mut ret = BTreeSet::new();
        self.collect_variables(&mut ret);
        ret
    }

    fn collect_variables(&self, set: &mut BTreeSet<Arc<str>>) {
        use Expression::*;
        match self {
            Variable(v) | Bound(v) => {
                set.insert(v.clone());
            }
            Constant(_) => {}
            Not(e) | IsIri(e) | IsBlank(e) | IsLiteral(e) => e.collect_variables(set),
            And(l, r)
            | Or(l, r)
            | Equal(l, r)
            | NotEqual(l, r)
            | SameTerm(l, r)
            | Less(l, r)
            | Greater(l, r)
            | StrStarts(l, r) => {
                l.collect_variables(set);
                r.collect_variables(set);
            }
            In(e, values) => {
                e.collect_variables(set);
                for v in values {
                    v.collect_variables(set);
                }
            }
        }
    }
}

/// The [effective boolean value](https://www.w3.org/TR/sparql11-query/#ebv) of a value.
pub fn effective_boolean_value(value: &Value) -> Option<bool> {
    let (lex, dt) = lex_dt(value)?;
    if value.language_tag().is_some() {
        return Some(!lex.is_empty());
    }
    match dt.as_str() {
        xsd::BOOLEAN => match lex.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => Some(false),
        },
        xsd::STRING => Some(!lex.is_empty()),
        dt if xsd::NUMERIC.contains(&dt) => {
            let n = lex.trim().parse::<f64>().ok()?;
            Some(n != 0.0 && !n.is_nan())
        }
        _ => None,
    }
}

fn numeric_value(value: &Value) -> Option<f64> {
    let (lex, dt) = lex_dt(value)?;
    if xsd::NUMERIC.contains(&dt.as_str()) {
        lex.trim().parse().ok()
    } else {
        None
    }
}

fn string_form(value: &Value) -> Option<String> {
    if let Some(iri) = term::iri_str(value) {
        Some(iri)
    } else {
        value.lexical_form().map(|lex| lex.to_string())
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (numeric_value(a), numeric_value(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (numeric_value(a), numeric_value(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ if a.is_literal() && b.is_literal() => Some(string_form(a)?.cmp(&string_form(b)?)),
        _ => None,
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Expression::*;
        match self {
            Variable(v) => write!(f, "?{v}"),
            Constant(c) => write!(f, "{}", Nt(c)),
            Bound(v) => write!(f, "BOUND(?{v})"),
            Not(e) => write!(f, "!({e})"),
            And(l, r) => write!(f, "({l} && {r})"),
            Or(l, r) => write!(f, "({l} || {r})"),
            Equal(l, r) => write!(f, "({l} = {r})"),
            NotEqual(l, r) => write!(f, "({l} != {r})"),
            SameTerm(l, r) => write!(f, "sameTerm({l}, {r})"),
            Less(l, r) => write!(f, "({l} < {r})"),
            Greater(l, r) => write!(f, "({l} > {r})"),
            IsIri(e) => write!(f, "isIRI({e})"),
            IsBlank(e) => write!(f, "isBlank({e})"),
            IsLiteral(e) => write!(f, "isLiteral({e})"),
            StrStarts(e, p) => write!(f, "STRSTARTS(STR({e}), STR({p}))"),
            In(e, values) => {
                write!(f, "({e} IN (")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("))")
            }
        }
    }
}
