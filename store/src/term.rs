//! The value model shared by the store and the layers built on top of it.
//!
//! Values are plain [`SimpleTerm`]s owning their data,
//! so that they can be freely moved across threads and transactions.
use std::fmt;

use sophia_api::term::{BnodeId, IriRef, SimpleTerm, Term, TermKind};

/// An RDF term owned by the store layer.
pub type Value = SimpleTerm<'static>;

/// The name of a graph in a dataset; `None` is the default graph.
pub type GraphName = Option<Value>;

/// IRIs of the XSD datatypes the store layer knows about.
pub mod xsd {
    /// `xsd:string`
    pub const STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
    /// `xsd:boolean`
    pub const BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
    /// `xsd:integer`
    pub const INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
    /// `xsd:decimal`
    pub const DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
    /// `xsd:double`
    pub const DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
    /// `xsd:float`
    pub const FLOAT: &str = "http://www.w3.org/2001/XMLSchema#float";

    /// `xsd:int`
    pub const INT: &str = "http://www.w3.org/2001/XMLSchema#int";

    pub(crate) const NUMERIC: [&str; 5] = [INTEGER, DECIMAL, DOUBLE, FLOAT, INT];
}

/// Build an IRI value, without checking its validity.
pub fn iri<T: Into<String>>(iri: T) -> Value {
    let iri: String = iri.into();
    SimpleTerm::Iri(IriRef::new_unchecked(iri.into()))
}

/// Build a blank node value, without checking its validity.
pub fn bnode<T: Into<String>>(id: T) -> Value {
    let id: String = id.into();
    SimpleTerm::BlankNode(BnodeId::new_unchecked(id.into()))
}

/// Build a typed literal.
pub fn literal<L: Into<String>, D: Into<String>>(lex: L, datatype: D) -> Value {
    let lex: String = lex.into();
    let datatype: String = datatype.into();
    SimpleTerm::LiteralDatatype(lex.into(), IriRef::new_unchecked(datatype.into()))
}

/// Build an `xsd:string` literal.
pub fn string<L: Into<String>>(lex: L) -> Value {
    literal(lex, xsd::STRING)
}

/// Build an `xsd:boolean` literal.
pub fn boolean(value: bool) -> Value {
    literal(if value { "true" } else { "false" }, xsd::BOOLEAN)
}

/// Build an `xsd:integer` literal.
pub fn integer(value: i64) -> Value {
    literal(value.to_string(), xsd::INTEGER)
}

/// Whether `value` can be used as the subject or graph name of a statement.
pub fn is_resource(value: &Value) -> bool {
    value.is_iri() || value.is_blank_node()
}

/// Whether `value` is an IRI starting with `prefix`.
pub fn has_prefix(value: &Value, prefix: &str) -> bool {
    value
        .iri()
        .map(|iri| iri.as_str().starts_with(prefix))
        .unwrap_or(false)
}

/// Whether `graph` is a named graph whose IRI starts with `prefix`.
pub fn graph_has_prefix(graph: &GraphName, prefix: &str) -> bool {
    graph.as_ref().map(|g| has_prefix(g, prefix)).unwrap_or(false)
}

/// The IRI of `value` as a string, if it is an IRI.
pub fn iri_str(value: &Value) -> Option<String> {
    value.iri().map(|iri| iri.as_str().to_string())
}

/// The lexical form and datatype IRI of `value`, if it is a literal.
pub fn lex_dt(value: &Value) -> Option<(String, String)> {
    let lex = value.lexical_form()?;
    let dt = value.datatype()?;
    Some((lex.to_string(), dt.as_str().to_string()))
}

/// Wraps a [`Value`] to display it in N-Triples syntax.
pub struct Nt<'a>(pub &'a Value);

impl fmt::Display for Nt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_term(f, self.0)
    }
}

fn write_term<T: Term>(f: &mut fmt::Formatter<'_>, t: T) -> fmt::Result {
    match t.kind() {
        TermKind::Iri => match t.iri() {
            Some(iri) => write!(f, "<{}>", iri.as_str()),
            None => Ok(()),
        },
        TermKind::BlankNode => match t.bnode_id() {
            Some(id) => write!(f, "_:{}", id.as_str()),
            None => Ok(()),
        },
        TermKind::Literal => {
            let Some(lex) = t.lexical_form() else {
                return Ok(());
            };
            f.write_str("\"")?;
            for c in lex.chars() {
                match c {
                    '"' => f.write_str("\\\"")?,
                    '\\' => f.write_str("\\\\")?,
                    '\n' => f.write_str("\\n")?,
                    '\r' => f.write_str("\\r")?,
                    c => write!(f, "{c}")?,
                }
            }
            f.write_str("\"")?;
            if let Some(tag) = t.language_tag() {
                write!(f, "@{}", tag.as_str())
            } else {
                match t.datatype() {
                    Some(dt) if dt.as_str() != xsd::STRING => write!(f, "^^<{}>", dt.as_str()),
                    _ => Ok(()),
                }
            }
        }
        TermKind::Triple => match t.triple() {
            Some([s, p, o]) => {
                f.write_str("<<( ")?;
                write_term(f, s)?;
                f.write_str(" ")?;
                write_term(f, p)?;
                f.write_str(" ")?;
                write_term(f, o)?;
                f.write_str(" )>>")
            }
            None => Ok(()),
        },
        TermKind::Variable => match t.variable() {
            Some(v) => write!(f, "?{}", v.as_str()),
            None => Ok(()),
        },
    }
}
