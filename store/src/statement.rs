use std::fmt;

use crate::term::{GraphName, Nt, Value};

/// A subject-predicate-object statement, optionally in a named graph (its *context*).
///
/// Statements are immutable values; the store and the reasoner only ever build new ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Statement {
    subject: Value,
    predicate: Value,
    object: Value,
    context: GraphName,
}

impl Statement {
    /// Constructor
    pub fn new(subject: Value, predicate: Value, object: Value, context: GraphName) -> Self {
        Self {
            subject,
            predicate,
            object,
            context,
        }
    }

    /// The subject of this statement
    pub fn s(&self) -> &Value {
        &self.subject
    }

    /// The predicate of this statement
    pub fn p(&self) -> &Value {
        &self.predicate
    }

    /// The object of this statement
    pub fn o(&self) -> &Value {
        &self.object
    }

    /// The context (graph name) of this statement
    pub fn c(&self) -> &GraphName {
        &self.context
    }

    /// A copy of this statement, moved to another context.
    pub fn with_context(&self, context: GraphName) -> Self {
        Self {
            subject: self.subject.clone(),
            predicate: self.predicate.clone(),
            object: self.object.clone(),
            context,
        }
    }

    /// Split this statement into its four components.
    pub fn into_parts(self) -> ([Value; 3], GraphName) {
        (
            [self.subject, self.predicate, self.object],
            self.context,
        )
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            Nt(&self.subject),
            Nt(&self.predicate),
            Nt(&self.object)
        )?;
        if let Some(c) = &self.context {
            write!(f, " {}", Nt(c))?;
        }
        f.write_str(" .")
    }
}
