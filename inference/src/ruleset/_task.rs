use std::{collections::HashSet, fmt, sync::Arc};

use sophia_store::{algebra::Query, binding::BindingSet, expression::Expression};

use crate::{_digest::Digester, InferenceError};

/// A node of a closure plan.
///
/// Before executing its [kind](TaskKind), a task evaluates its local bindings
/// against the bindings it receives, and overrides them accordingly.
#[derive(Clone, Debug, PartialEq)]
pub struct ClosureTask {
    id: Arc<str>,
    bindings: Vec<(Arc<str>, Expression)>,
    kind: TaskKind,
}

/// What a [`ClosureTask`] does.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskKind {
    /// Evaluate the listed rules
    Eval(Vec<Arc<str>>),
    /// Execute subtasks in order
    Sequence(Vec<ClosureTask>),
    /// Execute the subtask until it infers nothing new
    FixPoint(Box<ClosureTask>),
    /// Execute the subtask once per solution of the query
    Repeat(Box<ClosureTask>, Query),
}

impl ClosureTask {
    /// A task evaluating the given rules
    pub fn eval<I, N, R>(id: I, rules: R) -> Self
    where
        I: Into<Arc<str>>,
        N: Into<Arc<str>>,
        R: IntoIterator<Item = N>,
    {
        Self::new(id, TaskKind::Eval(rules.into_iter().map(Into::into).collect()))
    }

    /// A task executing `subtasks` in order
    pub fn sequence<I: Into<Arc<str>>>(id: I, subtasks: Vec<ClosureTask>) -> Self {
        Self::new(id, TaskKind::Sequence(subtasks))
    }

    /// A task executing `subtask` until a fixpoint is reached
    pub fn fixpoint<I: Into<Arc<str>>>(id: I, subtask: ClosureTask) -> Self {
        Self::new(id, TaskKind::FixPoint(Box::new(subtask)))
    }

    /// A task executing `subtask` once for each solution of `query`
    pub fn repeat<I: Into<Arc<str>>>(id: I, subtask: ClosureTask, query: Query) -> Self {
        Self::new(id, TaskKind::Repeat(Box::new(subtask), query))
    }

    fn new<I: Into<Arc<str>>>(id: I, kind: TaskKind) -> Self {
        ClosureTask {
            id: id.into(),
            bindings: vec![],
            kind,
        }
    }

    /// This task, binding `name` to the value of `value` before execution.
    pub fn with_binding<N: Into<Arc<str>>>(mut self, name: N, value: Expression) -> Self {
        self.bindings.push((name.into(), value));
        self
    }

    /// The identifier of this task
    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    /// What this task does
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// The bindings this task executes its kind with, given the `incoming` ones.
    ///
    /// Local bindings are evaluated against `incoming`;
    /// a local binding without value unbinds the variable.
    pub fn resolve_bindings(&self, incoming: &BindingSet) -> BindingSet {
        if self.bindings.is_empty() {
            return incoming.clone();
        }
        let mut ret = incoming.clone();
        for (name, expr) in &self.bindings {
            match expr.eval(incoming) {
                Some(value) => {
                    ret.insert(name.clone(), value);
                }
                None => {
                    ret.remove(name);
                }
            }
        }
        ret
    }

    /// All rule identifiers referenced by this task and its descendants.
    pub fn rule_ids(&self) -> Vec<&Arc<str>> {
        let mut ret = vec![];
        self.visit(&mut |t| {
            if let TaskKind::Eval(ids) = &t.kind {
                ret.extend(ids);
            }
        });
        ret
    }

    /// Check that every rule referenced by this plan satisfies `exists`,
    /// and that no `Eval` lists the same rule twice.
    pub fn validate<F: Fn(&str) -> bool>(&self, exists: F) -> Result<(), InferenceError> {
        let mut res = Ok(());
        self.visit(&mut |t| {
            if res.is_err() {
                return;
            }
            if let TaskKind::Eval(ids) = &t.kind {
                let mut seen = HashSet::new();
                for id in ids {
                    if !exists(id) {
                        res = Err(InferenceError::Configuration(format!(
                            "task {} references unknown rule {id}",
                            t.id
                        )));
                        return;
                    }
                    if !seen.insert(id) {
                        res = Err(InferenceError::Configuration(format!(
                            "task {} lists rule {id} twice",
                            t.id
                        )));
                        return;
                    }
                }
            }
        });
        res
    }

    /// A digest of this plan, combining kinds, bindings and children digests bottom-up.
    pub fn digest(&self) -> String {
        let mut d = Digester::new();
        d.update(&*self.id);
        for (name, expr) in &self.bindings {
            d.update(format!("?{name}={expr}"));
        }
        match &self.kind {
            TaskKind::Eval(ids) => {
                d.update("eval");
                for id in ids {
                    d.update(&**id);
                }
            }
            TaskKind::Sequence(children) => {
                d.update("sequence");
                for child in children {
                    d.update(child.digest());
                }
            }
            TaskKind::FixPoint(child) => {
                d.update("fixpoint").update(child.digest());
            }
            TaskKind::Repeat(child, query) => {
                d.update("repeat")
                    .update(query.to_string())
                    .update(child.digest());
            }
        }
        d.finalize()
    }

    fn visit<'a, F: FnMut(&'a ClosureTask)>(&'a self, f: &mut F) {
        f(self);
        match &self.kind {
            TaskKind::Eval(_) => {}
            TaskKind::Sequence(children) => children.iter().for_each(|c| c.visit(f)),
            TaskKind::FixPoint(child) | TaskKind::Repeat(child, _) => child.visit(f),
        }
    }
}

impl fmt::Display for ClosureTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if !self.bindings.is_empty() {
            f.write_str("[")?;
            for (i, (name, expr)) in self.bindings.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "?{name}={expr}")?;
            }
            f.write_str("]")?;
        }
        match &self.kind {
            TaskKind::Eval(ids) => {
                f.write_str(":eval(")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    f.write_str(id)?;
                }
                f.write_str(")")
            }
            TaskKind::Sequence(children) => {
                f.write_str(":sequence(")?;
                for (i, c) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str(")")
            }
            TaskKind::FixPoint(child) => write!(f, ":fixpoint({child})"),
            TaskKind::Repeat(child, query) => write!(f, ":repeat({child}, {query})"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sophia_store::term::{integer, iri};

    fn plan() -> ClosureTask {
        ClosureTask::sequence(
            "main",
            vec![
                ClosureTask::eval("init", ["r1"]),
                ClosureTask::fixpoint("loop", ClosureTask::eval("step", ["r2", "r3"])),
            ],
        )
    }

    #[test]
    fn rule_ids_in_order() {
        let plan = plan();
        let ids: Vec<&str> = plan.rule_ids().into_iter().map(|i| &**i).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn validate() {
        assert!(plan().validate(|id| id.starts_with('r')).is_ok());
        assert!(matches!(
            plan().validate(|id| id != "r3"),
            Err(InferenceError::Configuration(_))
        ));
        let dup = ClosureTask::eval("dup", ["r1", "r1"]);
        assert!(dup.validate(|_| true).is_err());
    }

    #[test]
    fn digest_changes_with_structure() {
        let d1 = plan().digest();
        assert_eq!(d1, plan().digest());
        let other = ClosureTask::sequence(
            "main",
            vec![
                ClosureTask::fixpoint("loop", ClosureTask::eval("step", ["r2", "r3"])),
                ClosureTask::eval("init", ["r1"]),
            ],
        );
        assert_ne!(d1, other.digest());
        let bound = plan().with_binding("n", Expression::constant(integer(1)));
        assert_ne!(d1, bound.digest());
    }

    #[test]
    fn local_bindings_override() {
        let task = ClosureTask::eval("t", ["r"])
            .with_binding("a", Expression::var("b"))
            .with_binding("c", Expression::var("missing"));
        let incoming = BindingSet::new()
            .with("a", iri("x:old"))
            .with("b", iri("x:new"))
            .with("c", iri("x:c"));
        let got = task.resolve_bindings(&incoming);
        assert_eq!(got.get("a"), Some(&iri("x:new")));
        assert_eq!(got.get("b"), Some(&iri("x:new")));
        assert_eq!(got.get("c"), None);
    }

    #[test]
    fn display() {
        assert_eq!(
            plan().to_string(),
            "main:sequence(init:eval(r1), loop:fixpoint(step:eval(r2 r3)))"
        );
    }
}
