//! I define [`NaiveInferencer`], a forward-chaining [`Inferencer`]
//! executing the closure plan of a [`Ruleset`] by naive re-evaluation of its rules.
//!
//! The only optimization is rule activation:
//! within one closure update, a rule is only re-evaluated
//! if a rule triggering it has produced something since its last evaluation
//! (or if the bindings it is evaluated with have changed).
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    num::NonZeroUsize,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace};
use sophia_store::{
    algebra::{Query, Update},
    binding::BindingSet,
    term::{iri, GraphName, Nt, Value},
    Statement,
};

use crate::{
    _digest::Digester,
    buffer::Buffer,
    config::InferenceConfig,
    inferencer::{Context, InferenceMode, Inferencer, Session},
    ruleset::{ClosureTask, Rule, Ruleset, TaskKind, TransformRegistry},
    status::ClosureStatus,
    InferenceError,
};

/// Name of the implicit parameter holding the inferred context prefix (as an IRI).
pub const INFERRED_PREFIX_PARAMETER: &str = "inferredContextPrefix";

/// A forward-chaining inferencer evaluating a [`Ruleset`] naively.
///
/// See [module documentation](self).
#[derive(Debug)]
pub struct NaiveInferencer {
    ruleset: Arc<Ruleset>,
    values: BindingSet,
    registry: Arc<TransformRegistry>,
    max_concurrent_rules: usize,
    timeout: Option<Duration>,
    config: Option<Arc<Config>>,
}

#[derive(Debug)]
struct Config {
    ruleset: Arc<Ruleset>,
    registry: Arc<TransformRegistry>,
    forward_rules: BTreeSet<Arc<str>>,
    parameters: BindingSet,
    default_context: Value,
    max_concurrent_rules: usize,
    timeout: Option<Duration>,
    digest: String,
}

impl NaiveInferencer {
    /// An inferencer for `ruleset`, with default settings.
    pub fn new(ruleset: Ruleset) -> Self {
        NaiveInferencer {
            ruleset: Arc::new(ruleset),
            values: BindingSet::new(),
            registry: Arc::new(TransformRegistry::default()),
            max_concurrent_rules: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            timeout: None,
            config: None,
        }
    }

    /// An inferencer for `ruleset`, with the parameters, concurrency and timeout of `config`.
    pub fn from_config(ruleset: Ruleset, config: &InferenceConfig) -> Self {
        Self::new(ruleset)
            .with_parameters(config.parameter_bindings())
            .with_max_concurrent_rules(config.max_concurrent_rules())
            .with_timeout(config.query_timeout())
    }

    /// Set explicit values for the parameters of the ruleset.
    pub fn with_parameters(mut self, values: BindingSet) -> Self {
        self.values = values;
        self
    }

    /// Set the transforms available to rules.
    pub fn with_registry(mut self, registry: TransformRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Set the maximum number of rules evaluated concurrently.
    pub fn with_max_concurrent_rules(mut self, max: usize) -> Self {
        self.max_concurrent_rules = max.max(1);
        self
    }

    /// Set the timeout of the queries evaluating rule bodies.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The ruleset of this inferencer
    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    /// Start a session; same as [`Inferencer::new_session`], without boxing.
    pub fn session(
        &self,
        transaction_id: &str,
        status: ClosureStatus,
        context: Arc<dyn Context>,
    ) -> Result<NaiveSession, InferenceError> {
        let config = self.config.clone().ok_or_else(|| {
            InferenceError::Fatal("inferencer used before initialization".into())
        })?;
        Ok(NaiveSession {
            active: config.forward_rules.clone(),
            config,
            transaction_id: transaction_id.to_string(),
            status,
            context,
            last_bindings: None,
            stats: BTreeMap::new(),
        })
    }
}

impl Inferencer for NaiveInferencer {
    fn initialize(&mut self, inferred_context_prefix: &str) -> Result<(), InferenceError> {
        if inferred_context_prefix.is_empty() {
            return Err(InferenceError::Configuration(
                "inferred context prefix can not be empty".into(),
            ));
        }
        for rule in self.ruleset.rules() {
            if let Some(call) = rule.transform() {
                if !self.registry.contains(&call.name) {
                    return Err(InferenceError::Configuration(format!(
                        "rule {} uses unknown transform {}",
                        rule.id(),
                        call.name
                    )));
                }
            }
        }
        let default_context = iri(inferred_context_prefix);
        let mut parameters = self.ruleset.parameter_bindings(&self.values)?;
        parameters.insert(INFERRED_PREFIX_PARAMETER, default_context.clone());

        let mut d = Digester::new();
        d.update(self.ruleset.digest());
        for (name, value) in parameters.iter() {
            d.update(format!("?{name}={}", Nt(value)));
        }
        let digest = d.finalize();
        debug!(
            "naive inferencer initialized for ruleset {} under <{inferred_context_prefix}>: {digest}",
            self.ruleset.id()
        );
        self.config = Some(Arc::new(Config {
            ruleset: self.ruleset.clone(),
            registry: self.registry.clone(),
            forward_rules: self.ruleset.forward_rule_ids(),
            parameters,
            default_context,
            max_concurrent_rules: self.max_concurrent_rules,
            timeout: self.timeout,
            digest,
        }));
        Ok(())
    }

    fn inference_mode(&self) -> InferenceMode {
        InferenceMode::Forward
    }

    fn configuration_digest(&self) -> &str {
        self.config.as_ref().map(|c| c.digest.as_str()).unwrap_or("")
    }

    fn new_session(
        &self,
        transaction_id: &str,
        status: ClosureStatus,
        context: Arc<dyn Context>,
    ) -> Result<Box<dyn Session>, InferenceError> {
        Ok(Box::new(self.session(transaction_id, status, context)?))
    }
}

/// Statistics about the evaluation of one rule in a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuleStats {
    /// Number of times the rule was evaluated
    pub activations: usize,
    /// Number of rows produced by its body (after transform)
    pub rows: usize,
    /// Total time spent evaluating it
    pub elapsed: Duration,
}

/// The [`Session`] of a [`NaiveInferencer`].
pub struct NaiveSession {
    config: Arc<Config>,
    transaction_id: String,
    status: ClosureStatus,
    context: Arc<dyn Context>,
    active: BTreeSet<Arc<str>>,
    last_bindings: Option<BindingSet>,
    stats: BTreeMap<Arc<str>, RuleStats>,
}

impl NaiveSession {
    /// Per-rule statistics accumulated by this session
    pub fn stats(&self) -> &BTreeMap<Arc<str>, RuleStats> {
        &self.stats
    }

    fn execute(
        &mut self,
        task: &ClosureTask,
        incoming: &BindingSet,
    ) -> Result<usize, InferenceError> {
        let b = task.resolve_bindings(incoming);
        match task.kind() {
            TaskKind::Eval(ids) => self.eval(task, ids, &b),
            TaskKind::Sequence(children) => {
                let mut total = 0;
                for child in children {
                    total += self.execute(child, &b)?;
                }
                Ok(total)
            }
            TaskKind::FixPoint(child) => {
                let mut total = 0;
                let mut rounds = 0;
                loop {
                    // new statements are counted on the whole store, not from the subtask result
                    let before = self.context.size(true, &[])?;
                    self.execute(child, &b)?;
                    let after = self.context.size(true, &[])?;
                    let inferred = after.saturating_sub(before);
                    rounds += 1;
                    total += inferred;
                    trace!("{}: round {rounds} inferred {inferred}", task.id());
                    if inferred == 0 {
                        break;
                    }
                }
                debug!("{}: fixpoint reached after {rounds} round(s)", task.id());
                Ok(total)
            }
            TaskKind::Repeat(child, query) => {
                let rows = self.collect_rows(query, &b)?;
                trace!("{}: repeating for {} row(s)", task.id(), rows.len());
                let mut total = 0;
                for row in rows {
                    total += self.execute(child, &row.overlay(&b))?;
                }
                Ok(total)
            }
        }
    }

    fn collect_rows(
        &self,
        query: &Query,
        b: &BindingSet,
    ) -> Result<Vec<BindingSet>, InferenceError> {
        self.context
            .query(query, None, Some(b), true, self.config.timeout)?
            .collect()
    }

    fn eval(
        &mut self,
        task: &ClosureTask,
        ids: &[Arc<str>],
        b: &BindingSet,
    ) -> Result<usize, InferenceError> {
        let config = self.config.clone();
        if self.last_bindings.as_ref() != Some(b) {
            self.active = config.forward_rules.clone();
            self.last_bindings = Some(b.clone());
        }
        let mut pending = VecDeque::new();
        for id in ids {
            if !self.active.contains(id) {
                trace!("{}: rule {id} is not active", task.id());
                continue;
            }
            let rule = config.ruleset.rule(id).ok_or_else(|| {
                InferenceError::Fatal(format!("task {} references unknown rule {id}", task.id()))
            })?;
            if !rule.is_enabled(b) {
                trace!("{}: rule {id} is disabled", task.id());
                continue;
            }
            self.active.remove(id);
            pending.push_back(rule);
        }
        if pending.is_empty() {
            return Ok(0);
        }

        let mut buffer = Buffer::new();
        let workers = config
            .max_concurrent_rules
            .min(pending.len())
            .saturating_sub(1);
        let state = Mutex::new(EvalState {
            pending,
            active: &mut self.active,
            stats: &mut self.stats,
            error: None,
        });
        let job = Job {
            config: &config,
            context: &*self.context,
            bindings: b,
            buffer: &buffer,
            state: &state,
        };
        match self.context.scheduler() {
            Some(pool) if workers > 0 => {
                trace!("{}: evaluating with {workers} extra worker(s)", task.id());
                pool.scope(|scope| {
                    for _ in 0..workers {
                        scope.spawn(move |_| job.drain());
                    }
                    job.drain();
                });
            }
            _ => job.drain(),
        }
        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(e) = state.error {
            return Err(e);
        }

        let size = buffer.size();
        if size > 0 {
            let statements: Vec<Statement> = buffer.iter().collect();
            self.context.add_inferred(&statements, &[])?;
        }
        debug!("{}: {size} statement(s) inferred", task.id());
        Ok(size)
    }
}

struct EvalState<'a> {
    pending: VecDeque<&'a Rule>,
    active: &'a mut BTreeSet<Arc<str>>,
    stats: &'a mut BTreeMap<Arc<str>, RuleStats>,
    error: Option<InferenceError>,
}

/// What a worker needs to evaluate pending rules.
#[derive(Clone, Copy)]
struct Job<'a, 's> {
    config: &'a Config,
    context: &'a dyn Context,
    bindings: &'a BindingSet,
    buffer: &'a Buffer,
    state: &'a Mutex<EvalState<'s>>,
}

impl<'a, 's> Job<'a, 's> {
    fn lock(&self) -> MutexGuard<'a, EvalState<'s>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop and evaluate pending rules until there is none left or one failed.
    fn drain(self) {
        loop {
            let rule = {
                let mut state = self.lock();
                if state.error.is_some() {
                    return;
                }
                let Some(rule) = state.pending.pop_front() else {
                    return;
                };
                state.stats.entry(rule.id().clone()).or_default().activations += 1;
                rule
            };
            let start = Instant::now();
            let res = self.fire(rule);
            let elapsed = start.elapsed();

            let mut state = self.lock();
            match res {
                Ok(rows) => {
                    let stats = state.stats.entry(rule.id().clone()).or_default();
                    stats.rows += rows;
                    stats.elapsed += elapsed;
                    if rows > 0 {
                        match rule.triggers() {
                            Some(triggered) => state.active.extend(triggered.iter().cloned()),
                            None => state
                                .active
                                .extend(self.config.forward_rules.iter().cloned()),
                        }
                    }
                }
                Err(e) => {
                    state.error.get_or_insert(e);
                }
            }
        }
    }

    /// Evaluate `rule`, appending its output to the buffer; return the number of rows.
    fn fire(&self, rule: &Rule) -> Result<usize, InferenceError> {
        let rows: Vec<BindingSet> = self
            .context
            .query(rule.body(), None, Some(self.bindings), true, self.config.timeout)?
            .collect::<Result<_, _>>()?;
        let rows = match rule.transform() {
            Some(call) => self.config.registry.apply(call, rows, self.bindings)?,
            None => rows,
        };
        let mut appender = self.buffer.appender();
        for row in &rows {
            for atom in rule.head() {
                if let Some(st) = atom.instantiate(row, &self.config.default_context) {
                    appender.append(st);
                }
            }
        }
        let added = appender.flush();
        trace!("rule {}: {} row(s), {added} new candidate(s)", rule.id(), rows.len());
        Ok(rows.len())
    }
}

impl Session for NaiveSession {
    fn statements_added(
        &mut self,
        statements: Option<&[Statement]>,
        _contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        trace!(
            "{}: {} statement(s) added",
            self.transaction_id,
            statements.map(|s| s.len().to_string()).unwrap_or("unknown".into())
        );
        self.status = self.status.after_added();
        Ok(())
    }

    fn statements_removed(
        &mut self,
        statements: Option<&[Statement]>,
        _contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        trace!(
            "{}: {} statement(s) removed",
            self.transaction_id,
            statements.map(|s| s.len().to_string()).unwrap_or("unknown".into())
        );
        self.status = self.status.after_removed();
        Ok(())
    }

    fn statements_cleared(&mut self, only_closure: bool) -> Result<(), InferenceError> {
        trace!("{}: statements cleared (closure only: {only_closure})", self.transaction_id);
        self.status = ClosureStatus::PossiblyIncomplete;
        Ok(())
    }

    fn rewrite_query(
        &mut self,
        query: Query,
        _status: ClosureStatus,
        _forward_enabled: bool,
    ) -> Result<Option<Query>, InferenceError> {
        Ok(Some(query))
    }

    fn rewrite_update(
        &mut self,
        update: Update,
        _status: ClosureStatus,
        _forward_enabled: bool,
    ) -> Result<Option<Update>, InferenceError> {
        Ok(Some(update))
    }

    fn update_closure(&mut self, status: ClosureStatus) -> Result<(), InferenceError> {
        match status {
            ClosureStatus::Current => {
                trace!("{}: closure is current", self.transaction_id);
                return Ok(());
            }
            ClosureStatus::Stale => {
                debug!("{}: removing stale closure", self.transaction_id);
                self.context.remove_inferred_matching(None, None, None, &[])?;
            }
            ClosureStatus::PossiblyIncomplete => {}
        }
        let config = self.config.clone();
        self.active = config.forward_rules.clone();
        self.last_bindings = None;
        let start = Instant::now();
        let inferred = self.execute(config.ruleset.plan(), &config.parameters)?;
        debug!(
            "{}: closure updated in {:?} ({inferred} statement(s) inferred)",
            self.transaction_id,
            start.elapsed()
        );
        for (id, s) in &self.stats {
            debug!(
                "  rule {id}: {} activation(s), {} row(s), {:?}",
                s.activations, s.rows, s.elapsed
            );
        }
        self.status = ClosureStatus::Current;
        Ok(())
    }

    fn close(&mut self, committing: bool) -> Result<(), InferenceError> {
        debug!(
            "{}: session closed ({}), closure {}",
            self.transaction_id,
            if committing { "commit" } else { "rollback" },
            self.status
        );
        Ok(())
    }
}
