use std::{
    collections::{BTreeSet, HashSet},
    path::PathBuf,
    sync::{atomic::{AtomicUsize, Ordering}, Arc, Mutex},
    thread::{self, ThreadId},
    time::Duration,
};

use rayon::ThreadPool;
use sophia_api::{source::TripleSource, term::SimpleTerm};
use sophia_store::{
    algebra::{PatternTerm, QuadPattern, Query, QueryDataset, Update},
    binding::BindingSet,
    expression::Expression,
    memory::{MemoryStore, MemoryTransaction},
    term::{has_prefix, iri, string, GraphName, Value},
    Statement,
    Store,
};
use test_case::test_case;

use crate::{
    config::{InferenceConfig, InferenceOptions},
    context::InferenceContext,
    inferencer::{Context, Cursor, InferenceMode, Inferencer, Session},
    naive::{NaiveInferencer, NaiveSession},
    repository::InferenceRepository,
    ruleset::{
        ClosureTask, HeadAtom, Rule, Ruleset, Transform, TransformCall, TransformRegistry,
        TRANSITIVE_REDUCTION,
    },
    status::{ClosureMetadata, ClosureStatus},
    transaction::InferenceTransaction,
    InferenceError,
};

const PREFIX: &str = "urn:x-inferred:";

const CHAIN: &str = r#"
    <x:a> <x:p> <x:b>.
    <x:b> <x:p> <x:c>.
    <x:c> <x:p> <x:d>.
"#;

fn facts(ttl: &str) -> Vec<Statement> {
    let triples: Vec<[SimpleTerm<'static>; 3]> = sophia_turtle::parser::turtle::parse_str(ttl)
        .collect_triples()
        .unwrap();
    triples
        .into_iter()
        .map(|[s, p, o]| Statement::new(s, p, o, None))
        .collect()
}

fn triples(statements: impl IntoIterator<Item = Statement>) -> BTreeSet<[Value; 3]> {
    statements
        .into_iter()
        .map(|st| {
            let ([s, p, o], _) = st.into_parts();
            [s, p, o]
        })
        .collect()
}

fn expected(ttl: &str) -> BTreeSet<[Value; 3]> {
    triples(facts(ttl))
}

fn v(name: &str) -> PatternTerm {
    PatternTerm::var(name)
}

fn transitive_rule(id: &str, p: &str) -> Rule {
    Rule::builder(id)
        .body(Query::select(vec![
            QuadPattern::new(v("x"), iri(p), v("y")),
            QuadPattern::new(v("y"), iri(p), v("z")),
        ]))
        .head(HeadAtom::new(v("x"), iri(p), v("z")))
        .build()
        .unwrap()
}

fn transitive_ruleset() -> Ruleset {
    Ruleset::builder("transitive")
        .rule(transitive_rule("trans", "x:p"))
        .plan(ClosureTask::fixpoint(
            "closure",
            ClosureTask::eval("step", ["trans"]),
        ))
        .build()
        .unwrap()
}

fn config() -> InferenceConfig {
    InferenceConfig {
        inferred_context_prefix: PREFIX.into(),
        parallel: false,
        ..InferenceConfig::default()
    }
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sophia-inference-{}-{name}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn repository(config: &InferenceConfig, ruleset: Ruleset) -> InferenceRepository<MemoryStore> {
    repository_on(MemoryStore::new(), config, ruleset)
}

fn repository_on(
    store: MemoryStore,
    config: &InferenceConfig,
    ruleset: Ruleset,
) -> InferenceRepository<MemoryStore> {
    let inferencer = NaiveInferencer::from_config(ruleset, config);
    InferenceRepository::new(store, inferencer, config).unwrap()
}

fn inferred(tx: &InferenceTransaction<MemoryTransaction>) -> BTreeSet<[Value; 3]> {
    let contexts: Vec<GraphName> = tx
        .context_ids()
        .unwrap()
        .into_iter()
        .filter(|g| has_prefix(g, PREFIX))
        .map(Some)
        .collect();
    if contexts.is_empty() {
        return BTreeSet::new();
    }
    triples(tx.statements(None, None, None, &contexts).unwrap())
}

fn explicit(tx: &InferenceTransaction<MemoryTransaction>) -> BTreeSet<[Value; 3]> {
    triples(tx.statements(None, None, None, &[None]).unwrap())
}

#[test]
fn transitive_closure() {
    crate::test_setup();
    let repo = repository(&config(), transitive_ruleset());
    let mut tx = repo.begin().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Stale);
    tx.add(&facts(CHAIN), &[]).unwrap();
    tx.update_closure().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Current);
    assert_eq!(
        inferred(&tx),
        expected("<x:a> <x:p> <x:c>. <x:a> <x:p> <x:d>. <x:b> <x:p> <x:d>.")
    );
    assert_eq!(explicit(&tx), expected(CHAIN));
    assert_eq!(tx.size(&[]).unwrap(), 6);
    tx.end(true).unwrap();
}

/// A transform recording the threads it runs on, slow enough for rules to overlap.
#[derive(Clone, Default)]
struct ThreadRecorder(Arc<Mutex<HashSet<ThreadId>>>);

impl ThreadRecorder {
    fn threads(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl Transform for ThreadRecorder {
    fn apply(
        &self,
        rows: Vec<BindingSet>,
        _: &[Value],
    ) -> Result<Vec<BindingSet>, InferenceError> {
        self.0.lock().unwrap().insert(thread::current().id());
        thread::sleep(Duration::from_millis(20));
        Ok(rows)
    }
}

const RECORD_THREAD: &str = "record-thread";

/// Six independent transitive rules, and a chain of 3 statements for each of them.
fn independent_rules() -> (Ruleset, String) {
    let mut builder = Ruleset::builder("parallel");
    let mut ttl = String::new();
    for i in 0..6 {
        let rule = transitive_rule(&format!("r{i}"), &format!("x:p{i}"))
            .to_builder()
            .transform(TransformCall::new(RECORD_THREAD, vec![]))
            .build()
            .unwrap();
        builder = builder.rule(rule);
        ttl.push_str(&format!(
            "<x:a> <x:p{i}> <x:b>. <x:b> <x:p{i}> <x:c>. <x:c> <x:p{i}> <x:d>.\n"
        ));
    }
    (builder.build().unwrap(), ttl)
}

fn recording_registry(recorder: &ThreadRecorder) -> TransformRegistry {
    let mut registry = TransformRegistry::default();
    registry.register(RECORD_THREAD, recorder.clone());
    registry
}

#[test]
fn closure_is_computed_in_parallel() {
    crate::test_setup();
    let cfg = InferenceConfig {
        parallel: true,
        max_concurrent_rules: Some(4),
        ..config()
    };
    let (ruleset, ttl) = independent_rules();
    let recorder = ThreadRecorder::default();
    let inferencer =
        NaiveInferencer::from_config(ruleset, &cfg).with_registry(recording_registry(&recorder));
    let repo = InferenceRepository::new(MemoryStore::new(), inferencer, &cfg).unwrap();
    let mut tx = repo.begin().unwrap();
    tx.add(&facts(&ttl), &[]).unwrap();
    tx.update_closure().unwrap();
    assert_eq!(inferred(&tx).len(), 18);
    assert!(recorder.threads() > 1);
    tx.end(true).unwrap();
}

#[test]
fn parallel_rule_stats() {
    crate::test_setup();
    let (ruleset, ttl) = independent_rules();
    let recorder = ThreadRecorder::default();
    let mut tx = MemoryStore::new().begin().unwrap();
    sophia_store::Transaction::add(&mut tx, &facts(&ttl), &[]).unwrap();
    let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
    let context = Arc::new(InferenceContext::new(
        Arc::new(Mutex::new(tx)),
        PREFIX.into(),
        Some(Arc::new(pool)),
        None,
    ));
    let mut inferencer = NaiveInferencer::new(ruleset)
        .with_registry(recording_registry(&recorder))
        .with_max_concurrent_rules(4);
    inferencer.initialize(PREFIX).unwrap();
    let mut session = inferencer
        .session("test", ClosureStatus::Stale, context.clone())
        .unwrap();

    let _unlocked = context.unlock(true).unwrap();
    session.update_closure(ClosureStatus::PossiblyIncomplete).unwrap();
    assert!(recorder.threads() > 1);
    // each rule: 2 new statements, then 1, then none
    assert_eq!(session.stats().len(), 6);
    for stats in session.stats().values() {
        assert_eq!(stats.activations, 3);
        assert_eq!(stats.rows, 2 + 3 + 3);
    }
    let total: usize = session.stats().values().map(|s| s.activations).sum();
    assert_eq!(total, 18);
    assert_eq!(context.size(true, &[]).unwrap(), 36);
}

/// A context counting every call made to it
struct CountingContext {
    inner: Arc<InferenceContext<MemoryTransaction>>,
    calls: AtomicUsize,
}

impl CountingContext {
    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

impl Context for CountingContext {
    fn query(
        &self,
        query: &Query,
        dataset: Option<&QueryDataset>,
        bindings: Option<&BindingSet>,
        include_closure: bool,
        timeout: Option<Duration>,
    ) -> Result<Cursor<BindingSet>, InferenceError> {
        self.tick();
        self.inner
            .query(query, dataset, bindings, include_closure, timeout)
    }

    fn statements(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        include_closure: bool,
        contexts: &[GraphName],
    ) -> Result<Cursor<Statement>, InferenceError> {
        self.tick();
        self.inner.statements(s, p, o, include_closure, contexts)
    }

    fn has_statement(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        include_closure: bool,
        contexts: &[GraphName],
    ) -> Result<bool, InferenceError> {
        self.tick();
        self.inner.has_statement(s, p, o, include_closure, contexts)
    }

    fn context_ids(&self, include_closure: bool) -> Result<Vec<Value>, InferenceError> {
        self.tick();
        self.inner.context_ids(include_closure)
    }

    fn size(&self, include_closure: bool, contexts: &[GraphName]) -> Result<usize, InferenceError> {
        self.tick();
        self.inner.size(include_closure, contexts)
    }

    fn add_inferred(
        &self,
        statements: &[Statement],
        contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        self.tick();
        self.inner.add_inferred(statements, contexts)
    }

    fn remove_inferred(
        &self,
        statements: &[Statement],
        contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        self.tick();
        self.inner.remove_inferred(statements, contexts)
    }

    fn remove_inferred_matching(
        &self,
        s: Option<&Value>,
        p: Option<&Value>,
        o: Option<&Value>,
        contexts: &[GraphName],
    ) -> Result<(), InferenceError> {
        self.tick();
        self.inner.remove_inferred_matching(s, p, o, contexts)
    }

    fn scheduler(&self) -> Option<Arc<ThreadPool>> {
        self.inner.scheduler()
    }
}

/// A session of `ruleset` over a fresh transaction containing `ttl`,
/// with the context that session uses.
fn session(
    ruleset: Ruleset,
    ttl: &str,
) -> (
    NaiveSession,
    Arc<InferenceContext<MemoryTransaction>>,
    Arc<CountingContext>,
) {
    let mut tx = MemoryStore::new().begin().unwrap();
    sophia_store::Transaction::add(&mut tx, &facts(ttl), &[]).unwrap();
    let inner = Arc::new(InferenceContext::new(
        Arc::new(Mutex::new(tx)),
        PREFIX.into(),
        None,
        None,
    ));
    let counting = Arc::new(CountingContext {
        inner: inner.clone(),
        calls: AtomicUsize::new(0),
    });
    let mut inferencer = NaiveInferencer::new(ruleset);
    inferencer.initialize(PREFIX).unwrap();
    let session = inferencer
        .session("test", ClosureStatus::Stale, counting.clone())
        .unwrap();
    (session, inner, counting)
}

#[test]
fn current_closure_is_left_untouched() {
    crate::test_setup();
    let (mut session, inner, counting) = session(transitive_ruleset(), CHAIN);
    {
        let _unlocked = inner.unlock(true).unwrap();
        session.update_closure(ClosureStatus::PossiblyIncomplete).unwrap();
    }
    let calls = counting.calls.load(Ordering::Relaxed);
    assert!(calls > 0);
    {
        let _unlocked = inner.unlock(true).unwrap();
        session.update_closure(ClosureStatus::Current).unwrap();
    }
    assert_eq!(counting.calls.load(Ordering::Relaxed), calls);

    let _unlocked = inner.unlock(false).unwrap();
    let got: Vec<Statement> = inner
        .statements(None, None, None, true, &[Some(iri(PREFIX))])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        triples(got),
        expected("<x:a> <x:p> <x:c>. <x:a> <x:p> <x:d>. <x:b> <x:p> <x:d>.")
    );
}

#[test]
fn fixpoint_stops_when_nothing_is_inferred() {
    crate::test_setup();
    let (mut session, inner, _) = session(transitive_ruleset(), "<x:a> <x:p> <x:b>.");
    let _unlocked = inner.unlock(true).unwrap();
    session.update_closure(ClosureStatus::PossiblyIncomplete).unwrap();
    assert_eq!(session.stats()["trans"].activations, 1);
    assert_eq!(session.stats()["trans"].rows, 0);
}

#[test]
fn fixpoint_converges() {
    crate::test_setup();
    let (mut session, inner, _) = session(transitive_ruleset(), CHAIN);
    let _unlocked = inner.unlock(true).unwrap();
    session.update_closure(ClosureStatus::PossiblyIncomplete).unwrap();
    // a-c, b-d in the first round, a-d in the second, nothing in the third
    assert_eq!(session.stats()["trans"].activations, 3);
}

#[test_case(None, 2; "untriggered rules reactivate everything")]
#[test_case(Some(vec![]), 1; "empty triggers reactivate nothing")]
#[test_case(Some(vec!["r1"]), 2; "self triggering rule")]
fn activation(triggers: Option<Vec<&str>>, activations: usize) {
    crate::test_setup();
    let mut rule = transitive_rule("r1", "x:p").to_builder();
    if let Some(ids) = triggers {
        rule = rule.triggers(ids);
    }
    let ruleset = Ruleset::builder("rs")
        .rule(rule.build().unwrap())
        .plan(ClosureTask::sequence(
            "twice",
            vec![
                ClosureTask::eval("e1", ["r1"]),
                ClosureTask::eval("e2", ["r1"]),
            ],
        ))
        .build()
        .unwrap();
    let (mut session, inner, _) = session(ruleset, CHAIN);
    let _unlocked = inner.unlock(true).unwrap();
    session.update_closure(ClosureStatus::PossiblyIncomplete).unwrap();
    assert_eq!(session.stats()["r1"].activations, activations);
}

#[test]
fn condition_disables_rule() {
    crate::test_setup();
    let rule = transitive_rule("r1", "x:p")
        .to_builder()
        .condition(Expression::bound("go"))
        .build()
        .unwrap();
    let ruleset = Ruleset::builder("rs")
        .rule(rule)
        .parameter("go", None)
        .build()
        .unwrap();
    let (mut session, inner, _) = session(ruleset, CHAIN);
    let _unlocked = inner.unlock(true).unwrap();
    session.update_closure(ClosureStatus::PossiblyIncomplete).unwrap();
    assert!(session.stats().is_empty());
    assert_eq!(inner.size(true, &[]).unwrap(), 3);
}

#[test_case(true; "p then q")]
#[test_case(false; "q then p")]
fn sequence_order_does_not_change_closure(p_first: bool) {
    crate::test_setup();
    let mut steps = vec![
        ClosureTask::fixpoint("fp", ClosureTask::eval("ep", ["tp"])),
        ClosureTask::fixpoint("fq", ClosureTask::eval("eq", ["tq"])),
    ];
    if !p_first {
        steps.reverse();
    }
    let ruleset = Ruleset::builder("rs")
        .rule(transitive_rule("tp", "x:p"))
        .rule(transitive_rule("tq", "x:q"))
        .plan(ClosureTask::sequence("all", steps))
        .build()
        .unwrap();
    let repo = repository(&config(), ruleset);
    let mut tx = repo.begin().unwrap();
    tx.add(
        &facts(&format!("{CHAIN} <x:a> <x:q> <x:b>. <x:b> <x:q> <x:c>.")),
        &[],
    )
    .unwrap();
    tx.update_closure().unwrap();
    assert_eq!(
        inferred(&tx),
        expected(
            "<x:a> <x:p> <x:c>. <x:a> <x:p> <x:d>. <x:b> <x:p> <x:d>. <x:a> <x:q> <x:c>."
        )
    );
    tx.end(false).unwrap();
}

#[test]
fn repeat_binds_each_row() {
    crate::test_setup();
    // every property declared symmetric gets its symmetric closure
    let symmetric = Rule::builder("sym")
        .body(Query::select(vec![QuadPattern::new(v("x"), v("prop"), v("y"))]))
        .head(HeadAtom::new(v("y"), v("prop"), v("x")))
        .condition(Expression::bound("prop"))
        .build()
        .unwrap();
    let ruleset = Ruleset::builder("rs")
        .rule(symmetric)
        .plan(ClosureTask::repeat(
            "each",
            ClosureTask::eval("sym", ["sym"]),
            Query::select(vec![QuadPattern::new(
                v("prop"),
                iri("x:type"),
                iri("x:Symmetric"),
            )])
            .project(["prop"]),
        ))
        .build()
        .unwrap();
    let repo = repository(&config(), ruleset);
    let mut tx = repo.begin().unwrap();
    tx.add(
        &facts(
            r#"
            <x:knows> <x:type> <x:Symmetric>.
            <x:near> <x:type> <x:Symmetric>.
            <x:a> <x:knows> <x:b>.
            <x:a> <x:near> <x:c>.
            <x:a> <x:likes> <x:d>.
        "#,
        ),
        &[],
    )
    .unwrap();
    tx.update_closure().unwrap();
    assert_eq!(
        inferred(&tx),
        expected("<x:b> <x:knows> <x:a>. <x:c> <x:near> <x:a>.")
    );
    tx.end(false).unwrap();
}

#[test]
fn transform_filters_rows() {
    crate::test_setup();
    let direct = Rule::builder("direct")
        .body(Query::select(vec![QuadPattern::new(v("s"), iri("x:sub"), v("o"))]))
        .head(HeadAtom::new(v("s"), iri("x:direct"), v("o")))
        .transform(TransformCall::new(
            TRANSITIVE_REDUCTION,
            vec![
                Expression::constant(string("s")),
                Expression::constant(string("o")),
            ],
        ))
        .build()
        .unwrap();
    let ruleset = Ruleset::builder("rs")
        .rule(direct)
        .plan(ClosureTask::eval("once", ["direct"]))
        .build()
        .unwrap();
    let repo = repository(&config(), ruleset);
    let mut tx = repo.begin().unwrap();
    tx.add(
        &facts("<x:a> <x:sub> <x:b>. <x:b> <x:sub> <x:c>. <x:a> <x:sub> <x:c>."),
        &[],
    )
    .unwrap();
    tx.update_closure().unwrap();
    assert_eq!(
        inferred(&tx),
        expected("<x:a> <x:direct> <x:b>. <x:b> <x:direct> <x:c>.")
    );
    tx.end(false).unwrap();
}

#[test]
fn stale_closure_is_recomputed() {
    crate::test_setup();
    let repo = repository(&config(), transitive_ruleset());
    let mut tx = repo.begin().unwrap();
    tx.add(&facts(CHAIN), &[]).unwrap();
    tx.update_closure().unwrap();
    tx.remove(&facts("<x:c> <x:p> <x:d>."), &[]).unwrap();
    assert_eq!(tx.status(), ClosureStatus::Stale);
    tx.update_closure().unwrap();
    assert_eq!(inferred(&tx), expected("<x:a> <x:p> <x:c>."));
    tx.end(true).unwrap();
}

#[test]
fn status_follows_writes() {
    crate::test_setup();
    let repo = repository(&config(), transitive_ruleset());
    let mut tx = repo.begin().unwrap();
    tx.update_closure().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Current);
    tx.add(&facts(CHAIN), &[]).unwrap();
    assert_eq!(tx.status(), ClosureStatus::PossiblyIncomplete);
    tx.update_closure().unwrap();
    tx.remove_matching(Some(&iri("x:a")), None, None, &[]).unwrap();
    assert_eq!(tx.status(), ClosureStatus::Stale);
    tx.update_closure().unwrap();
    assert_eq!(inferred(&tx), expected("<x:b> <x:p> <x:d>."));

    let insert = Update::insert_data(vec![QuadPattern::new(iri("x:d"), iri("x:p"), iri("x:e"))]);
    tx.update(&insert, None, None).unwrap();
    assert_eq!(tx.status(), ClosureStatus::PossiblyIncomplete);
    tx.end(false).unwrap();
}

#[test]
fn clear_closure() {
    crate::test_setup();
    let repo = repository(&config(), transitive_ruleset());
    let mut tx = repo.begin().unwrap();
    tx.add(&facts(CHAIN), &[]).unwrap();
    tx.update_closure().unwrap();
    tx.clear_closure().unwrap();
    assert!(inferred(&tx).is_empty());
    assert_eq!(explicit(&tx), expected(CHAIN));
    assert_eq!(tx.status(), ClosureStatus::PossiblyIncomplete);
    tx.end(false).unwrap();

    let mut tx = repo
        .begin_with(InferenceOptions {
            forward: false,
            backward: false,
        })
        .unwrap();
    tx.clear_closure().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Current);
    tx.end(false).unwrap();
}

#[test]
fn explicit_only_transactions() {
    crate::test_setup();
    let repo = repository(&config(), transitive_ruleset());
    let mut tx = repo.begin().unwrap();
    tx.add(&facts(CHAIN), &[]).unwrap();
    tx.update_closure().unwrap();
    tx.end(true).unwrap();

    let mut tx = repo
        .begin_with(InferenceOptions {
            forward: false,
            backward: false,
        })
        .unwrap();
    assert!(!tx.forward_enabled());
    assert_eq!(tx.size(&[]).unwrap(), 3);
    assert_eq!(tx.size(&[Some(iri(PREFIX))]).unwrap(), 0);
    assert_eq!(tx.statements(None, None, None, &[]).unwrap().len(), 3);
    assert!(!tx.has_statement(Some(&iri("x:a")), None, Some(&iri("x:d")), &[]).unwrap());
    assert!(tx.context_ids().unwrap().is_empty());

    let all = Query::select(vec![QuadPattern::new(v("s"), iri("x:p"), v("o"))]);
    assert_eq!(tx.query(&all, None, None).unwrap().into_bindings().len(), 3);
    let graph = Query::ask(vec![
        QuadPattern::new(v("s"), iri("x:p"), v("o")).in_graph(iri(PREFIX)),
    ]);
    assert!(!tx.query(&graph, None, None).unwrap().into_boolean());

    let before = tx.status();
    tx.update_closure().unwrap();
    assert_eq!(tx.status(), before);
    tx.end(false).unwrap();

    let tx = repo.begin().unwrap();
    assert_eq!(tx.query(&all, None, None).unwrap().into_bindings().len(), 6);
}

#[test]
fn metadata_round_trip() {
    crate::test_setup();
    let dir = temp_dir("metadata");
    let cfg = InferenceConfig {
        data_dir: Some(dir.clone()),
        ..config()
    };
    let store = MemoryStore::new();
    let repo = repository_on(store.clone(), &cfg, transitive_ruleset());
    let path = repo.metadata_path().unwrap().to_path_buf();
    assert!(path.starts_with(&dir));

    let mut tx = repo.begin().unwrap();
    tx.add(&facts(CHAIN), &[]).unwrap();
    tx.end(false).unwrap();
    assert!(ClosureMetadata::read(&path).unwrap().is_none());

    let mut tx = repo.begin().unwrap();
    tx.add(&facts(CHAIN), &[]).unwrap();
    tx.update_closure().unwrap();
    tx.end(true).unwrap();
    let record = ClosureMetadata::read(&path).unwrap().unwrap();
    assert_eq!(record.status, ClosureStatus::Current);
    assert_eq!(record.digest, repo.inferencer().configuration_digest());
    assert!(!record.was_empty);
    assert_eq!(repo.cache().get(&path), Some(record.clone()));

    // a fresh repository reads the file
    let again = repository_on(store.clone(), &cfg, transitive_ruleset());
    let mut tx = again.begin().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Current);
    tx.end(false).unwrap();

    // another configuration invalidates the record
    let other = transitive_ruleset()
        .to_builder()
        .rule(transitive_rule("other", "x:q"))
        .build()
        .unwrap();
    let changed = repository_on(store.clone(), &cfg, other);
    let mut tx = changed.begin().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Stale);
    tx.end(false).unwrap();

    // so does a store whose emptiness is not the recorded one
    ClosureMetadata {
        was_empty: true,
        ..record
    }
    .write(&path)
    .unwrap();
    let reset = repository_on(store, &cfg, transitive_ruleset());
    let mut tx = reset.begin().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Stale);
    tx.end(false).unwrap();

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn emptiness_change_is_recorded() {
    crate::test_setup();
    let dir = temp_dir("emptiness");
    let cfg = InferenceConfig {
        data_dir: Some(dir.clone()),
        ..config()
    };
    let store = MemoryStore::new();
    let repo = repository_on(store.clone(), &cfg, transitive_ruleset());
    let path = repo.metadata_path().unwrap().to_path_buf();

    let mut tx = repo.begin().unwrap();
    tx.update_closure().unwrap();
    tx.end(true).unwrap();
    assert!(ClosureMetadata::read(&path).unwrap().unwrap().was_empty);

    // the status is CURRENT again at commit time, but the store is no longer empty
    let mut tx = repo.begin().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Current);
    tx.add(&facts(CHAIN), &[]).unwrap();
    tx.update_closure().unwrap();
    tx.end(true).unwrap();
    let record = ClosureMetadata::read(&path).unwrap().unwrap();
    assert_eq!(record.status, ClosureStatus::Current);
    assert!(!record.was_empty);

    let mut tx = repo.begin().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Current);
    tx.end(false).unwrap();
    let again = repository_on(store, &cfg, transitive_ruleset());
    let mut tx = again.begin().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Current);
    tx.end(false).unwrap();

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn truncated_metadata_means_stale() {
    crate::test_setup();
    let dir = temp_dir("truncated");
    let cfg = InferenceConfig {
        data_dir: Some(dir.clone()),
        ..config()
    };
    let store = MemoryStore::new();
    let repo = repository_on(store.clone(), &cfg, transitive_ruleset());
    let path = repo.metadata_path().unwrap().to_path_buf();
    let mut tx = repo.begin().unwrap();
    tx.add(&facts(CHAIN), &[]).unwrap();
    tx.update_closure().unwrap();
    tx.end(true).unwrap();

    std::fs::write(&path, "CURRE").unwrap();
    let reopened = repository_on(store, &cfg, transitive_ruleset());
    let mut tx = reopened.begin().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Stale);
    tx.update_closure().unwrap();
    assert_eq!(inferred(&tx).len(), 3);
    tx.end(true).unwrap();
    let record = ClosureMetadata::read(&path).unwrap().unwrap();
    assert_eq!(record.status, ClosureStatus::Current);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn closure_updated_on_commit() {
    crate::test_setup();
    let cfg = InferenceConfig {
        update_closure_on_commit: true,
        ..config()
    };
    let repo = repository(&cfg, transitive_ruleset());
    let mut tx = repo.begin().unwrap();
    tx.add(&facts(CHAIN), &[]).unwrap();
    tx.end(true).unwrap();

    let tx = repo.begin().unwrap();
    assert_eq!(tx.status(), ClosureStatus::Current);
    assert_eq!(inferred(&tx).len(), 3);
}

#[test]
fn failed_closure_update_aborts_commit() {
    crate::test_setup();
    let cfg = InferenceConfig {
        update_closure_on_commit: true,
        ..config()
    };
    let broken = transitive_rule("broken", "x:p")
        .to_builder()
        .transform(TransformCall::new(TRANSITIVE_REDUCTION, vec![]))
        .build()
        .unwrap();
    let ruleset = Ruleset::builder("rs").rule(broken).build().unwrap();
    let repo = repository(&cfg, ruleset);
    let mut tx = repo.begin().unwrap();
    tx.add(&facts(CHAIN), &[]).unwrap();
    let err = tx.end(true).unwrap_err();
    assert!(err.is_fatal());
    assert!(tx.end(true).is_err());
    assert!(repo.store().is_empty());
}

#[test]
fn dropped_transaction_is_rolled_back() {
    crate::test_setup();
    let repo = repository(&config(), transitive_ruleset());
    {
        let mut tx = repo.begin().unwrap();
        tx.add(&facts(CHAIN), &[]).unwrap();
    }
    assert!(repo.store().is_empty());
}

/// An inferencer rewriting every query and update to nothing
struct Nihilist;

impl Inferencer for Nihilist {
    fn initialize(&mut self, _: &str) -> Result<(), InferenceError> {
        Ok(())
    }

    fn inference_mode(&self) -> InferenceMode {
        InferenceMode::Backward
    }

    fn configuration_digest(&self) -> &str {
        "nihilist"
    }

    fn new_session(
        &self,
        _: &str,
        _: ClosureStatus,
        _: Arc<dyn Context>,
    ) -> Result<Box<dyn Session>, InferenceError> {
        Ok(Box::new(Nihilist))
    }
}

impl Session for Nihilist {
    fn statements_added(
        &mut self,
        _: Option<&[Statement]>,
        _: &[GraphName],
    ) -> Result<(), InferenceError> {
        Ok(())
    }

    fn statements_removed(
        &mut self,
        _: Option<&[Statement]>,
        _: &[GraphName],
    ) -> Result<(), InferenceError> {
        Ok(())
    }

    fn statements_cleared(&mut self, _: bool) -> Result<(), InferenceError> {
        Ok(())
    }

    fn rewrite_query(
        &mut self,
        _: Query,
        _: ClosureStatus,
        _: bool,
    ) -> Result<Option<Query>, InferenceError> {
        Ok(None)
    }

    fn rewrite_update(
        &mut self,
        _: Update,
        _: ClosureStatus,
        _: bool,
    ) -> Result<Option<Update>, InferenceError> {
        Ok(None)
    }

    fn update_closure(&mut self, _: ClosureStatus) -> Result<(), InferenceError> {
        Err(InferenceError::Fatal("no closure to update".into()))
    }

    fn close(&mut self, _: bool) -> Result<(), InferenceError> {
        Ok(())
    }
}

#[test]
fn rewritten_to_nothing() {
    crate::test_setup();
    let repo = InferenceRepository::new(MemoryStore::new(), Nihilist, &config()).unwrap();
    let mut tx = repo
        .begin_with(InferenceOptions {
            forward: true,
            backward: true,
        })
        .unwrap();
    assert!(tx.backward_enabled());
    assert!(!tx.forward_enabled());
    tx.add(&facts(CHAIN), &[]).unwrap();

    let all = Query::select(vec![QuadPattern::new(v("s"), iri("x:p"), v("o"))]);
    assert!(tx.query(&all, None, None).unwrap().into_bindings().is_empty());
    let ask = Query::ask(vec![QuadPattern::new(v("s"), iri("x:p"), v("o"))]);
    assert!(!tx.query(&ask, None, None).unwrap().into_boolean());

    let delete = Update::delete(
        vec![QuadPattern::new(v("s"), iri("x:p"), v("o"))],
        all.clone(),
    );
    tx.update(&delete, None, None).unwrap();
    assert_eq!(tx.size(&[]).unwrap(), 3);

    // forward reasoning is not supported: nothing to update
    tx.update_closure().unwrap();
    tx.end(true).unwrap();
}
