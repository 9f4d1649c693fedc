#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chakrator_core::{
    LogLevel, LogSink, MemorySink, ReconcileError, ResourceEvent, ResourceObject, StatusWriter, DEFAULT_RECONCILER,
};
use chakrator_dispatch::{spawn_dispatcher, DispatchOutcome, DispatchState, Dispatcher};
use chakrator_loader::{LoadFailure, Loader, Outcome, Reconciler, RhaiLoader};
use chakrator_store::CodeStore;
use serde_json::{json, Value};

#[derive(Default)]
struct RecordingWriter {
    writes: Mutex<Vec<(String, Value)>>,
}

impl RecordingWriter {
    fn writes(&self) -> Vec<(String, Value)> { self.writes.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl StatusWriter for RecordingWriter {
    async fn write_status(&self, object: &ResourceObject, status: &Value) -> anyhow::Result<()> {
        self.writes.lock().unwrap().push((object.name().to_string(), status.clone()));
        Ok(())
    }
}

fn obj(name: &str) -> ResourceObject {
    ResourceObject::from_value(json!({ "metadata": { "name": name, "namespace": "ns" }, "spec": {} })).unwrap()
}

struct Rig {
    mem: Arc<MemorySink>,
    store: Arc<CodeStore>,
    writer: Arc<RecordingWriter>,
}

impl Rig {
    fn new(source: &str) -> Self {
        let mem = Arc::new(MemorySink::new());
        let sink: Arc<dyn LogSink> = mem.clone();
        let store = Arc::new(CodeStore::in_memory_with(source, sink));
        Self { mem, store, writer: Arc::new(RecordingWriter::default()) }
    }

    fn dispatcher(&self, loader: Arc<dyn Loader>) -> Dispatcher {
        Dispatcher::new(self.store.clone(), loader, self.mem.clone(), self.writer.clone())
    }
}

// ---- native loader used to observe ordering and overlap ----

struct Probe {
    seen: Mutex<Vec<String>>,
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
}

struct ProbeLoader(Arc<Probe>);
struct ProbeUnit(Arc<Probe>);

impl Loader for ProbeLoader {
    fn load(&self, _source: &str, _sink: Arc<dyn LogSink>) -> Result<Arc<dyn Reconciler>, LoadFailure> {
        Ok(Arc::new(ProbeUnit(self.0.clone())))
    }
}

#[async_trait::async_trait]
impl Reconciler for ProbeUnit {
    async fn reconcile(&self, object: &ResourceObject) -> Result<Outcome, ReconcileError> {
        if self.0.in_flight.swap(true, Ordering::SeqCst) {
            self.0.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        if object.name() == "panic" {
            self.0.in_flight.store(false, Ordering::SeqCst);
            panic!("native reconciler blew up");
        }
        self.0.seen.lock().unwrap().push(object.name().to_string());
        self.0.in_flight.store(false, Ordering::SeqCst);
        Ok(Outcome::unchanged())
    }
}

fn probe() -> Arc<Probe> {
    Arc::new(Probe { seen: Mutex::new(Vec::new()), in_flight: AtomicBool::new(false), overlaps: AtomicUsize::new(0) })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_are_serialized_in_arrival_order() {
    let rig = Rig::new("unused");
    let p = probe();
    let (tx, mut handle) = spawn_dispatcher(8, rig.dispatcher(Arc::new(ProbeLoader(p.clone()))));

    // single producer: exact order
    for i in 0..20 { tx.send(ResourceEvent::added(obj(&format!("s{i}")))).await.unwrap(); }
    assert!(handle.wait_processed(20).await);
    let expected: Vec<String> = (0..20).map(|i| format!("s{i}")).collect();
    assert_eq!(*p.seen.lock().unwrap(), expected);

    // concurrent producers: every event exactly once, per-producer order kept, never overlapping
    let mut producers = Vec::new();
    for t in 0..4 {
        let tx = tx.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..25 { tx.send(ResourceEvent::modified(obj(&format!("p{t}-{i}")))).await.unwrap(); }
        }));
    }
    for pr in producers { pr.await.unwrap(); }
    assert!(handle.wait_processed(120).await);

    let seen = p.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 120);
    for t in 0..4 {
        let mine: Vec<String> = seen.iter().filter(|n| n.starts_with(&format!("p{t}-"))).cloned().collect();
        let want: Vec<String> = (0..25).map(|i| format!("p{t}-{i}")).collect();
        assert_eq!(mine, want);
    }
    assert_eq!(p.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(handle.state(), DispatchState::Idle);

    drop(tx);
    handle.join().await.unwrap();
}

#[tokio::test]
async fn edits_apply_from_the_next_event_on() {
    let rig = Rig::new(r#"fn reconcile(o) { set_status(#{ v: "A" }); }"#);
    let mut d = rig.dispatcher(Arc::new(RhaiLoader::new()));

    assert_eq!(d.dispatch(ResourceEvent::added(obj("e1"))).await, DispatchOutcome::Reconciled { status_written: true });
    rig.store.write(r#"fn reconcile(o) { set_status(#{ v: "B" }); }"#).unwrap();
    assert_eq!(d.dispatch(ResourceEvent::modified(obj("e2"))).await, DispatchOutcome::Reconciled { status_written: true });

    let writes = rig.writer.writes();
    assert_eq!(writes, vec![("e1".to_string(), json!({ "v": "A" })), ("e2".to_string(), json!({ "v": "B" }))]);
}

#[tokio::test]
async fn edit_reaches_a_running_dispatch_loop() {
    let rig = Rig::new(r#"fn reconcile(o) { set_status(#{ v: "A" }); }"#);
    let (tx, mut handle) = spawn_dispatcher(4, rig.dispatcher(Arc::new(RhaiLoader::new())));

    tx.send(ResourceEvent::added(obj("e1"))).await.unwrap();
    assert!(handle.wait_processed(1).await);
    rig.store.write(r#"fn reconcile(o) { set_status(#{ v: "B" }); }"#).unwrap();
    tx.send(ResourceEvent::modified(obj("e2"))).await.unwrap();
    assert!(handle.wait_processed(2).await);

    let vs: Vec<Value> = rig.writer.writes().into_iter().map(|(_, s)| s["v"].clone()).collect();
    assert_eq!(vs, vec![json!("A"), json!("B")]);
}

#[tokio::test]
async fn faults_do_not_affect_the_next_event() {
    let src = r#"
        fn reconcile(o) {
            if o.metadata.name == "bad" { throw "boom"; }
            set_status(#{ ok: true });
        }
    "#;
    let rig = Rig::new(src);
    let mut d = rig.dispatcher(Arc::new(RhaiLoader::new()));

    match d.dispatch(ResourceEvent::added(obj("bad"))).await {
        DispatchOutcome::Faulted(msg) => assert!(msg.contains("boom"), "{msg}"),
        other => panic!("expected fault, got {other:?}"),
    }
    assert_eq!(d.state(), DispatchState::Idle);
    assert_eq!(d.dispatch(ResourceEvent::added(obj("good"))).await, DispatchOutcome::Reconciled { status_written: true });
    assert_eq!(rig.writer.writes(), vec![("good".to_string(), json!({ "ok": true }))]);

    let errors: Vec<String> = rig.mem.records().into_iter().filter(|r| r.level == LogLevel::Error).map(|r| r.message).collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Failed to reconcile ns/bad"), "{}", errors[0]);
}

#[tokio::test]
async fn native_panics_are_caught_at_the_boundary() {
    let rig = Rig::new("unused");
    let p = probe();
    let (tx, mut handle) = spawn_dispatcher(4, rig.dispatcher(Arc::new(ProbeLoader(p.clone()))));

    tx.send(ResourceEvent::added(obj("panic"))).await.unwrap();
    tx.send(ResourceEvent::added(obj("after"))).await.unwrap();
    assert!(handle.wait_processed(2).await);

    assert_eq!(*p.seen.lock().unwrap(), vec!["after".to_string()]);
    assert!(rig.mem.messages().iter().any(|m| m.contains("native reconciler blew up")));
}

#[tokio::test]
async fn load_failure_logs_one_error_and_leaves_dispatcher_idle() {
    let rig = Rig::new("fn reconcile(o) {");
    let mut d = rig.dispatcher(Arc::new(RhaiLoader::new()));

    let out = d.dispatch(ResourceEvent::added(obj("x"))).await;
    assert!(matches!(out, DispatchOutcome::LoadFailed(_)), "{out:?}");
    assert_eq!(rig.mem.count(LogLevel::Error), 1);
    assert_eq!(d.state(), DispatchState::Idle);
    assert_eq!(d.processed(), 1);

    // missing entry point is a load failure too
    rig.store.write("fn other(o) { }").unwrap();
    rig.mem.clear();
    assert!(matches!(d.dispatch(ResourceEvent::added(obj("y"))).await, DispatchOutcome::LoadFailed(_)));
    assert_eq!(rig.mem.count(LogLevel::Error), 1);

    // fixing the source recovers without a restart
    rig.store.write("fn reconcile(o) { }").unwrap();
    assert!(d.dispatch(ResourceEvent::added(obj("z"))).await.is_success());
    assert!(rig.writer.writes().is_empty());
}

#[tokio::test]
async fn rejections_and_deletions_run_through_the_unit() {
    let src = r#"
        fn reconcile(o) {
            if "deletionTimestamp" in o.metadata { info("cleanup " + o.metadata.name); return; }
            return reject("spec invalid");
        }
    "#;
    let rig = Rig::new(src);
    let mut d = rig.dispatcher(Arc::new(RhaiLoader::new()));

    assert_eq!(d.dispatch(ResourceEvent::added(obj("a"))).await, DispatchOutcome::Rejected("spec invalid".into()));

    let mut gone = obj("a");
    gone.metadata.deletion_timestamp = Some("2024-01-01T00:00:00Z".into());
    assert!(d.dispatch(ResourceEvent::deleted(gone)).await.is_success());
    assert!(rig.mem.messages().iter().any(|m| m == "cleanup a"));
    assert_eq!(rig.mem.count(LogLevel::Warn), 1);
}

#[tokio::test]
async fn default_template_sets_ready_once_then_stays_quiet() {
    let rig = Rig::new(DEFAULT_RECONCILER);
    let mut d = rig.dispatcher(Arc::new(RhaiLoader::new()));

    let fresh = ResourceObject::from_value(json!({
        "metadata": { "name": "demo", "namespace": "default", "generation": 1 },
        "spec": { "message": "hi" }
    }))
    .unwrap();
    assert_eq!(d.dispatch(ResourceEvent::added(fresh)).await, DispatchOutcome::Reconciled { status_written: true });

    let writes = rig.writer.writes();
    assert_eq!(writes.len(), 1);
    let status = &writes[0].1;
    assert_eq!(status["state"], "Ready");
    assert_eq!(status["message"], "hi");
    assert_eq!(status["observedGeneration"], 1);

    let settled = ResourceObject::from_value(json!({
        "metadata": { "name": "demo", "namespace": "default", "generation": 1 },
        "spec": { "message": "hi" },
        "status": { "state": "Ready", "message": "hi" }
    }))
    .unwrap();
    assert_eq!(d.dispatch(ResourceEvent::modified(settled)).await, DispatchOutcome::Reconciled { status_written: false });
    assert_eq!(rig.writer.writes().len(), 1);
}

struct FailingWriter;

#[async_trait::async_trait]
impl StatusWriter for FailingWriter {
    async fn write_status(&self, _object: &ResourceObject, _status: &Value) -> anyhow::Result<()> {
        anyhow::bail!("apiserver unavailable")
    }
}

#[tokio::test]
async fn status_write_failures_are_logged_not_fatal() {
    let mem = Arc::new(MemorySink::new());
    let sink: Arc<dyn LogSink> = mem.clone();
    let store = Arc::new(CodeStore::in_memory_with(r#"fn reconcile(o) { set_status(#{ a: 1 }); }"#, sink.clone()));
    let mut d = Dispatcher::new(store, Arc::new(RhaiLoader::new()), sink, Arc::new(FailingWriter));

    let out = d.dispatch(ResourceEvent::added(obj("a"))).await;
    assert_eq!(out, DispatchOutcome::StatusFailed("apiserver unavailable".into()));
    assert!(d.dispatch(ResourceEvent::added(obj("b"))).await == DispatchOutcome::StatusFailed("apiserver unavailable".into()));
    assert_eq!(mem.count(LogLevel::Error), 2);
}
