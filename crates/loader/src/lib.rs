//! Chakrator reconciliation loader.
//!
//! Turns reconciler source text into an invocable unit. Loading is a
//! capability behind [`Loader`]; the shipped implementation embeds Rhai and
//! compiles a fresh engine per load, with the host functions bound to the
//! log sink handed in by the caller.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chakrator_core::{LogLevel, LogRecord, LogSink, ReconcileError, ResourceObject, ENTRY_POINT};
use metrics::histogram;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Position, Scope, AST};
use serde_json::Value;
use tracing::debug;

/// Source text could not be turned into an invocable unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("load failure: {cause}")]
pub struct LoadFailure {
    pub cause: String,
}

impl LoadFailure {
    pub fn new(cause: impl Into<String>) -> Self { Self { cause: cause.into() } }
}

/// Side effects requested by one successful reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Replacement status for the reconciled object, if any.
    pub status: Option<Value>,
}

impl Outcome {
    pub fn unchanged() -> Self { Self::default() }
    pub fn with_status(status: Value) -> Self { Self { status: Some(status) } }
}

/// The loaded, callable form of a reconciler source.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, object: &ResourceObject) -> Result<Outcome, ReconcileError>;
}

pub trait Loader: Send + Sync {
    fn load(&self, source: &str, sink: Arc<dyn LogSink>) -> Result<Arc<dyn Reconciler>, LoadFailure>;

    /// Compile without keeping the result; diagnostics are discarded.
    fn check(&self, source: &str) -> Result<(), LoadFailure> {
        self.load(source, Arc::new(chakrator_core::NullSink)).map(|_| ())
    }
}

/// Value returned by the script's `reject(reason)`.
#[derive(Debug, Clone)]
pub struct Rejection(pub String);

#[derive(Debug, Clone, Copy, Default)]
pub struct RhaiLoader;

impl RhaiLoader {
    pub fn new() -> Self { Self }
}

impl Loader for RhaiLoader {
    fn load(&self, source: &str, sink: Arc<dyn LogSink>) -> Result<Arc<dyn Reconciler>, LoadFailure> {
        let started = Instant::now();
        let status: StatusSlot = Arc::new(Mutex::new(None));
        let engine = build_engine(sink, status.clone());
        let ast = engine.compile(source).map_err(|e| LoadFailure::new(format!("syntax error: {e}")))?;
        check_entry_point(&ast)?;
        histogram!("loader_compile_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(bytes = source.len(), "reconciler compiled");
        Ok(Arc::new(ScriptReconciler {
            engine: Arc::new(engine),
            ast: Arc::new(ast),
            status,
            call_lock: Arc::new(Mutex::new(())),
        }))
    }
}

fn check_entry_point(ast: &AST) -> Result<(), LoadFailure> {
    let arities: Vec<usize> = ast.iter_functions().filter(|f| f.name == ENTRY_POINT).map(|f| f.params.len()).collect();
    if arities.is_empty() {
        return Err(LoadFailure::new(format!("entry point `{ENTRY_POINT}(object)` not found")));
    }
    if !arities.contains(&1) {
        return Err(LoadFailure::new(format!(
            "entry point `{ENTRY_POINT}` must take exactly one parameter (found {:?})",
            arities
        )));
    }
    Ok(())
}

type StatusSlot = Arc<Mutex<Option<Value>>>;

fn take_status(slot: &StatusSlot) -> Option<Value> { slot.lock().unwrap_or_else(|p| p.into_inner()).take() }

/// Render a script value for a log line. Maps and arrays go out as JSON.
fn text_of(x: &Dynamic) -> String {
    if x.is_map() || x.is_array() {
        if let Ok(v) = rhai::serde::from_dynamic::<Value>(x) {
            return v.to_string();
        }
    }
    x.to_string()
}

/// `debug(x)` hands over the debug rendering; strings arrive quoted.
fn unquote(s: &str) -> &str {
    s.strip_prefix('"').and_then(|t| t.strip_suffix('"')).unwrap_or(s)
}

fn register_level(engine: &mut Engine, name: &str, level: LogLevel, sink: &Arc<dyn LogSink>) {
    let sink = sink.clone();
    engine.register_fn(name, move |x: Dynamic| sink.emit(LogRecord::new(level, text_of(&x))));
}

fn build_engine(sink: Arc<dyn LogSink>, status: StatusSlot) -> Engine {
    let mut engine = Engine::new();

    let print_sink = sink.clone();
    engine.on_print(move |s: &str| print_sink.emit(LogRecord::new(LogLevel::classify(s), s)));
    let debug_sink = sink.clone();
    engine.on_debug(move |s: &str, _src: Option<&str>, _pos: Position| debug_sink.debug(unquote(s)));

    register_level(&mut engine, "info", LogLevel::Info, &sink);
    register_level(&mut engine, "warn", LogLevel::Warn, &sink);
    register_level(&mut engine, "error", LogLevel::Error, &sink);
    register_level(&mut engine, "success", LogLevel::Success, &sink);
    let sep_sink = sink;
    engine.register_fn("separator", move || sep_sink.separator());

    engine.register_fn("set_status", move |next: Map| -> Result<(), Box<EvalAltResult>> {
        let value: Value = rhai::serde::from_dynamic(&Dynamic::from_map(next))?;
        *status.lock().unwrap_or_else(|p| p.into_inner()) = Some(value);
        Ok(())
    });

    engine.register_type_with_name::<Rejection>("Rejection");
    engine.register_fn("reject", |reason: Dynamic| Rejection(text_of(&reason)));
    engine.register_get("reason", |r: &mut Rejection| r.0.clone());

    engine.register_fn("now", || chrono::Utc::now().to_rfc3339());
    engine.register_fn("to_json", |x: Dynamic| -> Result<String, Box<EvalAltResult>> {
        let v: Value = rhai::serde::from_dynamic(&x)?;
        Ok(serde_json::to_string_pretty(&v).unwrap_or_else(|_| v.to_string()))
    });

    engine
}

/// A compiled script plus the engine its host functions live in.
pub struct ScriptReconciler {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    status: StatusSlot,
    // the status slot is per unit, so calls on one unit take turns
    call_lock: Arc<Mutex<()>>,
}

#[async_trait::async_trait]
impl Reconciler for ScriptReconciler {
    async fn reconcile(&self, object: &ResourceObject) -> Result<Outcome, ReconcileError> {
        let arg = rhai::serde::to_dynamic(object).map_err(|e| ReconcileError::Fault(format!("converting object: {e}")))?;
        let engine = self.engine.clone();
        let ast = self.ast.clone();
        let status = self.status.clone();
        let call_lock = self.call_lock.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let _guard = call_lock.lock().unwrap_or_else(|p| p.into_inner());
            let _ = take_status(&status);
            let mut scope = Scope::new();
            let out = engine.call_fn::<Dynamic>(&mut scope, &ast, ENTRY_POINT, (arg,));
            (out, take_status(&status))
        })
        .await;

        let (out, status) = joined.map_err(|e| {
            if e.is_panic() { ReconcileError::Fault("reconciler panicked".to_string()) } else { ReconcileError::Fault(e.to_string()) }
        })?;
        let value = out.map_err(|e| ReconcileError::Fault(e.to_string()))?;
        if let Some(Rejection(reason)) = value.try_cast::<Rejection>() {
            return Err(ReconcileError::Failure(reason));
        }
        Ok(Outcome { status })
    }
}
