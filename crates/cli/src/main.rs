use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chakrator_api::{ChakraApi, InProcApi};
use chakrator_core::{EventKind, LogRecord, LogSink, ResourceEvent, ResourceObject, StatusWriter, DEFAULT_RECONCILER};
use chakrator_dispatch::{spawn_dispatcher, Dispatcher, LoggingStatusWriter};
use chakrator_kubehub::KubeStatusWriter;
use chakrator_loader::{Loader, RhaiLoader};
use chakrator_logbus::LogBroadcaster;
use chakrator_server::{build_router, serve, with_middleware, AppState};
use chakrator_store::CodeStore;
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chakrator", version, about = "Hot-reloadable reconciliation runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a resource kind, reconcile every event, serve the editor API
    Run(RunArgs),
    /// Compile a reconciler script and report load errors
    Check {
        file: PathBuf,
    },
    /// Dry-run one event through a script; status writes are only logged
    Reconcile {
        script: PathBuf,
        /// Object as YAML or JSON
        object: PathBuf,
        /// added | modified | deleted
        #[arg(long = "kind", default_value = "added")]
        kind: String,
    },
    /// Print the default reconciler template
    Template,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// GVK key, e.g. "example.com/v1/MyResource" or "v1/ConfigMap"
    #[arg(long = "gvk", env = "CHAKRATOR_GVK", default_value = "example.com/v1/MyResource")]
    gvk: String,

    /// Namespace to watch (default: all)
    #[arg(long = "ns", env = "CHAKRATOR_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long = "listen", env = "CHAKRATOR_LISTEN", default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// Overrides the port of --listen
    #[arg(long = "port", env = "PORT")]
    port: Option<u16>,

    #[arg(long = "code-path", env = "CHAKRATOR_CODE_PATH", default_value = "reconciler.rhai")]
    code_path: PathBuf,

    /// Static files served at `/`
    #[arg(long = "public-dir", env = "CHAKRATOR_PUBLIC_DIR")]
    public_dir: Option<PathBuf>,

    #[arg(long = "queue-cap", env = "CHAKRATOR_QUEUE_CAP", default_value_t = 1024)]
    queue_cap: usize,

    /// Records a slow log subscriber may lag before losing the oldest
    #[arg(long = "log-capacity", default_value_t = chakrator_logbus::DEFAULT_CAPACITY)]
    log_capacity: usize,

    /// Serve the editor only; no cluster connection, status writes are logged
    #[arg(long = "no-watch", action = ArgAction::SetTrue)]
    no_watch: bool,
}

fn init_tracing() {
    let env = std::env::var("CHAKRATOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CHAKRATOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CHAKRATOR_METRICS_ADDR; expected host:port");
        }
    }
}

fn listen_addr(listen: SocketAddr, port: Option<u16>) -> SocketAddr {
    match port {
        Some(p) => SocketAddr::new(listen.ip(), p),
        None => listen,
    }
}

fn parse_object(path: &Path, text: &str) -> Result<ResourceObject> {
    let is_json = path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("json")).unwrap_or(false);
    let value: serde_json::Value = if is_json {
        serde_json::from_str(text).context("parsing JSON object")?
    } else {
        serde_yaml::from_str(text).context("parsing YAML object")?
    };
    ResourceObject::from_value(value).context("decoding resource object")
}

/// Prints rendered records to stdout (dry runs).
struct StdoutSink;

impl LogSink for StdoutSink {
    fn emit(&self, record: LogRecord) { println!("{}", record.render()) }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check { file } => {
            let src = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            match RhaiLoader::new().check(&src) {
                Ok(()) => {
                    println!("{}: OK", file.display());
                    Ok(())
                }
                Err(e) => bail!("{}: {}", file.display(), e.cause),
            }
        }
        Commands::Reconcile { script, object, kind } => {
            let kind = EventKind::from_str(&kind)?;
            let src = std::fs::read_to_string(&script).with_context(|| format!("reading {}", script.display()))?;
            let text = std::fs::read_to_string(&object).with_context(|| format!("reading {}", object.display()))?;
            let obj = parse_object(&object, &text)?;

            let sink: Arc<dyn LogSink> = Arc::new(StdoutSink);
            let store = Arc::new(CodeStore::in_memory_with(&src, sink.clone()));
            let status: Arc<dyn StatusWriter> = Arc::new(LoggingStatusWriter::new(sink.clone()));
            let mut dispatcher = Dispatcher::new(store, Arc::new(RhaiLoader::new()), sink, status);
            let outcome = dispatcher.dispatch(ResourceEvent::new(kind, obj)).await;
            if outcome.is_success() {
                Ok(())
            } else {
                Err(anyhow!("reconcile {}", outcome.as_str()))
            }
        }
        Commands::Template => {
            print!("{}", DEFAULT_RECONCILER);
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let addr = listen_addr(args.listen, args.port);
    info!(gvk = %args.gvk, ns = ?args.namespace, %addr, code_path = %args.code_path.display(), "run invoked");

    let bus = LogBroadcaster::new(args.log_capacity);
    let sink: Arc<dyn LogSink> = Arc::new(bus.clone());
    let store = Arc::new(CodeStore::open(&args.code_path, sink.clone())?);
    let loader: Arc<dyn Loader> = Arc::new(RhaiLoader::new());

    let status: Arc<dyn StatusWriter> = if args.no_watch {
        Arc::new(LoggingStatusWriter::new(sink.clone()))
    } else {
        Arc::new(KubeStatusWriter::connect(&args.gvk).await.context("connecting status writer")?)
    };
    let dispatcher = Dispatcher::new(store.clone(), loader.clone(), sink.clone(), status);
    let (event_tx, dispatch) = spawn_dispatcher(args.queue_cap, dispatcher);

    let mut watcher = tokio::spawn({
        let gvk = args.gvk.clone();
        let ns = args.namespace.clone();
        let tx = event_tx.clone();
        let enabled = !args.no_watch;
        async move {
            if !enabled {
                // keep the sender alive until shutdown
                let _tx = tx;
                std::future::pending::<()>().await;
                return Ok(());
            }
            chakrator_kubehub::start_watcher(&gvk, ns.as_deref(), tx).await
        }
    });

    let api: Arc<dyn ChakraApi> = Arc::new(InProcApi::new(store, bus.clone(), loader));
    let app = with_middleware(build_router(AppState::new(api)), args.public_dir);
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(serve(listener, app, async move {
        let _ = shutdown_rx.await;
    }));

    let result: Result<()> = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            Ok(())
        }
        res = &mut watcher => match res {
            Ok(Ok(())) => {
                warn!("watcher finished; shutting down");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = ?e, "watcher failed");
                Err(e.context("watch transport failed"))
            }
            Err(e) => Err(anyhow!("watcher task failed: {e}")),
        },
        res = &mut server => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!(e).context("server crashed")),
            Err(e) => Err(anyhow!("server task failed: {e}")),
        },
    };

    // Graceful shutdown: stop accepting edits, then let the dispatcher drain.
    let _ = shutdown_tx.send(());
    if !server.is_finished() {
        let _ = server.await;
    }
    if !watcher.is_finished() {
        watcher.abort();
        let _ = watcher.await;
    }
    drop(event_tx);
    let processed = dispatch.processed();
    if let Err(e) = dispatch.join().await {
        error!(error = %e, "dispatch loop panicked");
    }
    info!(processed, subscribers = bus.subscriber_count(), "shutdown complete");
    result
}
