//! Chakrator code store: holds the one reconciler source the runtime loads.
//!
//! Readers get a snapshot via an atomic pointer load and never see a partial
//! value. Writers replace the backing file with write-then-rename first and
//! swap the in-memory cell only once that succeeded.

#![forbid(unsafe_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arc_swap::ArcSwap;
use chakrator_core::{LogSink, DEFAULT_RECONCILER};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("reading {}: {}", .path.display(), .source)]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("writing {}: {}", .path.display(), .source)]
    Write { path: PathBuf, #[source] source: std::io::Error },
}

pub type StoreResult<T> = Result<T, StoreError>;

pub struct CodeStore {
    current: ArcSwap<String>,
    path: Option<PathBuf>,
    sink: Arc<dyn LogSink>,
    // single writer: file replace + swap happen as one step
    write_lock: Mutex<()>,
}

impl CodeStore {
    /// Open the store backed by `path`. A missing file is seeded with the
    /// default template so the location always holds the active source.
    pub fn open(path: impl Into<PathBuf>, sink: Arc<dyn LogSink>) -> StoreResult<Self> {
        let path = path.into();
        let text = match fs::read_to_string(&path) {
            Ok(text) => {
                info!(path = %path.display(), bytes = text.len(), "reconciler source loaded");
                text
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no reconciler source yet; seeding default template");
                replace_file(&path, DEFAULT_RECONCILER).map_err(|source| StoreError::Write { path: path.clone(), source })?;
                DEFAULT_RECONCILER.to_string()
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        Ok(Self { current: ArcSwap::from_pointee(text), path: Some(path), sink, write_lock: Mutex::new(()) })
    }

    /// Store without a backing file, starting from the default template.
    pub fn in_memory(sink: Arc<dyn LogSink>) -> Self {
        Self::in_memory_with(DEFAULT_RECONCILER, sink)
    }

    pub fn in_memory_with(initial: &str, sink: Arc<dyn LogSink>) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial.to_string()),
            path: None,
            sink,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> { self.path.as_deref() }

    /// Current source snapshot. Never fails.
    pub fn read(&self) -> Arc<String> { self.current.load_full() }

    /// Replace the source wholesale.
    pub fn write(&self, text: &str) -> StoreResult<()> {
        let started = Instant::now();
        {
            let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(path) = &self.path {
                replace_file(path, text).map_err(|source| {
                    warn!(path = %path.display(), error = %source, "reconciler source write failed");
                    StoreError::Write { path: path.clone(), source }
                })?;
            }
            self.current.store(Arc::new(text.to_string()));
        }
        histogram!("store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_writes_total", 1u64);
        debug!(bytes = text.len(), "reconciler source replaced");
        // committed; announcing it cannot undo the write
        self.sink.info("Code updated successfully");
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "reconciler".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn replace_file(path: &Path, text: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let res = (|| {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(text.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}
