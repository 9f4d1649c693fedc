//! Chakrator edit gateway (in-process).
//!
//! The operations frontends (HTTP server, CLI) depend on: read and replace
//! the reconciler source, attach to the log stream. Saving never compiles
//! the source; a broken edit surfaces on the next dispatched event.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chakrator_core::LogSink;
use chakrator_loader::Loader;
use chakrator_logbus::{LogBroadcaster, Subscription};
use chakrator_store::CodeStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Gateway errors, shaped for transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ChakraError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("io: {0}")]
    Io(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ChakraResult<T> = Result<T, ChakraError>;

/// Runtime facts exposed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Health {
    pub service: String,
    pub version: String,
    pub subscribers: usize,
    pub code_path: Option<String>,
}

#[async_trait::async_trait]
pub trait ChakraApi: Send + Sync {
    /// Current reconciler source. Never fails.
    async fn get_current_source(&self) -> String;

    /// Replace the reconciler source. Empty text is rejected.
    async fn update_source(&self, text: &str) -> ChakraResult<()>;

    /// Compile without saving; for tooling.
    async fn check_source(&self, text: &str) -> ChakraResult<()>;

    /// Attach a log subscriber; drop it to detach.
    fn subscribe_logs(&self) -> Subscription;

    fn health(&self) -> Health;
}

fn validate(text: &str) -> ChakraResult<()> {
    if text.is_empty() {
        return Err(ChakraError::Validation("code is required".into()));
    }
    Ok(())
}

// ----------------- In-process implementation -----------------

pub struct InProcApi {
    store: Arc<CodeStore>,
    bus: LogBroadcaster,
    loader: Arc<dyn Loader>,
}

impl InProcApi {
    pub fn new(store: Arc<CodeStore>, bus: LogBroadcaster, loader: Arc<dyn Loader>) -> Self { Self { store, bus, loader } }
}

#[async_trait::async_trait]
impl ChakraApi for InProcApi {
    async fn get_current_source(&self) -> String { self.store.read().as_str().to_owned() }

    async fn update_source(&self, text: &str) -> ChakraResult<()> {
        validate(text)?;
        let t0 = Instant::now();
        let store = self.store.clone();
        let owned = text.to_owned();
        tokio::task::spawn_blocking(move || store.write(&owned))
            .await
            .map_err(|e| ChakraError::Internal(e.to_string()))?
            .map_err(|e| {
                warn!(error = %e, "api: update_source failed");
                ChakraError::Io(e.to_string())
            })?;
        info!(bytes = text.len(), took_ms = %t0.elapsed().as_millis(), "api: update_source ok");
        Ok(())
    }

    async fn check_source(&self, text: &str) -> ChakraResult<()> {
        validate(text)?;
        self.loader.check(text).map_err(|e| ChakraError::Validation(e.cause))
    }

    fn subscribe_logs(&self) -> Subscription { self.bus.subscribe() }

    fn health(&self) -> Health {
        Health {
            service: "chakrator".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            subscribers: self.bus.subscriber_count(),
            code_path: self.store.path().map(|p| p.display().to_string()),
        }
    }
}

// ----------------- Mock implementation -----------------

/// In-memory gateway for frontend tests; can be told to fail writes.
pub struct MockApi {
    pub code: Mutex<String>,
    pub fail_writes: bool,
    pub bus: LogBroadcaster,
}

impl Default for MockApi {
    fn default() -> Self {
        Self { code: Mutex::new(chakrator_core::DEFAULT_RECONCILER.to_string()), fail_writes: false, bus: LogBroadcaster::default() }
    }
}

impl MockApi {
    pub fn new() -> Self { Self::default() }
    pub fn failing() -> Self { Self { fail_writes: true, ..Self::default() } }
}

#[async_trait::async_trait]
impl ChakraApi for MockApi {
    async fn get_current_source(&self) -> String { self.code.lock().unwrap_or_else(|p| p.into_inner()).clone() }

    async fn update_source(&self, text: &str) -> ChakraResult<()> {
        validate(text)?;
        if self.fail_writes {
            return Err(ChakraError::Io("mock: write refused".into()));
        }
        *self.code.lock().unwrap_or_else(|p| p.into_inner()) = text.to_owned();
        self.bus.info("Code updated successfully");
        Ok(())
    }

    async fn check_source(&self, text: &str) -> ChakraResult<()> { validate(text) }

    fn subscribe_logs(&self) -> Subscription { self.bus.subscribe() }

    fn health(&self) -> Health {
        Health { service: "chakrator-mock".into(), version: "0.0.0".into(), subscribers: self.bus.subscriber_count(), code_path: None }
    }
}
