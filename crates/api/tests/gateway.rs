#![forbid(unsafe_code)]

use std::sync::Arc;

use chakrator_api::{ChakraApi, ChakraError, InProcApi, MockApi};
use chakrator_core::{LogLevel, LogSink};
use chakrator_loader::RhaiLoader;
use chakrator_logbus::LogBroadcaster;
use chakrator_store::CodeStore;

fn gateway(dir: &tempfile::TempDir) -> (InProcApi, LogBroadcaster) {
    let bus = LogBroadcaster::new(64).without_mirror();
    let sink: Arc<dyn LogSink> = Arc::new(bus.clone());
    let store = CodeStore::open(dir.path().join("reconciler.rhai"), sink).unwrap();
    (InProcApi::new(Arc::new(store), bus.clone(), Arc::new(RhaiLoader::new())), bus)
}

#[tokio::test]
async fn edits_round_trip_and_are_announced() {
    let dir = tempfile::tempdir().unwrap();
    let (api, _bus) = gateway(&dir);
    let mut sub = api.subscribe_logs();

    let src = "fn reconcile(o) { info(\"v2\"); }\n";
    api.update_source(src).await.unwrap();
    assert_eq!(api.get_current_source().await, src);
    assert_eq!(std::fs::read_to_string(dir.path().join("reconciler.rhai")).unwrap(), src);

    let rec = sub.recv().await.unwrap();
    assert_eq!(rec.level, LogLevel::Info);
    assert_eq!(rec.message, "Code updated successfully");
}

#[tokio::test]
async fn empty_code_is_rejected_and_nothing_changes() {
    let dir = tempfile::tempdir().unwrap();
    let (api, _bus) = gateway(&dir);
    let before = api.get_current_source().await;
    assert!(matches!(api.update_source("").await, Err(ChakraError::Validation(_))));
    assert_eq!(api.get_current_source().await, before);
}

#[tokio::test]
async fn broken_code_is_saved_but_fails_check() {
    let dir = tempfile::tempdir().unwrap();
    let (api, _bus) = gateway(&dir);
    let broken = "fn reconcile(o) { let = ; }";
    api.update_source(broken).await.unwrap();
    assert_eq!(api.get_current_source().await, broken);
    assert!(matches!(api.check_source(broken).await, Err(ChakraError::Validation(_))));
    assert!(api.check_source("fn reconcile(o) { }").await.is_ok());
}

#[tokio::test]
async fn health_counts_live_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let (api, _bus) = gateway(&dir);
    assert_eq!(api.health().subscribers, 0);
    let a = api.subscribe_logs();
    let _b = api.subscribe_logs();
    assert_eq!(api.health().subscribers, 2);
    drop(a);
    assert_eq!(api.health().subscribers, 1);
    assert!(api.health().code_path.unwrap().ends_with("reconciler.rhai"));
}

#[tokio::test]
async fn mock_can_refuse_writes() {
    let api = MockApi::failing();
    let before = api.get_current_source().await;
    assert!(matches!(api.update_source("x").await, Err(ChakraError::Io(_))));
    assert_eq!(api.get_current_source().await, before);
}
