//! Chakrator kubehub: watcher wiring and status writes for the watched kind.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use chakrator_core::{EventKind, ResourceEvent, ResourceObject, StatusWriter};
use futures::{Stream, StreamExt};
use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Convert a watched object into the runtime's representation.
pub fn to_resource_object(obj: &DynamicObject) -> Result<ResourceObject> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    ResourceObject::from_value(raw).context("decoding watched object")
}

/// The watcher only reports "applied"; remember what we've seen so the first
/// sighting becomes `Added` and later ones `Modified`. The last known copy is
/// kept so a relist can report objects that vanished during a watch gap.
#[derive(Default)]
pub struct EventClassifier {
    seen: FxHashMap<String, ResourceObject>,
}

impl EventClassifier {
    pub fn new() -> Self { Self::default() }

    fn key(obj: &ResourceObject) -> String {
        match obj.metadata.uid.as_deref() {
            Some(uid) => uid.to_string(),
            None => obj.display_name(),
        }
    }

    pub fn applied(&mut self, obj: ResourceObject) -> ResourceEvent {
        let kind = match self.seen.insert(Self::key(&obj), obj.clone()) {
            None => EventKind::Added,
            Some(_) => EventKind::Modified,
        };
        ResourceEvent::new(kind, obj)
    }

    pub fn deleted(&mut self, obj: ResourceObject) -> ResourceEvent {
        self.seen.remove(&Self::key(&obj));
        ResourceEvent::deleted(obj)
    }

    /// Replay a full relist: every listed object is applied, then everything
    /// remembered but no longer listed is reported deleted.
    pub fn restarted(&mut self, list: Vec<ResourceObject>) -> Vec<ResourceEvent> {
        let listed: FxHashSet<String> = list.iter().map(Self::key).collect();
        let mut gone: Vec<ResourceObject> = Vec::new();
        self.seen.retain(|key, last| {
            if listed.contains(key) {
                true
            } else {
                gone.push(last.clone());
                false
            }
        });
        gone.sort_by_key(|o| o.display_name());
        let mut out: Vec<ResourceEvent> = list.into_iter().map(|o| self.applied(o)).collect();
        out.extend(gone.into_iter().map(ResourceEvent::deleted));
        out
    }

    pub fn len(&self) -> usize { self.seen.len() }
    pub fn is_empty(&self) -> bool { self.seen.is_empty() }
}

fn decode(o: &DynamicObject) -> Option<ResourceObject> {
    match to_resource_object(o) {
        Ok(obj) => Some(obj),
        Err(e) => {
            warn!(error = ?e, "skipping undecodable object");
            None
        }
    }
}

/// Drain watcher events into `event_tx`, classifying as we go. Stream errors
/// are logged and skipped (the backoff layer retries underneath); objects that
/// fail to decode are skipped. Returns when the stream ends or the receiver
/// is gone.
pub async fn pump_events<S, E>(stream: S, event_tx: mpsc::Sender<ResourceEvent>) -> Result<()>
where
    S: Stream<Item = std::result::Result<Event<DynamicObject>, E>>,
    E: std::fmt::Display,
{
    futures::pin_mut!(stream);
    let mut classifier = EventClassifier::new();
    while let Some(item) = stream.next().await {
        let batch: Vec<ResourceEvent> = match item {
            Ok(Event::Applied(o)) => decode(&o).map(|obj| classifier.applied(obj)).into_iter().collect(),
            Ok(Event::Deleted(o)) => decode(&o).map(|obj| classifier.deleted(obj)).into_iter().collect(),
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch restart");
                classifier.restarted(list.iter().filter_map(decode).collect())
            }
            Err(e) => {
                counter!("kubehub_watch_errors_total", 1u64);
                warn!(error = %e, "watch error; retrying");
                Vec::new()
            }
        };
        for event in batch {
            counter!("kubehub_events_total", 1u64, "kind" => event.kind.as_str());
            if event_tx.send(event).await.is_err() {
                warn!("event receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!("watcher stream ended");
    Ok(())
}

async fn resolve_api(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api: Api<DynamicObject> = if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        }
    } else {
        Api::all_with(client, &ar)
    };
    Ok(api)
}

/// List+watch the given kind and push events into `event_tx` in arrival
/// order. Only failing to set up the watch is an error.
pub async fn start_watcher(gvk_key: &str, namespace: Option<&str>, event_tx: mpsc::Sender<ResourceEvent>) -> Result<()> {
    let client = Client::try_default().await?;
    let api = resolve_api(client, gvk_key, namespace).await?;

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    info!(gvk = %gvk_key, ns = ?namespace, "watcher started");
    pump_events(stream, event_tx).await
}

/// Writes requested status through the status subresource (merge patch).
pub struct KubeStatusWriter {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeStatusWriter {
    pub async fn connect(gvk_key: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        Ok(Self { client, ar, namespaced })
    }

    fn api_for(&self, object: &ResourceObject) -> Api<DynamicObject> {
        if self.namespaced {
            Api::namespaced_with(self.client.clone(), object.namespace(), &self.ar)
        } else {
            Api::all_with(self.client.clone(), &self.ar)
        }
    }
}

#[async_trait::async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write_status(&self, object: &ResourceObject, status: &serde_json::Value) -> Result<()> {
        let api = self.api_for(object);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(object.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patching status of {}", object.display_name()))?;
        debug!(object = %object.display_name(), "status patched");
        Ok(())
    }
}
