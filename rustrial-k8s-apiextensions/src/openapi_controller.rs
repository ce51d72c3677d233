use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use kube::core::GroupVersionKind;
use rustrial_k8s_apiextensions_apis::{CustomResourceDefinition, ESTABLISHED};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crate::{
    capabilities::Capabilities,
    errors::ControllerError,
    informer::{CrdLister, ResourceEventHandler},
    openapi_builder::{build_swagger, etag},
    workqueue::{WorkQueue, run_workers},
};

const OPENAPI_CONTROLLER: &'static str = "openapi_controller";

/// Receives the OpenAPI documents of the served custom resources.
#[cfg_attr(test, automock)]
pub(crate) trait AggregationManager: Send + Sync {
    fn add_update(&self, key: &str, spec: Value, etag: String);

    fn remove(&self, key: &str);
}

/// `example.com/v1, Kind=Widget`
fn gvk_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
}

#[derive(Default)]
struct Published {
    specs: BTreeMap<String, (Value, String)>,
    merged: Option<Arc<Value>>,
}

/// Keeps the published documents in memory and merges them on demand.
#[derive(Default)]
pub(crate) struct OpenApiAggregator {
    published: Mutex<Published>,
}

impl OpenApiAggregator {
    fn lock(&self) -> MutexGuard<'_, Published> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All published documents merged into one.
    pub fn merged(&self) -> Arc<Value> {
        let mut published = self.lock();
        if let Some(merged) = &published.merged {
            return merged.clone();
        }
        let mut paths = serde_json::Map::new();
        let mut definitions = serde_json::Map::new();
        for (spec, _) in published.specs.values() {
            if let Some(p) = spec["paths"].as_object() {
                paths.extend(p.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            if let Some(d) = spec["definitions"].as_object() {
                definitions.extend(d.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        let merged = Arc::new(json!({
            "swagger": "2.0",
            "info": { "title": "Kubernetes", "version": "v0.1.0" },
            "paths": paths,
            "definitions": definitions,
        }));
        published.merged = Some(merged.clone());
        merged
    }
}

impl AggregationManager for OpenApiAggregator {
    fn add_update(&self, key: &str, spec: Value, etag: String) {
        let mut published = self.lock();
        if published.specs.get(key).map_or(false, |(_, e)| *e == etag) {
            trace!("OpenAPI spec of {} unchanged", key);
            return;
        }
        info!("Publishing OpenAPI spec of {}", key);
        published.specs.insert(key.to_string(), (spec, etag));
        published.merged = None;
    }

    fn remove(&self, key: &str) {
        let mut published = self.lock();
        if published.specs.remove(key).is_some() {
            info!("Retracted OpenAPI spec of {}", key);
            published.merged = None;
        }
    }
}

/// Publishes the OpenAPI documents of established definitions, keyed by
/// group, version and kind.
pub(crate) struct OpenApiController {
    lister: CrdLister,
    manager: Option<Arc<dyn AggregationManager>>,
    capabilities: Capabilities,
    queue: Arc<WorkQueue<GroupVersionKind>>,
}

impl OpenApiController {
    pub fn new(
        lister: CrdLister,
        manager: Option<Arc<dyn AggregationManager>>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            lister,
            manager,
            capabilities,
            queue: WorkQueue::new(OPENAPI_CONTROLLER),
        }
    }

    fn enabled(&self) -> bool {
        self.capabilities.custom_resource_validation
            && self.capabilities.openapi_aggregation
            && self.manager.is_some()
    }

    fn enqueue(&self, crd: &CustomResourceDefinition) {
        if !self.enabled() {
            return;
        }
        for version in &crd.spec.versions {
            self.queue.add(GroupVersionKind::gvk(
                &crd.spec.group,
                &version.name,
                &crd.spec.names.kind,
            ));
        }
    }

    pub(crate) async fn sync(&self, gvk: GroupVersionKind) -> Result<(), ControllerError> {
        let Some(manager) = self.manager.as_ref() else {
            return Ok(());
        };
        let key = gvk_key(&gvk);
        for crd in self.lister.list() {
            if crd.spec.group != gvk.group
                || crd.spec.names.kind != gvk.kind
                || !crd.is_condition_true(ESTABLISHED)
                || !crd.has_served_version(&gvk.version)
            {
                continue;
            }
            let spec = build_swagger(&crd, &gvk.version)?;
            let etag = etag(&spec);
            manager.add_update(&key, spec, etag);
            return Ok(());
        }
        manager.remove(&key);
        Ok(())
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.enabled() {
            info!("{} disabled", OPENAPI_CONTROLLER);
            return;
        }
        if !self.lister.wait_for_sync().await {
            error!("{} could not sync its cache", OPENAPI_CONTROLLER);
            return;
        }
        let queue = self.queue.clone();
        run_workers(OPENAPI_CONTROLLER, queue, 1, cancel, move |gvk: GroupVersionKind| {
            let me = self.clone();
            async move { me.sync(gvk).await }
        })
        .await
    }
}

impl ResourceEventHandler<CustomResourceDefinition> for OpenApiController {
    fn on_add(&self, crd: &CustomResourceDefinition) {
        self.enqueue(crd);
    }

    fn on_update(&self, old: &CustomResourceDefinition, new: &CustomResourceDefinition) {
        // Versions or kind of the old revision might not be served anymore.
        self.enqueue(old);
        self.enqueue(new);
    }

    fn on_delete(&self, crd: &CustomResourceDefinition) {
        self.enqueue(crd);
    }
}
