use std::{collections::HashSet, sync::Arc, time::Duration};

use kube::ResourceExt;
use rustrial_k8s_apiextensions_apis::{
    API_GROUP, CUSTOM_RESOURCE_CLEANUP_FINALIZER, Condition, CustomResourceDefinition,
    ESTABLISHED, TERMINATING,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    crd_handler::CustomResourceInstances,
    crd_modifications::CrdModifications,
    crd_registry::CrdClient,
    errors::{ControllerError, ExtApiError, RegistryError},
    informer::{CrdLister, ResourceEventHandler},
    workqueue::{WorkQueue, run_workers},
};

const FINALIZER_CONTROLLER: &'static str = "finalizer_controller";

/// Group resources whose storage is shared with built-in types, their
/// instances must never be removed through a custom resource definition.
const OVERLAPPING_BUILT_IN_RESOURCES: [(&'static str, &'static str); 2] = [
    ("apiregistration.k8s.io", "apiservices"),
    (API_GROUP, "customresourcedefinitions"),
];

fn overlaps_built_in(crd: &CustomResourceDefinition) -> bool {
    OVERLAPPING_BUILT_IN_RESOURCES
        .iter()
        .any(|(g, r)| crd.spec.group == *g && crd.spec.names.plural == *r)
}

fn join_errors(errors: &[RegistryError]) -> String {
    match errors {
        [e] => e.to_string(),
        _ => format!(
            "[{}]",
            errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Removes all custom resources of a deleted definition before releasing its
/// cleanup finalizer.
pub(crate) struct CrdFinalizer {
    lister: CrdLister,
    client: Arc<dyn CrdClient>,
    instances: Arc<dyn CustomResourceInstances>,
    queue: Arc<WorkQueue<String>>,
    workers: usize,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl CrdFinalizer {
    pub fn new(
        lister: CrdLister,
        client: Arc<dyn CrdClient>,
        instances: Arc<dyn CustomResourceInstances>,
        workers: usize,
    ) -> Self {
        Self {
            lister,
            client,
            instances,
            queue: WorkQueue::new(FINALIZER_CONTROLLER),
            workers: workers.max(1),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_poll(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    fn enqueue(&self, crd: &CustomResourceDefinition) {
        if crd.is_deleted() && crd.has_finalizer(CUSTOM_RESOURCE_CLEANUP_FINALIZER) {
            self.queue.add(crd.name_any());
        }
    }

    /// Deletes all instances and waits until none are left. Returns the
    /// resulting `Terminating` condition, and the error to retry on.
    async fn delete_instances(
        &self,
        crd: &CustomResourceDefinition,
    ) -> (Condition, Option<ControllerError>) {
        let Some(version) = crd.preferred_version() else {
            return (
                Condition::new(TERMINATING, Some(false), "InstanceDeletionCompleted", "no served version left"),
                None,
            );
        };
        let items = match self.instances.list(crd, version).await {
            Ok(items) => items,
            Err(e) => {
                let message = format!("could not list instances: {}", e);
                return (
                    Condition::new(TERMINATING, Some(true), "InstanceDeletionFailed", message),
                    Some(e.into()),
                );
            }
        };
        let mut deleted_namespaces = HashSet::new();
        let mut delete_errors = Vec::new();
        for item in &items {
            let namespace = item.metadata.namespace.clone().unwrap_or_default();
            if !deleted_namespaces.insert(namespace.clone()) {
                continue;
            }
            if let Err(e) = self.instances.delete_collection(crd, version, &namespace).await {
                warn!(
                    "Failed to delete {} instances in namespace {:?}: {}",
                    crd.name_any(),
                    namespace,
                    e
                );
                delete_errors.push(e);
            }
        }

        // Poll even after failed deletes, some namespaces might still drain.
        let deadline = Instant::now() + self.poll_timeout;
        let poll_error = loop {
            match self.instances.list(crd, version).await {
                Ok(items) if items.is_empty() => break None,
                Ok(items) => {
                    debug!("{} waiting for {} items to be removed", crd.name_any(), items.len())
                }
                Err(e) => break Some(e.to_string()),
            }
            if Instant::now() + self.poll_interval > deadline {
                break Some("timed out waiting for the condition".to_string());
            }
            tokio::time::sleep(self.poll_interval).await;
        };
        match (poll_error, delete_errors.is_empty()) {
            (None, _) => (
                Condition::new(TERMINATING, Some(false), "InstanceDeletionCompleted", "removed all instances"),
                None,
            ),
            (Some(poll_error), true) => {
                let message = format!("could not confirm zero CustomResources remaining: {}", poll_error);
                (
                    Condition::new(TERMINATING, Some(true), "InstanceDeletionCheck", message.clone()),
                    Some(ControllerError::InstanceDeletion(message)),
                )
            }
            (Some(poll_error), false) => {
                let message = format!(
                    "could not issue all deletes: {}, could not confirm zero CustomResources remaining: {}",
                    join_errors(&delete_errors),
                    poll_error
                );
                (
                    Condition::new(TERMINATING, Some(true), "InstanceDeletionFailed", message.clone()),
                    Some(ControllerError::InstanceDeletion(message)),
                )
            }
        }
    }

    pub(crate) async fn sync(&self, key: String) -> Result<(), ControllerError> {
        let Some(cached) = self.lister.get(&key) else {
            return Ok(());
        };
        if !cached.is_deleted() || !cached.has_finalizer(CUSTOM_RESOURCE_CLEANUP_FINALIZER) {
            return Ok(());
        }
        let mut crd = CrdModifications::new(cached.as_ref().clone());

        if overlaps_built_in(&crd) {
            crd.set_condition(Condition::new(
                TERMINATING,
                Some(false),
                "OverlappingBuiltInResource",
                "instances overlap with built-in resources in storage",
            ));
        } else if crd.is_condition_true(ESTABLISHED) {
            crd.set_condition(Condition::new(
                TERMINATING,
                Some(true),
                "InstanceDeletionInProgress",
                "CustomResource deletion is in progress",
            ));
            // Observers must see the progress before any instance is touched.
            match crd.update_status(self.client.as_ref()).await {
                Ok(_) => info!("Deleting instances of {}", key),
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    debug!("{} changed while finalizing, skipping: {}", key, e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            let (condition, error) = self.delete_instances(&crd).await;
            crd.set_condition(condition);
            if let Some(error) = error {
                if let Err(e) = crd.update_status(self.client.as_ref()).await {
                    warn!("Failed to record instance deletion failure of {}: {}", key, e);
                }
                return Err(error);
            }
        } else {
            crd.set_condition(Condition::new(
                TERMINATING,
                Some(false),
                "NeverEstablished",
                "resource was never established",
            ));
        }

        crd.remove_finalizer(CUSTOM_RESOURCE_CLEANUP_FINALIZER);
        match crd.update_status(self.client.as_ref()).await {
            Ok(_) => {
                info!("Removed finalizer of {}", key);
                Ok(())
            }
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!("{} changed while finalizing, skipping: {}", key, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.lister.wait_for_sync().await {
            error!("{} could not sync its cache", FINALIZER_CONTROLLER);
            return;
        }
        let queue = self.queue.clone();
        let workers = self.workers;
        run_workers(FINALIZER_CONTROLLER, queue, workers, cancel, move |key: String| {
            let me = self.clone();
            async move { me.sync(key).await }
        })
        .await
    }
}

impl ResourceEventHandler<CustomResourceDefinition> for CrdFinalizer {
    fn on_add(&self, crd: &CustomResourceDefinition) {
        self.enqueue(crd);
    }

    fn on_update(&self, _old: &CustomResourceDefinition, new: &CustomResourceDefinition) {
        self.enqueue(new);
    }

    fn on_delete(&self, _crd: &CustomResourceDefinition) {}
}
