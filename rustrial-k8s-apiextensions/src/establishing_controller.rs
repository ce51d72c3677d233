use std::{sync::Arc, time::Duration};

use rustrial_k8s_apiextensions_apis::{Condition, ESTABLISHED, NAMES_ACCEPTED};
use tokio_util::sync::CancellationToken;

use crate::{
    crd_modifications::CrdModifications,
    crd_registry::CrdClient,
    errors::{ControllerError, ExtApiError},
    informer::CrdLister,
    workqueue::{WorkQueue, run_workers},
};

const ESTABLISHING_CONTROLLER: &'static str = "establishing_controller";

/// Promotes definitions whose names got accepted to `Established`.
pub(crate) struct EstablishingController {
    lister: CrdLister,
    client: Arc<dyn CrdClient>,
    queue: Arc<WorkQueue<String>>,
}

impl EstablishingController {
    pub fn new(lister: CrdLister, client: Arc<dyn CrdClient>) -> Self {
        Self {
            lister,
            client,
            queue: WorkQueue::new(ESTABLISHING_CONTROLLER),
        }
    }

    /// Schedules a check of the definition once `delay` elapsed.
    pub fn queue_crd(&self, name: &str, delay: Duration) {
        self.queue.add_after(name.to_string(), delay);
    }

    pub(crate) async fn sync(&self, key: String) -> Result<(), ControllerError> {
        let Some(cached) = self.lister.get(&key) else {
            debug!("{} is gone, nothing to establish", key);
            return Ok(());
        };
        if !cached.is_condition_true(NAMES_ACCEPTED) || cached.is_condition_true(ESTABLISHED) {
            return Ok(());
        }
        let mut crd = CrdModifications::new(cached.as_ref().clone());
        crd.set_condition(Condition::new(
            ESTABLISHED,
            Some(true),
            "InitialNamesAccepted",
            "the initial names have been accepted",
        ));
        match crd.update_status(self.client.as_ref()).await {
            Ok(_) => {
                info!("{} is established", key);
                Ok(())
            }
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!("{} changed while establishing, skipping: {}", key, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Processes queued definitions with a single worker until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.lister.wait_for_sync().await {
            error!("{} could not sync its cache", ESTABLISHING_CONTROLLER);
            return;
        }
        let queue = self.queue.clone();
        run_workers(ESTABLISHING_CONTROLLER, queue, 1, cancel, move |key: String| {
            let me = self.clone();
            async move { me.sync(key).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crd_registry::{MockCrdClient, tests::crd},
        errors::RegistryError,
        informer::tests::lister,
    };
    use rustrial_k8s_apiextensions_apis::CustomResourceDefinition;

    fn accepted() -> CustomResourceDefinition {
        let mut c = crd("example.com", "widgets", "Widget");
        c.set_condition(Condition::new(NAMES_ACCEPTED, Some(true), "NoConflicts", "no conflicts found"));
        c.set_condition(Condition::new(ESTABLISHED, Some(false), "Installing", "the initial names have been accepted"));
        c
    }

    #[tokio::test]
    async fn establishes_accepted_definition() {
        let (lister, _writer) = lister(vec![accepted()]);
        let mut client = MockCrdClient::new();
        client
            .expect_update_status()
            .withf(|c| {
                let established = c.find_condition(ESTABLISHED).unwrap();
                established.is_true() && established.reason == "InitialNamesAccepted"
            })
            .times(1)
            .returning(|c| Ok(c.clone()));
        let controller = EstablishingController::new(lister, Arc::new(client));
        controller.sync("widgets.example.com".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn established_or_unaccepted_definitions_are_skipped() {
        let mut established = accepted();
        established.set_condition(Condition::new(ESTABLISHED, Some(true), "InitialNamesAccepted", ""));
        let mut unaccepted = crd("example.com", "gadgets", "Gadget");
        unaccepted.set_condition(Condition::new(NAMES_ACCEPTED, Some(false), "KindConflict", ""));
        let (lister, _writer) = lister(vec![established, unaccepted]);
        // no expectations: any write fails the test
        let controller = EstablishingController::new(lister, Arc::new(MockCrdClient::new()));
        controller.sync("widgets.example.com".to_string()).await.unwrap();
        controller.sync("gadgets.example.com".to_string()).await.unwrap();
        controller.sync("missing.example.com".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn stale_writes_are_dropped_and_other_errors_retried() {
        let (lister, _writer) = lister(vec![accepted()]);
        let mut client = MockCrdClient::new();
        let mut calls = 0;
        client.expect_update_status().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(RegistryError::Conflict {
                    kind: "customresourcedefinitions.apiextensions.k8s.io".to_string(),
                    name: "widgets.example.com".to_string(),
                    message: "the object has been modified".to_string(),
                })
            } else {
                Err(RegistryError::Internal("etcd unavailable".to_string()))
            }
        });
        let controller = EstablishingController::new(lister, Arc::new(client));
        controller.sync("widgets.example.com".to_string()).await.unwrap();
        assert!(controller.sync("widgets.example.com".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn queued_definitions_are_processed() {
        let (lister, _writer) = lister(vec![accepted()]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut client = MockCrdClient::new();
        client.expect_update_status().returning(move |c| {
            let _ = tx.send(c.metadata.name.clone());
            Ok(c.clone())
        });
        let controller = Arc::new(EstablishingController::new(lister, Arc::new(client)));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.clone().run(cancel.clone()));
        controller.queue_crd("widgets.example.com", Duration::from_millis(10));
        let name = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(Some(Some("widgets.example.com".to_string())), name);
        cancel.cancel();
        handle.await.unwrap();
    }
}
