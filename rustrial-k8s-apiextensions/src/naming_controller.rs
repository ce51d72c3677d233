//! Resolves the names of definitions against the other definitions of their group.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use kube::ResourceExt;
use rustrial_k8s_apiextensions_apis::{
    CONDITION_FALSE, CONDITION_TRUE, CONDITION_UNKNOWN, Condition, CustomResourceDefinition,
    CustomResourceDefinitionNames, ESTABLISHED, NAMES_ACCEPTED,
};
use tokio_util::sync::CancellationToken;

use crate::{
    crd_modifications::CrdModifications,
    crd_registry::CrdClient,
    errors::{ControllerError, ExtApiError},
    informer::{CrdLister, ResourceEventHandler},
    workqueue::{WorkQueue, run_workers},
};

const NAMING_CONTROLLER: &'static str = "naming_controller";

fn equal_to_accepted_or_fresh(
    requested: &str,
    accepted: &str,
    used: &HashSet<String>,
) -> Result<(), String> {
    if requested == accepted || !used.contains(requested) {
        Ok(())
    } else {
        Err(format!("{:?} is already in use", requested))
    }
}

pub(crate) struct NamingController {
    lister: CrdLister,
    client: Arc<dyn CrdClient>,
    queue: Arc<WorkQueue<String>>,
    /// Definitions as written by this controller, newer than the cache until
    /// the informer catches up.
    mutations: Mutex<HashMap<String, CustomResourceDefinition>>,
}

impl NamingController {
    pub fn new(lister: CrdLister, client: Arc<dyn CrdClient>) -> Self {
        Self {
            lister,
            client,
            queue: WorkQueue::new(NAMING_CONTROLLER),
            mutations: Default::default(),
        }
    }

    /// The newer of the cached definition and the last written one.
    fn latest(&self, cached: &CustomResourceDefinition) -> CustomResourceDefinition {
        let name = cached.name_any();
        let mut mutations = self.mutations.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mutated) = mutations.get(&name) {
            let rv = |c: &CustomResourceDefinition| {
                c.metadata
                    .resource_version
                    .as_deref()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0)
            };
            if mutated.metadata.uid == cached.metadata.uid && rv(mutated) > rv(cached) {
                return mutated.clone();
            }
            mutations.remove(&name);
        }
        cached.clone()
    }

    /// Names already claimed within `group`, as resources and as kinds.
    fn accepted_names_for_group(&self, group: &str) -> (HashSet<String>, HashSet<String>) {
        let mut resources = HashSet::new();
        let mut kinds = HashSet::new();
        for cached in self.lister.list() {
            if cached.spec.group != group {
                continue;
            }
            let names = self.latest(&cached).accepted_names();
            resources.insert(names.plural);
            resources.insert(names.singular);
            resources.extend(names.short_names);
            kinds.insert(names.kind);
            kinds.insert(names.list_kind);
        }
        (resources, kinds)
    }

    /// The names to accept and the resulting `NamesAccepted` and `Established` conditions.
    pub(crate) fn calculate_names_and_conditions(
        &self,
        crd: &CustomResourceDefinition,
    ) -> (CustomResourceDefinitionNames, Condition, Condition) {
        let (resources, kinds) = self.accepted_names_for_group(&crd.spec.group);
        let mut names_accepted = Condition::new(NAMES_ACCEPTED, None, "", "");
        let mut conflict = |reason: &str, message: String| {
            names_accepted.status = CONDITION_FALSE.to_string();
            names_accepted.reason = reason.to_string();
            names_accepted.message = message;
        };
        let requested = &crd.spec.names;
        let accepted = crd.accepted_names();
        let mut names = accepted.clone();

        match equal_to_accepted_or_fresh(&requested.plural, &accepted.plural, &resources) {
            Ok(()) => names.plural = requested.plural.clone(),
            Err(e) => conflict("PluralConflict", e),
        }
        match equal_to_accepted_or_fresh(&requested.singular, &accepted.singular, &resources) {
            Ok(()) => names.singular = requested.singular.clone(),
            Err(e) => conflict("SingularConflict", e),
        }
        if requested.short_names != accepted.short_names {
            let errors: Vec<String> = requested
                .short_names
                .iter()
                .filter(|s| !accepted.short_names.contains(s))
                .filter_map(|s| equal_to_accepted_or_fresh(s, "", &resources).err())
                .collect();
            match errors.len() {
                0 => names.short_names = requested.short_names.clone(),
                1 => conflict("ShortNamesConflict", errors[0].clone()),
                _ => conflict("ShortNamesConflict", format!("[{}]", errors.join(", "))),
            }
        }
        match equal_to_accepted_or_fresh(&requested.kind, &accepted.kind, &kinds) {
            Ok(()) => names.kind = requested.kind.clone(),
            Err(e) => conflict("KindConflict", e),
        }
        match equal_to_accepted_or_fresh(&requested.list_kind, &accepted.list_kind, &kinds) {
            Ok(()) => names.list_kind = requested.list_kind.clone(),
            Err(e) => conflict("ListKindConflict", e),
        }
        names.categories = requested.categories.clone();

        if names_accepted.status == CONDITION_UNKNOWN {
            names_accepted = Condition::new(NAMES_ACCEPTED, Some(true), "NoConflicts", "no conflicts found");
        }

        // Established only ever becomes true through the establishing controller.
        let mut established = crd.find_condition(ESTABLISHED).cloned().unwrap_or_else(|| {
            Condition::new(ESTABLISHED, Some(false), "NotAccepted", "not all names are accepted")
        });
        if established.status != CONDITION_TRUE && names_accepted.status == CONDITION_TRUE {
            established = Condition::new(
                ESTABLISHED,
                Some(false),
                "Installing",
                "the initial names have been accepted",
            );
        }
        (names, names_accepted, established)
    }

    fn requeue_all_other_group_crds(&self, name: &str) {
        let Some((_, group)) = name.split_once('.') else {
            return;
        };
        for crd in self.lister.list() {
            let other = crd.name_any();
            if crd.spec.group == group && other != name {
                self.queue.add(other);
            }
        }
    }

    pub(crate) async fn sync(&self, key: String) -> Result<(), ControllerError> {
        let Some(cached) = self.lister.get(&key) else {
            // The names of the deleted definition are free again.
            self.requeue_all_other_group_crds(&key);
            return Ok(());
        };
        let current = self.latest(&cached);
        if current.spec.names == current.accepted_names() {
            return Ok(());
        }
        let (names, names_accepted, established) = self.calculate_names_and_conditions(&current);
        if current.accepted_names() == names
            && current
                .find_condition(NAMES_ACCEPTED)
                .map_or(false, |c| c.is_equivalent(&names_accepted))
        {
            return Ok(());
        }

        let mut crd = CrdModifications::new(current);
        crd.status.get_or_insert_with(Default::default).accepted_names = names;
        crd.set_condition(names_accepted);
        crd.set_condition(established);
        match crd.update_status(self.client.as_ref()).await {
            Ok(_) => {
                info!(
                    "{} names accepted: {}",
                    key,
                    crd.is_condition_true(NAMES_ACCEPTED)
                );
            }
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!("{} changed while resolving names, skipping: {}", key, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.mutations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), crd.into_inner());
        // Names might have been released.
        self.requeue_all_other_group_crds(&key);
        Ok(())
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.lister.wait_for_sync().await {
            error!("{} could not sync its cache", NAMING_CONTROLLER);
            return;
        }
        let queue = self.queue.clone();
        run_workers(NAMING_CONTROLLER, queue, 1, cancel, move |key: String| {
            let me = self.clone();
            async move { me.sync(key).await }
        })
        .await
    }
}

impl ResourceEventHandler<CustomResourceDefinition> for NamingController {
    fn on_add(&self, crd: &CustomResourceDefinition) {
        self.queue.add(crd.name_any());
    }

    fn on_update(&self, _old: &CustomResourceDefinition, new: &CustomResourceDefinition) {
        self.queue.add(new.name_any());
    }

    fn on_delete(&self, crd: &CustomResourceDefinition) {
        self.queue.add(crd.name_any());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crd_registry::{MockCrdClient, tests::crd},
        informer::tests::lister,
    };
    use kube_runtime::reflector::store::Writer;

    /// A definition as stored, names defaulted.
    fn requested(group: &str, plural: &str, kind: &str) -> CustomResourceDefinition {
        let mut c = crd(group, plural, kind);
        c.spec.names.singular = c.spec.names.singular();
        c.spec.names.list_kind = c.spec.names.list_kind();
        c.metadata.uid = Some(format!("uid-{}", plural));
        c.metadata.resource_version = Some("1".to_string());
        c
    }

    fn accepted(mut c: CustomResourceDefinition) -> CustomResourceDefinition {
        let names = c.spec.names.clone();
        c.status.get_or_insert_with(Default::default).accepted_names = names;
        c.set_condition(Condition::new(NAMES_ACCEPTED, Some(true), "NoConflicts", "no conflicts found"));
        c.set_condition(Condition::new(ESTABLISHED, Some(true), "InitialNamesAccepted", ""));
        c
    }

    fn controller(
        crds: Vec<CustomResourceDefinition>,
        client: MockCrdClient,
    ) -> (NamingController, Writer<CustomResourceDefinition>) {
        let (lister, writer) = lister(crds);
        (NamingController::new(lister, Arc::new(client)), writer)
    }

    #[test]
    fn fresh_names_are_accepted() {
        let c = requested("example.com", "widgets", "Widget");
        let (controller, _w) = controller(vec![c.clone()], MockCrdClient::new());
        let (names, names_accepted, established) = controller.calculate_names_and_conditions(&c);
        assert_eq!(c.spec.names, names);
        assert_eq!(CONDITION_TRUE, names_accepted.status);
        assert_eq!("NoConflicts", names_accepted.reason);
        assert_eq!(CONDITION_FALSE, established.status);
        assert_eq!("Installing", established.reason);
    }

    #[test]
    fn conflicting_names_are_not_accepted() {
        let mut existing = requested("example.com", "widgets", "Widget");
        existing.spec.names.short_names = vec!["wd".to_string()];
        let existing = accepted(existing);
        // claims the kind and a short name of `widgets`
        let mut c = requested("example.com", "gadgets", "Widget");
        c.spec.names.short_names = vec!["wd".to_string(), "gd".to_string()];
        c.spec.names.singular = "gadget".to_string();
        c.spec.names.list_kind = "GadgetList".to_string();
        let (controller, _w) = controller(vec![existing, c.clone()], MockCrdClient::new());
        let (names, names_accepted, established) = controller.calculate_names_and_conditions(&c);
        assert_eq!("gadgets", names.plural);
        assert_eq!("gadget", names.singular);
        assert!(names.short_names.is_empty());
        assert_eq!("", names.kind);
        assert_eq!("GadgetList", names.list_kind);
        assert_eq!(CONDITION_FALSE, names_accepted.status);
        // last conflict wins
        assert_eq!("KindConflict", names_accepted.reason);
        assert_eq!("\"Widget\" is already in use", names_accepted.message);
        assert_eq!("NotAccepted", established.reason);
    }

    #[test]
    fn other_groups_do_not_conflict() {
        let existing = accepted(requested("example.org", "widgets", "Widget"));
        let c = requested("example.com", "widgets", "Widget");
        let (controller, _w) = controller(vec![existing, c.clone()], MockCrdClient::new());
        let (_, names_accepted, _) = controller.calculate_names_and_conditions(&c);
        assert!(names_accepted.is_true());
    }

    #[tokio::test]
    async fn sync_writes_accepted_names_once() {
        let c = requested("example.com", "widgets", "Widget");
        let mut client = MockCrdClient::new();
        client
            .expect_update_status()
            .withf(|c| {
                c.accepted_names() == c.spec.names && c.is_condition_true(NAMES_ACCEPTED)
            })
            .times(1)
            .returning(|c| {
                let mut c = c.clone();
                c.metadata.resource_version = Some("2".to_string());
                Ok(c)
            });
        let (controller, _w) = controller(vec![c], client);
        controller.sync("widgets.example.com".to_string()).await.unwrap();
        // the mutation cache is ahead of the stale lister
        controller.sync("widgets.example.com".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn accepted_definitions_are_skipped() {
        let c = accepted(requested("example.com", "widgets", "Widget"));
        let (controller, _w) = controller(vec![c], MockCrdClient::new());
        controller.sync("widgets.example.com".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn deletion_requeues_group() {
        let a = requested("example.com", "widgets", "Widget");
        let b = requested("example.com", "gadgets", "Gadget");
        let c = requested("example.org", "things", "Thing");
        let (controller, _w) = controller(vec![a, b, c], MockCrdClient::new());
        controller.sync("gizmos.example.com".to_string()).await.unwrap();
        assert_eq!(2, controller.queue.len());
    }
}
