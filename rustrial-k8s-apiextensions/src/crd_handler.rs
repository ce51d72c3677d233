//! Dynamic REST storage of custom resources, built from the cached definitions.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIResource, APIResourceList};
use kube::{ResourceExt, core::DynamicObject};
use rustrial_k8s_apiextensions_apis::{
    CustomResourceDefinition, ESTABLISHED, NAMES_ACCEPTED, ResourceScope, TERMINATING,
};

#[cfg(test)]
use mockall::automock;

use crate::{
    capabilities::Capabilities,
    custom_resource::{CustomResourceStorage, served_names},
    errors::RegistryError,
    establishing_controller::EstablishingController,
    informer::{CrdLister, ResourceEventHandler},
    registry::{DeleteOptions, ListOptions},
    storage::Storage,
};

/// Delay before establishing a definition when several servers may still be
/// serving conflicting names.
const HA_ESTABLISHING_DELAY: Duration = Duration::from_secs(5);

/// Access to the custom resources of a definition, used while finalizing it.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait CustomResourceInstances: Send + Sync {
    async fn list(
        &self,
        crd: &CustomResourceDefinition,
        version: &str,
    ) -> Result<Vec<DynamicObject>, RegistryError>;

    /// Deletes all instances of `namespace`, an empty namespace meaning all of a
    /// cluster scoped resource.
    async fn delete_collection(
        &self,
        crd: &CustomResourceDefinition,
        version: &str,
        namespace: &str,
    ) -> Result<(), RegistryError>;
}

/// Stores of all served versions of one definition revision.
struct ServingInfo {
    uid: Option<String>,
    resource_version: Option<String>,
    storages: HashMap<String, Arc<CustomResourceStorage>>,
}

/// A custom resource resolved for a request.
pub(crate) struct ServedResource {
    pub crd: Arc<CustomResourceDefinition>,
    pub storage: Arc<CustomResourceStorage>,
    pub terminating: bool,
}

impl ServedResource {
    pub fn check_create(&self) -> Result<(), RegistryError> {
        if self.terminating {
            Err(RegistryError::MethodNotSupported(
                "create not allowed while custom resource definition is terminating".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

pub(crate) struct CrdHandler {
    storage: Arc<dyn Storage>,
    lister: CrdLister,
    capabilities: Capabilities,
    establishing: Arc<EstablishingController>,
    master_count: usize,
    cache: Mutex<HashMap<String, Arc<ServingInfo>>>,
}

impl CrdHandler {
    pub fn new(
        storage: Arc<dyn Storage>,
        lister: CrdLister,
        capabilities: Capabilities,
        establishing: Arc<EstablishingController>,
        master_count: usize,
    ) -> Self {
        Self {
            storage,
            lister,
            capabilities,
            establishing,
            master_count,
            cache: Default::default(),
        }
    }

    fn serving_info(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<Arc<ServingInfo>, RegistryError> {
        let name = crd.name_any();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(info) = cache.get(&name) {
            if info.uid == crd.metadata.uid && info.resource_version == crd.metadata.resource_version {
                return Ok(info.clone());
            }
        }
        let mut storages = HashMap::new();
        for version in crd.served_versions() {
            let storage =
                CustomResourceStorage::new(self.storage.clone(), crd, version, &self.capabilities)?;
            storages.insert(version.to_string(), Arc::new(storage));
        }
        let info = Arc::new(ServingInfo {
            uid: crd.metadata.uid.clone(),
            resource_version: crd.metadata.resource_version.clone(),
            storages,
        });
        cache.insert(name, info.clone());
        Ok(info)
    }

    fn invalidate(&self, name: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.remove(name).is_some() {
            debug!("removed serving info of {}", name);
        }
    }

    fn not_found(group: &str, plural: &str) -> RegistryError {
        RegistryError::NotFound {
            kind: if group.is_empty() {
                plural.to_string()
            } else {
                format!("{}.{}", plural, group)
            },
            name: String::new(),
        }
    }

    /// Resolves `/apis/{group}/{version}/.../{plural}` to the stores of the
    /// definition, which must serve the version and have its names accepted.
    pub fn resolve(
        &self,
        group: &str,
        version: &str,
        plural: &str,
    ) -> Result<ServedResource, RegistryError> {
        let crd = self
            .lister
            .get(&format!("{}.{}", plural, group))
            .ok_or_else(|| Self::not_found(group, plural))?;
        if !crd.has_served_version(version) {
            return Err(Self::not_found(group, plural));
        }
        if !crd.is_condition_true(NAMES_ACCEPTED) && !crd.is_condition_true(ESTABLISHED) {
            return Err(Self::not_found(group, plural));
        }
        let info = self.serving_info(&crd)?;
        let storage = info
            .storages
            .get(version)
            .cloned()
            .ok_or_else(|| Self::not_found(group, plural))?;
        let terminating = crd.is_condition_true(TERMINATING);
        Ok(ServedResource {
            crd,
            storage,
            terminating,
        })
    }

    /// Resource list of an API group version, `None` if nothing is served there.
    pub fn discovery(&self, group: &str, version: &str) -> Option<APIResourceList> {
        let mut crds: Vec<Arc<CustomResourceDefinition>> = self
            .lister
            .list()
            .into_iter()
            .filter(|c| {
                c.spec.group == group
                    && c.has_served_version(version)
                    && c.is_condition_true(ESTABLISHED)
            })
            .collect();
        if crds.is_empty() {
            return None;
        }
        crds.sort_by(|a, b| a.spec.names.plural.cmp(&b.spec.names.plural));
        let mut resources = Vec::new();
        for crd in crds {
            let names = served_names(&crd);
            let namespaced = crd.spec.scope == ResourceScope::Namespaced;
            let verbs: Vec<String> = if crd.is_condition_true(TERMINATING) {
                vec!["delete", "deletecollection", "get", "list"]
            } else {
                vec!["create", "delete", "deletecollection", "get", "list", "update"]
            }
            .into_iter()
            .map(str::to_string)
            .collect();
            resources.push(APIResource {
                name: names.plural.clone(),
                singular_name: names.singular(),
                namespaced,
                kind: names.kind.clone(),
                verbs,
                short_names: Some(names.short_names.clone()).filter(|s| !s.is_empty()),
                categories: Some(names.categories.clone()).filter(|c| !c.is_empty()),
                ..Default::default()
            });
            if self.capabilities.custom_resource_subresources {
                if crd.has_status_subresource(version) {
                    resources.push(APIResource {
                        name: format!("{}/status", names.plural),
                        namespaced,
                        kind: names.kind.clone(),
                        verbs: vec!["get".to_string(), "update".to_string()],
                        ..Default::default()
                    });
                }
                if crd.scale_subresource(version).is_some() {
                    resources.push(APIResource {
                        name: format!("{}/scale", names.plural),
                        namespaced,
                        group: Some("autoscaling".to_string()),
                        version: Some("v1".to_string()),
                        kind: "Scale".to_string(),
                        verbs: vec!["get".to_string(), "update".to_string()],
                        ..Default::default()
                    });
                }
            }
        }
        Some(APIResourceList {
            group_version: format!("{}/{}", group, version),
            resources,
        })
    }

    /// Stores used to drain a definition, schema validation does not apply to deletion.
    fn instance_storage(
        &self,
        crd: &CustomResourceDefinition,
        version: &str,
    ) -> Result<CustomResourceStorage, RegistryError> {
        let capabilities = Capabilities {
            custom_resource_validation: false,
            ..self.capabilities
        };
        CustomResourceStorage::new(self.storage.clone(), crd, version, &capabilities)
    }

    fn queue_establishing(&self, crd: &CustomResourceDefinition) {
        if crd.is_condition_true(NAMES_ACCEPTED) && !crd.is_condition_true(ESTABLISHED) {
            let delay = if self.master_count > 1 {
                HA_ESTABLISHING_DELAY
            } else {
                Duration::ZERO
            };
            self.establishing.queue_crd(&crd.name_any(), delay);
        }
    }
}

impl ResourceEventHandler<CustomResourceDefinition> for CrdHandler {
    fn on_add(&self, crd: &CustomResourceDefinition) {
        self.queue_establishing(crd);
    }

    fn on_update(&self, old: &CustomResourceDefinition, new: &CustomResourceDefinition) {
        self.queue_establishing(new);
        if old.metadata.uid != new.metadata.uid
            || old.spec != new.spec
            || old.accepted_names() != new.accepted_names()
        {
            self.invalidate(&new.name_any());
        }
    }

    fn on_delete(&self, crd: &CustomResourceDefinition) {
        self.invalidate(&crd.name_any());
    }
}

#[async_trait]
impl CustomResourceInstances for CrdHandler {
    async fn list(
        &self,
        crd: &CustomResourceDefinition,
        version: &str,
    ) -> Result<Vec<DynamicObject>, RegistryError> {
        let storage = self.instance_storage(crd, version)?;
        let (items, _) = storage.list(None, &ListOptions::default()).await?;
        Ok(items)
    }

    async fn delete_collection(
        &self,
        crd: &CustomResourceDefinition,
        version: &str,
        namespace: &str,
    ) -> Result<(), RegistryError> {
        let storage = self.instance_storage(crd, version)?;
        let namespace = Some(namespace).filter(|ns| !ns.is_empty());
        storage
            .store
            .delete_collection(namespace, &ListOptions::default(), &DeleteOptions::default())
            .await?;
        Ok(())
    }
}
