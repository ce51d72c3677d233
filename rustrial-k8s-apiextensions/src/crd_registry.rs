//! REST storage of [`CustomResourceDefinition`] objects.
use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use kube::ResourceExt;
use rustrial_k8s_apiextensions_apis::{
    API_GROUP, CUSTOM_RESOURCE_CLEANUP_FINALIZER, Condition, CustomResourceDefinition,
    CustomResourceDefinitionNames, TERMINATING,
};

#[cfg(test)]
use mockall::automock;

use crate::{
    errors::{FieldError, RegistryError},
    registry::{
        Attrs, RestStore, RestStrategy, StatusStrategy, default_attrs, next_generation,
    },
    storage::Storage,
};

pub(crate) const CRD_RESOURCE: &'static str = "customresourcedefinitions";

/// Write access to definitions used by the controllers.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait CrdClient: Send + Sync {
    async fn update(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, RegistryError>;

    /// Updates status and finalizers.
    async fn update_status(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, RegistryError>;
}

/// Lowercase RFC 1035 label: alphanumerics and `-`, starting with a letter.
pub(crate) fn is_dns1035_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.starts_with(|c: char| c.is_ascii_lowercase())
        && !s.ends_with('-')
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Lowercase RFC 1123 subdomain.
pub(crate) fn is_dns1123_subdomain(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
                && label.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

fn validate_names(names: &CustomResourceDefinitionNames, path: &str) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if names.plural.is_empty() {
        errors.push(FieldError::required(format!("{}.plural", path), ""));
    } else if !is_dns1035_label(&names.plural) {
        errors.push(FieldError::invalid(
            format!("{}.plural", path),
            format!("{:?}: must be a DNS-1035 label", names.plural),
        ));
    }
    if !names.singular.is_empty() && !is_dns1035_label(&names.singular) {
        errors.push(FieldError::invalid(
            format!("{}.singular", path),
            format!("{:?}: must be a DNS-1035 label", names.singular),
        ));
    }
    for (i, short_name) in names.short_names.iter().enumerate() {
        if !is_dns1035_label(short_name) {
            errors.push(FieldError::invalid(
                format!("{}.shortNames[{}]", path, i),
                format!("{:?}: must be a DNS-1035 label", short_name),
            ));
        }
    }
    if names.kind.is_empty() {
        errors.push(FieldError::required(format!("{}.kind", path), ""));
    } else if !is_dns1035_label(&names.kind.to_lowercase()) {
        errors.push(FieldError::invalid(
            format!("{}.kind", path),
            format!("{:?}: may have mixed case, but should otherwise match a DNS-1035 label", names.kind),
        ));
    }
    if names.list_kind.is_empty() {
        errors.push(FieldError::required(format!("{}.listKind", path), ""));
    } else if names.list_kind == names.kind {
        errors.push(FieldError::invalid(
            format!("{}.listKind", path),
            "kind and listKind may not be the same",
        ));
    }
    errors
}

fn validate_definition(crd: &CustomResourceDefinition) -> Vec<FieldError> {
    let spec = &crd.spec;
    let mut errors = Vec::new();
    if crd.name_any() != CustomResourceDefinition::expected_name(spec) {
        errors.push(FieldError::invalid(
            "metadata.name",
            format!("{:?}: must be spec.names.plural+\".\"+spec.group", crd.name_any()),
        ));
    }
    if spec.group.is_empty() {
        errors.push(FieldError::required("spec.group", ""));
    } else if !spec.group.contains('.') || !is_dns1123_subdomain(&spec.group) {
        errors.push(FieldError::invalid(
            "spec.group",
            format!("{:?}: should be a domain with at least one dot", spec.group),
        ));
    }
    errors.extend(validate_names(&spec.names, "spec.names"));
    if spec.versions.is_empty() {
        errors.push(FieldError::required("spec.versions", "must have at least one version"));
    }
    let mut seen = HashSet::new();
    let mut storage_versions = 0;
    for (i, version) in spec.versions.iter().enumerate() {
        let path = format!("spec.versions[{}]", i);
        if !is_dns1035_label(&version.name) {
            errors.push(FieldError::invalid(
                format!("{}.name", path),
                format!("{:?}: must be a DNS-1035 label", version.name),
            ));
        }
        if !seen.insert(version.name.as_str()) {
            errors.push(FieldError::new(
                crate::errors::FieldErrorKind::Duplicate,
                format!("{}.name", path),
                version.name.clone(),
            ));
        }
        if version.storage {
            storage_versions += 1;
        }
        if let Some(schema) = version.schema.as_ref().and_then(|s| s.open_api_v3_schema.as_ref()) {
            match schema.get("type").and_then(|t| t.as_str()) {
                Some("object") | None => (),
                Some(other) => errors.push(FieldError::invalid(
                    format!("{}.schema.openAPIV3Schema.type", path),
                    format!("{:?}: must be object at the root", other),
                )),
            }
        }
        if let Some(scale) = version.subresources.as_ref().and_then(|s| s.scale.as_ref()) {
            let path = format!("{}.subresources.scale", path);
            if !scale.spec_replicas_path.starts_with(".spec.") {
                errors.push(FieldError::invalid(
                    format!("{}.specReplicasPath", path),
                    "should be a json path under .spec",
                ));
            }
            if !scale.status_replicas_path.starts_with(".status.") {
                errors.push(FieldError::invalid(
                    format!("{}.statusReplicasPath", path),
                    "should be a json path under .status",
                ));
            }
            if let Some(selector) = &scale.label_selector_path {
                if !selector.starts_with(".spec.") && !selector.starts_with(".status.") {
                    errors.push(FieldError::invalid(
                        format!("{}.labelSelectorPath", path),
                        "should be a json path under either .spec or .status",
                    ));
                }
            }
        }
    }
    if !spec.versions.is_empty() && storage_versions != 1 {
        errors.push(FieldError::invalid(
            "spec.versions",
            "must have exactly one version marked as storage version",
        ));
    }
    errors
}

fn validate_stored_versions(crd: &CustomResourceDefinition) -> Vec<FieldError> {
    crd.status
        .iter()
        .flat_map(|s| s.stored_versions.iter().enumerate())
        .filter(|(_, v)| crd.version(v).is_none())
        .map(|(i, v)| {
            FieldError::invalid(
                format!("status.storedVersions[{}]", i),
                format!("{:?}: must appear in spec.versions", v),
            )
        })
        .collect()
}

fn default_names(names: &mut CustomResourceDefinitionNames) {
    names.singular = names.singular();
    names.list_kind = names.list_kind();
}

fn record_storage_version(crd: &mut CustomResourceDefinition) {
    if let Some(storage) = crd.storage_version().map(str::to_string) {
        let status = crd.status.get_or_insert_with(Default::default);
        if !status.is_stored_version(&storage) {
            status.stored_versions.push(storage);
        }
    }
}

/// Cluster scoped definitions, `status` is only writable through the status subresource.
pub(crate) struct CrdStrategy;

impl RestStrategy<CustomResourceDefinition> for CrdStrategy {
    fn kind(&self) -> String {
        "CustomResourceDefinition".to_string()
    }

    fn namespace_scoped(&self) -> bool {
        false
    }

    fn prepare_for_create(&self, crd: &mut CustomResourceDefinition) -> Result<(), RegistryError> {
        crd.status = Some(Default::default());
        crd.metadata.generation = Some(1);
        default_names(&mut crd.spec.names);
        record_storage_version(crd);
        Ok(())
    }

    fn prepare_for_update(
        &self,
        crd: &mut CustomResourceDefinition,
        old: &CustomResourceDefinition,
    ) -> Result<(), RegistryError> {
        crd.status = old.status.clone();
        default_names(&mut crd.spec.names);
        crd.metadata.generation = Some(next_generation(
            old.metadata.generation,
            crd.spec != old.spec,
        ));
        record_storage_version(crd);
        Ok(())
    }

    fn prepare_for_delete(&self, crd: &mut CustomResourceDefinition) {
        if !crd.has_finalizer(CUSTOM_RESOURCE_CLEANUP_FINALIZER) {
            crd.finalizers_mut()
                .push(CUSTOM_RESOURCE_CLEANUP_FINALIZER.to_string());
        }
        crd.set_condition(Condition::new(
            TERMINATING,
            Some(true),
            "InstanceDeletionPending",
            "CustomResourceDefinition marked for deletion; CustomResource deletion will begin soon",
        ));
    }

    fn validate(&self, crd: &CustomResourceDefinition) -> Vec<FieldError> {
        validate_definition(crd)
    }

    fn validate_update(
        &self,
        crd: &CustomResourceDefinition,
        old: &CustomResourceDefinition,
    ) -> Vec<FieldError> {
        let mut errors = validate_definition(crd);
        if crd.spec.group != old.spec.group {
            errors.push(FieldError::invalid("spec.group", "field is immutable"));
        }
        if crd.spec.scope != old.spec.scope {
            errors.push(FieldError::invalid("spec.scope", "field is immutable"));
        }
        errors.extend(validate_stored_versions(crd));
        errors
    }

    fn validate_status_update(
        &self,
        crd: &CustomResourceDefinition,
        _old: &CustomResourceDefinition,
    ) -> Vec<FieldError> {
        let mut errors = validate_stored_versions(crd);
        if let Some(status) = &crd.status {
            if !status.accepted_names.plural.is_empty() {
                errors.extend(validate_names(&status.accepted_names, "status.acceptedNames"));
            }
        }
        errors
    }

    fn get_attrs(&self, crd: &CustomResourceDefinition) -> Attrs {
        default_attrs(crd, false)
    }

    fn allow_create_on_update(&self) -> bool {
        false
    }

    fn allow_unconditional_update(&self) -> bool {
        false
    }
}

/// Main and status store of definitions.
pub(crate) struct CrdRegistry {
    store: RestStore<CustomResourceDefinition>,
    status: RestStore<CustomResourceDefinition>,
}

impl CrdRegistry {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let strategy: Arc<dyn RestStrategy<CustomResourceDefinition>> = Arc::new(CrdStrategy);
        let store = RestStore::new(storage, strategy.clone(), API_GROUP, CRD_RESOURCE);
        let status = store.with_strategy(Arc::new(StatusStrategy::new(strategy)));
        Self { store, status }
    }

    pub fn store(&self) -> &RestStore<CustomResourceDefinition> {
        &self.store
    }

    pub fn status_store(&self) -> &RestStore<CustomResourceDefinition> {
        &self.status
    }
}

#[async_trait]
impl CrdClient for CrdRegistry {
    async fn update(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, RegistryError> {
        self.store
            .update(None, &crd.name_any(), crd.clone(), false)
            .await
    }

    async fn update_status(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, RegistryError> {
        self.status
            .update(None, &crd.name_any(), crd.clone(), false)
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{errors::ExtApiError, storage::MemoryStorage};
    use kube::core::ObjectMeta;
    use rustrial_k8s_apiextensions_apis::{
        CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceSubresourceScale,
        CustomResourceSubresources, ResourceScope,
    };

    pub(crate) fn version(name: &str, storage: bool) -> CustomResourceDefinitionVersion {
        CustomResourceDefinitionVersion {
            name: name.to_string(),
            served: true,
            storage,
            schema: None,
            subresources: None,
        }
    }

    /// A definition `<plural>.<group>` with a single served storage version `v1`.
    pub(crate) fn crd(group: &str, plural: &str, kind: &str) -> CustomResourceDefinition {
        CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", plural, group)),
                ..Default::default()
            },
            spec: CustomResourceDefinitionSpec {
                group: group.to_string(),
                names: CustomResourceDefinitionNames {
                    plural: plural.to_string(),
                    kind: kind.to_string(),
                    ..Default::default()
                },
                scope: ResourceScope::Namespaced,
                versions: vec![version("v1", true)],
            },
            status: None,
        }
    }

    fn registry() -> CrdRegistry {
        CrdRegistry::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn dns_names() {
        assert!(is_dns1035_label("widgets"));
        assert!(is_dns1035_label("v1beta1"));
        assert!(!is_dns1035_label("1widgets"));
        assert!(!is_dns1035_label("Widgets"));
        assert!(!is_dns1035_label("widgets-"));
        assert!(is_dns1123_subdomain("example.com"));
        assert!(!is_dns1123_subdomain("example..com"));
    }

    #[test]
    fn validation() {
        assert!(CrdStrategy.validate(&{
            let mut c = crd("example.com", "widgets", "Widget");
            CrdStrategy.prepare_for_create(&mut c).unwrap();
            c
        }).is_empty());

        let mut c = crd("example", "widgets", "Widget");
        c.metadata.name = Some("other.example".to_string());
        c.spec.versions.push(version("v1", true));
        c.spec.versions.push(version("v2", false));
        c.spec.versions[2].subresources = Some(CustomResourceSubresources {
            status: None,
            scale: Some(CustomResourceSubresourceScale {
                spec_replicas_path: ".status.replicas".to_string(),
                status_replicas_path: ".status.replicas".to_string(),
                label_selector_path: None,
            }),
        });
        CrdStrategy.prepare_for_create(&mut c).unwrap();
        let fields: Vec<String> = CrdStrategy.validate(&c).into_iter().map(|e| e.field).collect();
        assert_eq!(
            vec![
                "metadata.name",
                "spec.group",
                "spec.versions[1].name",
                "spec.versions[2].subresources.scale.specReplicasPath",
                "spec.versions",
            ],
            fields
        );
    }

    #[tokio::test]
    async fn create_initializes_status_and_names() {
        let r = registry();
        let created = r
            .store()
            .create(None, crd("example.com", "widgets", "Widget"), false)
            .await
            .unwrap();
        assert_eq!(Some(1), created.metadata.generation);
        let status = created.status.unwrap();
        assert_eq!(vec!["v1".to_string()], status.stored_versions);
        assert!(status.conditions.is_empty());
        assert_eq!("widget", created.spec.names.singular);
        assert_eq!("WidgetList", created.spec.names.list_kind);
    }

    #[tokio::test]
    async fn update_tracks_generation_and_stored_versions() {
        let r = registry();
        let created = r
            .store()
            .create(None, crd("example.com", "widgets", "Widget"), false)
            .await
            .unwrap();

        let mut labelled = created.clone();
        labelled.labels_mut().insert("a".to_string(), "b".to_string());
        let labelled = r.update(&labelled).await.unwrap();
        assert_eq!(Some(1), labelled.metadata.generation);

        let mut next = labelled.clone();
        next.spec.versions[0].storage = false;
        next.spec.versions.push(version("v2", true));
        let next = r.update(&next).await.unwrap();
        assert_eq!(Some(2), next.metadata.generation);
        assert_eq!(
            vec!["v1".to_string(), "v2".to_string()],
            next.status.as_ref().unwrap().stored_versions
        );

        // stored versions must stay listed
        let mut dropped = next.clone();
        dropped.spec.versions.remove(0);
        let e = r.update(&dropped).await.unwrap_err();
        assert_eq!(422, e.code());

        let mut regrouped = next.clone();
        regrouped.spec.group = "example.org".to_string();
        regrouped.metadata.name = Some("widgets.example.org".to_string());
        assert!(r.update(&regrouped).await.is_err());
    }

    #[tokio::test]
    async fn status_update_does_not_change_spec() {
        let r = registry();
        let created = r
            .store()
            .create(None, crd("example.com", "widgets", "Widget"), false)
            .await
            .unwrap();
        let mut request = created.clone();
        request.spec.names.short_names = vec!["wd".to_string()];
        request.set_condition(Condition::new(
            rustrial_k8s_apiextensions_apis::NAMES_ACCEPTED,
            Some(true),
            "NoConflicts",
            "no conflicts found",
        ));
        let updated = r.update_status(&request).await.unwrap();
        assert!(updated.spec.names.short_names.is_empty());
        assert!(updated.is_condition_true(rustrial_k8s_apiextensions_apis::NAMES_ACCEPTED));
        assert_eq!(Some(1), updated.metadata.generation);
    }

    #[tokio::test]
    async fn delete_adds_cleanup_finalizer() {
        let r = registry();
        r.store()
            .create(None, crd("example.com", "widgets", "Widget"), false)
            .await
            .unwrap();
        let deleting = r
            .store()
            .delete(None, "widgets.example.com", &Default::default())
            .await
            .unwrap();
        assert!(deleting.is_deleted());
        assert!(deleting.has_finalizer(CUSTOM_RESOURCE_CLEANUP_FINALIZER));
        let terminating = deleting.find_condition(TERMINATING).unwrap();
        assert!(terminating.is_true());
        assert_eq!("InstanceDeletionPending", terminating.reason);

        let mut released = deleting.clone();
        released.remove_finalizer(CUSTOM_RESOURCE_CLEANUP_FINALIZER);
        r.update_status(&released).await.unwrap();
        assert!(
            r.store()
                .get(None, "widgets.example.com")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
