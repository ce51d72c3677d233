//! REST storage of custom resources, one per served version of a definition.
use std::sync::Arc;

use k8s_openapi::api::autoscaling::v1::Scale;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use rustrial_k8s_apiextensions_apis::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceSubresourceScale,
    ResourceScope,
};
use serde_json::Value;

use crate::{
    capabilities::Capabilities,
    errors::{FieldError, RegistryError},
    registry::{
        Attrs, ListOptions, RestStore, RestStrategy, StatusStrategy, default_attrs,
        next_generation, spec_changed,
    },
    scale::{apply_scale, scale_from_custom_resource},
    storage::Storage,
};

/// The names in effect for a definition, `spec.names` until names got accepted.
pub(crate) fn served_names(crd: &CustomResourceDefinition) -> CustomResourceDefinitionNames {
    let accepted = crd.accepted_names();
    if accepted.plural.is_empty() {
        crd.spec.names.clone()
    } else {
        accepted
    }
}

/// `/spec/replicas` to `spec.replicas`.
fn field_path(pointer: &str) -> String {
    let path = pointer.trim_start_matches('/').replace('/', ".");
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path
    }
}

pub(crate) struct CustomResourceStrategy {
    kind: String,
    namespaced: bool,
    has_status: bool,
    validator: Option<jsonschema::Validator>,
    scale: Option<CustomResourceSubresourceScale>,
}

impl CustomResourceStrategy {
    pub fn new(
        crd: &CustomResourceDefinition,
        version: &str,
        capabilities: &Capabilities,
    ) -> Result<Self, RegistryError> {
        let validator = match crd.schema(version) {
            Some(schema) if capabilities.custom_resource_validation => {
                Some(jsonschema::validator_for(schema).map_err(|e| {
                    RegistryError::Internal(format!(
                        "invalid openAPIV3Schema of version {} of {}: {}",
                        version,
                        CustomResourceDefinition::expected_name(&crd.spec),
                        e
                    ))
                })?)
            }
            _ => None,
        };
        let (has_status, scale) = if capabilities.custom_resource_subresources {
            (
                crd.has_status_subresource(version),
                crd.scale_subresource(version).cloned(),
            )
        } else {
            (false, None)
        };
        Ok(Self {
            kind: served_names(crd).kind,
            namespaced: crd.spec.scope == ResourceScope::Namespaced,
            has_status,
            validator,
            scale,
        })
    }

    fn validate_schema(&self, obj: &DynamicObject) -> Vec<FieldError> {
        let Some(validator) = &self.validator else {
            return Vec::new();
        };
        let instance = match serde_json::to_value(obj) {
            Ok(v) => v,
            Err(e) => return vec![FieldError::invalid("<root>", e.to_string())],
        };
        if validator.is_valid(&instance) {
            return Vec::new();
        }
        validator
            .iter_errors(&instance)
            .map(|e| FieldError::invalid(field_path(&e.instance_path.to_string()), e.to_string()))
            .collect()
    }

    fn validate_scale(&self, obj: &DynamicObject) -> Vec<FieldError> {
        match &self.scale {
            Some(paths) => match scale_from_custom_resource(obj, paths) {
                Ok(_) => Vec::new(),
                Err(e) => vec![FieldError::invalid(
                    paths.spec_replicas_path.trim_start_matches('.'),
                    e.to_string(),
                )],
            },
            None => Vec::new(),
        }
    }
}

impl RestStrategy<DynamicObject> for CustomResourceStrategy {
    fn kind(&self) -> String {
        self.kind.clone()
    }

    fn namespace_scoped(&self) -> bool {
        self.namespaced
    }

    fn prepare_for_create(&self, obj: &mut DynamicObject) -> Result<(), RegistryError> {
        if self.has_status {
            if let Some(data) = obj.data.as_object_mut() {
                data.remove("status");
            }
        }
        obj.metadata.generation = Some(1);
        Ok(())
    }

    fn prepare_for_update(
        &self,
        obj: &mut DynamicObject,
        old: &DynamicObject,
    ) -> Result<(), RegistryError> {
        if self.has_status {
            if let Some(data) = obj.data.as_object_mut() {
                match old.data.get("status") {
                    Some(status) => {
                        data.insert("status".to_string(), status.clone());
                    }
                    None => {
                        data.remove("status");
                    }
                }
            }
        }
        let changed = spec_changed(&obj.data, &old.data);
        obj.metadata.generation = Some(next_generation(old.metadata.generation, changed));
        Ok(())
    }

    fn validate(&self, obj: &DynamicObject) -> Vec<FieldError> {
        let mut errors = self.validate_schema(obj);
        errors.extend(self.validate_scale(obj));
        errors
    }

    fn validate_update(&self, obj: &DynamicObject, _old: &DynamicObject) -> Vec<FieldError> {
        self.validate(obj)
    }

    fn validate_status_update(&self, obj: &DynamicObject, _old: &DynamicObject) -> Vec<FieldError> {
        self.validate(obj)
    }

    fn get_attrs(&self, obj: &DynamicObject) -> Attrs {
        default_attrs(obj, self.namespaced)
    }

    fn allow_create_on_update(&self) -> bool {
        false
    }

    fn allow_unconditional_update(&self) -> bool {
        false
    }
}

/// The stores serving one version of a definition.
pub(crate) struct CustomResourceStorage {
    pub api_resource: ApiResource,
    pub namespaced: bool,
    pub store: RestStore<DynamicObject>,
    pub status: Option<RestStore<DynamicObject>>,
    pub scale: Option<CustomResourceSubresourceScale>,
}

impl CustomResourceStorage {
    pub fn new(
        storage: Arc<dyn Storage>,
        crd: &CustomResourceDefinition,
        version: &str,
        capabilities: &Capabilities,
    ) -> Result<Self, RegistryError> {
        let names = served_names(crd);
        let strategy = CustomResourceStrategy::new(crd, version, capabilities)?;
        let has_status = strategy.has_status;
        let scale = strategy.scale.clone();
        let strategy: Arc<dyn RestStrategy<DynamicObject>> = Arc::new(strategy);
        let store = RestStore::new(storage, strategy.clone(), &crd.spec.group, &names.plural);
        let status = if has_status {
            Some(store.with_strategy(Arc::new(StatusStrategy::new(strategy))))
        } else {
            None
        };
        let gvk = GroupVersionKind::gvk(&crd.spec.group, version, &names.kind);
        Ok(Self {
            api_resource: ApiResource::from_gvk_with_plural(&gvk, &names.plural),
            namespaced: crd.spec.scope == ResourceScope::Namespaced,
            store,
            status,
            scale,
        })
    }

    /// Objects are served in the requested version, no conversion beyond the
    /// `apiVersion` is applied.
    pub fn convert(&self, mut obj: DynamicObject) -> DynamicObject {
        obj.types = Some(TypeMeta {
            api_version: self.api_resource.api_version.clone(),
            kind: self.api_resource.kind.clone(),
        });
        obj
    }

    pub fn decode(&self, body: &[u8]) -> Result<DynamicObject, RegistryError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| RegistryError::BadRequest(format!("unable to decode body: {}", e)))?;
        let obj: DynamicObject = serde_json::from_value(value)
            .map_err(|e| RegistryError::BadRequest(format!("unable to decode object: {}", e)))?;
        Ok(self.convert(obj))
    }

    pub async fn list(
        &self,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> Result<(Vec<DynamicObject>, u64), RegistryError> {
        let (items, rv) = self.store.list(namespace, options).await?;
        Ok((items.into_iter().map(|o| self.convert(o)).collect(), rv))
    }

    fn scale_paths(&self) -> Result<&CustomResourceSubresourceScale, RegistryError> {
        self.scale.as_ref().ok_or_else(|| {
            RegistryError::NotFound {
                kind: format!("{}/scale", self.api_resource.plural),
                name: String::new(),
            }
        })
    }

    pub async fn get_scale(&self, namespace: Option<&str>, name: &str) -> Result<Scale, RegistryError> {
        let paths = self.scale_paths()?;
        let cr = self.store.get(namespace, name).await?;
        Ok(scale_from_custom_resource(&cr, paths)?)
    }

    /// Writes the desired replicas, the current object is the base of the update.
    pub async fn update_scale(
        &self,
        namespace: Option<&str>,
        name: &str,
        scale: &Scale,
        dry_run: bool,
    ) -> Result<Scale, RegistryError> {
        let paths = self.scale_paths()?;
        let mut cr = self.store.get(namespace, name).await?;
        apply_scale(&mut cr, paths, scale)?;
        let updated = self.store.update(namespace, name, cr, dry_run).await?;
        Ok(scale_from_custom_resource(&updated, paths)?)
    }
}
