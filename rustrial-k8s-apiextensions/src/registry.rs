//! Generic REST storage: a [`RestStrategy`] bound to a [`Storage`] backend.
use std::{collections::BTreeMap, sync::Arc};

use kube::{Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    errors::{ExtApiError, FieldError, RegistryError, StorageError},
    storage::{Preconditions, Storage, WatchStream},
    utils::{metadata_str, now_rfc3339, resource_version, set_metadata_field},
};

/// Finalizer asking the garbage collector to orphan dependents.
pub(crate) const ORPHAN_FINALIZER: &'static str = "orphan";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GarbageCollectionPolicy {
    DeleteDependents,
    OrphanDependents,
    /// The resource ignores requested propagation policies.
    Unsupported,
}

/// Labels and indexed fields of an object.
pub(crate) type Attrs = (BTreeMap<String, String>, BTreeMap<String, String>);

/// Resource specific behavior of a [`RestStore`].
pub(crate) trait RestStrategy<K>: Send + Sync {
    fn kind(&self) -> String;

    fn namespace_scoped(&self) -> bool;

    /// Clears fields which must not be set by the user on create, e.g. `status`.
    fn prepare_for_create(&self, obj: &mut K) -> Result<(), RegistryError>;

    /// Resets fields which must not be changed by the user on update and
    /// maintains `metadata.generation`.
    fn prepare_for_update(&self, obj: &mut K, old: &K) -> Result<(), RegistryError>;

    /// Hook called on the first deletion request of an object, may add finalizers.
    fn prepare_for_delete(&self, _obj: &mut K) {}

    fn validate(&self, obj: &K) -> Vec<FieldError>;

    fn validate_update(&self, obj: &K, old: &K) -> Vec<FieldError>;

    /// Validation used by the status subresource.
    fn validate_status_update(&self, _obj: &K, _old: &K) -> Vec<FieldError> {
        Vec::new()
    }

    fn canonicalize(&self, _obj: &mut K) {}

    fn get_attrs(&self, obj: &K) -> Attrs;

    fn allow_create_on_update(&self) -> bool;

    fn allow_unconditional_update(&self) -> bool;

    fn default_garbage_collection_policy(&self) -> GarbageCollectionPolicy {
        GarbageCollectionPolicy::DeleteDependents
    }
}

/// Labels plus `metadata.name` (and `metadata.namespace`) as fields.
pub(crate) fn default_attrs<K: Resource>(obj: &K, namespaced: bool) -> Attrs {
    let mut fields = BTreeMap::new();
    fields.insert("metadata.name".to_string(), obj.name_any());
    if namespaced {
        fields.insert(
            "metadata.namespace".to_string(),
            obj.namespace().unwrap_or_default(),
        );
    }
    (obj.labels().clone(), fields)
}

/// Deep comparison of everything but type meta, `metadata` and `status`.
pub(crate) fn spec_changed(new: &Value, old: &Value) -> bool {
    fn content(v: &Value) -> Value {
        let mut v = v.clone();
        if let Some(m) = v.as_object_mut() {
            for k in ["apiVersion", "kind", "metadata", "status"] {
                m.remove(k);
            }
        }
        v
    }
    content(new) != content(old)
}

/// The generation of an updated object.
pub(crate) fn next_generation(old: Option<i64>, changed: bool) -> i64 {
    match (old, changed) {
        (Some(g), false) => g,
        (Some(g), true) => g + 1,
        (None, _) => 1,
    }
}

/// Update through the status subresource: only `status` (plus the finalizers
/// and the resource version) is taken from `obj`, everything else is kept from `old`.
pub(crate) fn status_only_update<K>(obj: &mut K, old: &K) -> Result<(), RegistryError>
where
    K: Serialize + DeserializeOwned,
{
    let requested = serde_json::to_value(&*obj)?;
    let mut merged = serde_json::to_value(old)?;
    if let Some(m) = merged.as_object_mut() {
        match requested.get("status") {
            Some(status) => {
                m.insert("status".to_string(), status.clone());
            }
            None => {
                m.remove("status");
            }
        }
    }
    for field in ["finalizers", "resourceVersion"] {
        match requested.get("metadata").and_then(|m| m.get(field)) {
            Some(v) => set_metadata_field(&mut merged, field, v.clone()),
            None => {
                if let Some(m) = merged.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    m.remove(field);
                }
            }
        }
    }
    *obj = serde_json::from_value(merged)?;
    Ok(())
}

/// Wraps a strategy to serve the `status` subresource.
pub(crate) struct StatusStrategy<K> {
    inner: Arc<dyn RestStrategy<K>>,
}

impl<K> StatusStrategy<K> {
    pub fn new(inner: Arc<dyn RestStrategy<K>>) -> Self {
        Self { inner }
    }
}

impl<K> RestStrategy<K> for StatusStrategy<K>
where
    K: Serialize + DeserializeOwned + Send + Sync,
{
    fn kind(&self) -> String {
        self.inner.kind()
    }

    fn namespace_scoped(&self) -> bool {
        self.inner.namespace_scoped()
    }

    fn prepare_for_create(&self, _obj: &mut K) -> Result<(), RegistryError> {
        Err(RegistryError::MethodNotSupported(format!(
            "create is not supported on the status of {}",
            self.inner.kind()
        )))
    }

    fn prepare_for_update(&self, obj: &mut K, old: &K) -> Result<(), RegistryError> {
        status_only_update(obj, old)
    }

    fn validate(&self, obj: &K) -> Vec<FieldError> {
        self.inner.validate(obj)
    }

    fn validate_update(&self, obj: &K, old: &K) -> Vec<FieldError> {
        self.inner.validate_status_update(obj, old)
    }

    fn canonicalize(&self, obj: &mut K) {
        self.inner.canonicalize(obj)
    }

    fn get_attrs(&self, obj: &K) -> Attrs {
        self.inner.get_attrs(obj)
    }

    fn allow_create_on_update(&self) -> bool {
        false
    }

    fn allow_unconditional_update(&self) -> bool {
        self.inner.allow_unconditional_update()
    }

    fn default_garbage_collection_policy(&self) -> GarbageCollectionPolicy {
        self.inner.default_garbage_collection_policy()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Requirement {
    key: String,
    value: String,
    equals: bool,
}

/// Equality based selector like `a=b,c!=d`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Selector(Vec<Requirement>);

impl Selector {
    pub fn parse(text: &str) -> Result<Self, RegistryError> {
        let mut requirements = Vec::new();
        for term in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value, equals) = if let Some((k, v)) = term.split_once("!=") {
                (k, v, false)
            } else if let Some((k, v)) = term.split_once("==") {
                (k, v, true)
            } else if let Some((k, v)) = term.split_once('=') {
                (k, v, true)
            } else {
                return Err(RegistryError::BadRequest(format!(
                    "unable to parse requirement: {:?}",
                    term
                )));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(RegistryError::BadRequest(format!(
                    "unable to parse requirement: {:?}, key must not be empty",
                    term
                )));
            }
            requirements.push(Requirement {
                key: key.to_string(),
                value: value.trim().to_string(),
                equals,
            });
        }
        Ok(Self(requirements))
    }

    pub fn matches(&self, attrs: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|r| match attrs.get(&r.key) {
            Some(v) => (v == &r.value) == r.equals,
            None => !r.equals,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DeleteOptions {
    pub preconditions: Preconditions,
    pub propagation_policy: Option<GarbageCollectionPolicy>,
    pub dry_run: bool,
}

/// CRUD handler of one resource bound to the storage backend.
pub(crate) struct RestStore<K> {
    storage: Arc<dyn Storage>,
    strategy: Arc<dyn RestStrategy<K>>,
    /// Storage key prefix, `/registry/<group>/<resource>`.
    prefix: String,
    /// Resource name used in errors, `<resource>.<group>`.
    qualified_resource: String,
}

impl<K> Clone for RestStore<K> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            strategy: self.strategy.clone(),
            prefix: self.prefix.clone(),
            qualified_resource: self.qualified_resource.clone(),
        }
    }
}

impl<K> RestStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        storage: Arc<dyn Storage>,
        strategy: Arc<dyn RestStrategy<K>>,
        group: &str,
        resource: &str,
    ) -> Self {
        let qualified_resource = if group.is_empty() {
            resource.to_string()
        } else {
            format!("{}.{}", resource, group)
        };
        Self {
            storage,
            strategy,
            prefix: format!("/registry/{}/{}", group, resource),
            qualified_resource,
        }
    }

    /// A store on the same storage location with a different strategy, e.g. for the status subresource.
    pub fn with_strategy(&self, strategy: Arc<dyn RestStrategy<K>>) -> Self {
        Self {
            strategy,
            ..self.clone()
        }
    }

    fn key(&self, namespace: Option<&str>, name: &str) -> String {
        match namespace {
            Some(ns) if self.strategy.namespace_scoped() => {
                format!("{}/{}/{}", self.prefix, ns, name)
            }
            _ => format!("{}/{}", self.prefix, name),
        }
    }

    fn list_prefix(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if self.strategy.namespace_scoped() && !ns.is_empty() => {
                format!("{}/{}/", self.prefix, ns)
            }
            _ => format!("{}/", self.prefix),
        }
    }

    fn error(&self, e: StorageError, name: &str) -> RegistryError {
        RegistryError::from_storage(e, &self.qualified_resource, name)
    }

    fn invalid(&self, name: &str, errors: Vec<FieldError>) -> RegistryError {
        RegistryError::invalid(&self.strategy.kind(), name, errors)
    }

    /// The namespace of an object addressed by a request in `namespace`.
    fn object_namespace(
        &self,
        namespace: Option<&str>,
        obj: &K,
    ) -> Result<Option<String>, RegistryError> {
        if !self.strategy.namespace_scoped() {
            return Ok(None);
        }
        let requested = namespace.filter(|ns| !ns.is_empty());
        let own = obj.meta().namespace.as_deref().filter(|ns| !ns.is_empty());
        match (requested, own) {
            (Some(r), Some(o)) if r != o => Err(RegistryError::BadRequest(
                "the namespace of the provided object does not match the namespace sent on the request"
                    .to_string(),
            )),
            (Some(ns), _) | (None, Some(ns)) => Ok(Some(ns.to_string())),
            (None, None) => Err(RegistryError::BadRequest(
                "the server could not find the requested resource, a namespace is required"
                    .to_string(),
            )),
        }
    }

    fn prepare_create(&self, obj: &mut K) -> Result<Value, RegistryError> {
        let name = obj.name_any();
        {
            let meta = obj.meta_mut();
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
            meta.resource_version = None;
            meta.creation_timestamp = None;
            meta.deletion_timestamp = None;
        }
        self.strategy.prepare_for_create(obj)?;
        let errors = self.strategy.validate(obj);
        if !errors.is_empty() {
            return Err(self.invalid(&name, errors));
        }
        self.strategy.canonicalize(obj);
        let mut value = serde_json::to_value(&*obj)?;
        set_metadata_field(&mut value, "creationTimestamp", Value::String(now_rfc3339()));
        Ok(value)
    }

    fn prepare_update(&self, existing: Option<Value>, obj: &K) -> Result<Value, RegistryError> {
        let mut obj = obj.clone();
        let Some(existing) = existing else {
            return self.prepare_create(&mut obj);
        };
        let old: K = serde_json::from_value(existing)?;
        let name = old.name_any();
        if old.meta().deletion_timestamp.is_some() {
            let added: Vec<&String> = obj
                .finalizers()
                .iter()
                .filter(|f| !old.finalizers().contains(f))
                .collect();
            if !added.is_empty() {
                return Err(self.invalid(
                    &name,
                    vec![FieldError::forbidden(
                        "metadata.finalizers",
                        "no new finalizers can be added if the object is being deleted",
                    )],
                ));
            }
        }
        {
            let (meta, old_meta) = (obj.meta_mut(), old.meta());
            meta.uid = old_meta.uid.clone();
            meta.creation_timestamp = old_meta.creation_timestamp.clone();
            meta.deletion_timestamp = old_meta.deletion_timestamp.clone();
            meta.deletion_grace_period_seconds = old_meta.deletion_grace_period_seconds;
            meta.generation = old_meta.generation;
        }
        self.strategy.prepare_for_update(&mut obj, &old)?;
        let errors = self.strategy.validate_update(&obj, &old);
        if !errors.is_empty() {
            return Err(self.invalid(&name, errors));
        }
        self.strategy.canonicalize(&mut obj);
        Ok(serde_json::to_value(&obj)?)
    }

    pub async fn create(
        &self,
        namespace: Option<&str>,
        mut obj: K,
        dry_run: bool,
    ) -> Result<K, RegistryError> {
        obj.meta_mut().namespace = self.object_namespace(namespace, &obj)?;
        if obj.meta().name.as_deref().unwrap_or_default().is_empty() {
            match obj.meta().generate_name.clone().filter(|p| !p.is_empty()) {
                Some(prefix) => {
                    let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..5].to_string();
                    obj.meta_mut().name = Some(format!("{}{}", prefix, suffix));
                }
                None => {
                    return Err(self.invalid(
                        "",
                        vec![FieldError::required(
                            "metadata.name",
                            "name or generateName is required",
                        )],
                    ));
                }
            }
        }
        let name = obj.name_any();
        let key = self.key(obj.meta().namespace.as_deref(), &name);
        let value = self.prepare_create(&mut obj)?;
        let stored = if dry_run {
            match self.storage.get(&key).await {
                Ok(_) => return Err(self.error(StorageError::AlreadyExists(key), &name)),
                Err(e) if e.is_not_found() => value,
                Err(e) => return Err(self.error(e, &name)),
            }
        } else {
            self.storage
                .create(&key, value)
                .await
                .map_err(|e| self.error(e, &name))?
        };
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, RegistryError> {
        let value = self
            .storage
            .get(&self.key(namespace, name))
            .await
            .map_err(|e| self.error(e, name))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Raw JSON objects and the resource version of the list.
    pub async fn list_raw(&self, namespace: Option<&str>) -> Result<(Vec<Value>, u64), RegistryError> {
        self.storage
            .list(&self.list_prefix(namespace))
            .await
            .map_err(|e| self.error(e, ""))
    }

    pub async fn list(
        &self,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> Result<(Vec<K>, u64), RegistryError> {
        let labels = Selector::parse(options.label_selector.as_deref().unwrap_or_default())?;
        let fields = Selector::parse(options.field_selector.as_deref().unwrap_or_default())?;
        let (items, rv) = self.list_raw(namespace).await?;
        let mut result = Vec::with_capacity(items.len());
        for item in items {
            let obj: K = serde_json::from_value(item)?;
            let (l, f) = self.strategy.get_attrs(&obj);
            if labels.matches(&l) && fields.matches(&f) {
                result.push(obj);
            }
        }
        Ok((result, rv))
    }

    pub async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: u64,
    ) -> Result<WatchStream, StorageError> {
        self.storage
            .watch(&self.list_prefix(namespace), resource_version)
            .await
    }

    pub async fn update(
        &self,
        namespace: Option<&str>,
        name: &str,
        mut obj: K,
        dry_run: bool,
    ) -> Result<K, RegistryError> {
        let namespace = self.object_namespace(namespace, &obj)?;
        match obj.meta().name.as_deref() {
            Some(n) if n == name => (),
            None => obj.meta_mut().name = Some(name.to_string()),
            Some(n) => {
                return Err(RegistryError::BadRequest(format!(
                    "the name of the object ({}) does not match the name on the URL ({})",
                    n, name
                )));
            }
        }
        obj.meta_mut().namespace = namespace.clone();
        let key = self.key(namespace.as_deref(), name);
        let rv = obj.meta().resource_version.clone().filter(|v| !v.is_empty());
        if rv.is_none() && !self.strategy.allow_unconditional_update() {
            return Err(self.invalid(
                name,
                vec![FieldError::required(
                    "metadata.resourceVersion",
                    "must be specified for an update",
                )],
            ));
        }
        let preconditions = Preconditions {
            uid: None,
            resource_version: rv,
        };
        let allow_create = self.strategy.allow_create_on_update();
        let stored = if dry_run {
            let existing = match self.storage.get(&key).await {
                Ok(v) => {
                    preconditions
                        .check(&key, &v)
                        .map_err(|e| self.error(e, name))?;
                    Some(v)
                }
                Err(e) if e.is_not_found() && allow_create => None,
                Err(e) => return Err(self.error(e, name)),
            };
            self.prepare_update(existing, &obj)?
        } else {
            self.storage
                .guaranteed_update(&key, &preconditions, allow_create, &mut |existing| {
                    self.prepare_update(existing, &obj)
                        .map_err(|e| StorageError::Aborted(Box::new(e)))
                })
                .await
                .map_err(|e| self.error(e, name))?
        };
        let deleted = metadata_str(&stored, "deletionTimestamp").is_some();
        let finalizers = stored
            .get("metadata")
            .and_then(|m| m.get("finalizers"))
            .and_then(|f| f.as_array())
            .map_or(0, |f| f.len());
        if deleted && finalizers == 0 && !dry_run {
            // The last finalizer is gone, the deletion can complete.
            let preconditions = Preconditions {
                uid: metadata_str(&stored, "uid").map(str::to_string),
                resource_version: Some(resource_version(&stored).to_string()),
            };
            let removed = self
                .storage
                .delete(&key, &preconditions)
                .await
                .map_err(|e| self.error(e, name))?;
            return Ok(serde_json::from_value(removed)?);
        }
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<K, RegistryError> {
        let key = self.key(namespace, name);
        let existing = self
            .storage
            .get(&key)
            .await
            .map_err(|e| self.error(e, name))?;
        options
            .preconditions
            .check(&key, &existing)
            .map_err(|e| self.error(e, name))?;
        let rv = resource_version(&existing);
        let mut obj: K = serde_json::from_value(existing)?;
        if obj.meta().deletion_timestamp.is_some() {
            if !obj.finalizers().is_empty() {
                // Deletion already pending on finalizers.
                return Ok(obj);
            }
        } else {
            self.strategy.prepare_for_delete(&mut obj);
            let policy = match self.strategy.default_garbage_collection_policy() {
                GarbageCollectionPolicy::Unsupported => GarbageCollectionPolicy::DeleteDependents,
                default => options.propagation_policy.unwrap_or(default),
            };
            if policy == GarbageCollectionPolicy::OrphanDependents
                && !obj.finalizers().iter().any(|f| f == ORPHAN_FINALIZER)
            {
                obj.finalizers_mut().push(ORPHAN_FINALIZER.to_string());
            }
            if !obj.finalizers().is_empty() {
                let mut value = serde_json::to_value(&obj)?;
                set_metadata_field(&mut value, "deletionTimestamp", Value::String(now_rfc3339()));
                if options.dry_run {
                    return Ok(serde_json::from_value(value)?);
                }
                let updated = self
                    .storage
                    .compare_and_swap(&key, rv, value)
                    .await
                    .map_err(|e| self.error(e, name))?;
                return Ok(serde_json::from_value(updated)?);
            }
        }
        if options.dry_run {
            return Ok(obj);
        }
        let preconditions = Preconditions {
            uid: obj.meta().uid.clone(),
            resource_version: Some(rv.to_string()),
        };
        let removed = self
            .storage
            .delete(&key, &preconditions)
            .await
            .map_err(|e| self.error(e, name))?;
        Ok(serde_json::from_value(removed)?)
    }

    /// Deletes all selected objects of the namespace (all namespaces if `None`),
    /// continuing after failures and returning them aggregated.
    pub async fn delete_collection(
        &self,
        namespace: Option<&str>,
        list_options: &ListOptions,
        options: &DeleteOptions,
    ) -> Result<Vec<K>, RegistryError> {
        let (items, _) = self.list(namespace, list_options).await?;
        let mut deleted = Vec::with_capacity(items.len());
        let mut errors = Vec::new();
        for item in items {
            let ns = item.namespace();
            match self.delete(ns.as_deref(), &item.name_any(), options).await {
                Ok(o) => deleted.push(o),
                Err(e) if e.is_not_found() => (),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(deleted)
        } else {
            Err(RegistryError::Aggregate(errors))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{errors::ExtApiError, storage::MemoryStorage};
    use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
    use serde_json::json;

    /// Namespaced widgets with spec/status split.
    pub(crate) struct WidgetStrategy;

    impl RestStrategy<DynamicObject> for WidgetStrategy {
        fn kind(&self) -> String {
            "Widget".to_string()
        }

        fn namespace_scoped(&self) -> bool {
            true
        }

        fn prepare_for_create(&self, obj: &mut DynamicObject) -> Result<(), RegistryError> {
            if let Some(m) = obj.data.as_object_mut() {
                m.remove("status");
            }
            obj.metadata.generation = Some(1);
            Ok(())
        }

        fn prepare_for_update(
            &self,
            obj: &mut DynamicObject,
            old: &DynamicObject,
        ) -> Result<(), RegistryError> {
            obj.data["status"] = old.data.get("status").cloned().unwrap_or(Value::Null);
            let changed = spec_changed(&obj.data, &old.data);
            obj.metadata.generation = Some(next_generation(old.metadata.generation, changed));
            Ok(())
        }

        fn validate(&self, obj: &DynamicObject) -> Vec<FieldError> {
            if obj.data.get("spec").is_none() {
                vec![FieldError::required("spec", "")]
            } else {
                vec![]
            }
        }

        fn validate_update(&self, obj: &DynamicObject, _old: &DynamicObject) -> Vec<FieldError> {
            self.validate(obj)
        }

        fn get_attrs(&self, obj: &DynamicObject) -> Attrs {
            default_attrs(obj, true)
        }

        fn allow_create_on_update(&self) -> bool {
            false
        }

        fn allow_unconditional_update(&self) -> bool {
            false
        }
    }

    pub(crate) fn widget(name: &str, data: Value) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("example.com", "v1", "Widget"));
        DynamicObject::new(name, &ar).within("default").data(data)
    }

    fn stores() -> (RestStore<DynamicObject>, RestStore<DynamicObject>) {
        let strategy: Arc<dyn RestStrategy<DynamicObject>> = Arc::new(WidgetStrategy);
        let main = RestStore::new(
            Arc::new(MemoryStorage::new()),
            strategy.clone(),
            "example.com",
            "widgets",
        );
        let status = main.with_strategy(Arc::new(StatusStrategy::new(strategy)));
        (main, status)
    }

    #[test]
    fn selectors() {
        let attrs: BTreeMap<String, String> = [
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "front".to_string()),
        ]
        .into_iter()
        .collect();
        assert!(Selector::parse("").unwrap().matches(&attrs));
        assert!(Selector::parse("app=web, tier==front").unwrap().matches(&attrs));
        assert!(!Selector::parse("app!=web").unwrap().matches(&attrs));
        assert!(Selector::parse("env!=prod").unwrap().matches(&attrs));
        assert!(!Selector::parse("env=prod").unwrap().matches(&attrs));
        assert!(Selector::parse("app").is_err());
    }

    #[test]
    fn generation_ignores_key_order_and_status() {
        let a: Value = serde_json::from_str(r#"{"spec":{"a":1,"b":[1,2]},"status":{"x":1}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"status":{"x":2},"spec":{"b":[1,2],"a":1}}"#).unwrap();
        assert!(!spec_changed(&a, &b));
        assert!(spec_changed(&a, &json!({"spec": {"a": 2, "b": [1, 2]}})));
    }

    #[tokio::test]
    async fn create_stamps_system_fields() {
        let (store, _) = stores();
        let created = store
            .create(Some("default"), widget("w", json!({"spec": {"size": 1}, "status": {"ready": true}})), false)
            .await
            .unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(Some(1), created.metadata.generation);
        assert_eq!(Some("1".to_string()), created.metadata.resource_version);
        assert!(created.data.get("status").is_none());

        let e = store
            .create(Some("default"), widget("w", json!({"spec": {}})), false)
            .await
            .unwrap_err();
        assert_eq!(409, e.code());
        let e = store
            .create(Some("default"), widget("x", json!({})), false)
            .await
            .unwrap_err();
        assert_eq!(422, e.code());
    }

    #[tokio::test]
    async fn dry_run_create_does_not_persist() {
        let (store, _) = stores();
        store
            .create(Some("default"), widget("w", json!({"spec": {}})), true)
            .await
            .unwrap();
        assert!(store.get(Some("default"), "w").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn status_update_keeps_spec_and_spec_update_keeps_status() {
        let (store, status) = stores();
        let created = store
            .create(Some("default"), widget("w", json!({"spec": {"size": 1}})), false)
            .await
            .unwrap();

        let mut request = created.clone();
        request.data = json!({"spec": {"size": 2}, "status": {"ready": true}});
        let updated = status.update(Some("default"), "w", request, false).await.unwrap();
        assert_eq!(json!({"size": 1}), updated.data["spec"]);
        assert_eq!(json!({"ready": true}), updated.data["status"]);
        assert_eq!(Some(1), updated.metadata.generation);

        let fetched = store.get(Some("default"), "w").await.unwrap();
        assert_eq!(json!({"size": 1}), fetched.data["spec"]);

        let mut request = fetched.clone();
        request.data = json!({"spec": {"size": 3}, "status": {"ready": false}});
        let updated = store.update(Some("default"), "w", request, false).await.unwrap();
        assert_eq!(json!({"size": 3}), updated.data["spec"]);
        assert_eq!(json!({"ready": true}), updated.data["status"]);
        assert_eq!(Some(2), updated.metadata.generation);
    }

    #[tokio::test]
    async fn update_requires_matching_resource_version() {
        let (store, _) = stores();
        let created = store
            .create(Some("default"), widget("w", json!({"spec": {"size": 1}})), false)
            .await
            .unwrap();
        let mut stale = created.clone();
        stale.data = json!({"spec": {"size": 2}});
        store.update(Some("default"), "w", stale.clone(), false).await.unwrap();
        let e = store.update(Some("default"), "w", stale, false).await.unwrap_err();
        assert!(e.is_conflict());

        let mut unconditional = created;
        unconditional.metadata.resource_version = None;
        let e = store
            .update(Some("default"), "w", unconditional, false)
            .await
            .unwrap_err();
        assert_eq!(422, e.code());
    }

    #[tokio::test]
    async fn delete_is_gated_by_finalizers() {
        let (store, status) = stores();
        let mut w = widget("w", json!({"spec": {}}));
        w.metadata.finalizers = Some(vec!["example.com/cleanup".to_string()]);
        store.create(Some("default"), w, false).await.unwrap();

        let pending = store
            .delete(Some("default"), "w", &Default::default())
            .await
            .unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());
        // second delete is a no-op
        let again = store
            .delete(Some("default"), "w", &Default::default())
            .await
            .unwrap();
        assert_eq!(pending.metadata.resource_version, again.metadata.resource_version);

        let mut release = again;
        release.metadata.finalizers = Some(vec![]);
        status.update(Some("default"), "w", release, false).await.unwrap();
        assert!(store.get(Some("default"), "w").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_collection_per_namespace() {
        let (store, _) = stores();
        for (ns, name) in [("a", "1"), ("a", "2"), ("b", "1")] {
            let mut w = widget(name, json!({"spec": {}}));
            w.metadata.namespace = Some(ns.to_string());
            store.create(Some(ns), w, false).await.unwrap();
        }
        let deleted = store
            .delete_collection(Some("a"), &Default::default(), &Default::default())
            .await
            .unwrap();
        assert_eq!(2, deleted.len());
        let (rest, _) = store.list(None, &Default::default()).await.unwrap();
        assert_eq!(1, rest.len());
        assert_eq!(Some("b".to_string()), rest[0].metadata.namespace);
    }

    #[tokio::test]
    async fn list_with_selectors() {
        let (store, _) = stores();
        let mut w = widget("w1", json!({"spec": {}}));
        w.metadata.labels = Some([("app".to_string(), "web".to_string())].into_iter().collect());
        store.create(Some("default"), w, false).await.unwrap();
        store
            .create(Some("default"), widget("w2", json!({"spec": {}})), false)
            .await
            .unwrap();
        let options = ListOptions {
            label_selector: Some("app=web".to_string()),
            ..Default::default()
        };
        let (items, _) = store.list(Some("default"), &options).await.unwrap();
        assert_eq!(vec!["w1".to_string()], items.iter().map(|i| i.name_any()).collect::<Vec<_>>());
        let options = ListOptions {
            field_selector: Some("metadata.name=w2".to_string()),
            ..Default::default()
        };
        let (items, _) = store.list(None, &options).await.unwrap();
        assert_eq!(1, items.len());
    }
}
