use std::{
    collections::{BTreeMap, HashSet},
    sync::{Mutex, PoisonError},
};

use rustrial_k8s_apiextensions_apis::admission::{
    GroupVersionKind, GroupVersionResource, Operation, UserInfo,
};
use serde_json::Value;

use crate::errors::AdmissionError;

/// Tracks which mutating plugins have to run again in the second pass.
#[derive(Debug, Default)]
pub(crate) struct ReinvocationContext {
    is_reinvoke: bool,
    should_reinvoke: bool,
    /// The object as left by the mutating webhooks of the previous pass.
    last_webhook_output: Option<Value>,
    previously_invoked_reinvocable: HashSet<String>,
    reinvoke_webhooks: HashSet<String>,
}

impl ReinvocationContext {
    pub fn is_reinvoke(&self) -> bool {
        self.is_reinvoke
    }

    pub fn set_is_reinvoke(&mut self) {
        self.is_reinvoke = true;
    }

    pub fn should_reinvoke(&self) -> bool {
        self.should_reinvoke
    }

    pub fn set_should_reinvoke(&mut self) {
        self.should_reinvoke = true;
    }

    pub(crate) fn set_last_webhook_output(&mut self, object: Option<Value>) {
        self.last_webhook_output = object;
    }

    pub(crate) fn is_output_changed_since_last_webhook_invocation(&self, object: Option<&Value>) -> bool {
        self.last_webhook_output.as_ref() != object
    }

    pub(crate) fn add_reinvocable_webhook_to_previously_invoked(&mut self, webhook: &str) {
        self.previously_invoked_reinvocable.insert(webhook.to_string());
    }

    /// Every reinvocable webhook invoked so far has to run again.
    pub(crate) fn require_reinvoking_previously_invoked(&mut self) {
        self.reinvoke_webhooks
            .extend(self.previously_invoked_reinvocable.drain());
    }

    pub(crate) fn should_reinvoke_webhook(&self, webhook: &str) -> bool {
        self.reinvoke_webhooks.contains(webhook)
    }
}

/// One request passing through admission.
#[derive(Debug)]
pub(crate) struct Attributes {
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    pub subresource: String,
    /// Empty for cluster scoped resources.
    pub namespace: String,
    pub name: String,
    pub operation: Operation,
    pub object: Option<Value>,
    pub old_object: Option<Value>,
    pub user_info: UserInfo,
    pub dry_run: bool,
    /// Labels of the namespace of the request, matched by namespace selectors.
    pub namespace_labels: BTreeMap<String, String>,
    annotations: Mutex<BTreeMap<String, String>>,
    reinvocation: ReinvocationContext,
}

impl Attributes {
    pub fn new(operation: Operation, kind: GroupVersionKind, resource: GroupVersionResource) -> Self {
        Self {
            kind,
            resource,
            subresource: String::new(),
            namespace: String::new(),
            name: String::new(),
            operation,
            object: None,
            old_object: None,
            user_info: UserInfo::default(),
            dry_run: false,
            namespace_labels: BTreeMap::new(),
            annotations: Default::default(),
            reinvocation: Default::default(),
        }
    }

    /// Records an audit annotation, a key can not be set to another value.
    pub fn add_annotation(&self, key: &str, value: &str) -> Result<(), AdmissionError> {
        let mut annotations = self.annotations.lock().unwrap_or_else(PoisonError::into_inner);
        match annotations.get(key) {
            Some(existing) if existing != value => Err(AdmissionError::Internal(format!(
                "admission annotations are not allowed to be overwritten, key:{:?}, old value: {:?}, new value:{:?}",
                key, existing, value
            ))),
            Some(_) => Ok(()),
            None => {
                annotations.insert(key.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.annotations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reinvocation(&mut self) -> &mut ReinvocationContext {
        &mut self.reinvocation
    }
}
