//! Admission of writes to custom resources: in-process plugins and webhooks.
use std::sync::Arc;

use async_trait::async_trait;
use rustrial_k8s_apiextensions_apis::admission::Operation;

use crate::errors::AdmissionError;

mod attributes;
mod mutating;
mod validating;
mod webhook;

pub(crate) use attributes::Attributes;
pub(crate) use mutating::MutatingWebhookDispatcher;
pub(crate) use validating::ValidatingWebhookDispatcher;
pub(crate) use webhook::{ReqwestWebhookClient, WebhookClient};

/// A plugin that may change the object of a request.
#[async_trait]
pub(crate) trait MutationInterface: Send + Sync {
    fn handles(&self, operation: Operation) -> bool;

    async fn admit(&self, attributes: &mut Attributes) -> Result<(), AdmissionError>;
}

/// A plugin that may only accept or reject a request.
#[async_trait]
pub(crate) trait ValidationInterface: Send + Sync {
    fn handles(&self, operation: Operation) -> bool;

    async fn validate(&self, attributes: &Attributes) -> Result<(), AdmissionError>;
}

/// Mutating plugins in order, then validating plugins.
#[derive(Default, Clone)]
pub(crate) struct AdmissionChain {
    mutators: Vec<Arc<dyn MutationInterface>>,
    validators: Vec<Arc<dyn ValidationInterface>>,
}

impl AdmissionChain {
    pub fn with_mutator(mut self, mutator: Arc<dyn MutationInterface>) -> Self {
        self.mutators.push(mutator);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ValidationInterface>) -> Self {
        self.validators.push(validator);
        self
    }

    async fn run_mutators(&self, attributes: &mut Attributes) -> Result<(), AdmissionError> {
        for mutator in &self.mutators {
            if mutator.handles(attributes.operation) {
                mutator.admit(attributes).await?;
            }
        }
        Ok(())
    }

    /// Runs the mutating plugins, a second time if one of them asked for it.
    pub async fn admit(&self, attributes: &mut Attributes) -> Result<(), AdmissionError> {
        self.run_mutators(attributes).await?;
        if attributes.reinvocation().should_reinvoke() {
            attributes.reinvocation().set_is_reinvoke();
            self.run_mutators(attributes).await?;
        }
        Ok(())
    }

    pub async fn validate(&self, attributes: &Attributes) -> Result<(), AdmissionError> {
        for validator in &self.validators {
            if validator.handles(attributes.operation) {
                validator.validate(attributes).await?;
            }
        }
        Ok(())
    }

    /// Mutation followed by validation of the final object.
    pub async fn run(&self, attributes: &mut Attributes) -> Result<(), AdmissionError> {
        self.admit(attributes).await?;
        self.validate(attributes).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustrial_k8s_apiextensions_apis::admission::{GroupVersionKind, GroupVersionResource};
    use serde_json::{Value, json};
    use std::sync::Mutex;

    pub(crate) fn widget_attributes(operation: Operation, object: Option<Value>) -> Attributes {
        let mut attributes = Attributes::new(
            operation,
            GroupVersionKind {
                group: "example.com".to_string(),
                version: "v1".to_string(),
                kind: "Widget".to_string(),
            },
            GroupVersionResource {
                group: "example.com".to_string(),
                version: "v1".to_string(),
                resource: "widgets".to_string(),
            },
        );
        attributes.namespace = "default".to_string();
        attributes.name = "w1".to_string();
        attributes.object = object;
        attributes
    }

    /// Sets `spec.size` to 3 the first time, records every call.
    #[derive(Default)]
    struct Defaulter(Mutex<Vec<bool>>);

    #[async_trait]
    impl MutationInterface for Defaulter {
        fn handles(&self, operation: Operation) -> bool {
            operation == Operation::Create
        }

        async fn admit(&self, attributes: &mut Attributes) -> Result<(), AdmissionError> {
            self.0.lock().unwrap().push(attributes.reinvocation().is_reinvoke());
            if let Some(object) = attributes.object.as_mut() {
                if object["spec"]["size"].is_null() {
                    object["spec"]["size"] = json!(3);
                    attributes.reinvocation().set_should_reinvoke();
                }
            }
            Ok(())
        }
    }

    struct SizeLimit;

    #[async_trait]
    impl ValidationInterface for SizeLimit {
        fn handles(&self, _operation: Operation) -> bool {
            true
        }

        async fn validate(&self, attributes: &Attributes) -> Result<(), AdmissionError> {
            match attributes.object.as_ref().and_then(|o| o["spec"]["size"].as_i64()) {
                Some(size) if size > 5 => Err(AdmissionError::denied("size-limit", None)),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn mutators_are_reinvoked_once_on_request() {
        let defaulter = Arc::new(Defaulter::default());
        let chain = AdmissionChain::default()
            .with_mutator(defaulter.clone())
            .with_validator(Arc::new(SizeLimit));
        let mut attributes = widget_attributes(Operation::Create, Some(json!({ "spec": {} })));
        chain.run(&mut attributes).await.unwrap();
        assert_eq!(vec![false, true], *defaulter.0.lock().unwrap());
        assert_eq!(json!(3), attributes.object.unwrap()["spec"]["size"]);
    }

    #[tokio::test]
    async fn validators_reject() {
        let defaulter = Arc::new(Defaulter::default());
        let chain = AdmissionChain::default()
            .with_mutator(defaulter.clone())
            .with_validator(Arc::new(SizeLimit));
        let mut attributes = widget_attributes(Operation::Update, Some(json!({ "spec": { "size": 6 } })));
        let err = chain.run(&mut attributes).await.unwrap_err();
        assert_eq!(400, err.status().code);
        // not handled for updates
        assert!(defaulter.0.lock().unwrap().is_empty());
    }
}
