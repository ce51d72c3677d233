use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use rustrial_k8s_apiextensions_apis::admission::{FailurePolicy, Operation, ValidatingWebhook};

use super::{
    Attributes, ValidationInterface,
    webhook::{
        WebhookAccessor, WebhookClient, check_dry_run, create_admission_review, should_call_hook,
        verify_admission_response,
    },
};
use crate::errors::AdmissionError;

/// Calls all matching validating webhooks concurrently.
pub(crate) struct ValidatingWebhookDispatcher {
    hooks: Vec<ValidatingWebhook>,
    client: Arc<dyn WebhookClient>,
}

impl ValidatingWebhookDispatcher {
    pub fn new(hooks: Vec<ValidatingWebhook>, client: Arc<dyn WebhookClient>) -> Self {
        Self { hooks, client }
    }

    async fn call_hook(
        &self,
        hook: &ValidatingWebhook,
        attributes: &Attributes,
    ) -> Result<(), AdmissionError> {
        check_dry_run(hook, attributes)?;
        let request = create_admission_review(hook, attributes)?;
        let review = self
            .client
            .call(&hook.name, &hook.client_config, hook.timeout(), &request)
            .await?;
        let response = verify_admission_response(hook, &request, review, false)?;
        for (key, value) in &response.audit_annotations {
            if let Err(e) = attributes.add_annotation(&format!("{}/{}", hook.name, key), value) {
                warn!("Failed to set admission audit annotation of {}: {}", hook.name, e);
            }
        }
        for warning in &response.warnings {
            warn!("Admission webhook {} returned warning: {}", hook.name, warning);
        }
        if response.allowed {
            Ok(())
        } else {
            Err(AdmissionError::denied(&hook.name, response.status))
        }
    }
}

#[async_trait]
impl ValidationInterface for ValidatingWebhookDispatcher {
    fn handles(&self, _operation: Operation) -> bool {
        true
    }

    async fn validate(&self, attributes: &Attributes) -> Result<(), AdmissionError> {
        let hooks: Vec<&ValidatingWebhook> = self
            .hooks
            .iter()
            .filter(|h| should_call_hook(*h, attributes))
            .collect();
        let results = join_all(hooks.iter().map(|h| self.call_hook(h, attributes))).await;
        let mut first_error = None;
        for (hook, result) in hooks.into_iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(e) if e.is_calling_webhook() && hook.failure_policy() == FailurePolicy::Ignore => {
                    warn!("Failed calling webhook, failing open {}: {}", hook.name, e);
                }
                Err(e) if e.is_calling_webhook() => {
                    error!("Failed calling webhook, failing closed {}: {}", hook.name, e);
                    first_error.get_or_insert(e.fail_closed());
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{
        tests::widget_attributes,
        webhook::{MockWebhookClient, tests::rule},
    };
    use rustrial_k8s_apiextensions_apis::admission::{
        AdmissionResponse, AdmissionReview, SideEffectClass, WebhookClientConfig,
    };
    use serde_json::json;

    fn hook(name: &str) -> ValidatingWebhook {
        ValidatingWebhook {
            name: name.to_string(),
            client_config: WebhookClientConfig {
                url: Some(format!("https://{}/validate", name)),
                ..Default::default()
            },
            rules: vec![rule(&["widgets"])],
            failure_policy: None,
            namespace_selector: None,
            side_effects: Some(SideEffectClass::None),
            timeout_seconds: None,
            admission_review_versions: vec!["v1".to_string()],
        }
    }

    fn answer(review: &AdmissionReview, allowed: bool) -> AdmissionReview {
        AdmissionReview {
            api_version: review.api_version.clone(),
            kind: "AdmissionReview".to_string(),
            request: None,
            response: Some(AdmissionResponse {
                uid: review.request.as_ref().unwrap().uid.clone(),
                allowed,
                audit_annotations: [("checked".to_string(), "yes".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn all_matching_webhooks_are_called() {
        let mut client = MockWebhookClient::new();
        client
            .expect_call()
            .times(2)
            .returning(|_, _, _, review| Ok(answer(review, true)));
        let mut other = hook("c.example.com");
        other.rules = vec![rule(&["gadgets"])];
        let dispatcher = ValidatingWebhookDispatcher::new(
            vec![hook("a.example.com"), hook("b.example.com"), other],
            Arc::new(client),
        );
        let attributes = widget_attributes(Operation::Create, Some(json!({})));
        dispatcher.validate(&attributes).await.unwrap();
        let annotations = attributes.annotations();
        assert_eq!(Some(&"yes".to_string()), annotations.get("a.example.com/checked"));
        assert_eq!(Some(&"yes".to_string()), annotations.get("b.example.com/checked"));
    }

    #[tokio::test]
    async fn first_rejection_wins() {
        let mut client = MockWebhookClient::new();
        client
            .expect_call()
            .returning(|webhook, _, _, review| Ok(answer(review, webhook == "a.example.com")));
        let dispatcher = ValidatingWebhookDispatcher::new(
            vec![hook("a.example.com"), hook("b.example.com"), hook("c.example.com")],
            Arc::new(client),
        );
        let attributes = widget_attributes(Operation::Create, Some(json!({})));
        let err = dispatcher.validate(&attributes).await.unwrap_err();
        assert_eq!(
            "admission webhook \"b.example.com\" denied the request without explanation",
            err.to_string()
        );
    }

    #[tokio::test]
    async fn unreachable_webhooks_follow_failure_policy() {
        let mut client = MockWebhookClient::new();
        client
            .expect_call()
            .returning(|webhook, _, _, _| Err(AdmissionError::Timeout(webhook.to_string())));
        let mut ignored = hook("a.example.com");
        ignored.failure_policy = Some(FailurePolicy::Ignore);
        let client = Arc::new(client);
        let attributes = widget_attributes(Operation::Create, Some(json!({})));
        ValidatingWebhookDispatcher::new(vec![ignored], client.clone())
            .validate(&attributes)
            .await
            .unwrap();
        let err = ValidatingWebhookDispatcher::new(vec![hook("b.example.com")], client)
            .validate(&attributes)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Timeout(_)));
        assert_eq!(504, err.status().code);

        let mut refused = MockWebhookClient::new();
        refused.expect_call().returning(|webhook, _, _, _| {
            Err(AdmissionError::CallingWebhook {
                webhook: webhook.to_string(),
                message: "connection refused".to_string(),
            })
        });
        let err = ValidatingWebhookDispatcher::new(vec![hook("c.example.com")], Arc::new(refused))
            .validate(&attributes)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Internal(_)));
        assert_eq!(500, err.status().code);
    }
}
