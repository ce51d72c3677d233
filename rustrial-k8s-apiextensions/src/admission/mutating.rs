use std::sync::Arc;

use async_trait::async_trait;
use rustrial_k8s_apiextensions_apis::admission::{
    FailurePolicy, MutatingWebhook, Operation, ReinvocationPolicy,
};

use super::{
    Attributes, MutationInterface,
    webhook::{
        WebhookAccessor, WebhookClient, check_dry_run, create_admission_review, should_call_hook,
        verify_admission_response,
    },
};
use crate::errors::AdmissionError;

/// Calls the mutating webhooks in registration order and applies their patches.
pub(crate) struct MutatingWebhookDispatcher {
    hooks: Vec<MutatingWebhook>,
    client: Arc<dyn WebhookClient>,
}

impl MutatingWebhookDispatcher {
    pub fn new(hooks: Vec<MutatingWebhook>, client: Arc<dyn WebhookClient>) -> Self {
        Self { hooks, client }
    }

    /// Calls one webhook, returns whether its patch changed the object.
    async fn call_hook(
        &self,
        hook: &MutatingWebhook,
        attributes: &mut Attributes,
    ) -> Result<bool, AdmissionError> {
        check_dry_run(hook, attributes)?;
        let request = create_admission_review(hook, attributes)?;
        let review = self
            .client
            .call(&hook.name, &hook.client_config, hook.timeout(), &request)
            .await?;
        let response = verify_admission_response(hook, &request, review, true)?;
        for (key, value) in &response.audit_annotations {
            if let Err(e) = attributes.add_annotation(&format!("{}/{}", hook.name, key), value) {
                warn!("Failed to set admission audit annotation of {}: {}", hook.name, e);
            }
        }
        for warning in &response.warnings {
            warn!("Admission webhook {} returned warning: {}", hook.name, warning);
        }
        if !response.allowed {
            return Err(AdmissionError::denied(&hook.name, response.status));
        }
        let Some(patch) = response.patch.filter(|p| !p.is_empty()) else {
            return Ok(false);
        };
        let patch: json_patch::Patch = serde_json::from_slice(&patch)
            .map_err(|e| AdmissionError::Internal(e.to_string()))?;
        if patch.0.is_empty() {
            return Ok(false);
        }
        let Some(object) = attributes.object.as_ref() else {
            return Err(AdmissionError::Internal(format!(
                "admission webhook {:?} attempted to modify the object, which is not supported for this operation",
                hook.name
            )));
        };
        let mut patched = object.clone();
        json_patch::patch(&mut patched, &patch)
            .map_err(|e| AdmissionError::Internal(e.to_string()))?;
        let changed = patched != *object;
        attributes.object = Some(patched);
        Ok(changed)
    }

    async fn dispatch(
        &self,
        hooks: &[&MutatingWebhook],
        attributes: &mut Attributes,
    ) -> Result<(), AdmissionError> {
        for hook in hooks {
            let context = attributes.reinvocation();
            if context.is_reinvoke() && !context.should_reinvoke_webhook(&hook.name) {
                continue;
            }
            let result = self.call_hook(hook, attributes).await;
            let context = attributes.reinvocation();
            if let Ok(true) = result {
                // Earlier webhooks saw an outdated object.
                context.require_reinvoking_previously_invoked();
                context.set_should_reinvoke();
            }
            if hook.reinvocation_policy() == ReinvocationPolicy::IfNeeded {
                context.add_reinvocable_webhook_to_previously_invoked(&hook.name);
            }
            match result {
                Ok(_) => {}
                Err(e) if e.is_calling_webhook() && hook.failure_policy() == FailurePolicy::Ignore => {
                    warn!("Failed calling webhook, failing open {}: {}", hook.name, e);
                }
                Err(e) if e.is_calling_webhook() => {
                    error!("Failed calling webhook, failing closed {}: {}", hook.name, e);
                    return Err(e.fail_closed());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MutationInterface for MutatingWebhookDispatcher {
    fn handles(&self, _operation: Operation) -> bool {
        true
    }

    async fn admit(&self, attributes: &mut Attributes) -> Result<(), AdmissionError> {
        let hooks: Vec<&MutatingWebhook> = self
            .hooks
            .iter()
            .filter(|h| should_call_hook(*h, &*attributes))
            .collect();
        if hooks.is_empty() {
            return Ok(());
        }
        let object = attributes.object.clone();
        let context = attributes.reinvocation();
        if context.is_reinvoke() && context.is_output_changed_since_last_webhook_invocation(object.as_ref()) {
            // In-process plugins changed the object since the webhooks ran.
            context.require_reinvoking_previously_invoked();
        }
        let result = self.dispatch(&hooks, attributes).await;
        let object = attributes.object.clone();
        attributes.reinvocation().set_last_webhook_output(object);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{
        AdmissionChain,
        tests::widget_attributes,
        webhook::{MockWebhookClient, tests::rule},
    };
    use base64::{Engine, engine::general_purpose::STANDARD};
    use rustrial_k8s_apiextensions_apis::admission::{
        AdmissionResponse, AdmissionReview, PatchType, SideEffectClass, WebhookClientConfig,
    };
    use serde_json::{Value, json};
    use std::sync::Mutex;

    fn hook(name: &str, reinvocation: ReinvocationPolicy) -> MutatingWebhook {
        MutatingWebhook {
            name: name.to_string(),
            client_config: WebhookClientConfig {
                url: Some(format!("https://{}/mutate", name)),
                ..Default::default()
            },
            rules: vec![rule(&["widgets"])],
            failure_policy: None,
            namespace_selector: None,
            side_effects: Some(SideEffectClass::None),
            timeout_seconds: None,
            admission_review_versions: vec!["v1".to_string()],
            reinvocation_policy: Some(reinvocation),
        }
    }

    /// The answer to `review`, allowing it with an optional JSON patch.
    fn allow(review: &AdmissionReview, patch: Option<Value>) -> AdmissionReview {
        AdmissionReview {
            api_version: review.api_version.clone(),
            kind: "AdmissionReview".to_string(),
            request: None,
            response: Some(AdmissionResponse {
                uid: review.request.as_ref().unwrap().uid.clone(),
                allowed: true,
                patch_type: patch.as_ref().map(|_| PatchType::JsonPatch),
                patch: patch.map(|p| p.to_string().into_bytes()),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn earlier_webhooks_are_reinvoked_once_after_a_mutation() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let mut client = MockWebhookClient::new();
        client.expect_call().returning(move |webhook, _, _, review| {
            recorded.lock().unwrap().push(webhook.to_string());
            let object = review.request.as_ref().unwrap().object.clone().unwrap();
            if webhook == "b.example.com" && object["spec"]["b"].is_null() {
                Ok(allow(review, Some(json!([{ "op": "add", "path": "/spec/b", "value": true }]))))
            } else {
                Ok(allow(review, None))
            }
        });
        let dispatcher = MutatingWebhookDispatcher::new(
            vec![
                hook("a.example.com", ReinvocationPolicy::IfNeeded),
                hook("b.example.com", ReinvocationPolicy::Never),
            ],
            Arc::new(client),
        );
        let chain = AdmissionChain::default().with_mutator(Arc::new(dispatcher));
        let mut attributes = widget_attributes(Operation::Create, Some(json!({ "spec": {} })));
        chain.admit(&mut attributes).await.unwrap();
        assert_eq!(
            vec!["a.example.com", "b.example.com", "a.example.com"],
            *calls.lock().unwrap()
        );
        assert_eq!(json!(true), attributes.object.unwrap()["spec"]["b"]);
    }

    #[tokio::test]
    async fn dry_run_is_refused_for_webhooks_with_side_effects() {
        let mut h = hook("a.example.com", ReinvocationPolicy::Never);
        h.side_effects = Some(SideEffectClass::Some);
        h.failure_policy = Some(FailurePolicy::Ignore);
        let mut client = MockWebhookClient::new();
        client.expect_call().times(0);
        let dispatcher = MutatingWebhookDispatcher::new(vec![h], Arc::new(client));
        let mut attributes = widget_attributes(Operation::Create, Some(json!({})));
        attributes.dry_run = true;
        let err = dispatcher.admit(&mut attributes).await.unwrap_err();
        assert!(matches!(err, AdmissionError::DryRunUnsupported(_)));
    }

    #[tokio::test]
    async fn failure_policy_decides_on_call_errors() {
        let failing = || {
            let mut client = MockWebhookClient::new();
            client.expect_call().returning(|webhook, _, _, _| {
                Err(AdmissionError::CallingWebhook {
                    webhook: webhook.to_string(),
                    message: "connection refused".to_string(),
                })
            });
            Arc::new(client)
        };
        let mut ignored = hook("a.example.com", ReinvocationPolicy::Never);
        ignored.failure_policy = Some(FailurePolicy::Ignore);
        let dispatcher = MutatingWebhookDispatcher::new(vec![ignored], failing());
        let mut attributes = widget_attributes(Operation::Create, Some(json!({})));
        dispatcher.admit(&mut attributes).await.unwrap();

        let dispatcher =
            MutatingWebhookDispatcher::new(vec![hook("a.example.com", ReinvocationPolicy::Never)], failing());
        let err = dispatcher.admit(&mut attributes).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Internal(_)));
        assert_eq!(500, err.status().code);

        let mut client = MockWebhookClient::new();
        client
            .expect_call()
            .returning(|webhook, _, _, _| Err(AdmissionError::Timeout(webhook.to_string())));
        let dispatcher = MutatingWebhookDispatcher::new(
            vec![hook("a.example.com", ReinvocationPolicy::Never)],
            Arc::new(client),
        );
        let err = dispatcher.admit(&mut attributes).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Timeout(_)));
        assert_eq!(504, err.status().code);
    }

    #[tokio::test]
    async fn rejections_and_annotations() {
        let mut client = MockWebhookClient::new();
        client.expect_call().returning(|_, _, _, review| {
            let mut answer = allow(review, None);
            let response = answer.response.as_mut().unwrap();
            response.audit_annotations.insert("reason".to_string(), "quota".to_string());
            response.allowed = false;
            response.status = Some(rustrial_k8s_apiextensions_apis::Status {
                message: "quota exceeded".to_string(),
                code: 403,
                ..Default::default()
            });
            Ok(answer)
        });
        let dispatcher = MutatingWebhookDispatcher::new(
            vec![hook("quota.example.com", ReinvocationPolicy::Never)],
            Arc::new(client),
        );
        let mut attributes = widget_attributes(Operation::Create, Some(json!({})));
        let err = dispatcher.admit(&mut attributes).await.unwrap_err();
        let status = err.status();
        assert_eq!(403, status.code);
        assert_eq!(
            "admission webhook \"quota.example.com\" denied the request: quota exceeded",
            status.message
        );
        assert_eq!(
            Some(&"quota".to_string()),
            attributes.annotations().get("quota.example.com/reason")
        );
    }

    #[tokio::test]
    async fn patches_without_object_are_internal_errors() {
        let mut client = MockWebhookClient::new();
        client.expect_call().returning(|_, _, _, review| {
            Ok(allow(review, Some(json!([{ "op": "add", "path": "/a", "value": 1 }]))))
        });
        let mut h = hook("a.example.com", ReinvocationPolicy::Never);
        h.rules[0].operations.push(rustrial_k8s_apiextensions_apis::admission::OperationType::Delete);
        let dispatcher = MutatingWebhookDispatcher::new(vec![h], Arc::new(client));
        let mut attributes = widget_attributes(Operation::Delete, None);
        let err = dispatcher.admit(&mut attributes).await.unwrap_err();
        assert!(err.to_string().contains("attempted to modify the object"));
    }

    #[test]
    fn patches_are_base64_on_the_wire() {
        let review = AdmissionReview {
            api_version: "admission.k8s.io/v1".to_string(),
            kind: "AdmissionReview".to_string(),
            request: None,
            response: Some(AdmissionResponse {
                patch: Some(b"[]".to_vec()),
                ..Default::default()
            }),
        };
        let json = serde_json::to_value(&review).unwrap();
        assert_eq!(STANDARD.encode(b"[]"), json["response"]["patch"]);
    }
}
