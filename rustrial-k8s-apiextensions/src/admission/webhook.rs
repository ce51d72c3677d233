//! Selection of webhooks, review construction and the HTTP client calling them.
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use rustrial_k8s_apiextensions_apis::admission::{
    ADMISSION_GROUP, AdmissionRequest, AdmissionResponse, AdmissionReview, FailurePolicy,
    LabelSelector, MutatingWebhook, PatchType, RuleScope, RuleWithOperations, SideEffectClass,
    ValidatingWebhook, WebhookClientConfig,
};
use url::Url;

#[cfg(test)]
use mockall::automock;

use super::Attributes;
use crate::errors::AdmissionError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_TIMEOUT_SECONDS: u64 = 1;
const MAX_TIMEOUT_SECONDS: u64 = 30;

/// Review versions understood by this server, in order of preference.
const SUPPORTED_REVIEW_VERSIONS: [&'static str; 2] = ["v1", "v1beta1"];

/// Common view on mutating and validating webhook registrations.
pub(crate) trait WebhookAccessor {
    fn name(&self) -> &str;
    fn client_config(&self) -> &WebhookClientConfig;
    fn rules(&self) -> &[RuleWithOperations];
    fn failure_policy(&self) -> FailurePolicy;
    fn namespace_selector(&self) -> Option<&LabelSelector>;
    fn side_effects(&self) -> Option<SideEffectClass>;
    fn timeout_seconds(&self) -> Option<i32>;
    fn admission_review_versions(&self) -> &[String];

    /// Call timeout, 10s unless configured, bounded to 1..30s.
    fn timeout(&self) -> Duration {
        self.timeout_seconds()
            .map(|s| Duration::from_secs((s.max(0) as u64).clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS)))
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

macro_rules! webhook_accessor {
    ($t:ty) => {
        impl WebhookAccessor for $t {
            fn name(&self) -> &str {
                &self.name
            }

            fn client_config(&self) -> &WebhookClientConfig {
                &self.client_config
            }

            fn rules(&self) -> &[RuleWithOperations] {
                &self.rules
            }

            fn failure_policy(&self) -> FailurePolicy {
                self.failure_policy.unwrap_or(FailurePolicy::Fail)
            }

            fn namespace_selector(&self) -> Option<&LabelSelector> {
                self.namespace_selector.as_ref()
            }

            fn side_effects(&self) -> Option<SideEffectClass> {
                self.side_effects
            }

            fn timeout_seconds(&self) -> Option<i32> {
                self.timeout_seconds
            }

            fn admission_review_versions(&self) -> &[String] {
                &self.admission_review_versions
            }
        }
    };
}

webhook_accessor!(MutatingWebhook);
webhook_accessor!(ValidatingWebhook);

fn exact_or_wildcard(items: &[String], requested: &str) -> bool {
    items.iter().any(|i| i == "*" || i == requested)
}

fn is_namespace_request(attributes: &Attributes) -> bool {
    attributes.resource.group.is_empty()
        && attributes.resource.version == "v1"
        && attributes.resource.resource == "namespaces"
}

pub(crate) fn rule_matches(rule: &RuleWithOperations, attributes: &Attributes) -> bool {
    let scope = match rule.scope.unwrap_or(RuleScope::All) {
        RuleScope::All => true,
        RuleScope::Namespaced => !is_namespace_request(attributes) && !attributes.namespace.is_empty(),
        RuleScope::Cluster => is_namespace_request(attributes) || attributes.namespace.is_empty(),
    };
    let resource = rule.resources.iter().any(|r| {
        let (res, sub) = r.split_once('/').unwrap_or((r.as_str(), ""));
        (res == "*" || res == attributes.resource.resource)
            && (sub == "*" || sub == attributes.subresource)
    });
    scope
        && rule.operations.iter().any(|op| op.matches(attributes.operation))
        && exact_or_wildcard(&rule.api_groups, &attributes.resource.group)
        && exact_or_wildcard(&rule.api_versions, &attributes.resource.version)
        && resource
}

/// Cluster scoped requests always match, namespace objects are matched by
/// their own labels.
fn namespace_matches(selector: Option<&LabelSelector>, attributes: &Attributes) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    if is_namespace_request(attributes) {
        let labels = attributes
            .object
            .as_ref()
            .or(attributes.old_object.as_ref())
            .and_then(|o| serde_json::from_value(o["metadata"]["labels"].clone()).ok())
            .unwrap_or_default();
        return selector.matches(&labels);
    }
    attributes.namespace.is_empty() || selector.matches(&attributes.namespace_labels)
}

/// Whether `hook` has to be called for the request.
pub(crate) fn should_call_hook(hook: &dyn WebhookAccessor, attributes: &Attributes) -> bool {
    hook.rules().iter().any(|r| rule_matches(r, attributes))
        && namespace_matches(hook.namespace_selector(), attributes)
}

/// Fails dry-run requests for webhooks that might have side effects.
pub(crate) fn check_dry_run(hook: &dyn WebhookAccessor, attributes: &Attributes) -> Result<(), AdmissionError> {
    if !attributes.dry_run {
        return Ok(());
    }
    match hook.side_effects() {
        None => Err(AdmissionError::CallingWebhook {
            webhook: hook.name().to_string(),
            message: "Webhook SideEffects is nil".to_string(),
        }),
        Some(s) if s.supports_dry_run() => Ok(()),
        Some(_) => Err(AdmissionError::DryRunUnsupported(hook.name().to_string())),
    }
}

/// The review sent to `hook`, in the first review version it accepts.
pub(crate) fn create_admission_review(
    hook: &dyn WebhookAccessor,
    attributes: &Attributes,
) -> Result<AdmissionReview, AdmissionError> {
    let version = hook
        .admission_review_versions()
        .iter()
        .find(|v| SUPPORTED_REVIEW_VERSIONS.contains(&v.as_str()))
        .ok_or_else(|| AdmissionError::CallingWebhook {
            webhook: hook.name().to_string(),
            message: format!(
                "webhook does not accept known AdmissionReview versions {:?}",
                SUPPORTED_REVIEW_VERSIONS
            ),
        })?;
    let request = AdmissionRequest {
        uid: uuid::Uuid::new_v4().to_string(),
        kind: attributes.kind.clone(),
        resource: attributes.resource.clone(),
        sub_resource: attributes.subresource.clone(),
        name: attributes.name.clone(),
        namespace: attributes.namespace.clone(),
        operation: attributes.operation,
        user_info: attributes.user_info.clone(),
        object: attributes.object.clone(),
        old_object: attributes.old_object.clone(),
        dry_run: attributes.dry_run,
    };
    Ok(AdmissionReview::new(
        &format!("{}/{}", ADMISSION_GROUP, version),
        request,
    ))
}

/// Checks the response of a webhook against the request it answers.
pub(crate) fn verify_admission_response(
    hook: &dyn WebhookAccessor,
    request: &AdmissionReview,
    review: AdmissionReview,
    mutating: bool,
) -> Result<AdmissionResponse, AdmissionError> {
    let invalid = |message: String| AdmissionError::CallingWebhook {
        webhook: hook.name().to_string(),
        message,
    };
    let uid = request.request.as_ref().map(|r| r.uid.as_str()).unwrap_or_default();
    let v1 = format!("{}/v1", ADMISSION_GROUP);
    if request.api_version == v1
        && (review.api_version != v1 || review.kind != "AdmissionReview")
    {
        return Err(invalid(format!(
            "expected webhook response of {}, Kind=AdmissionReview, got {}, Kind={}",
            v1, review.api_version, review.kind
        )));
    }
    let mut response = review
        .response
        .ok_or_else(|| invalid("webhook response was absent".to_string()))?;
    if request.api_version == v1 {
        if response.uid != uid {
            return Err(invalid(format!(
                "expected response.uid={:?}, got {:?}",
                uid, response.uid
            )));
        }
        let has_patch = response.patch.as_ref().map_or(false, |p| !p.is_empty());
        if has_patch && !mutating {
            return Err(invalid("validating webhook may not return response.patch".to_string()));
        }
        if has_patch && response.patch_type != Some(PatchType::JsonPatch) {
            return Err(invalid("webhook returned response.patch but not response.patchType".to_string()));
        }
    }
    if !mutating {
        response.patch = None;
        response.patch_type = None;
    }
    Ok(response)
}

/// Sends admission reviews to webhooks.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait WebhookClient: Send + Sync {
    async fn call(
        &self,
        webhook: &str,
        config: &WebhookClientConfig,
        timeout: Duration,
        review: &AdmissionReview,
    ) -> Result<AdmissionReview, AdmissionError>;
}

/// The URL a webhook is reached at.
pub(crate) fn webhook_url(config: &WebhookClientConfig) -> Result<Url, String> {
    match (&config.url, &config.service) {
        (Some(url), _) => Url::parse(url).map_err(|e| format!("invalid webhook URL {:?}: {}", url, e)),
        (None, Some(service)) => {
            let url = format!(
                "https://{}.{}.svc:{}{}",
                service.name,
                service.namespace,
                service.port.unwrap_or(443),
                service.path.as_deref().unwrap_or_default()
            );
            Url::parse(&url).map_err(|e| format!("invalid service reference {:?}: {}", url, e))
        }
        (None, None) => Err("webhook has neither url nor service".to_string()),
    }
}

/// `reqwest` based client, one connection pool per CA bundle.
#[derive(Default)]
pub(crate) struct ReqwestWebhookClient {
    clients: Mutex<HashMap<Option<Vec<u8>>, reqwest::Client>>,
}

impl ReqwestWebhookClient {
    fn client(&self, ca_bundle: &Option<Vec<u8>>) -> Result<reqwest::Client, String> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(ca_bundle) {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(pem) = ca_bundle {
            for certificate in reqwest::Certificate::from_pem_bundle(pem)
                .map_err(|e| format!("invalid caBundle: {}", e))?
            {
                builder = builder.add_root_certificate(certificate);
            }
        }
        let client = builder.build().map_err(|e| e.to_string())?;
        clients.insert(ca_bundle.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl WebhookClient for ReqwestWebhookClient {
    async fn call(
        &self,
        webhook: &str,
        config: &WebhookClientConfig,
        timeout: Duration,
        review: &AdmissionReview,
    ) -> Result<AdmissionReview, AdmissionError> {
        let calling = |message: String| AdmissionError::CallingWebhook {
            webhook: webhook.to_string(),
            message,
        };
        let url = webhook_url(config).map_err(calling)?;
        let client = self.client(&config.ca_bundle).map_err(calling)?;
        let to_error = |e: reqwest::Error| {
            if e.is_timeout() {
                AdmissionError::Timeout(webhook.to_string())
            } else {
                calling(e.to_string())
            }
        };
        let response = client
            .post(url)
            .timeout(timeout)
            .json(review)
            .send()
            .await
            .map_err(to_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(calling(format!("the server responded with status {}", status)));
        }
        response.json::<AdmissionReview>().await.map_err(to_error)
    }
}
