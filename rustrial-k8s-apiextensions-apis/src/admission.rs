//! Admission review wire types and webhook registrations.
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Status;

pub const ADMISSION_GROUP: &'static str = "admission.k8s.io";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

/// Operation matcher of a webhook rule, `*` matches every operation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationType {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "CONNECT")]
    Connect,
}

impl OperationType {
    pub fn matches(&self, op: Operation) -> bool {
        match (self, op) {
            (Self::All, _) => true,
            (Self::Create, Operation::Create)
            | (Self::Update, Operation::Update)
            | (Self::Delete, Operation::Delete)
            | (Self::Connect, Operation::Connect) => true,
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, Default)]
#[serde(default)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, Default)]
#[serde(default)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(default)]
pub struct UserInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// The body sent to and received from admission webhooks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AdmissionReview {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

impl AdmissionReview {
    pub fn new(api_version: &str, request: AdmissionRequest) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: "AdmissionReview".to_string(),
            request: Some(request),
            response: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub operation: Operation,
    #[serde(default)]
    pub user_info: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<serde_json::Value>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchType {
    #[serde(rename = "JSONPatch")]
    JsonPatch,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Raw JSON Patch, base64 encoded on the wire.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub patch: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<PatchType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub audit_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

mod base64_bytes {
    use super::*;
    use base64::{Engine, engine::general_purpose::STANDARD};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    Ignore,
    Fail,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SideEffectClass {
    Unknown,
    None,
    Some,
    NoneOnDryRun,
}

impl SideEffectClass {
    /// Whether a webhook of this class may be called for a dry-run request.
    pub fn supports_dry_run(&self) -> bool {
        matches!(self, Self::None | Self::NoneOnDryRun)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReinvocationPolicy {
    Never,
    IfNeeded,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleScope {
    Cluster,
    Namespaced,
    #[serde(rename = "*")]
    All,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuleWithOperations {
    pub operations: Vec<OperationType>,
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub api_versions: Vec<String>,
    /// Resources, optionally with subresource like `widgets/status`, `*/scale` or `*`.
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<RuleScope>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServiceReference {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WebhookClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,
    /// PEM encoded CA bundle, base64 encoded on the wire.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// An empty selector matches everything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| {
                let value = labels.get(&r.key);
                match r.operator {
                    LabelSelectorOperator::In => value.map_or(false, |v| r.values.contains(v)),
                    LabelSelectorOperator::NotIn => value.map_or(true, |v| !r.values.contains(v)),
                    LabelSelectorOperator::Exists => value.is_some(),
                    LabelSelectorOperator::DoesNotExist => value.is_none(),
                }
            })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MutatingWebhook {
    pub name: String,
    pub client_config: WebhookClientConfig,
    #[serde(default)]
    pub rules: Vec<RuleWithOperations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<SideEffectClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    #[serde(default)]
    pub admission_review_versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reinvocation_policy: Option<ReinvocationPolicy>,
}

impl MutatingWebhook {
    pub fn reinvocation_policy(&self) -> ReinvocationPolicy {
        self.reinvocation_policy.unwrap_or(ReinvocationPolicy::Never)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatingWebhook {
    pub name: String,
    pub client_config: WebhookClientConfig,
    #[serde(default)]
    pub rules: Vec<RuleWithOperations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<SideEffectClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    #[serde(default)]
    pub admission_review_versions: Vec<String>,
}

/// Static webhook registrations loaded at startup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AdmissionConfiguration {
    pub mutating_webhooks: Vec<MutatingWebhook>,
    pub validating_webhooks: Vec<ValidatingWebhook>,
}

impl AdmissionConfiguration {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_patch_is_base64() {
        let response: AdmissionResponse = serde_json::from_str(
            r#"{"uid":"1","allowed":true,"patch":"W10=","patchType":"JSONPatch","auditAnnotations":{"a":"b"}}"#,
        )
        .unwrap();
        assert_eq!(Some(b"[]".to_vec()), response.patch);
        assert_eq!(Some(PatchType::JsonPatch), response.patch_type);
        assert_eq!(Some(&"b".to_string()), response.audit_annotations.get("a"));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!("W10=", json["patch"]);
    }

    #[test]
    fn request_serialization() {
        let request = AdmissionRequest {
            uid: "u".to_string(),
            kind: GroupVersionKind {
                group: "example.com".to_string(),
                version: "v1".to_string(),
                kind: "Widget".to_string(),
            },
            resource: GroupVersionResource {
                group: "example.com".to_string(),
                version: "v1".to_string(),
                resource: "widgets".to_string(),
            },
            sub_resource: String::new(),
            name: "w".to_string(),
            namespace: "default".to_string(),
            operation: Operation::Create,
            user_info: Default::default(),
            object: Some(serde_json::json!({"a": 1})),
            old_object: None,
            dry_run: false,
        };
        let json = serde_json::to_value(&AdmissionReview::new("admission.k8s.io/v1", request)).unwrap();
        assert_eq!("CREATE", json["request"]["operation"]);
        assert_eq!("AdmissionReview", json["kind"]);
        assert_eq!(false, json["request"]["dryRun"]);
        assert!(json["request"].get("oldObject").is_none());
    }

    #[test]
    fn label_selector_matches() {
        let labels: BTreeMap<String, String> =
            [("env".to_string(), "prod".to_string())].into_iter().collect();
        assert!(LabelSelector::default().matches(&labels));
        let selector: LabelSelector = serde_json::from_str(
            r#"{"matchLabels":{"env":"prod"},"matchExpressions":[{"key":"tier","operator":"DoesNotExist"}]}"#,
        )
        .unwrap();
        assert!(selector.matches(&labels));
        let selector: LabelSelector = serde_json::from_str(
            r#"{"matchExpressions":[{"key":"env","operator":"NotIn","values":["prod"]}]}"#,
        )
        .unwrap();
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn admission_configuration_from_yaml() {
        let config = AdmissionConfiguration::from_yaml(
            r#"
mutatingWebhooks:
  - name: defaults.example.com
    clientConfig:
      url: https://defaults.example.com/mutate
    rules:
      - operations: ["CREATE", "UPDATE"]
        apiGroups: ["example.com"]
        apiVersions: ["*"]
        resources: ["widgets"]
    sideEffects: None
    reinvocationPolicy: IfNeeded
    admissionReviewVersions: ["v1"]
validatingWebhooks:
  - name: policy.example.com
    clientConfig:
      service:
        namespace: policy
        name: webhook
    failurePolicy: Ignore
"#,
        )
        .unwrap();
        assert_eq!(1, config.mutating_webhooks.len());
        let m = &config.mutating_webhooks[0];
        assert_eq!(ReinvocationPolicy::IfNeeded, m.reinvocation_policy());
        assert_eq!(vec![OperationType::Create, OperationType::Update], m.rules[0].operations);
        assert_eq!(Some(SideEffectClass::None), m.side_effects);
        let v = &config.validating_webhooks[0];
        assert_eq!(Some(FailurePolicy::Ignore), v.failure_policy);
        assert_eq!("webhook", v.client_config.service.as_ref().unwrap().name);
    }
}
