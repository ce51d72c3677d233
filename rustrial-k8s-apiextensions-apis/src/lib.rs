use std::cmp::Ordering;

use chrono::{SecondsFormat, Utc};
use kube::{CustomResource, ResourceExt};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod admission;

pub const API_GROUP: &'static str = "apiextensions.k8s.io";

pub const API_VERSION: &'static str = "v1";

/// Finalizer blocking removal of a [`CustomResourceDefinition`] until all its
/// custom resource instances are gone.
///
/// Note, changing the finalizer name is a breaking change, objects persisted
/// with the old name would never be released.
pub const CUSTOM_RESOURCE_CLEANUP_FINALIZER: &'static str =
    "customresourcecleanup.apiextensions.k8s.io";

/// Condition type: the names in `spec.names` are accepted (no conflicts).
pub const NAMES_ACCEPTED: &'static str = "NamesAccepted";
/// Condition type: the API is served.
pub const ESTABLISHED: &'static str = "Established";
/// Condition type: the definition is being deleted.
pub const TERMINATING: &'static str = "Terminating";

pub const CONDITION_TRUE: &'static str = "True";
pub const CONDITION_FALSE: &'static str = "False";
pub const CONDITION_UNKNOWN: &'static str = "Unknown";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    #[serde(default)]
    pub message: String,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition.
    #[serde(default)]
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: impl Into<String>) -> Self {
        Self {
            last_transition_time: None,
            message: message.into(),
            reason: reason.to_string(),
            status: status
                .map(|v| if v { CONDITION_TRUE } else { CONDITION_FALSE })
                .unwrap_or(CONDITION_UNKNOWN)
                .to_string(),
            type_: tpe.to_string(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == CONDITION_TRUE
    }

    /// Two conditions are equivalent if they only differ in their transition time.
    pub fn is_equivalent(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Whether the custom resources of a definition live in a namespace or at cluster level.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ResourceScope {
    Namespaced,
    Cluster,
}

impl Default for ResourceScope {
    fn default() -> Self {
        Self::Namespaced
    }
}

/// Schema object causing the API server to serve a new resource type.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apiextensions.k8s.io",
    version = "v1",
    kind = "CustomResourceDefinition",
    plural = "customresourcedefinitions",
    shortname = "crd",
    shortname = "crds",
    derive = "PartialEq",
    status = "CustomResourceDefinitionStatus",
    printcolumn = r#"{
        "name":"Established",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Established\")].status",
        "description": "Whether the API of the custom resource is served."
    }"#
)]
pub struct CustomResourceDefinitionSpec {
    /// The API group of the custom resources, `metadata.name` must be `<plural>.<group>`.
    pub group: String,
    /// The resource and kind names of the custom resources.
    pub names: CustomResourceDefinitionNames,
    /// Whether the custom resources are cluster or namespace scoped.
    #[serde(default)]
    pub scope: ResourceScope,
    /// All versions of the custom resources, exactly one of them must be the storage version.
    pub versions: Vec<CustomResourceDefinitionVersion>,
}

/// The names used to serve a custom resource.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomResourceDefinitionNames {
    /// Plural resource name used in the URL path, e.g. `/apis/<group>/<version>/.../<plural>`.
    pub plural: String,
    /// Singular name, defaults to the lowercased kind.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub singular: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
    pub kind: String,
    /// Defaults to `<kind>List`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub list_kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

impl CustomResourceDefinitionNames {
    pub fn singular(&self) -> String {
        if self.singular.is_empty() {
            self.kind.to_lowercase()
        } else {
            self.singular.clone()
        }
    }

    pub fn list_kind(&self) -> String {
        if self.list_kind.is_empty() {
            format!("{}List", self.kind)
        } else {
            self.list_kind.clone()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceDefinitionVersion {
    pub name: String,
    /// Whether this version is served through the REST API.
    pub served: bool,
    /// Whether objects are persisted in this version.
    pub storage: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<CustomResourceValidation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subresources: Option<CustomResourceSubresources>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct CustomResourceValidation {
    #[serde(
        rename = "openAPIV3Schema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub open_api_v3_schema: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct CustomResourceSubresources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CustomResourceSubresourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<CustomResourceSubresourceScale>,
}

/// Enables the `/status` subresource, its presence is the switch.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct CustomResourceSubresourceStatus {}

/// Enables the `/scale` subresource by mapping the replica fields of the custom resource.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceSubresourceScale {
    /// JSON path like `.spec.replicas`.
    pub spec_replicas_path: String,
    /// JSON path like `.status.replicas`.
    pub status_replicas_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomResourceDefinitionStatus {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// The names actually being served, which might differ from `spec.names`
    /// while conflicting names are being resolved.
    pub accepted_names: CustomResourceDefinitionNames,
    /// All versions objects were ever persisted with.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stored_versions: Vec<String>,
}

impl CustomResourceDefinitionStatus {
    pub fn find_condition(&self, tpe: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == tpe)
    }

    /// Sets the condition, preserving the position of an existing condition of
    /// the same type. The transition time only moves if the status changes.
    pub fn set_condition(&mut self, mut c: Condition) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Some(existing) = self.conditions.iter_mut().find(|e| e.type_ == c.type_) {
            if existing.status != c.status || existing.last_transition_time.is_none() {
                existing.last_transition_time = Some(now);
            }
            existing.status = c.status;
            existing.reason = c.reason;
            existing.message = c.message;
        } else {
            c.last_transition_time = Some(now);
            self.conditions.push(c);
        }
    }

    pub fn remove_condition(&mut self, tpe: &str) {
        self.conditions.retain(|c| c.type_ != tpe);
    }

    pub fn is_stored_version(&self, version: &str) -> bool {
        self.stored_versions.iter().any(|v| v == version)
    }
}

impl CustomResourceDefinition {
    /// The expected `metadata.name` of a definition.
    pub fn expected_name(spec: &CustomResourceDefinitionSpec) -> String {
        format!("{}.{}", spec.names.plural, spec.group)
    }

    pub fn find_condition(&self, tpe: &str) -> Option<&Condition> {
        self.status.as_ref().map(|s| s.find_condition(tpe)).flatten()
    }

    pub fn is_condition_true(&self, tpe: &str) -> bool {
        self.find_condition(tpe).map_or(false, |c| c.is_true())
    }

    pub fn is_condition_false(&self, tpe: &str) -> bool {
        self.find_condition(tpe)
            .map_or(false, |c| c.status == CONDITION_FALSE)
    }

    pub fn set_condition(&mut self, c: Condition) {
        self.status.get_or_insert_with(Default::default).set_condition(c);
    }

    pub fn remove_condition(&mut self, tpe: &str) {
        if let Some(status) = self.status.as_mut() {
            status.remove_condition(tpe);
        }
    }

    pub fn accepted_names(&self) -> CustomResourceDefinitionNames {
        self.status
            .as_ref()
            .map(|s| s.accepted_names.clone())
            .unwrap_or_default()
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Returns `true` if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let finalizers = self.finalizers_mut();
        let len = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        finalizers.len() != len
    }

    pub fn version(&self, name: &str) -> Option<&CustomResourceDefinitionVersion> {
        self.spec.versions.iter().find(|v| v.name == name)
    }

    pub fn has_served_version(&self, name: &str) -> bool {
        self.version(name).map_or(false, |v| v.served)
    }

    pub fn served_versions(&self) -> impl Iterator<Item = &str> {
        self.spec
            .versions
            .iter()
            .filter(|v| v.served)
            .map(|v| v.name.as_str())
    }

    pub fn storage_version(&self) -> Option<&str> {
        self.spec
            .versions
            .iter()
            .find(|v| v.storage)
            .map(|v| v.name.as_str())
    }

    /// The version with the highest priority according to [`compare_kube_aware_versions`].
    pub fn preferred_version(&self) -> Option<&str> {
        self.spec
            .versions
            .iter()
            .map(|v| v.name.as_str())
            .max_by(|a, b| compare_kube_aware_versions(a, b))
    }

    pub fn has_status_subresource(&self, version: &str) -> bool {
        self.version(version)
            .map(|v| v.subresources.as_ref())
            .flatten()
            .map_or(false, |s| s.status.is_some())
    }

    pub fn scale_subresource(&self, version: &str) -> Option<&CustomResourceSubresourceScale> {
        self.version(version)
            .map(|v| v.subresources.as_ref())
            .flatten()
            .map(|s| s.scale.as_ref())
            .flatten()
    }

    pub fn schema(&self, version: &str) -> Option<&serde_json::Value> {
        self.version(version)
            .map(|v| v.schema.as_ref())
            .flatten()
            .map(|s| s.open_api_v3_schema.as_ref())
            .flatten()
    }
}

/// Parsed form of a version string following the Kubernetes conventions
/// `v<major>`, `v<major>beta<minor>` and `v<major>alpha<minor>`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum KubeVersion<'a> {
    Stable(u64),
    Beta(u64, u64),
    Alpha(u64, u64),
    Other(&'a str),
}

impl<'a> KubeVersion<'a> {
    fn parse(v: &'a str) -> Self {
        fn number(s: &str) -> Option<u64> {
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && !s.starts_with('0') {
                s.parse().ok()
            } else {
                None
            }
        }
        let Some(rest) = v.strip_prefix('v') else {
            return Self::Other(v);
        };
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        let Some(major) = number(&rest[..digits]) else {
            return Self::Other(v);
        };
        let qualifier = &rest[digits..];
        if qualifier.is_empty() {
            Self::Stable(major)
        } else if let Some(minor) = qualifier.strip_prefix("beta").map(number).flatten() {
            Self::Beta(major, minor)
        } else if let Some(minor) = qualifier.strip_prefix("alpha").map(number).flatten() {
            Self::Alpha(major, minor)
        } else {
            Self::Other(v)
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Stable(_) => 3,
            Self::Beta(..) => 2,
            Self::Alpha(..) => 1,
            Self::Other(_) => 0,
        }
    }
}

/// Compares two version strings by Kubernetes priority: GA before beta before
/// alpha before anything else; higher numbers first within the same class;
/// non-conforming strings compare reverse-alphabetically so that `a` wins over `b`.
///
/// Returns [`Ordering::Greater`] if `a` has the higher priority.
pub fn compare_kube_aware_versions(a: &str, b: &str) -> Ordering {
    let (va, vb) = (KubeVersion::parse(a), KubeVersion::parse(b));
    match va.rank().cmp(&vb.rank()) {
        Ordering::Equal => (),
        o => return o,
    }
    match (va, vb) {
        (KubeVersion::Stable(x), KubeVersion::Stable(y)) => x.cmp(&y),
        (KubeVersion::Beta(x1, x2), KubeVersion::Beta(y1, y2))
        | (KubeVersion::Alpha(x1, x2), KubeVersion::Alpha(y1, y2)) => (x1, x2).cmp(&(y1, y2)),
        (KubeVersion::Other(x), KubeVersion::Other(y)) => y.cmp(x),
        _ => Ordering::Equal,
    }
}

/// Kubernetes-style status object returned for failed requests and carried by
/// admission responses.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Status {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct StatusDetails {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<StatusCause>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(default)]
pub struct StatusCause {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub field: String,
}

impl Status {
    pub fn failure(code: i32, reason: &str, message: impl Into<String>) -> Self {
        Self {
            status: Some("Failure".to_string()),
            message: message.into(),
            reason: reason.to_string(),
            code,
            details: None,
        }
    }
}
