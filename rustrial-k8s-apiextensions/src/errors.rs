use rustrial_k8s_apiextensions_apis::{Status, StatusCause, StatusDetails};

/// Extension methods to classify errors the way reconcilers care about.
pub(crate) trait ExtApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

/// Errors of the storage boundary.
#[derive(thiserror::Error, Debug)]
pub(crate) enum StorageError {
    #[error("key {0} not found")]
    NotFound(String),
    #[error("key {0} already exists")]
    AlreadyExists(String),
    /// Optimistic concurrency failure, the precondition did not hold.
    #[error("conflict on key {key}: {message}")]
    Conflict { key: String, message: String },
    /// A watch was started from (or fell behind to) a compacted resource version.
    #[error("too old resource version: {0}")]
    Expired(u64),
    /// The transform function of a guaranteed update rejected the object.
    #[error("{0}")]
    Aborted(Box<dyn std::error::Error + Send + Sync>),
    #[error("{0}")]
    Internal(String),
}

impl ExtApiError for StorageError {
    fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Internal(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FieldErrorKind {
    Required,
    Invalid,
    Duplicate,
    Forbidden,
    NotSupported,
}

impl FieldErrorKind {
    fn reason(&self) -> &'static str {
        match self {
            Self::Required => "FieldValueRequired",
            Self::Invalid => "FieldValueInvalid",
            Self::Duplicate => "FieldValueDuplicate",
            Self::Forbidden => "FieldValueForbidden",
            Self::NotSupported => "FieldValueNotSupported",
        }
    }
}

/// A validation error of a single field, e.g. `spec.versions[1].name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FieldError {
    pub kind: FieldErrorKind,
    pub field: String,
    pub detail: String,
}

impl FieldError {
    pub fn new(kind: FieldErrorKind, field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            detail: detail.into(),
        }
    }

    pub fn required(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::Required, field, detail)
    }

    pub fn invalid(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::Invalid, field, detail)
    }

    pub fn forbidden(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::Forbidden, field, detail)
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.kind {
            FieldErrorKind::Required => "Required value",
            FieldErrorKind::Invalid => "Invalid value",
            FieldErrorKind::Duplicate => "Duplicate value",
            FieldErrorKind::Forbidden => "Forbidden",
            FieldErrorKind::NotSupported => "Unsupported value",
        };
        if self.detail.is_empty() {
            write!(f, "{}: {}", self.field, what)
        } else {
            write!(f, "{}: {}: {}", self.field, what, self.detail)
        }
    }
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<String>>()
        .join(", ")
}

/// Errors of the REST layer, each maps to an HTTP status code.
#[derive(thiserror::Error, Debug)]
pub(crate) enum RegistryError {
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} \"{name}\" already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("Operation cannot be fulfilled on {kind} \"{name}\": {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },
    #[error("{kind} \"{name}\" is invalid: [{}]", join(.errors))]
    Invalid {
        kind: String,
        name: String,
        errors: Vec<FieldError>,
    },
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    MethodNotSupported(String),
    #[error("[{}]", join(.0))]
    Aggregate(Vec<RegistryError>),
    #[error("Internal error occurred: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn from_storage(e: StorageError, kind: &str, name: &str) -> Self {
        match e {
            StorageError::NotFound(_) => RegistryError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            StorageError::AlreadyExists(_) => RegistryError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            StorageError::Conflict { message, .. } => RegistryError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message,
            },
            StorageError::Aborted(inner) => match inner.downcast::<RegistryError>() {
                Ok(e) => *e,
                Err(other) => RegistryError::Internal(other.to_string()),
            },
            e @ StorageError::Expired(_) => RegistryError::Internal(e.to_string()),
            StorageError::Internal(message) => RegistryError::Internal(message),
        }
    }

    pub fn invalid(kind: &str, name: &str, errors: Vec<FieldError>) -> Self {
        RegistryError::Invalid {
            kind: kind.to_string(),
            name: name.to_string(),
            errors,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            RegistryError::NotFound { .. } => 404,
            RegistryError::AlreadyExists { .. } | RegistryError::Conflict { .. } => 409,
            RegistryError::Invalid { .. } => 422,
            RegistryError::BadRequest(_) => 400,
            RegistryError::Forbidden(_) => 403,
            RegistryError::MethodNotSupported(_) => 405,
            RegistryError::Aggregate(_) | RegistryError::Internal(_) => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            RegistryError::NotFound { .. } => "NotFound",
            RegistryError::AlreadyExists { .. } => "AlreadyExists",
            RegistryError::Conflict { .. } => "Conflict",
            RegistryError::Invalid { .. } => "Invalid",
            RegistryError::BadRequest(_) => "BadRequest",
            RegistryError::Forbidden(_) => "Forbidden",
            RegistryError::MethodNotSupported(_) => "MethodNotAllowed",
            RegistryError::Aggregate(_) | RegistryError::Internal(_) => "InternalError",
        }
    }

    /// The Kubernetes style status body of this error.
    pub fn status(&self) -> Status {
        let mut status = Status::failure(self.code() as i32, self.reason(), self.to_string());
        match self {
            RegistryError::NotFound { kind, name }
            | RegistryError::AlreadyExists { kind, name }
            | RegistryError::Conflict { kind, name, .. } => {
                status.details = Some(StatusDetails {
                    name: name.clone(),
                    kind: kind.clone(),
                    ..Default::default()
                });
            }
            RegistryError::Invalid { kind, name, errors } => {
                status.details = Some(StatusDetails {
                    name: name.clone(),
                    kind: kind.clone(),
                    causes: errors
                        .iter()
                        .map(|e| StatusCause {
                            reason: e.kind.reason().to_string(),
                            message: e.to_string(),
                            field: e.field.clone(),
                        })
                        .collect(),
                    ..Default::default()
                });
            }
            _ => (),
        }
        status
    }
}

impl ExtApiError for RegistryError {
    fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }

    fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict { .. })
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Internal(e.to_string())
    }
}

/// Errors of the reconciliation loops.
#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    #[error("{0}")]
    Registry(#[from] RegistryError),
    /// Custom resource instances could not (yet) be removed.
    #[error("{0}")]
    InstanceDeletion(String),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Any(String),
}

impl ExtApiError for ControllerError {
    fn is_not_found(&self) -> bool {
        match self {
            ControllerError::Registry(e) => e.is_not_found(),
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            ControllerError::Registry(e) => e.is_conflict(),
            _ => false,
        }
    }
}

/// Errors of the admission chain.
#[derive(thiserror::Error, Debug)]
pub(crate) enum AdmissionError {
    /// A webhook or in-process plugin rejected the request.
    #[error("{}", .status.message)]
    Denied { status: Status },
    #[error("admission webhook {0:?} does not support dry run")]
    DryRunUnsupported(String),
    /// The webhook could not be called or returned an unusable response.
    #[error("failed calling webhook {webhook:?}: {message}")]
    CallingWebhook { webhook: String, message: String },
    #[error("failed calling webhook {0:?}: timeout exceeded")]
    Timeout(String),
    #[error("Internal error occurred: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// Builds the rejection of a webhook, making sure the status is a failure
    /// with a code of at least 400 and a message naming the webhook.
    pub fn denied(webhook: &str, result: Option<Status>) -> Self {
        let denied_by = format!("admission webhook {:?} denied the request", webhook);
        let mut status = result.unwrap_or_default();
        if status.code < 400 {
            status.code = 400;
        }
        if status.status.as_deref().map_or(true, |s| s.is_empty() || s == "Success") {
            status.status = Some("Failure".to_string());
        }
        status.message = if !status.message.is_empty() {
            format!("{}: {}", denied_by, status.message)
        } else if !status.reason.is_empty() {
            format!("{}: {}", denied_by, status.reason)
        } else {
            format!("{} without explanation", denied_by)
        };
        AdmissionError::Denied { status }
    }

    /// Whether the error is a failure to reach the webhook, which is subject to
    /// the webhook's failure policy.
    pub fn is_calling_webhook(&self) -> bool {
        matches!(
            self,
            AdmissionError::CallingWebhook { .. } | AdmissionError::Timeout(_)
        )
    }

    /// The error surfaced when a failing webhook call rejects the request,
    /// timeouts keep their own status.
    pub fn fail_closed(self) -> Self {
        match self {
            AdmissionError::CallingWebhook { .. } => AdmissionError::Internal(self.to_string()),
            e => e,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            AdmissionError::Denied { status } => status.clone(),
            AdmissionError::DryRunUnsupported(_) => {
                Status::failure(400, "BadRequest", self.to_string())
            }
            AdmissionError::Timeout(_) => Status::failure(504, "Timeout", self.to_string()),
            AdmissionError::CallingWebhook { .. } | AdmissionError::Internal(_) => {
                Status::failure(500, "InternalError", self.to_string())
            }
        }
    }
}

/// Errors answering an API request.
#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

impl RequestError {
    pub fn status(&self) -> Status {
        match self {
            RequestError::Registry(e) => e.status(),
            RequestError::Admission(e) => e.status(),
        }
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(e: serde_json::Error) -> Self {
        RequestError::Registry(e.into())
    }
}

/// Fatal startup misconfiguration.
#[derive(thiserror::Error, Debug)]
pub(crate) enum ConfigError {
    #[error("unrecognized feature gate: {0}")]
    UnknownFeatureGate(String),
    #[error("missing bool value for feature gate {0:?}")]
    MalformedFeatureGate(String),
    #[error("invalid value of feature gate {name}={value}, expected true or false")]
    InvalidFeatureGateValue { name: String, value: String },
    #[error("invalid value {value:?} of {name}")]
    InvalidValue { name: String, value: String },
}

/// Errors reading or writing the scale subresource projection.
#[derive(thiserror::Error, Debug, PartialEq)]
pub(crate) enum ScaleError {
    #[error("{path} accessor error: {value} is of the type {found}, expected int64")]
    NotAnInteger {
        path: String,
        value: String,
        found: &'static str,
    },
    #[error("the spec replicas field {0:?} cannot be negative")]
    NegativeReplicas(String),
    #[error("the replicas field {path:?} must be less than or equal to 2147483647, got {value}")]
    ReplicasOutOfRange { path: String, value: i64 },
    #[error("{path} accessor error: {value} is of the type {found}, expected string")]
    NotAString {
        path: String,
        value: String,
        found: &'static str,
    },
    #[error("value cannot be set because {0} is not a map")]
    NotAMap(String),
}

impl From<ScaleError> for RegistryError {
    fn from(e: ScaleError) -> Self {
        RegistryError::BadRequest(e.to_string())
    }
}
