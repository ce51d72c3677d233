//! Feature gates, resolved once at startup.
use crate::errors::ConfigError;

const CUSTOM_RESOURCE_VALIDATION: &'static str = "CustomResourceValidation";
const CUSTOM_RESOURCE_SUBRESOURCES: &'static str = "CustomResourceSubresources";
const OPENAPI_AGGREGATION: &'static str = "OpenAPIAggregation";
const CUSTOM_RESOURCE_WEBHOOK_ADMISSION: &'static str = "CustomResourceWebhookAdmission";

/// Optional behavior of the server, every gate defaults to enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Capabilities {
    /// Validate custom resources against the `openAPIV3Schema` of their version.
    pub custom_resource_validation: bool,
    /// Serve the `status` and `scale` subresources.
    pub custom_resource_subresources: bool,
    /// Publish OpenAPI documents of established definitions.
    pub openapi_aggregation: bool,
    /// Run writes to custom resources through the admission webhooks.
    pub custom_resource_webhook_admission: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            custom_resource_validation: true,
            custom_resource_subresources: true,
            openapi_aggregation: true,
            custom_resource_webhook_admission: true,
        }
    }
}

impl Capabilities {
    /// Parses `Name=bool` pairs separated by commas, e.g.
    /// `CustomResourceValidation=false,OpenAPIAggregation=true`.
    pub fn from_feature_gates(gates: &str) -> Result<Self, ConfigError> {
        let mut capabilities = Self::default();
        for gate in gates.split(',').map(str::trim).filter(|g| !g.is_empty()) {
            let (name, value) = gate
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedFeatureGate(gate.to_string()))?;
            let (name, value) = (name.trim(), value.trim());
            let enabled: bool = value.parse().map_err(|_| ConfigError::InvalidFeatureGateValue {
                name: name.to_string(),
                value: value.to_string(),
            })?;
            let flag = match name {
                CUSTOM_RESOURCE_VALIDATION => &mut capabilities.custom_resource_validation,
                CUSTOM_RESOURCE_SUBRESOURCES => &mut capabilities.custom_resource_subresources,
                OPENAPI_AGGREGATION => &mut capabilities.openapi_aggregation,
                CUSTOM_RESOURCE_WEBHOOK_ADMISSION => {
                    &mut capabilities.custom_resource_webhook_admission
                }
                _ => return Err(ConfigError::UnknownFeatureGate(name.to_string())),
            };
            *flag = enabled;
        }
        Ok(capabilities)
    }
}
