use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use opentelemetry::{
    KeyValue,
    global::{self},
    metrics::{Counter, Histogram, Meter},
};
use serde_json::Value;

pub(crate) fn metric_name(name: &str) -> String {
    format!("apiextensions_{}", name)
}

/// Current time in the RFC 3339 format used by Kubernetes timestamps.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Mutable access to `metadata` of a JSON object, creating it if missing.
pub(crate) fn metadata_mut(obj: &mut Value) -> Option<&mut serde_json::Map<String, Value>> {
    let obj = obj.as_object_mut()?;
    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    if !metadata.is_object() {
        *metadata = Value::Object(Default::default());
    }
    metadata.as_object_mut()
}

pub(crate) fn set_metadata_field(obj: &mut Value, field: &str, value: Value) {
    if let Some(metadata) = metadata_mut(obj) {
        metadata.insert(field.to_string(), value);
    }
}

pub(crate) fn metadata_str<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.get("metadata")
        .and_then(|m| m.get(field))
        .and_then(|v| v.as_str())
}

/// The resource version of a stored JSON object, `0` if it has none.
pub(crate) fn resource_version(obj: &Value) -> u64 {
    metadata_str(obj, "resourceVersion")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Sync metrics shared by all controllers, labelled by controller name.
#[derive(Clone)]
pub(crate) struct ControllerMetrics {
    controller: &'static str,
    sync_count: Counter<u64>,
    sync_errors: Counter<u64>,
    sync_duration: Histogram<u64>,
}

impl ControllerMetrics {
    pub fn new(controller: &'static str) -> Self {
        let meter: Meter = global::meter("apiextensions_controllers");
        let sync_count = meter
            .u64_counter(metric_name("controller_sync_count"))
            .with_description("Count of controller sync invocations")
            .build();
        let sync_errors = meter
            .u64_counter(metric_name("controller_sync_error_count"))
            .with_description("Count of failed controller sync invocations")
            .build();
        let sync_duration = meter
            .u64_histogram(metric_name("controller_sync_duration_ms"))
            .with_description("Controller sync duration in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            controller,
            sync_count,
            sync_errors,
            sync_duration,
        }
    }

    pub fn record(&self, start: Instant, failed: bool) {
        let labels = [KeyValue::new("controller", self.controller)];
        self.sync_count.add(1, &labels);
        if failed {
            self.sync_errors.add(1, &labels);
        }
        self.sync_duration
            .record(start.elapsed().as_millis() as u64, &labels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_helpers() {
        let mut obj = json!({"spec": {}});
        set_metadata_field(&mut obj, "resourceVersion", json!("42"));
        assert_eq!(Some("42"), metadata_str(&obj, "resourceVersion"));
        assert_eq!(42, resource_version(&obj));
        assert_eq!(0, resource_version(&json!({})));
    }
}
