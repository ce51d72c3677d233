//! Projection of a custom resource onto the `autoscaling/v1` `Scale` subresource.
use k8s_openapi::api::autoscaling::v1::{Scale, ScaleSpec, ScaleStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use rustrial_k8s_apiextensions_apis::CustomResourceSubresourceScale;
use serde_json::{Map, Value};

use crate::errors::ScaleError;

fn segments(path: &str) -> Vec<&str> {
    path.trim_start_matches('.')
        .split('.')
        .filter(|s| !s.is_empty())
        .collect()
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The value at `path`, `None` if a segment is missing.
fn nested<'a>(data: &'a Value, path: &str) -> Result<Option<&'a Value>, ScaleError> {
    let mut current = data;
    for segment in segments(path) {
        let Some(map) = current.as_object() else {
            return Err(ScaleError::NotAMap(path.to_string()));
        };
        match map.get(segment) {
            Some(v) => current = v,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn nested_i64(data: &Value, path: &str) -> Result<Option<i64>, ScaleError> {
    match nested(data, path)? {
        None => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| ScaleError::NotAnInteger {
            path: path.to_string(),
            value: v.to_string(),
            found: type_name(v),
        }),
    }
}

fn replicas(value: i64, path: &str) -> Result<i32, ScaleError> {
    i32::try_from(value).map_err(|_| ScaleError::ReplicasOutOfRange {
        path: path.to_string(),
        value,
    })
}

fn nested_string(data: &Value, path: &str) -> Result<Option<String>, ScaleError> {
    match nested(data, path)? {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(v) => Err(ScaleError::NotAString {
            path: path.to_string(),
            value: v.to_string(),
            found: type_name(v),
        }),
    }
}

fn set_nested(data: &mut Value, path: &str, value: Value) -> Result<(), ScaleError> {
    let segments = segments(path);
    let Some((last, parents)) = segments.split_last() else {
        return Err(ScaleError::NotAMap(path.to_string()));
    };
    let mut current = data;
    for segment in parents {
        let Some(map) = current.as_object_mut() else {
            return Err(ScaleError::NotAMap(path.to_string()));
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    match current.as_object_mut() {
        Some(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        None => Err(ScaleError::NotAMap(path.to_string())),
    }
}

/// Reads the scale of a custom resource. A missing spec or status replicas
/// field counts as `0`, negative spec replicas and counts beyond `i32` are
/// rejected.
pub(crate) fn scale_from_custom_resource(
    cr: &DynamicObject,
    paths: &CustomResourceSubresourceScale,
) -> Result<Scale, ScaleError> {
    let spec_replicas = nested_i64(&cr.data, &paths.spec_replicas_path)?.unwrap_or(0);
    if spec_replicas < 0 {
        return Err(ScaleError::NegativeReplicas(paths.spec_replicas_path.clone()));
    }
    let spec_replicas = replicas(spec_replicas, &paths.spec_replicas_path)?;
    let status_replicas = nested_i64(&cr.data, &paths.status_replicas_path)?.unwrap_or(0);
    let status_replicas = replicas(status_replicas, &paths.status_replicas_path)?;
    let selector = match paths.label_selector_path.as_deref() {
        Some(path) if !path.is_empty() => nested_string(&cr.data, path)?,
        _ => None,
    };
    Ok(Scale {
        metadata: ObjectMeta {
            name: cr.metadata.name.clone(),
            namespace: cr.metadata.namespace.clone(),
            uid: cr.metadata.uid.clone(),
            resource_version: cr.metadata.resource_version.clone(),
            creation_timestamp: cr.metadata.creation_timestamp.clone(),
            ..Default::default()
        },
        spec: Some(ScaleSpec {
            replicas: Some(spec_replicas),
        }),
        status: Some(ScaleStatus {
            replicas: status_replicas,
            selector,
        }),
    })
}

/// Writes the desired replicas of `scale` into the custom resource, the
/// resource version of the scale becomes the update precondition.
pub(crate) fn apply_scale(
    cr: &mut DynamicObject,
    paths: &CustomResourceSubresourceScale,
    scale: &Scale,
) -> Result<(), ScaleError> {
    let replicas = scale.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    if replicas < 0 {
        return Err(ScaleError::NegativeReplicas(paths.spec_replicas_path.clone()));
    }
    if !cr.data.is_object() {
        cr.data = Value::Object(Map::new());
    }
    set_nested(&mut cr.data, &paths.spec_replicas_path, Value::from(replicas as i64))?;
    if let Some(rv) = scale.metadata.resource_version.as_ref().filter(|rv| !rv.is_empty()) {
        cr.metadata.resource_version = Some(rv.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::widget;
    use serde_json::json;

    fn paths() -> CustomResourceSubresourceScale {
        CustomResourceSubresourceScale {
            spec_replicas_path: ".spec.replicas".to_string(),
            status_replicas_path: ".status.replicas".to_string(),
            label_selector_path: Some(".status.selector".to_string()),
        }
    }

    #[test]
    fn reads_scale() {
        let mut cr = widget(
            "w",
            json!({"spec": {"replicas": 3}, "status": {"replicas": 2, "selector": "app=w"}}),
        );
        cr.metadata.resource_version = Some("7".to_string());
        let scale = scale_from_custom_resource(&cr, &paths()).unwrap();
        assert_eq!(Some(3), scale.spec.unwrap().replicas);
        let status = scale.status.unwrap();
        assert_eq!(2, status.replicas);
        assert_eq!(Some("app=w".to_string()), status.selector);
        assert_eq!(Some("7".to_string()), scale.metadata.resource_version);
        assert_eq!(Some("default".to_string()), scale.metadata.namespace);
    }

    #[test]
    fn missing_replicas_default_to_zero() {
        let cr = widget("w", json!({"spec": {}}));
        let scale = scale_from_custom_resource(&cr, &paths()).unwrap();
        assert_eq!(Some(0), scale.spec.unwrap().replicas);
        let status = scale.status.unwrap();
        assert_eq!(0, status.replicas);
        assert_eq!(None, status.selector);
    }

    #[test]
    fn rejects_negative_and_mistyped_replicas() {
        let cr = widget("w", json!({"spec": {"replicas": -1}}));
        assert_eq!(
            ScaleError::NegativeReplicas(".spec.replicas".to_string()),
            scale_from_custom_resource(&cr, &paths()).unwrap_err()
        );
        let cr = widget("w", json!({"spec": {"replicas": "3"}}));
        assert!(matches!(
            scale_from_custom_resource(&cr, &paths()),
            Err(ScaleError::NotAnInteger { found: "string", .. })
        ));
        let cr = widget("w", json!({"spec": {"replicas": 1}, "status": {"selector": 1}}));
        assert!(matches!(
            scale_from_custom_resource(&cr, &paths()),
            Err(ScaleError::NotAString { .. })
        ));
    }

    #[test]
    fn rejects_replicas_beyond_int32() {
        let cr = widget("w", json!({"spec": {"replicas": 2147483648i64}}));
        assert_eq!(
            ScaleError::ReplicasOutOfRange {
                path: ".spec.replicas".to_string(),
                value: 2147483648,
            },
            scale_from_custom_resource(&cr, &paths()).unwrap_err()
        );
        let cr = widget(
            "w",
            json!({"spec": {"replicas": 1}, "status": {"replicas": 4294967297i64}}),
        );
        assert_eq!(
            ScaleError::ReplicasOutOfRange {
                path: ".status.replicas".to_string(),
                value: 4294967297,
            },
            scale_from_custom_resource(&cr, &paths()).unwrap_err()
        );
        let cr = widget("w", json!({"spec": {"replicas": 2147483647}}));
        let scale = scale_from_custom_resource(&cr, &paths()).unwrap();
        assert_eq!(Some(i32::MAX), scale.spec.unwrap().replicas);
    }

    #[test]
    fn writes_spec_replicas() {
        let mut cr = widget("w", json!({"status": {"replicas": 2}}));
        let mut scale = scale_from_custom_resource(&cr, &paths()).unwrap();
        scale.spec = Some(ScaleSpec { replicas: Some(5) });
        scale.metadata.resource_version = Some("9".to_string());
        apply_scale(&mut cr, &paths(), &scale).unwrap();
        assert_eq!(json!(5), cr.data["spec"]["replicas"]);
        assert_eq!(json!(2), cr.data["status"]["replicas"]);
        assert_eq!(Some("9".to_string()), cr.metadata.resource_version);

        scale.spec = Some(ScaleSpec { replicas: Some(-1) });
        assert!(apply_scale(&mut cr, &paths(), &scale).is_err());

        let mut cr = widget("w", json!({"spec": "oops"}));
        scale.spec = Some(ScaleSpec { replicas: Some(1) });
        assert_eq!(
            ScaleError::NotAMap(".spec.replicas".to_string()),
            apply_scale(&mut cr, &paths(), &scale).unwrap_err()
        );
    }
}
