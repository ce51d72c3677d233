//! Swagger 2.0 documents for the served versions of custom resource definitions.
use k8s_openapi::{
    api::autoscaling::v1::Scale,
    apimachinery::pkg::apis::meta::v1::{ListMeta, ObjectMeta, Status},
};
use rustrial_k8s_apiextensions_apis::{CustomResourceDefinition, ResourceScope};
use schemars::r#gen::SchemaSettings;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

/// `example.com` becomes `com.example`.
fn reverse_group(group: &str) -> String {
    group.split('.').rev().collect::<Vec<_>>().join(".")
}

/// Name of the definition of `kind`, e.g. `com.example.v1.Widget`.
pub(crate) fn definition_name(group: &str, version: &str, kind: &str) -> String {
    format!("{}.{}.{}", reverse_group(group), version, kind)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn definition_ref(name: &str) -> Value {
    json!({ "$ref": format!("#/definitions/{}", name) })
}

fn path_parameter(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "in": "path",
        "required": true,
        "type": "string",
        "uniqueItems": true,
        "description": description,
    })
}

fn body_parameter(schema: &Value) -> Value {
    json!({ "name": "body", "in": "body", "required": true, "schema": schema })
}

fn operation(id: String, action: &str, parameters: Vec<Value>, responses: &[(&str, &Value)]) -> Value {
    let responses: Map<String, Value> = responses
        .iter()
        .map(|(code, schema)| {
            let description = if *code == "201" { "Created" } else { "OK" };
            (
                code.to_string(),
                json!({ "description": description, "schema": schema }),
            )
        })
        .chain(std::iter::once((
            "401".to_string(),
            json!({ "description": "Unauthorized" }),
        )))
        .collect();
    json!({
        "operationId": id,
        "consumes": ["application/json"],
        "produces": ["application/json"],
        "schemes": ["https"],
        "parameters": parameters,
        "responses": responses,
        "x-kubernetes-action": action,
    })
}

/// The Swagger 2.0 document of one served version of `crd`.
pub(crate) fn build_swagger(
    crd: &CustomResourceDefinition,
    version: &str,
) -> Result<Value, serde_json::Error> {
    let group = crd.spec.group.as_str();
    let names = &crd.spec.names;
    let namespaced = crd.spec.scope == ResourceScope::Namespaced;
    let list_kind = if names.list_kind.is_empty() {
        names.list_kind()
    } else {
        names.list_kind.clone()
    };
    let kind_name = definition_name(group, version, &names.kind);
    let list_name = definition_name(group, version, &list_kind);

    let mut settings = SchemaSettings::openapi3();
    settings.definitions_path = "#/definitions/".to_string();
    let mut generator = settings.into_generator();
    let object_meta = serde_json::to_value(generator.subschema_for::<ObjectMeta>())?;
    let list_meta = serde_json::to_value(generator.subschema_for::<ListMeta>())?;
    let status = serde_json::to_value(generator.subschema_for::<Status>())?;
    let scale = serde_json::to_value(generator.subschema_for::<Scale>())?;
    let mut definitions = serde_json::to_value(generator.take_definitions())?;

    let gvk = |kind: &str| json!([{ "group": group, "version": version, "kind": kind }]);
    let type_string = |description: &str| json!({ "type": "string", "description": description });
    let api_version = type_string("APIVersion defines the versioned schema of this representation of an object.");
    let kind = type_string("Kind is a string value representing the REST resource this object represents.");

    let mut kind_schema = crd
        .schema(version)
        .cloned()
        .unwrap_or_else(|| json!({ "type": "object" }));
    if let Some(schema) = kind_schema.as_object_mut() {
        schema.insert("type".to_string(), json!("object"));
        let properties = schema
            .entry("properties")
            .or_insert_with(|| json!({}));
        if let Some(properties) = properties.as_object_mut() {
            properties.insert("apiVersion".to_string(), api_version.clone());
            properties.insert("kind".to_string(), kind.clone());
            properties.insert("metadata".to_string(), object_meta);
        }
        schema.insert("x-kubernetes-group-version-kind".to_string(), gvk(&names.kind));
    }
    let list_schema = json!({
        "type": "object",
        "description": format!("{} is a list of {}", list_kind, names.kind),
        "required": ["items"],
        "properties": {
            "apiVersion": api_version,
            "kind": kind,
            "items": { "type": "array", "items": definition_ref(&kind_name) },
            "metadata": list_meta,
        },
        "x-kubernetes-group-version-kind": gvk(&list_kind),
    });
    if let Some(definitions) = definitions.as_object_mut() {
        definitions.insert(kind_name.clone(), kind_schema);
        definitions.insert(list_name.clone(), list_schema);
    }

    let kind_ref = definition_ref(&kind_name);
    let list_ref = definition_ref(&list_name);
    let op_id = |action: &str, suffix: &str| {
        let group_version: String = group
            .split(['.', '-'])
            .chain(std::iter::once(version))
            .map(capitalize)
            .collect();
        format!(
            "{}{}{}{}{}",
            action,
            group_version,
            if namespaced { "Namespaced" } else { "" },
            names.kind,
            suffix
        )
    };
    let mut collection_path = format!("/apis/{}/{}", group, version);
    let mut scope_parameters = Vec::new();
    if namespaced {
        collection_path.push_str("/namespaces/{namespace}");
        scope_parameters.push(path_parameter("namespace", "object name and auth scope, such as for teams and projects"));
    }
    collection_path.push('/');
    collection_path.push_str(&names.plural);
    let item_path = format!("{}/{{name}}", collection_path);
    let name_parameter = path_parameter("name", &format!("name of the {}", names.kind));
    let with = |extra: Vec<Value>| {
        let mut parameters = scope_parameters.clone();
        parameters.extend(extra);
        parameters
    };

    let mut paths = Map::new();
    paths.insert(
        collection_path,
        json!({
            "get": operation(op_id("list", ""), "list", with(vec![]), &[("200", &list_ref)]),
            "post": operation(op_id("create", ""), "post", with(vec![body_parameter(&kind_ref)]), &[("200", &kind_ref), ("201", &kind_ref)]),
            "delete": operation(op_id("deleteCollection", ""), "deletecollection", with(vec![]), &[("200", &status)]),
        }),
    );
    paths.insert(
        item_path.clone(),
        json!({
            "get": operation(op_id("read", ""), "get", with(vec![name_parameter.clone()]), &[("200", &kind_ref)]),
            "put": operation(op_id("replace", ""), "put", with(vec![name_parameter.clone(), body_parameter(&kind_ref)]), &[("200", &kind_ref), ("201", &kind_ref)]),
            "delete": operation(op_id("delete", ""), "delete", with(vec![name_parameter.clone()]), &[("200", &kind_ref)]),
        }),
    );
    if crd.has_status_subresource(version) {
        paths.insert(
            format!("{}/status", item_path),
            json!({
                "get": operation(op_id("read", "Status"), "get", with(vec![name_parameter.clone()]), &[("200", &kind_ref)]),
                "put": operation(op_id("replace", "Status"), "put", with(vec![name_parameter.clone(), body_parameter(&kind_ref)]), &[("200", &kind_ref), ("201", &kind_ref)]),
            }),
        );
    }
    if crd.scale_subresource(version).is_some() {
        paths.insert(
            format!("{}/scale", item_path),
            json!({
                "get": operation(op_id("read", "Scale"), "get", with(vec![name_parameter.clone()]), &[("200", &scale)]),
                "put": operation(op_id("replace", "Scale"), "put", with(vec![name_parameter, body_parameter(&scale)]), &[("200", &scale), ("201", &scale)]),
            }),
        );
    }

    Ok(json!({
        "swagger": "2.0",
        "info": { "title": "Kubernetes CRD Swagger", "version": "v0.1.0" },
        "paths": paths,
        "definitions": definitions,
    }))
}

/// Quoted hex SHA-256 of the serialized document.
pub(crate) fn etag(spec: &Value) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(spec.to_string().as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd_registry::tests::crd;
    use rustrial_k8s_apiextensions_apis::{
        CustomResourceSubresourceScale, CustomResourceSubresourceStatus, CustomResourceSubresources,
        CustomResourceValidation,
    };

    #[test]
    fn namespaced_document() {
        let mut c = crd("example.com", "widgets", "Widget");
        c.spec.versions[0].schema = Some(CustomResourceValidation {
            open_api_v3_schema: Some(json!({
                "type": "object",
                "properties": { "spec": { "type": "object" } },
            })),
        });
        let doc = build_swagger(&c, "v1").unwrap();
        assert_eq!("2.0", doc["swagger"]);
        let widget = &doc["definitions"]["com.example.v1.Widget"];
        assert_eq!("object", widget["properties"]["spec"]["type"]);
        assert_eq!(
            "#/definitions/io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta",
            widget["properties"]["metadata"]["$ref"]
        );
        assert_eq!("Widget", widget["x-kubernetes-group-version-kind"][0]["kind"]);
        assert!(doc["definitions"]["io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta"].is_object());
        assert_eq!(
            "#/definitions/com.example.v1.Widget",
            doc["definitions"]["com.example.v1.WidgetList"]["properties"]["items"]["items"]["$ref"]
        );
        let collection = &doc["paths"]["/apis/example.com/v1/namespaces/{namespace}/widgets"];
        assert_eq!("listExampleComV1NamespacedWidget", collection["get"]["operationId"]);
        assert!(doc["paths"]["/apis/example.com/v1/namespaces/{namespace}/widgets/{name}"]["put"].is_object());
        assert!(doc["paths"].get("/apis/example.com/v1/namespaces/{namespace}/widgets/{name}/status").is_none());
    }

    #[test]
    fn cluster_document_with_subresources() {
        let mut c = crd("example.com", "widgets", "Widget");
        c.spec.scope = ResourceScope::Cluster;
        c.spec.versions[0].subresources = Some(CustomResourceSubresources {
            status: Some(CustomResourceSubresourceStatus {}),
            scale: Some(CustomResourceSubresourceScale {
                spec_replicas_path: ".spec.replicas".to_string(),
                status_replicas_path: ".status.replicas".to_string(),
                label_selector_path: None,
            }),
        });
        let doc = build_swagger(&c, "v1").unwrap();
        assert_eq!(
            "readExampleComV1WidgetStatus",
            doc["paths"]["/apis/example.com/v1/widgets/{name}/status"]["get"]["operationId"]
        );
        assert_eq!(
            "#/definitions/io.k8s.api.autoscaling.v1.Scale",
            doc["paths"]["/apis/example.com/v1/widgets/{name}/scale"]["get"]["responses"]["200"]["schema"]["$ref"]
        );
        // no schema declared
        assert_eq!("object", doc["definitions"]["com.example.v1.Widget"]["type"]);
    }

    #[test]
    fn etag_follows_content() {
        let c = crd("example.com", "widgets", "Widget");
        let a = build_swagger(&c, "v1").unwrap();
        let b = build_swagger(&c, "v1").unwrap();
        assert_eq!(etag(&a), etag(&b));
        assert!(etag(&a).starts_with('"') && etag(&a).ends_with('"'));
        assert_eq!(66, etag(&a).len());
        let mut other = c.clone();
        other.spec.names.kind = "Gadget".to_string();
        assert_ne!(etag(&a), etag(&build_swagger(&other, "v1").unwrap()));
    }
}
