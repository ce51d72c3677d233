//! HTTP front end serving definitions, custom resources, discovery, the
//! aggregated OpenAPI document, health and metrics.
use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::{Bytes, Incoming},
    header::{CONTENT_TYPE, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use k8s_openapi::{
    api::autoscaling::v1::Scale,
    apimachinery::pkg::apis::meta::v1::{APIResource, APIResourceList},
};
use kube::{ResourceExt, core::DynamicObject};
use rustrial_k8s_apiextensions_apis::{
    API_GROUP, API_VERSION, CustomResourceDefinition, Status,
    admission::{GroupVersionKind, GroupVersionResource, Operation},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    admission::{AdmissionChain, Attributes},
    crd_handler::{CrdHandler, ServedResource},
    crd_registry::{CRD_RESOURCE, CrdRegistry},
    custom_resource::{CustomResourceStorage, served_names},
    errors::{ExtApiError, RegistryError, RequestError},
    openapi_controller::OpenApiAggregator,
    prometheus_exporter::metrics_response,
    registry::{DeleteOptions, GarbageCollectionPolicy, ListOptions, RestStore},
    storage::Preconditions,
};

type HttpResponse = Response<Full<Bytes>>;

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Healthz,
    Metrics,
    OpenApi,
    Discovery { group: &'a str, version: &'a str },
    Definitions { name: Option<&'a str>, status: bool },
    Resources(ResourcePath<'a>),
}

/// `/apis/{group}/{version}[/namespaces/{namespace}]/{plural}[/{name}[/{subresource}]]`
#[derive(Debug, PartialEq, Eq)]
struct ResourcePath<'a> {
    group: &'a str,
    version: &'a str,
    namespace: Option<&'a str>,
    plural: &'a str,
    name: Option<&'a str>,
    subresource: Option<&'a str>,
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/healthz" => return Some(Route::Healthz),
            "/metrics" => return Some(Route::Metrics),
            "/openapi/v2" => return Some(Route::OpenApi),
            _ => (),
        }
        let segments: Vec<&'a str> = path.trim_matches('/').split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        let ["apis", group, version, rest @ ..] = segments.as_slice() else {
            return None;
        };
        let (group, version) = (*group, *version);
        let (namespace, rest) = match rest {
            ["namespaces", namespace, rest @ ..] if !rest.is_empty() => (Some(*namespace), rest),
            _ => (None, rest),
        };
        let (plural, name, subresource) = match rest {
            [] => return Some(Route::Discovery { group, version }),
            [plural] => (*plural, None, None),
            [plural, name] => (*plural, Some(*name), None),
            [plural, name, subresource] => (*plural, Some(*name), Some(*subresource)),
            _ => return None,
        };
        if group == API_GROUP && version == API_VERSION && plural == CRD_RESOURCE {
            return match (namespace, subresource) {
                (None, None) => Some(Route::Definitions { name, status: false }),
                (None, Some("status")) => Some(Route::Definitions { name, status: true }),
                _ => None,
            };
        }
        Some(Route::Resources(ResourcePath {
            group,
            version,
            namespace,
            plural,
            name,
            subresource,
        }))
    }
}

/// Query parameters understood by the server.
#[derive(Debug, Default, PartialEq)]
struct Query {
    label_selector: Option<String>,
    field_selector: Option<String>,
    dry_run: bool,
    propagation_policy: Option<GarbageCollectionPolicy>,
}

fn parse_dry_run(value: &str) -> Result<bool, RegistryError> {
    match value {
        "All" => Ok(true),
        "" => Ok(false),
        other => Err(RegistryError::BadRequest(format!(
            "unsupported dry run value {:?}, supported values: All",
            other
        ))),
    }
}

fn parse_propagation_policy(value: &str) -> Result<GarbageCollectionPolicy, RegistryError> {
    match value {
        "Orphan" => Ok(GarbageCollectionPolicy::OrphanDependents),
        "Background" | "Foreground" => Ok(GarbageCollectionPolicy::DeleteDependents),
        other => Err(RegistryError::BadRequest(format!(
            "unsupported propagation policy {:?}",
            other
        ))),
    }
}

impl Query {
    fn parse(query: Option<&str>) -> Result<Self, RegistryError> {
        let mut result = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "labelSelector" => result.label_selector = Some(value.into_owned()),
                "fieldSelector" => result.field_selector = Some(value.into_owned()),
                "dryRun" => result.dry_run = parse_dry_run(&value)?,
                "propagationPolicy" => {
                    result.propagation_policy = Some(parse_propagation_policy(&value)?)
                }
                _ => (),
            }
        }
        Ok(result)
    }

    fn list_options(&self) -> ListOptions {
        ListOptions {
            label_selector: self.label_selector.clone(),
            field_selector: self.field_selector.clone(),
        }
    }

    /// Delete options from the query, overridden by a `DeleteOptions` body.
    fn delete_options(&self, body: &[u8]) -> Result<DeleteOptions, RegistryError> {
        let mut options = DeleteOptions {
            propagation_policy: self.propagation_policy,
            dry_run: self.dry_run,
            ..Default::default()
        };
        if body.is_empty() {
            return Ok(options);
        }
        let body: Value = serde_json::from_slice(body).map_err(|e| {
            RegistryError::BadRequest(format!("unable to decode delete options: {}", e))
        })?;
        let preconditions = &body["preconditions"];
        options.preconditions = Preconditions {
            uid: preconditions["uid"].as_str().map(str::to_string),
            resource_version: preconditions["resourceVersion"].as_str().map(str::to_string),
        };
        if let Some(policy) = body["propagationPolicy"].as_str() {
            options.propagation_policy = Some(parse_propagation_policy(policy)?);
        }
        for value in body["dryRun"].as_array().into_iter().flatten() {
            options.dry_run |= parse_dry_run(value.as_str().unwrap_or_default())?;
        }
        Ok(options)
    }
}

fn respond(code: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = code;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(code: StatusCode, body: &T) -> Result<HttpResponse, RequestError> {
    Ok(respond(code, "application/json", serde_json::to_vec(body)?))
}

/// A failure as a `meta/v1` `Status` object.
fn status_response(status: &Status) -> HttpResponse {
    let code = u16::try_from(status.code)
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = serde_json::to_value(status).unwrap_or_else(|_| json!({}));
    if let Some(fields) = body.as_object_mut() {
        fields.insert("kind".to_string(), json!("Status"));
        fields.insert("apiVersion".to_string(), json!("v1"));
    }
    respond(code, "application/json", body.to_string())
}

fn list_body<T: Serialize>(api_version: &str, kind: &str, items: &[T], resource_version: u64) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": { "resourceVersion": resource_version.to_string() },
        "items": items,
    })
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, RegistryError> {
    serde_json::from_slice(body)
        .map_err(|e| RegistryError::BadRequest(format!("unable to decode body: {}", e)))
}

/// `None` if the object does not exist.
fn existing<T>(result: Result<T, RegistryError>) -> Result<Option<T>, RegistryError> {
    match result {
        Ok(o) => Ok(Some(o)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn not_supported(method: &Method) -> RequestError {
    RegistryError::MethodNotSupported(format!("the server does not allow method {} here", method))
        .into()
}

fn not_found() -> RequestError {
    RegistryError::NotFound {
        kind: "resource".to_string(),
        name: String::new(),
    }
    .into()
}

fn definitions_discovery() -> APIResourceList {
    let kind = "CustomResourceDefinition".to_string();
    APIResourceList {
        group_version: format!("{}/{}", API_GROUP, API_VERSION),
        resources: vec![
            APIResource {
                name: CRD_RESOURCE.to_string(),
                singular_name: "customresourcedefinition".to_string(),
                namespaced: false,
                kind: kind.clone(),
                verbs: ["create", "delete", "deletecollection", "get", "list", "update"]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                short_names: Some(vec!["crd".to_string(), "crds".to_string()]),
                ..Default::default()
            },
            APIResource {
                name: format!("{}/status", CRD_RESOURCE),
                namespaced: false,
                kind,
                verbs: vec!["get".to_string(), "update".to_string()],
                ..Default::default()
            },
        ],
    }
}

fn status_store(storage: &CustomResourceStorage) -> Result<&RestStore<DynamicObject>, RegistryError> {
    storage.status.as_ref().ok_or_else(|| RegistryError::NotFound {
        kind: format!("{}/status", storage.api_resource.plural),
        name: String::new(),
    })
}

/// A custom resource request after routing.
struct ResourceRequest<'a> {
    path: ResourcePath<'a>,
    query: Query,
    body: &'a [u8],
    served: ServedResource,
}

impl ResourceRequest<'_> {
    fn storage(&self) -> &CustomResourceStorage {
        &self.served.storage
    }

    fn attributes(
        &self,
        operation: Operation,
        namespace: Option<&str>,
        name: &str,
        dry_run: bool,
    ) -> Attributes {
        let resource = &self.storage().api_resource;
        let mut attributes = Attributes::new(
            operation,
            GroupVersionKind {
                group: resource.group.clone(),
                version: resource.version.clone(),
                kind: resource.kind.clone(),
            },
            GroupVersionResource {
                group: resource.group.clone(),
                version: resource.version.clone(),
                resource: resource.plural.clone(),
            },
        );
        attributes.subresource = self.path.subresource.unwrap_or_default().to_string();
        attributes.namespace = namespace.unwrap_or_default().to_string();
        attributes.name = name.to_string();
        attributes.dry_run = dry_run;
        attributes
    }
}

pub(crate) struct ApiServer {
    crds: Arc<CrdRegistry>,
    handler: Arc<CrdHandler>,
    admission: AdmissionChain,
    openapi: Arc<OpenApiAggregator>,
    metrics: prometheus::Registry,
}

impl ApiServer {
    pub fn new(
        crds: Arc<CrdRegistry>,
        handler: Arc<CrdHandler>,
        admission: AdmissionChain,
        openapi: Arc<OpenApiAggregator>,
        metrics: prometheus::Registry,
    ) -> Self {
        Self {
            crds,
            handler,
            admission,
            openapi,
            metrics,
        }
    }

    /// Accepts connections until `cancel` fires.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on http://{}", addr);
        loop {
            let (stream, remote) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };
            let server = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.serve_request(request).await) }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Connection from {} failed: {}", remote, e);
                }
            });
        }
    }

    async fn serve_request(&self, request: Request<Incoming>) -> HttpResponse {
        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return status_response(&Status::failure(
                    400,
                    "BadRequest",
                    format!("unable to read body: {}", e),
                ));
            }
        };
        self.handle(&parts.method, &parts.uri, &body).await
    }

    pub async fn handle(&self, method: &Method, uri: &Uri, body: &[u8]) -> HttpResponse {
        let response = match Route::parse(uri.path()) {
            Some(route) => match self.route(route, method, uri.query(), body).await {
                Ok(response) => response,
                Err(e) => {
                    let status = e.status();
                    if status.code >= 500 {
                        error!("{} {} failed: {}", method, uri, e);
                    }
                    status_response(&status)
                }
            },
            None => status_response(&Status::failure(
                404,
                "NotFound",
                "the server could not find the requested resource",
            )),
        };
        debug!("{} {} {}", method, uri, response.status().as_u16());
        response
    }

    async fn route(
        &self,
        route: Route<'_>,
        method: &Method,
        query: Option<&str>,
        body: &[u8],
    ) -> Result<HttpResponse, RequestError> {
        match (route, method) {
            (Route::Healthz, &Method::GET) => Ok(respond(StatusCode::OK, "text/plain", "ok")),
            (Route::Metrics, &Method::GET) => Ok(metrics_response(&self.metrics)),
            (Route::OpenApi, &Method::GET) => json_response(StatusCode::OK, &*self.openapi.merged()),
            (Route::Discovery { group, version }, &Method::GET) => {
                let list = if group == API_GROUP && version == API_VERSION {
                    Some(definitions_discovery())
                } else {
                    self.handler.discovery(group, version)
                };
                match list {
                    Some(list) => json_response(StatusCode::OK, &list),
                    None => Err(not_found()),
                }
            }
            (Route::Definitions { name, status }, _) => {
                self.definitions(method, name, status, &Query::parse(query)?, body)
                    .await
            }
            (Route::Resources(path), _) => {
                let served = self.handler.resolve(path.group, path.version, path.plural)?;
                let request = ResourceRequest {
                    path,
                    query: Query::parse(query)?,
                    body,
                    served,
                };
                self.resources(method, &request).await
            }
            (_, method) => Err(not_supported(method)),
        }
    }

    async fn definitions(
        &self,
        method: &Method,
        name: Option<&str>,
        status: bool,
        query: &Query,
        body: &[u8],
    ) -> Result<HttpResponse, RequestError> {
        let store = if status {
            self.crds.status_store()
        } else {
            self.crds.store()
        };
        let api_version = format!("{}/{}", API_GROUP, API_VERSION);
        match (method, name) {
            (&Method::GET, Some(name)) => json_response(StatusCode::OK, &store.get(None, name).await?),
            (&Method::GET, None) if !status => {
                let (items, rv) = store.list(None, &query.list_options()).await?;
                let body = list_body(&api_version, "CustomResourceDefinitionList", &items, rv);
                json_response(StatusCode::OK, &body)
            }
            (&Method::POST, None) if !status => {
                let crd: CustomResourceDefinition = decode(body)?;
                let created = store.create(None, crd, query.dry_run).await?;
                info!("Created custom resource definition {}", created.name_any());
                json_response(StatusCode::CREATED, &created)
            }
            (&Method::PUT, Some(name)) => {
                let crd: CustomResourceDefinition = decode(body)?;
                json_response(StatusCode::OK, &store.update(None, name, crd, query.dry_run).await?)
            }
            (&Method::DELETE, Some(name)) if !status => {
                let options = query.delete_options(body)?;
                json_response(StatusCode::OK, &store.delete(None, name, &options).await?)
            }
            (&Method::DELETE, None) if !status => {
                let options = query.delete_options(body)?;
                let deleted = store
                    .delete_collection(None, &query.list_options(), &options)
                    .await?;
                let body = list_body(&api_version, "CustomResourceDefinitionList", &deleted, 0);
                json_response(StatusCode::OK, &body)
            }
            (method, _) => Err(not_supported(method)),
        }
    }

    async fn resources(
        &self,
        method: &Method,
        request: &ResourceRequest<'_>,
    ) -> Result<HttpResponse, RequestError> {
        let storage = request.storage();
        let path = &request.path;
        let scoped = if storage.namespaced {
            path.namespace.is_some() || path.name.is_none()
        } else {
            path.namespace.is_none()
        };
        if !scoped {
            return Err(not_found());
        }
        match (path.name, path.subresource) {
            (None, None) => self.collection(method, request).await,
            (Some(name), None) => self.item(method, request, &storage.store, name).await,
            (Some(name), Some("status")) => {
                self.item(method, request, status_store(storage)?, name).await
            }
            (Some(name), Some("scale")) => self.scale(method, request, name).await,
            _ => Err(not_found()),
        }
    }

    /// Runs the admission chain, returns the object as left by the mutating plugins.
    async fn admit<T: Serialize + DeserializeOwned>(
        &self,
        mut attributes: Attributes,
        object: Option<&T>,
        old_object: Option<&T>,
    ) -> Result<Option<T>, RequestError> {
        attributes.object = object.map(serde_json::to_value).transpose()?;
        attributes.old_object = old_object.map(serde_json::to_value).transpose()?;
        self.admission.run(&mut attributes).await?;
        match attributes.object {
            Some(value) if object.is_some() => Ok(Some(serde_json::from_value(value).map_err(|e| {
                RegistryError::BadRequest(format!("admitted object is invalid: {}", e))
            })?)),
            _ => Ok(None),
        }
    }

    async fn collection(
        &self,
        method: &Method,
        request: &ResourceRequest<'_>,
    ) -> Result<HttpResponse, RequestError> {
        let storage = request.storage();
        let namespace = request.path.namespace;
        let api_version = &storage.api_resource.api_version;
        let list_kind = served_names(&request.served.crd).list_kind();
        match *method {
            Method::GET => {
                let (items, rv) = storage.list(namespace, &request.query.list_options()).await?;
                json_response(StatusCode::OK, &list_body(api_version, &list_kind, &items, rv))
            }
            Method::POST => {
                request.served.check_create()?;
                let obj = storage.decode(request.body)?;
                let name = obj.metadata.name.clone().unwrap_or_default();
                let dry_run = request.query.dry_run;
                let attributes = request.attributes(Operation::Create, namespace, &name, dry_run);
                let admitted = self.admit(attributes, Some(&obj), None).await?;
                let obj = storage.convert(admitted.unwrap_or(obj));
                let created = storage.store.create(namespace, obj, dry_run).await?;
                json_response(StatusCode::CREATED, &storage.convert(created))
            }
            Method::DELETE => {
                let options = request.query.delete_options(request.body)?;
                let list_options = request.query.list_options();
                let (items, _) = storage.store.list(namespace, &list_options).await?;
                for item in &items {
                    let item_namespace = item.namespace();
                    let attributes = request.attributes(
                        Operation::Delete,
                        item_namespace.as_deref(),
                        &item.name_any(),
                        options.dry_run,
                    );
                    self.admit(attributes, None, Some(item)).await?;
                }
                let deleted = storage
                    .store
                    .delete_collection(namespace, &list_options, &options)
                    .await?;
                let deleted: Vec<DynamicObject> =
                    deleted.into_iter().map(|o| storage.convert(o)).collect();
                json_response(StatusCode::OK, &list_body(api_version, &list_kind, &deleted, 0))
            }
            _ => Err(not_supported(method)),
        }
    }

    async fn item(
        &self,
        method: &Method,
        request: &ResourceRequest<'_>,
        store: &RestStore<DynamicObject>,
        name: &str,
    ) -> Result<HttpResponse, RequestError> {
        let storage = request.storage();
        let namespace = request.path.namespace;
        match *method {
            Method::GET => {
                let obj = store.get(namespace, name).await?;
                json_response(StatusCode::OK, &storage.convert(obj))
            }
            Method::PUT => {
                let obj = storage.decode(request.body)?;
                let old = existing(store.get(namespace, name).await)?;
                let dry_run = request.query.dry_run;
                let attributes = request.attributes(Operation::Update, namespace, name, dry_run);
                let admitted = self.admit(attributes, Some(&obj), old.as_ref()).await?;
                let obj = storage.convert(admitted.unwrap_or(obj));
                let updated = store.update(namespace, name, obj, dry_run).await?;
                json_response(StatusCode::OK, &storage.convert(updated))
            }
            Method::DELETE if request.path.subresource.is_none() => {
                let options = request.query.delete_options(request.body)?;
                let old = store.get(namespace, name).await?;
                let attributes =
                    request.attributes(Operation::Delete, namespace, name, options.dry_run);
                self.admit(attributes, None, Some(&old)).await?;
                let deleted = store.delete(namespace, name, &options).await?;
                json_response(StatusCode::OK, &storage.convert(deleted))
            }
            _ => Err(not_supported(method)),
        }
    }

    async fn scale(
        &self,
        method: &Method,
        request: &ResourceRequest<'_>,
        name: &str,
    ) -> Result<HttpResponse, RequestError> {
        let storage = request.storage();
        let namespace = request.path.namespace;
        match *method {
            Method::GET => json_response(StatusCode::OK, &storage.get_scale(namespace, name).await?),
            Method::PUT => {
                let scale: Scale = decode(request.body)?;
                let old = existing(storage.get_scale(namespace, name).await)?;
                let dry_run = request.query.dry_run;
                let mut attributes = request.attributes(Operation::Update, namespace, name, dry_run);
                attributes.kind = GroupVersionKind {
                    group: "autoscaling".to_string(),
                    version: "v1".to_string(),
                    kind: "Scale".to_string(),
                };
                let admitted = self.admit(attributes, Some(&scale), old.as_ref()).await?;
                let scale = admitted.unwrap_or(scale);
                let updated = storage.update_scale(namespace, name, &scale, dry_run).await?;
                json_response(StatusCode::OK, &updated)
            }
            _ => Err(not_supported(method)),
        }
    }
}
