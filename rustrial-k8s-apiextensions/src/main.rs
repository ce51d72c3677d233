#[macro_use]
extern crate log;

use std::{net::SocketAddr, sync::Arc};

use admission::{
    AdmissionChain, MutatingWebhookDispatcher, ReqwestWebhookClient, ValidatingWebhookDispatcher,
    WebhookClient,
};
use apiserver::ApiServer;
use capabilities::Capabilities;
use crd_handler::CrdHandler;
use crd_registry::CrdRegistry;
use errors::ConfigError;
use establishing_controller::EstablishingController;
use finalizer_controller::CrdFinalizer;
use informer::{CrdLister, Informer};
use naming_controller::NamingController;
use openapi_controller::{AggregationManager, OpenApiAggregator, OpenApiController};
use prometheus_exporter::init_meter_provider;
use rustrial_k8s_apiextensions_apis::{CustomResourceDefinition, admission::AdmissionConfiguration};
use storage::MemoryStorage;
use tokio_util::sync::CancellationToken;

mod admission;
mod apiserver;
mod capabilities;
mod crd_handler;
mod crd_modifications;
mod crd_registry;
mod custom_resource;
mod errors;
mod establishing_controller;
mod finalizer_controller;
mod informer;
mod naming_controller;
mod openapi_builder;
mod openapi_controller;
mod prometheus_exporter;
mod registry;
mod scale;
mod storage;
mod utils;
mod workqueue;

#[derive(Clone, Debug)]
struct Configuration {
    listen_addr: SocketAddr,
    finalizer_workers: usize,
    master_count: usize,
    admission: AdmissionConfiguration,
    capabilities: Capabilities,
}

impl Configuration {
    pub fn from_env() -> anyhow::Result<Self> {
        let addr = env_var("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = env_var("LISTEN_PORT").unwrap_or_else(|| "8080".to_string());
        let listen_addr = format!("{}:{}", addr, port)
            .parse()
            .map_err(|_| invalid("LISTEN_ADDR/LISTEN_PORT", &format!("{}:{}", addr, port)))?;
        let finalizer_workers = parse_count("FINALIZER_WORKERS", 5)?;
        let master_count = parse_count("MASTER_COUNT", 1)?;
        let admission = match env_var("ADMISSION_CONFIG") {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                AdmissionConfiguration::from_yaml(&text)?
            }
            None => AdmissionConfiguration::default(),
        };
        let capabilities = match env_var("FEATURE_GATES") {
            Some(gates) => Capabilities::from_feature_gates(&gates)?,
            None => Capabilities::default(),
        };
        Ok(Configuration {
            listen_addr,
            finalizer_workers,
            master_count,
            admission,
            capabilities,
        })
    }

    /// The mutating and validating webhooks, if webhook admission is enabled.
    fn admission_chain(&self) -> AdmissionChain {
        if !self.capabilities.custom_resource_webhook_admission {
            info!("Webhook admission of custom resources is disabled");
            return AdmissionChain::default();
        }
        let client: Arc<dyn WebhookClient> = Arc::new(ReqwestWebhookClient::default());
        info!(
            "Registered {} mutating and {} validating webhooks",
            self.admission.mutating_webhooks.len(),
            self.admission.validating_webhooks.len()
        );
        AdmissionChain::default()
            .with_mutator(Arc::new(MutatingWebhookDispatcher::new(
                self.admission.mutating_webhooks.clone(),
                client.clone(),
            )))
            .with_validator(Arc::new(ValidatingWebhookDispatcher::new(
                self.admission.validating_webhooks.clone(),
                client,
            )))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// A positive count from the environment.
fn parse_count(name: &str, default: usize) -> Result<usize, ConfigError> {
    match env_var(name) {
        Some(v) => v
            .parse()
            .ok()
            .filter(|n: &usize| *n > 0)
            .ok_or_else(|| invalid(name, &v)),
        None => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let _ = rustls::crypto::ring::default_provider().install_default();
    let configuration = Configuration::from_env()?;
    let metrics = prometheus::Registry::new();
    let meter_provider = init_meter_provider(&metrics)?;

    let storage = Arc::new(MemoryStorage::new());
    let crds = Arc::new(CrdRegistry::new(storage.clone()));
    let mut informer: Informer<CustomResourceDefinition> = Informer::new(crds.store().clone());
    let lister = CrdLister::new(informer.reader());

    let establishing = Arc::new(EstablishingController::new(lister.clone(), crds.clone()));
    let naming = Arc::new(NamingController::new(lister.clone(), crds.clone()));
    let handler = Arc::new(CrdHandler::new(
        storage.clone(),
        lister.clone(),
        configuration.capabilities,
        establishing.clone(),
        configuration.master_count,
    ));
    let finalizer = Arc::new(CrdFinalizer::new(
        lister.clone(),
        crds.clone(),
        handler.clone(),
        configuration.finalizer_workers,
    ));
    let aggregator = Arc::new(OpenApiAggregator::default());
    let manager: Arc<dyn AggregationManager> = aggregator.clone();
    let openapi = Arc::new(OpenApiController::new(
        lister.clone(),
        Some(manager),
        configuration.capabilities,
    ));
    informer.add_event_handler(naming.clone());
    informer.add_event_handler(handler.clone());
    informer.add_event_handler(finalizer.clone());
    informer.add_event_handler(openapi.clone());

    let server = Arc::new(ApiServer::new(
        crds,
        handler,
        configuration.admission_chain(),
        aggregator,
        metrics,
    ));

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(informer.run(cancel.clone()));
    tasks.spawn(naming.run(cancel.clone()));
    tasks.spawn(establishing.run(cancel.clone()));
    tasks.spawn(finalizer.run(cancel.clone()));
    tasks.spawn(openapi.run(cancel.clone()));
    let server = tokio::spawn(server.serve(configuration.listen_addr, cancel.clone()));

    info!("start controllers ...");
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down ...");
            Ok(())
        }
        result = server => result?,
    };
    cancel.cancel();
    while tasks.join_next().await.is_some() {}
    meter_provider.shutdown()?;
    result
}
