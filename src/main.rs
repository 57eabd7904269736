use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use emberlink::api::RestApi;
use emberlink::config::{load_config, Config, TemplatesConfig};
use emberlink::expression::{DefaultExpressionEvaluatorFactory, ExpressionEvaluatorFactory};
use emberlink::fhir::ObservationProcessor;
use emberlink::pipeline::FhirImportService;
use emberlink::template::{
    content_template_factory, fhir_template_factory, CollectionContentTemplate, ContentTemplate, FhirTemplate,
    TemplateCollection,
};
use emberlink::upsert::{FhirResourceIdentityService, FhirStore, InMemoryFhirStore, ObservationCache, ObservationUpsertEngine};
use emberlink::validation::TemplateValidator;

const CONFIG_PATH: &str = "config.yaml";

type Templates = (TemplateCollection<Arc<dyn ContentTemplate>>, TemplateCollection<FhirTemplate>);

/// Reads the configured template documents; a missing path yields no templates.
fn load_templates(config: &TemplatesConfig, evaluators: Arc<dyn ExpressionEvaluatorFactory>) -> emberlink::Result<Templates> {
    let content = match &config.device_content_path {
        Some(path) => content_template_factory(evaluators).load(&std::fs::read_to_string(path)?)?,
        None => TemplateCollection::new(),
    };
    let fhir_templates = match &config.fhir_mapping_path {
        Some(path) => fhir_template_factory().load(&std::fs::read_to_string(path)?)?,
        None => TemplateCollection::new(),
    };
    Ok((content, fhir_templates))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config_path = Path::new(CONFIG_PATH);
    let config = if config_path.exists() {
        load_config(config_path)?
    } else {
        Config::default()
    };

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.logging.filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    if !config_path.exists() {
        warn!(path = CONFIG_PATH, "Config file not found, using defaults");
    }

    let evaluators = Arc::new(DefaultExpressionEvaluatorFactory::new());
    let (content, fhir_templates) = load_templates(&config.templates, evaluators.clone())?;
    info!(
        content_templates = content.len(),
        fhir_templates = fhir_templates.len(),
        "Templates loaded"
    );

    let store: Arc<dyn FhirStore> = Arc::new(InMemoryFhirStore::new());
    let processor = Arc::new(ObservationProcessor::default());
    let cache = ObservationCache::new(
        config.fhir.observation_cache_ttl(),
        config.fhir.observation_cache_capacity,
    );
    let upserts = ObservationUpsertEngine::new(Arc::clone(&store), Arc::clone(&processor), cache)
        .with_max_conflict_retries(config.fhir.max_conflict_retries);
    let identities = FhirResourceIdentityService::new(Arc::clone(&store), config.fhir.identity_resolution)
        .with_device_system(config.fhir.device_identifier_system.clone());

    let import = FhirImportService::new(
        Arc::new(CollectionContentTemplate::new(content)),
        Arc::new(fhir_templates),
        processor,
        Arc::new(identities),
        Arc::new(upserts),
    );
    let api = RestApi::new(Arc::new(import), Arc::new(TemplateValidator::new(evaluators)), store);

    let host: IpAddr = config.api.host.parse()?;
    let addr = SocketAddr::new(host, config.api.port);
    info!(%addr, "Starting server");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (_, server) = warp::serve(api.routes()).bind_with_graceful_shutdown(addr, async move {
        shutdown_rx.await.ok();
        info!("Shutting down server");
    });
    let server_handle = tokio::spawn(server);

    signal::ctrl_c().await?;
    info!("Ctrl+C received, starting graceful shutdown");
    shutdown_tx.send(()).ok();

    server_handle.await?;
    info!("Server shutdown complete");
    Ok(())
}
