//! Tandem server entry point.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dotenvy::dotenv;
use mimalloc::MiMalloc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tandem::adapter::{anthropic::AnthropicBackend, gemini::GeminiBackend, ModelBackend};
use tandem::config::{model_ids, AppConfig, Vendor, MODELS};
use tandem::orchestrator::Orchestrator;
use tandem::server::{serve, AppState};
use tandem::session::SessionStore;
use tandem::tools::{KalimatClient, SearchHadith, SearchQuran, Tool, ToolRegistry};
use tandem::SYSTEM_PROMPT;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).compact())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tandem=debug")))
        .init();

    let _ = dotenv();

    let config = match AppConfig::load() {
        Ok(c) => Arc::new(c),
        Err(msg) => {
            eprintln!("Configuration error: {msg}");
            std::process::exit(1);
        }
    };

    info!(
        name: "config.loaded",
        port = config.port,
        auth_enabled = config.auth_enabled(),
        stream_timeout_s = config.stream_timeout.as_secs(),
        "Configuration loaded"
    );

    // Tool registry, shared by every adapter.
    let kalimat = Arc::new(KalimatClient::new(config.kalimat_api_key.clone()));
    let registry = ToolRegistry::new(vec![
        Arc::new(SearchQuran::new(Arc::clone(&kalimat))) as Arc<dyn Tool>,
        Arc::new(SearchHadith::new(kalimat)) as Arc<dyn Tool>,
    ]);
    for name in registry.names() {
        info!(name: "tool.registered", tool = %name, "Tool registered");
    }

    // One backend per configured model.
    let backends: Vec<Arc<dyn ModelBackend>> = MODELS
        .iter()
        .map(|spec| match spec.vendor {
            Vendor::Anthropic => Arc::new(AnthropicBackend::new(
                spec.id,
                config.anthropic_api_key.clone(),
                registry.clone(),
                SYSTEM_PROMPT,
            )) as Arc<dyn ModelBackend>,
            Vendor::Gemini => Arc::new(GeminiBackend::new(
                spec.id,
                config.google_api_key.clone(),
                registry.clone(),
                SYSTEM_PROMPT,
            )) as Arc<dyn ModelBackend>,
        })
        .collect();

    let orchestrator = Arc::new(Orchestrator::new(
        backends,
        registry,
        config.stream_timeout,
    ));

    let sessions = SessionStore::new(model_ids());
    let reaper = sessions.spawn_reaper();

    let state = AppState {
        config,
        sessions,
        orchestrator,
        accepting: Arc::new(AtomicBool::new(true)),
    };

    if let Err(e) = serve(state).await {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }

    reaper.abort();
    info!("Shutdown complete");
}
