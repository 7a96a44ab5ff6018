use std::error::Error;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mosaic_runtime::driver::{ClaudeDriver, Driver};
use mosaic_runtime::model::{InMemoryStore, ModelStore};
use mosaic_runtime::node::DriverFactory;
use mosaic_runtime::runtime_manager::RuntimeManager;
use mosaic_runtime::ws::AppState;
use mosaic_runtime::{config, ws};

struct ClaudeDriverFactory {
    cli_path: Option<String>,
}

impl DriverFactory for ClaudeDriverFactory {
    fn build(&self) -> Box<dyn Driver> {
        let mut options = claude_agent_sdk_rust::ClaudeAgentOptions::default();
        if let Some(path) = &self.cli_path {
            options.cli_path = Some(path.clone().into());
        }
        Box::new(ClaudeDriver::new(options))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let config = config::Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mosaic_runtime=info,tower_http=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(|metadata| match *metadata.level() {
            tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => {
                sentry::integrations::tracing::EventFilter::Breadcrumb
            }
            _ => sentry::integrations::tracing::EventFilter::Ignore,
        }))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let store: Arc<dyn ModelStore> = Arc::new(InMemoryStore::new());
    let driver_factory: Arc<dyn DriverFactory> = Arc::new(ClaudeDriverFactory {
        cli_path: config.claude_cli_path.clone(),
    });
    let runtime = RuntimeManager::start(config.worker_count, store, driver_factory);

    let app_state = AppState {
        runtime: Arc::clone(&runtime),
    };
    let app = Router::new()
        .route("/ws/{user_id}", get(ws::ws_handler))
        .with_state(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "mosaic runtime listening");
    axum::serve(listener, app).await?;

    Ok(())
}
