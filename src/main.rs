use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::{Arc, OnceLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use mongoscope::config::{Config, LoggingConfig};
use mongoscope::services::{CommandMonitor, MongoExplainClient, PersistentQueryProfilerService};
use mongoscope::utils::metrics_sink::{MetricsSink, NoopSink, PrometheusSink};
use mongoscope::utils::RateLimiter;
use mongoscope::{handlers, middleware, models, AppState, QueryProfilerService};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::profiler::list_slow_queries,
        handlers::profiler::explain_query,
        handlers::profiler::recommend,
        handlers::profiler::summary,
        handlers::profiler::collection_stats,
        handlers::profiler::patterns,
    ),
    components(
        schemas(
            handlers::profiler::ExplainRequest,
            models::QueryStage,
            models::SeverityLevel,
            models::QueryStats,
            models::ExplainStage,
            models::ExplainPlan,
            models::AggregationExplainStage,
            models::AggregationExplainPlan,
            models::SlowQueryRecord,
            models::OptimizationRecommendation,
            models::IndexInfo,
            models::CollectionStatsReport,
            models::ProfilerSummary,
            models::PatternStat,
            models::PatternWindowStat,
        )
    ),
    tags(
        (name = "Profiler", description = "Slow query recording, explain and recommendations"),
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = Config::load()?;
    let _log_guard = init_logging(&config.logging);

    tracing::info!("MongoScope starting up");

    // Prometheus recorder has to be installed before any metric is emitted.
    let metrics_handle = if config.metrics.enabled {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
        Some(handle)
    } else {
        None
    };
    let sink: Arc<dyn MetricsSink> = if config.metrics.enabled {
        Arc::new(PrometheusSink)
    } else {
        Arc::new(NoopSink)
    };

    // The command monitor needs the profiler, which needs the client, which
    // needs its options built before the monitor can exist. The slot breaks
    // the cycle: the driver callback reads it, and it is filled once the
    // profiler is up.
    let monitor_slot: Arc<OnceLock<Arc<CommandMonitor>>> = Arc::new(OnceLock::new());

    let explain_client = if config.mongodb.uri.is_empty() {
        tracing::warn!("No MongoDB URI configured, running without a database");
        None
    } else {
        let mut options = mongodb::options::ClientOptions::parse(&config.mongodb.uri).await?;
        options.app_name = Some("mongoscope".to_string());
        if config.profiler.monitor_commands {
            let slot = Arc::clone(&monitor_slot);
            options.command_event_handler = Some(mongodb::event::EventHandler::callback(
                move |event: mongodb::event::command::CommandEvent| {
                    if let Some(monitor) = slot.get() {
                        monitor.handle(&event);
                    }
                },
            ));
        }
        let client = mongodb::Client::with_options(options)?;
        let explain_client = MongoExplainClient::new(client.database(&config.mongodb.database));
        match explain_client.ping().await {
            Ok(()) => tracing::info!(
                database = %config.mongodb.database,
                "Connected to MongoDB"
            ),
            Err(error) => tracing::warn!(
                %error,
                "MongoDB is not reachable yet, continuing anyway"
            ),
        }
        Some(explain_client)
    };

    let profiler = Arc::new(QueryProfilerService::new(
        explain_client.clone(),
        config.profiler_settings(),
        sink,
    ));

    let persistent = match (&explain_client, config.profiler.persist_collection.as_str()) {
        (Some(client), name) if !name.is_empty() => {
            tracing::info!(collection = name, "Persistent slow query store enabled");
            Some(Arc::new(PersistentQueryProfilerService::new(
                Arc::clone(&profiler),
                client,
                name,
            )))
        }
        _ => None,
    };

    if config.profiler.monitor_commands {
        // The persistence collection's own traffic must not feed back into
        // the profiler.
        let ignored = if config.profiler.persist_collection.is_empty() {
            vec![]
        } else {
            vec![config.profiler.persist_collection.clone()]
        };
        let monitor = Arc::new(CommandMonitor::new(Arc::clone(&profiler), ignored));
        if monitor_slot.set(monitor).is_err() {
            tracing::warn!("Command monitor was already installed");
        } else {
            tracing::info!("Driver command monitor enabled");
        }
    }

    let state = Arc::new(AppState {
        rate_limiter: Arc::new(RateLimiter::new(config.api.requests_per_minute)),
        profiler,
        persistent,
        config,
    });

    let api_routes = Router::new()
        .route("/api/profiler/slow-queries", get(handlers::profiler::list_slow_queries))
        .route("/api/profiler/explain", post(handlers::profiler::explain_query))
        .route("/api/profiler/recommendations", post(handlers::profiler::recommend))
        .route("/api/profiler/analyze", post(handlers::profiler::recommend))
        .route("/api/profiler/summary", get(handlers::profiler::summary))
        .route("/api/profiler/collection/:name/stats", get(handlers::profiler::collection_stats))
        .route("/api/profiler/patterns", get(handlers::profiler::patterns))
        .layer(axum_middleware::from_fn_with_state(Arc::clone(&state), middleware::api_guard))
        .with_state(Arc::clone(&state));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check));

    let metrics_routes = match metrics_handle {
        Some(handle) => {
            Router::new().route("/metrics", get(move || async move { handle.render() }))
        }
        None => Router::new(),
    };

    let app = Router::new()
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Console logging always, rolling daily file logging when configured. The
/// returned guard keeps the file writer flushing until main exits.
fn init_logging(logging: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_filter = tracing_subscriber::EnvFilter::new(&logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("mongoscope.log");
        // The rolling appender adds its own date suffix.
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
        Some(guard)
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        None
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}
