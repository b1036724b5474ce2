use action_metrics::backend::PrometheusBackend;
use action_metrics::config::AppConfig;
use action_metrics::layer::{track_action, TrackedAction};
use action_metrics::{ActionDescriptor, InstrumentationContext};
use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().context("initialize tracing subscriber")?;

    if let Err(err) = run().await {
        tracing::error!(error = ?err, "fatal demo server error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config = AppConfig::load().context("load configuration from environment")?;

    let (context, backend) = match config.instrumentation.settings() {
        Some(settings) => {
            let backend = Arc::new(
                PrometheusBackend::new(&settings.category).context("register prometheus families")?,
            );
            let context = InstrumentationContext::new(&settings, backend.clone())
                .context("initialize instrumentation context")?;
            (Some(context), Some(backend))
        }
        None => (None, None),
    };

    let listen_addr = config
        .listen_addr
        .clone()
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let app = App {
        config: Arc::new(config),
        context,
        backend,
    };
    app.run(&listen_addr).await
}

struct App {
    config: Arc<AppConfig>,
    context: Option<InstrumentationContext>,
    backend: Option<Arc<PrometheusBackend>>,
}

impl App {
    async fn run(self, listen_addr: &str) -> Result<()> {
        let router = demo_router(self.context.clone(), self.backend.clone());
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("bind demo server to {listen_addr}"))?;
        info!(
            address = %listen_addr,
            instrumented = self.context.is_some(),
            "action metrics demo online"
        );

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "demo server error");
            }
        });

        let heartbeat = Duration::from_secs(self.config.heartbeat_secs.unwrap_or(30).max(1));
        let mut ticker = tokio::time::interval(heartbeat);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(context) = &self.context {
                        info!(
                            bundles = context.bundle_count(),
                            names = context.name_count(),
                            dropped = context.dropped_dispatches(),
                            "instrumentation heartbeat"
                        );
                    }
                }
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        warn!(error = %err, "ctrl_c listener error");
                    }
                    info!("Shutdown signal received, exiting");
                    break;
                }
            }
        }

        server.abort();
        if let Some(context) = &self.context {
            context.shutdown().await;
        }
        Ok(())
    }
}

fn demo_router(
    context: Option<InstrumentationContext>,
    backend: Option<Arc<PrometheusBackend>>,
) -> Router {
    let track = |descriptor: ActionDescriptor| {
        from_fn_with_state(TrackedAction::new(context.clone(), descriptor), track_action)
    };

    Router::new()
        .route(
            "/",
            get(home_index).layer(track(ActionDescriptor::mvc("Home", "Index"))),
        )
        .route(
            "/store/browse",
            get(store_browse).layer(track(
                ActionDescriptor::mvc("Store", "Browse").with_parameters(["genre"]),
            )),
        )
        .route(
            "/api/albums/:id",
            get(album_details).layer(track(
                ActionDescriptor::api("Albums", "Get").with_parameters(["id"]),
            )),
        )
        .route(
            "/api/cart",
            post(add_to_cart).layer(track(
                ActionDescriptor::api("Cart", "Add").with_parameters(["item"]),
            )),
        )
        .route(
            "/health",
            get(|| async { StatusCode::OK })
                .layer(track(ActionDescriptor::mvc("Health", "Check").untracked())),
        )
        .route("/metrics", get(render_metrics).with_state(backend))
        .layer(TraceLayer::new_for_http())
}

async fn home_index() -> &'static str {
    "Welcome to the store"
}

async fn store_browse(Query(query): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
    let genre = query.get("genre").cloned().unwrap_or_else(|| "Rock".to_string());
    Json(serde_json::json!({ "genre": genre, "albums": [] }))
}

async fn album_details(Path(id): Path<u32>) -> Result<Json<serde_json::Value>, StatusCode> {
    if id == 0 {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(serde_json::json!({ "id": id, "title": format!("Album {id}") })))
}

#[derive(Debug, Deserialize)]
struct CartItem {
    item: String,
    quantity: Option<u32>,
}

async fn add_to_cart(Json(req): Json<CartItem>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "item": req.item,
        "quantity": req.quantity.unwrap_or(1),
    }))
}

async fn render_metrics(
    State(backend): State<Option<Arc<PrometheusBackend>>>,
) -> Result<String, (StatusCode, String)> {
    match backend {
        Some(backend) => backend
            .render()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        None => Err((StatusCode::NOT_FOUND, "instrumentation disabled".to_string())),
    }
}

fn init_tracing() -> Result<()> {
    let env_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,hyper=warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("tracing subscriber init: {err}"))
}
