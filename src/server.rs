//! HTTP edge for the search path. Templates and static assets live in a
//! separate frontend; this serves JSON only.

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::index::Indexer;
use crate::search::{self, SearchResult};
use crate::store::Store;

/// Shared application state
#[derive(Clone)]
struct AppState {
    store: Store,
    indexer: Indexer,
    serve_channel: String,
}

/// Configure and run the HTTP server until the token cancels.
pub async fn serve(
    store: Store,
    indexer: Indexer,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let state = AppState {
        store,
        indexer,
        serve_channel: config.serve_channel.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/query", get(query_handler))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("🌐 listening on http://0.0.0.0:{}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    #[serde(default)]
    query: String,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    results: Vec<VideoMatch>,
}

#[derive(Debug, Serialize)]
struct VideoMatch {
    video_id: String,
    title: String,
    published_at: String,
    thumbnail_url: String,
    matches: Vec<LineMatch>,
}

#[derive(Debug, Serialize)]
struct LineMatch {
    start: f64,
    text: String,
}

async fn query_handler(State(state): State<AppState>, Query(params): Query<QueryParams>) -> Response {
    let started = std::time::Instant::now();

    if params.query.chars().count() < search::MIN_QUERY_LEN {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Please type at least {} characters", search::MIN_QUERY_LEN),
        )
            .into_response();
    }

    let channel = match state.indexer.ensure_channel(&state.serve_channel).await {
        Ok(channel) => channel,
        Err(err) => {
            error!("retrieving channel {:?}: {err:#}", state.serve_channel);
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Could not find/retrieve channel to search for",
            )
                .into_response();
        }
    };

    info!("searching for {:?} in {:?}", params.query, channel.title);
    match search::search_channel(&state.store, &channel, &params.query).await {
        Ok(results) => {
            info!("search took {:?}", started.elapsed());
            Json(render_results(results)).into_response()
        }
        Err(err) => {
            error!("searching through channel: {err:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Searching failed").into_response()
        }
    }
}

fn render_results(results: Vec<SearchResult>) -> QueryResponse {
    QueryResponse {
        results: results
            .into_iter()
            .map(|result| VideoMatch {
                video_id: result.video.id,
                title: result.video.title,
                published_at: result.video.published_at.to_rfc3339(),
                thumbnail_url: result.video.thumbnail_url,
                matches: result
                    .lines
                    .into_iter()
                    .map(|line| LineMatch {
                        start: line.start,
                        text: line.text,
                    })
                    .collect(),
            })
            .collect(),
    }
}
