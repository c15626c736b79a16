use crate::auth::bearer::{self, BearerTokenCache};
use crate::config::AppConfig;
use crate::embeddings::EmbeddingsProvider;
use crate::error::{AppError, AppResult};
use crate::ingest::auth::{self as ingest_auth, ProjectKeyCache};
use crate::ingest::handler::{self as ingest_handler, IngestState};
use crate::pipeline::pii::PiiDetector;
use crate::pricing::TokenEstimator;
use crate::query::handler as query_handler;
use crate::query::planner::QueryState;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, Method};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use deadpool_sqlite::Pool;
use std::sync::Arc;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

/// Everything the HTTP surface needs, built once at startup.
pub struct AppContext {
    pub config: AppConfig,
    pub pool: Pool,
    pub estimator: Arc<dyn TokenEstimator>,
    pub detector: Arc<dyn PiiDetector>,
    pub embeddings: Option<Arc<dyn EmbeddingsProvider>>,
}

/// Collector and query routes. Serve with connect info when rate limiting is on.
pub fn router(ctx: AppContext) -> AppResult<Router> {
    let AppContext {
        config,
        pool,
        estimator,
        detector,
        embeddings,
    } = ctx;

    let ingest_state = Arc::new(IngestState {
        config: config.ingest.clone(),
        pool: pool.clone(),
        estimator,
        detector,
        embeddings: embeddings.clone(),
    });
    let query_state = Arc::new(QueryState {
        config: config.query.clone(),
        pool: pool.clone(),
        embeddings,
    });

    let project_key_cache = Arc::new(ProjectKeyCache::new(pool.clone()));
    let bearer_cache = Arc::new(BearerTokenCache::new(pool));

    // ── Collector (X-Auth-Token, rate limited per client IP) ──
    let mut ingest_routes = Router::new()
        .route("/collector", post(ingest_handler::collect))
        .layer(DefaultBodyLimit::max(config.ingest.max_payload_bytes))
        .layer(middleware::from_fn(ingest_auth::require_auth_token))
        .layer(axum::Extension(project_key_cache));

    if config.rate_limit.enabled {
        let governor_conf = GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(config.rate_limit.per_second)
            .burst_size(config.rate_limit.burst_size)
            .finish()
            .ok_or_else(|| AppError::Internal("invalid rate limit configuration".to_string()))?;
        ingest_routes = ingest_routes.layer(GovernorLayer::new(governor_conf));
    }

    let ingest_cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(ingest_auth::AUTH_HEADER),
        ]);
    let ingest_routes = ingest_routes.with_state(ingest_state).layer(ingest_cors);

    // ── Query surface (bearer tokens with scopes) ──
    let api_routes = Router::new()
        .route(
            "/api/projects/{project_id}/traces/search",
            post(query_handler::search_traces),
        )
        .route(
            "/api/projects/{project_id}/traces/spans",
            post(query_handler::traces_with_spans),
        )
        .route(
            "/api/projects/{project_id}/traces/checks",
            post(query_handler::trace_checks),
        )
        .route(
            "/api/projects/{project_id}/traces/{trace_id}",
            get(query_handler::get_trace),
        )
        .route(
            "/api/projects/{project_id}/threads/{thread_id}",
            get(query_handler::thread),
        )
        .route(
            "/api/projects/{project_id}/topics/counts",
            post(query_handler::topic_counts),
        )
        .route(
            "/api/projects/{project_id}/customers-and-labels",
            get(query_handler::customers_and_labels),
        )
        .layer(middleware::from_fn(bearer::require_bearer))
        .layer(axum::Extension(bearer_cache))
        .layer(RequestBodyLimitLayer::new(config.ingest.max_payload_bytes))
        .with_state(query_state.clone());

    let api_cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let health_route = Router::new()
        .route("/health", get(query_handler::health))
        .with_state(query_state);

    Ok(api_routes
        .layer(api_cors)
        .merge(health_route)
        .merge(ingest_routes))
}
