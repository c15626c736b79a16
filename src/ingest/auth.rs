use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use deadpool_sqlite::Pool;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

pub const AUTH_HEADER: &str = "x-auth-token";

/// Project resolved from a collector `X-Auth-Token`.
#[derive(Clone, Debug)]
pub struct ProjectAuth {
    pub project_id: String,
    pub pii_redaction: bool,
}

/// api_key → `ProjectAuth`, cached for five minutes.
#[derive(Clone)]
pub struct ProjectKeyCache {
    cache: Cache<String, ProjectAuth>,
    pool: Pool,
}

impl ProjectKeyCache {
    pub fn new(pool: Pool) -> Self {
        let cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(Duration::from_secs(300))
            .build();
        Self { cache, pool }
    }

    pub async fn resolve(&self, api_key: &str) -> Option<ProjectAuth> {
        if let Some(auth) = self.cache.get(api_key) {
            return Some(auth);
        }

        let key = api_key.to_string();
        let conn = self.pool.get().await.ok()?;
        let result = conn
            .interact(move |conn| {
                conn.query_row(
                    "SELECT id, pii_redaction FROM projects WHERE api_key = ?1",
                    rusqlite::params![key],
                    |row| {
                        Ok(ProjectAuth {
                            project_id: row.get(0)?,
                            pii_redaction: row.get::<_, i64>(1)? != 0,
                        })
                    },
                )
            })
            .await
            .ok()?;

        match result {
            Ok(auth) => {
                self.cache.insert(api_key.to_string(), auth.clone());
                Some(auth)
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                tracing::error!(error = %e, "project key lookup failed");
                None
            }
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Middleware: resolves `X-Auth-Token` to exactly one project and injects `ProjectAuth`.
pub async fn require_auth_token(request: Request<Body>, next: Next) -> Result<Response, Response> {
    let token = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let Some(token) = token else {
        tracing::warn!(path = %request.uri().path(), "auth rejected: missing X-Auth-Token header");
        return Err(unauthorized("missing X-Auth-Token header"));
    };

    let cache = request
        .extensions()
        .get::<Arc<ProjectKeyCache>>()
        .cloned()
        .ok_or_else(|| {
            tracing::error!("ProjectKeyCache not configured");
            (StatusCode::INTERNAL_SERVER_ERROR, "auth not configured").into_response()
        })?;

    let auth = cache.resolve(&token).await.ok_or_else(|| {
        tracing::warn!(
            key_prefix = %&token[..token.len().min(6)],
            "auth rejected: unknown project key"
        );
        unauthorized("invalid auth token")
    })?;

    tracing::debug!(project_id = %auth.project_id, "collector auth ok");
    let mut request = request;
    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}
