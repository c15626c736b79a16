use axum::{
    body::Body,
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use deadpool_sqlite::Pool;
use moka::sync::Cache;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

pub const TOKEN_PREFIX: &str = "tl_tk_";

/// The authenticated caller of the query surface, injected into request extensions.
#[derive(Clone, Debug)]
pub struct TokenAuth {
    pub token_id: String,
    pub project_id: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<i64>,
}

impl TokenAuth {
    fn is_expired(&self, now_secs: i64) -> bool {
        self.expires_at.map(|exp| exp < now_secs).unwrap_or(false)
    }
}

/// Bearer token resolution: SHA-256 hash → `TokenAuth`, cached for five minutes.
#[derive(Clone)]
pub struct BearerTokenCache {
    cache: Cache<String, TokenAuth>,
    pool: Pool,
}

impl BearerTokenCache {
    pub fn new(pool: Pool) -> Self {
        let cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(Duration::from_secs(300))
            .build();
        Self { cache, pool }
    }

    pub async fn resolve(&self, plaintext: &str) -> Option<TokenAuth> {
        let hash = hash_token(plaintext);
        let now = chrono::Utc::now().timestamp();

        if let Some(auth) = self.cache.get(&hash) {
            if auth.is_expired(now) {
                self.cache.invalidate(&hash);
                return None;
            }
            return Some(auth);
        }

        let h = hash.clone();
        let conn = self.pool.get().await.ok()?;
        let row = conn
            .interact(move |conn| {
                conn.query_row(
                    "SELECT id, project_id, scopes, expires_at
                     FROM api_tokens
                     WHERE token_hash = ?1 AND revoked_at IS NULL",
                    rusqlite::params![h],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                        ))
                    },
                )
            })
            .await
            .ok()?;

        let (token_id, project_id, scopes_json, expires_at) = match row {
            Ok(found) => found,
            Err(rusqlite::Error::QueryReturnedNoRows) => return None,
            Err(e) => {
                tracing::error!(error = %e, "bearer token lookup failed");
                return None;
            }
        };

        let scopes: Vec<String> = serde_json::from_str(&scopes_json).ok()?;
        let auth = TokenAuth {
            token_id,
            project_id,
            scopes,
            expires_at,
        };
        if auth.is_expired(now) {
            return None;
        }

        self.cache.insert(hash, auth.clone());
        Some(auth)
    }

    /// Record token use without delaying the request.
    pub fn touch_last_used(&self, token_id: String) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let now = chrono::Utc::now().timestamp();
            if let Ok(conn) = pool.get().await {
                let _ = conn
                    .interact(move |conn| {
                        conn.execute(
                            "UPDATE api_tokens SET last_used_at = ?1 WHERE id = ?2",
                            rusqlite::params![now, token_id],
                        )
                    })
                    .await;
            }
        });
    }
}

/// SHA-256 of a plaintext token, hex encoded.
pub fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

fn extract_bearer(req: &Request<Body>) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Middleware: resolves `Authorization: Bearer <token>` and injects `TokenAuth`.
pub async fn require_bearer(request: Request<Body>, next: Next) -> Result<Response, Response> {
    let plaintext = extract_bearer(&request).ok_or_else(|| unauthorized("missing bearer token"))?;

    let cache = request
        .extensions()
        .get::<Arc<BearerTokenCache>>()
        .cloned()
        .ok_or_else(|| {
            tracing::error!("bearer cache not configured");
            (StatusCode::INTERNAL_SERVER_ERROR, "bearer cache not configured").into_response()
        })?;

    let auth = cache.resolve(&plaintext).await.ok_or_else(|| {
        tracing::warn!(
            path = %request.uri().path(),
            "auth rejected: invalid or expired bearer token"
        );
        unauthorized("invalid or expired token")
    })?;

    cache.touch_last_used(auth.token_id.clone());

    let mut request = request;
    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}

/// New plaintext token: 256 bits of entropy, URL-safe base64, `tl_tk_` prefix.
pub fn generate_token() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}
