use crate::auth::bearer::{generate_token, hash_token};
use crate::auth::permission::VALID_SCOPES;
use crate::error::{AppError, AppResult};
use crate::storage;
use deadpool_sqlite::Pool;
use rusqlite::params;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Collector credential, sent as `X-Auth-Token`.
    pub api_key: String,
    pub pii_redaction: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedToken {
    pub id: String,
    pub name: String,
    /// Plaintext, shown once.
    pub token: String,
    pub token_prefix: String,
    pub project_id: String,
    pub scopes: Vec<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// Random collector key: "tl_" + 64 hex chars (256-bit entropy).
fn generate_api_key() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("tl_{}", hex::encode(bytes))
}

pub async fn create_project(pool: &Pool, name: &str, pii_redaction: bool) -> AppResult<Project> {
    if name.trim().is_empty() {
        return Err(AppError::Validation("name is required".to_string()));
    }

    let project = Project {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        api_key: generate_api_key(),
        pii_redaction,
        created_at: chrono::Utc::now().timestamp(),
    };

    let p = project.clone();
    storage::interact(pool, move |conn| {
        conn.execute(
            "INSERT INTO projects (id, name, api_key, pii_redaction, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![p.id, p.name, p.api_key, p.pii_redaction, p.created_at],
        )
    })
    .await?;

    tracing::info!(project_id = %project.id, name = %project.name, "project created");
    Ok(project)
}

async fn project_exists(pool: &Pool, project_id: &str) -> AppResult<bool> {
    let id = project_id.to_string();
    storage::interact(pool, move |conn| {
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM projects WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
    })
    .await
}

/// Issue a scoped bearer token for the query surface.
pub async fn create_token(
    pool: &Pool,
    project_id: &str,
    name: &str,
    scopes: Vec<String>,
    expires_in_days: Option<u64>,
) -> AppResult<CreatedToken> {
    if name.trim().is_empty() {
        return Err(AppError::Validation("name is required".to_string()));
    }
    if scopes.is_empty() {
        return Err(AppError::Validation("at least one scope is required".to_string()));
    }
    if let Some(bad) = scopes.iter().find(|s| !VALID_SCOPES.contains(&s.as_str())) {
        return Err(AppError::Validation(format!(
            "invalid scope: {bad}. Valid scopes: {}",
            VALID_SCOPES.join(", ")
        )));
    }
    if !project_exists(pool, project_id).await? {
        return Err(AppError::NotFound(format!("project {project_id} not found")));
    }

    let token = generate_token();
    let created_at = chrono::Utc::now().timestamp();
    let created = CreatedToken {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        token_prefix: token.chars().take(12).collect(),
        token,
        project_id: project_id.to_string(),
        scopes,
        created_at,
        expires_at: expires_in_days.map(|days| created_at + days as i64 * 86_400),
    };

    let c = created.clone();
    let hash = hash_token(&c.token);
    let scopes_json = serde_json::to_string(&c.scopes)
        .map_err(|e| AppError::Internal(format!("failed to encode scopes: {e}")))?;
    storage::interact(pool, move |conn| {
        conn.execute(
            "INSERT INTO api_tokens (id, name, token_hash, token_prefix, project_id, scopes,
                                     created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                c.id,
                c.name,
                hash,
                c.token_prefix,
                c.project_id,
                scopes_json,
                c.created_at,
                c.expires_at
            ],
        )
    })
    .await?;

    tracing::info!(
        project_id = %created.project_id,
        token_prefix = %created.token_prefix,
        "api token created"
    );
    Ok(created)
}

/// Register (or rename) the display name of a guardrail slug.
pub async fn add_guardrail(pool: &Pool, project_id: &str, slug: &str, name: &str) -> AppResult<()> {
    if slug.trim().is_empty() || name.trim().is_empty() {
        return Err(AppError::Validation("slug and name are required".to_string()));
    }
    if !project_exists(pool, project_id).await? {
        return Err(AppError::NotFound(format!("project {project_id} not found")));
    }
    let (p, s, n) = (
        project_id.to_string(),
        slug.trim().to_string(),
        name.trim().to_string(),
    );
    storage::interact(pool, move |conn| {
        conn.execute(
            "INSERT INTO guardrails (project_id, slug, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id, slug) DO UPDATE SET name = excluded.name",
            params![p, s, n],
        )
    })
    .await?;
    Ok(())
}
