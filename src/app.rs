use std::{env, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use regex::Regex;
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, Row};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::gateway::HttpGateway;
use crate::store::{parse_agent_row, parse_gateway_config_row, PgAgentStore, PgGatewayConfigs};
use crate::types::*;
use crate::workflow::ConnectionWorkflow;

const WEBHOOK_PATH: &str = "/api/whatsapp/webhook";

fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn is_valid_agent_status(value: &str) -> bool {
    matches!(value, "active" | "draft" | "inactive")
}

fn is_valid_ai_mode(value: &str) -> bool {
    matches!(value, "centralized" | "decentralized")
}

fn is_valid_http_url(value: &str) -> bool {
    Regex::new(r"^https?://\S+$")
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn validate_knowledge_base(kb: &KnowledgeBase) -> Result<(), String> {
    for url in &kb.urls {
        if !is_valid_http_url(url.trim()) {
            return Err(format!("knowledge base url is not valid: {url}"));
        }
    }
    Ok(())
}

/// Admin saves may leave the callback URL blank; it then defaults to this
/// deployment's public URL plus the fixed webhook path.
fn derive_webhook_url(public_base_url: &str, provided: &str) -> String {
    let provided = provided.trim();
    if !provided.is_empty() {
        return provided.to_string();
    }
    format!("{}{}", public_base_url.trim_end_matches('/'), WEBHOOK_PATH)
}

fn json_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn parse_json_text(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or(Value::Null)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or(value.strip_prefix("bearer "))?;
    Some(token.trim().to_string())
}

async fn auth_user_from_headers(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<AuthedUser, (StatusCode, Json<Value>)> {
    let token = bearer_token(headers).ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing bearer token" })),
    ))?;

    let row = sqlx::query(
        "SELECT u.id, u.email FROM auth_tokens t JOIN users u ON u.id = t.user_id WHERE t.token = $1",
    )
    .bind(&token)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
    .ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid token" })),
    ))?;

    Ok(AuthedUser {
        id: row.get("id"),
        email: row.get("email"),
    })
}

async fn user_has_role(state: &Arc<AppState>, user_id: &str, role: &str) -> bool {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM user_roles WHERE user_id = $1 AND role = $2",
    )
    .bind(user_id)
    .bind(role)
    .fetch_one(&state.db)
    .await
    .unwrap_or(0)
        > 0
}

async fn require_admin(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<AuthedUser, (StatusCode, Json<Value>)> {
    let user = auth_user_from_headers(state, headers).await?;
    if !user_has_role(state, &user.id, "admin").await {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "administrator role required" })),
        ));
    }
    Ok(user)
}

async fn issue_auth_token(state: &Arc<AppState>, user_id: &str) -> Option<String> {
    let token = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO auth_tokens (token, user_id, created_at) VALUES ($1,$2,$3)",
    )
    .bind(&token)
    .bind(user_id)
    .bind(now_iso())
    .execute(&state.db)
    .await
    .is_ok();
    if inserted {
        Some(token)
    } else {
        None
    }
}

async fn user_roles(state: &Arc<AppState>, user_id: &str) -> Vec<String> {
    sqlx::query_scalar::<_, String>("SELECT role FROM user_roles WHERE user_id = $1 ORDER BY role")
        .bind(user_id)
        .fetch_all(&state.db)
        .await
        .unwrap_or_default()
}

async fn grant_role(state: &Arc<AppState>, user_id: &str, role: &str) {
    let _ = sqlx::query(
        "INSERT INTO user_roles (id, user_id, role, created_at) VALUES ($1,$2,$3,$4) \
         ON CONFLICT (user_id, role) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(role)
    .bind(now_iso())
    .execute(&state.db)
    .await;
}

fn parse_profile_row(row: sqlx::postgres::PgRow) -> UserProfile {
    UserProfile {
        id: row.get("id"),
        full_name: row.get("full_name"),
        avatar_url: row.get("avatar_url"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

async fn fetch_profile(state: &Arc<AppState>, user_id: &str) -> Option<UserProfile> {
    sqlx::query(
        "SELECT id, full_name, avatar_url, created_at, updated_at FROM profiles WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
    .map(parse_profile_row)
}

async fn create_user_with_profile(
    state: &Arc<AppState>,
    email: &str,
    password_hash: &str,
    full_name: &str,
) -> Option<String> {
    let user_id = Uuid::new_v4().to_string();
    let now = now_iso();
    let inserted = sqlx::query(
        "INSERT INTO users (id, email, password_hash, created_at, updated_at, last_login_at) \
         VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(&user_id)
    .bind(email)
    .bind(password_hash)
    .bind(&now)
    .bind(&now)
    .bind("")
    .execute(&state.db)
    .await
    .is_ok();
    if !inserted {
        return None;
    }
    let _ = sqlx::query(
        "INSERT INTO profiles (id, full_name, avatar_url, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5)",
    )
    .bind(&user_id)
    .bind(full_name)
    .bind("")
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await;
    Some(user_id)
}

fn workflow_error_response(err: &WorkflowError) -> (StatusCode, Json<Value>) {
    match err {
        WorkflowError::ConfigurationMissing => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "messaging gateway is not configured; save the gateway settings in the admin panel first"
            })),
        ),
        WorkflowError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "agent not found" })),
        ),
        WorkflowError::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing or invalid caller identity" })),
        ),
        WorkflowError::BadRequest(message) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
        }
        WorkflowError::Gateway(gateway_err) => {
            eprintln!("[whatsapp] gateway call failed: {gateway_err}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "messaging gateway request failed" })),
            )
        }
        WorkflowError::Store(store_err) => {
            eprintln!("[whatsapp] store failure: {store_err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
        }
    }
}

fn whatsapp_link_json(agent: &Agent) -> Value {
    json!({
        "status": agent
            .whatsapp_status
            .map(|s| s.as_str())
            .unwrap_or(WhatsappStatus::Disconnected.as_str()),
        "instanceName": agent.whatsapp_instance_name,
        "qrCode": agent.whatsapp_qr_code,
        "phoneNumber": agent.whatsapp_phone_number,
        "connectedAt": agent.whatsapp_connected_at,
    })
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn signup_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignupBody>,
) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    if email.is_empty() || !email.contains('@') || body.password.trim().len() < 6 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid signup payload" })),
        )
            .into_response();
    }
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM users WHERE email = $1")
        .bind(&email)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0)
        > 0;
    if exists {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "email already registered" })),
        )
            .into_response();
    }
    let password_hash = match hash(body.password, DEFAULT_COST) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "unable to hash password" })),
            )
                .into_response();
        }
    };
    let Some(user_id) =
        create_user_with_profile(&state, &email, &password_hash, body.full_name.trim()).await
    else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create user" })),
        )
            .into_response();
    };
    grant_role(&state, &user_id, "user").await;
    let Some(token) = issue_auth_token(&state, &user_id).await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create auth token" })),
        )
            .into_response();
    };
    (
        StatusCode::CREATED,
        Json(json!({
            "token": token,
            "user": { "id": user_id, "email": email },
        })),
    )
        .into_response()
}

async fn login_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    let row = sqlx::query("SELECT id, password_hash FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();
    let Some(row) = row else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response();
    };
    let user_id: String = row.get("id");
    let password_hash: String = row.get("password_hash");
    if !verify(body.password, &password_hash).unwrap_or(false) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response();
    }

    let _ = sqlx::query("UPDATE users SET last_login_at = $1 WHERE id = $2")
        .bind(now_iso())
        .bind(&user_id)
        .execute(&state.db)
        .await;

    let Some(token) = issue_auth_token(&state, &user_id).await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create auth token" })),
        )
            .into_response();
    };
    let roles = user_roles(&state, &user_id).await;
    (
        StatusCode::OK,
        Json(json!({
            "token": token,
            "user": { "id": user_id, "email": email },
            "roles": roles,
        })),
    )
        .into_response()
}

async fn get_me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let profile = fetch_profile(&state, &user.id).await;
    let roles = user_roles(&state, &user.id).await;
    (
        StatusCode::OK,
        Json(json!({
            "user": { "id": user.id, "email": user.email },
            "profile": profile,
            "roles": roles,
        })),
    )
        .into_response()
}

/// First-run bootstrap: creates (or adopts) the given account and grants it
/// the admin role, but only while no administrator exists yet.
async fn setup_admin(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetupAdminBody>,
) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    if email.is_empty() || !email.contains('@') || body.password.trim().len() < 6 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid setup payload" })),
        )
            .into_response();
    }

    let admin_exists =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM user_roles WHERE role = 'admin'")
            .fetch_one(&state.db)
            .await
            .unwrap_or(0)
            > 0;
    if admin_exists {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "an administrator account already exists" })),
        )
            .into_response();
    }

    let existing = sqlx::query("SELECT id, password_hash FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();

    let user_id = match existing {
        Some(row) => {
            let password_hash: String = row.get("password_hash");
            if !verify(&body.password, &password_hash).unwrap_or(false) {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "invalid credentials" })),
                )
                    .into_response();
            }
            row.get::<String, _>("id")
        }
        None => {
            let password_hash = match hash(&body.password, DEFAULT_COST) {
                Ok(v) => v,
                Err(_) => {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": "unable to hash password" })),
                    )
                        .into_response();
                }
            };
            let Some(user_id) =
                create_user_with_profile(&state, &email, &password_hash, body.full_name.trim())
                    .await
            else {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "failed to create user" })),
                )
                    .into_response();
            };
            user_id
        }
    };

    grant_role(&state, &user_id, "admin").await;
    grant_role(&state, &user_id, "user").await;
    let Some(token) = issue_auth_token(&state, &user_id).await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create auth token" })),
        )
            .into_response();
    };
    (
        StatusCode::CREATED,
        Json(json!({
            "token": token,
            "user": { "id": user_id, "email": email },
            "roles": ["admin", "user"],
        })),
    )
        .into_response()
}

async fn get_profile(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let Some(profile) = fetch_profile(&state, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "profile not found" })),
        )
            .into_response();
    };
    (StatusCode::OK, Json(json!({ "profile": profile }))).into_response()
}

async fn patch_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PatchProfileBody>,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let Some(mut profile) = fetch_profile(&state, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "profile not found" })),
        )
            .into_response();
    };
    if let Some(v) = body.full_name {
        profile.full_name = v.trim().to_string();
    }
    if let Some(v) = body.avatar_url {
        profile.avatar_url = v.trim().to_string();
    }
    profile.updated_at = now_iso();
    let _ = sqlx::query(
        "UPDATE profiles SET full_name = $1, avatar_url = $2, updated_at = $3 WHERE id = $4",
    )
    .bind(&profile.full_name)
    .bind(&profile.avatar_url)
    .bind(&profile.updated_at)
    .bind(&profile.id)
    .execute(&state.db)
    .await;
    (StatusCode::OK, Json(json!({ "profile": profile }))).into_response()
}

async fn get_agents(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let rows = sqlx::query(
        "SELECT id, user_id, name, description, avatar_url, tags, instructions, knowledge_base, \
         model_provider, model_name, ai_api_key, status, created_at, updated_at, \
         whatsapp_instance_name, whatsapp_status, whatsapp_qr_code, whatsapp_phone_number, \
         whatsapp_connected_at FROM agents WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let agents = rows.into_iter().map(parse_agent_row).collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "agents": agents }))).into_response()
}

async fn fetch_agent_for_user(
    state: &Arc<AppState>,
    agent_id: &str,
    user_id: &str,
) -> Option<Agent> {
    sqlx::query(
        "SELECT id, user_id, name, description, avatar_url, tags, instructions, knowledge_base, \
         model_provider, model_name, ai_api_key, status, created_at, updated_at, \
         whatsapp_instance_name, whatsapp_status, whatsapp_qr_code, whatsapp_phone_number, \
         whatsapp_connected_at FROM agents WHERE id = $1 AND user_id = $2",
    )
    .bind(agent_id)
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
    .map(parse_agent_row)
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateAgentBody>,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "name is required" })),
        )
            .into_response();
    }
    let status = body.status.unwrap_or_else(|| "draft".to_string());
    if !is_valid_agent_status(&status) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "status must be active, draft, or inactive" })),
        )
            .into_response();
    }
    if let Err(err) = validate_knowledge_base(&body.knowledge_base) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": err }))).into_response();
    }

    let now = now_iso();
    let agent = Agent {
        id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        name,
        description: body.description.trim().to_string(),
        avatar_url: body.avatar_url.trim().to_string(),
        tags: body.tags,
        instructions: body.instructions,
        knowledge_base: body.knowledge_base,
        model_provider: body.model_provider.trim().to_string(),
        model_name: body.model_name.trim().to_string(),
        ai_api_key: body.ai_api_key.trim().to_string(),
        status,
        created_at: now.clone(),
        updated_at: now,
        whatsapp_instance_name: None,
        whatsapp_status: None,
        whatsapp_qr_code: None,
        whatsapp_phone_number: None,
        whatsapp_connected_at: None,
    };
    let inserted = sqlx::query(
        "INSERT INTO agents (id, user_id, name, description, avatar_url, tags, instructions, \
         knowledge_base, model_provider, model_name, ai_api_key, status, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)",
    )
    .bind(&agent.id)
    .bind(&agent.user_id)
    .bind(&agent.name)
    .bind(&agent.description)
    .bind(&agent.avatar_url)
    .bind(serde_json::to_string(&agent.tags).unwrap_or_else(|_| "[]".to_string()))
    .bind(&agent.instructions)
    .bind(serde_json::to_string(&agent.knowledge_base).unwrap_or_else(|_| "{}".to_string()))
    .bind(&agent.model_provider)
    .bind(&agent.model_name)
    .bind(&agent.ai_api_key)
    .bind(&agent.status)
    .bind(&agent.created_at)
    .bind(&agent.updated_at)
    .execute(&state.db)
    .await
    .is_ok();
    if !inserted {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create agent" })),
        )
            .into_response();
    }
    (StatusCode::CREATED, Json(json!({ "agent": agent }))).into_response()
}

async fn get_agent(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let Some(agent) = fetch_agent_for_user(&state, &agent_id, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "agent not found" })),
        )
            .into_response();
    };
    (StatusCode::OK, Json(json!({ "agent": agent }))).into_response()
}

async fn update_agent(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateAgentBody>,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let Some(mut agent) = fetch_agent_for_user(&state, &agent_id, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "agent not found" })),
        )
            .into_response();
    };

    if let Some(v) = body.name {
        let name = v.trim().to_string();
        if name.is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "name is required" })),
            )
                .into_response();
        }
        agent.name = name;
    }
    if let Some(v) = body.description {
        agent.description = v.trim().to_string();
    }
    if let Some(v) = body.avatar_url {
        agent.avatar_url = v.trim().to_string();
    }
    if let Some(v) = body.tags {
        agent.tags = v;
    }
    if let Some(v) = body.instructions {
        agent.instructions = v;
    }
    if let Some(v) = body.knowledge_base {
        if let Err(err) = validate_knowledge_base(&v) {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": err }))).into_response();
        }
        agent.knowledge_base = v;
    }
    if let Some(v) = body.model_provider {
        agent.model_provider = v.trim().to_string();
    }
    if let Some(v) = body.model_name {
        agent.model_name = v.trim().to_string();
    }
    if let Some(v) = body.ai_api_key {
        agent.ai_api_key = v.trim().to_string();
    }
    if let Some(v) = body.status {
        if !is_valid_agent_status(&v) {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "status must be active, draft, or inactive" })),
            )
                .into_response();
        }
        agent.status = v;
    }
    agent.updated_at = now_iso();

    let _ = sqlx::query(
        "UPDATE agents SET name = $1, description = $2, avatar_url = $3, tags = $4, \
         instructions = $5, knowledge_base = $6, model_provider = $7, model_name = $8, \
         ai_api_key = $9, status = $10, updated_at = $11 WHERE id = $12 AND user_id = $13",
    )
    .bind(&agent.name)
    .bind(&agent.description)
    .bind(&agent.avatar_url)
    .bind(serde_json::to_string(&agent.tags).unwrap_or_else(|_| "[]".to_string()))
    .bind(&agent.instructions)
    .bind(serde_json::to_string(&agent.knowledge_base).unwrap_or_else(|_| "{}".to_string()))
    .bind(&agent.model_provider)
    .bind(&agent.model_name)
    .bind(&agent.ai_api_key)
    .bind(&agent.status)
    .bind(&agent.updated_at)
    .bind(&agent.id)
    .bind(&user.id)
    .execute(&state.db)
    .await;

    (StatusCode::OK, Json(json!({ "agent": agent }))).into_response()
}

async fn delete_agent(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let deleted = sqlx::query("DELETE FROM agents WHERE id = $1 AND user_id = $2")
        .bind(&agent_id)
        .bind(&user.id)
        .execute(&state.db)
        .await
        .map(|r| r.rows_affected() > 0)
        .unwrap_or(false);
    if !deleted {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "agent not found" })),
        )
            .into_response();
    }
    (StatusCode::OK, Json(json!({ "success": true }))).into_response()
}

async fn connect_whatsapp(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    match state.workflow.connect(&agent_id, &user.id).await {
        Ok(started) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "instanceName": started.instance_name,
                "qrcode": started.qr_code,
            })),
        )
            .into_response(),
        Err(err) => workflow_error_response(&err).into_response(),
    }
}

async fn get_whatsapp_link(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let Some(agent) = fetch_agent_for_user(&state, &agent_id, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "agent not found" })),
        )
            .into_response();
    };
    (StatusCode::OK, Json(json!({ "whatsapp": whatsapp_link_json(&agent) }))).into_response()
}

async fn poll_whatsapp(
    Path(agent_id): Path<String>,
    Query(query): Query<PollQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let interval = Duration::from_millis(query.interval_ms.unwrap_or(1500).clamp(250, 10_000));
    let timeout = Duration::from_millis(query.timeout_ms.unwrap_or(20_000).clamp(1_000, 25_000));
    match state
        .workflow
        .poll_until_connected(&agent_id, &user.id, interval, timeout)
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "connected": outcome.connected,
                "qrCode": outcome.qr_code,
            })),
        )
            .into_response(),
        Err(err) => workflow_error_response(&err).into_response(),
    }
}

async fn check_whatsapp_status(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    match state.workflow.check_status(&agent_id, &user.id).await {
        Ok(status) => (StatusCode::OK, Json(json!({ "status": status }))).into_response(),
        Err(err) => workflow_error_response(&err).into_response(),
    }
}

async fn disconnect_whatsapp(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    match state.workflow.disconnect(&agent_id, &user.id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(err) => workflow_error_response(&err).into_response(),
    }
}

/// Inbound gateway events. Everything parseable is acknowledged so the
/// gateway stops redelivering; only envelopes without an instance name are
/// rejected at the boundary.
async fn gateway_webhook(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let payload =
        serde_json::from_slice::<GatewayWebhookBody>(&body).unwrap_or_default();
    match state.workflow.apply_webhook_event(&payload).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "received": true }))).into_response(),
        Err(WorkflowError::BadRequest(message)) => {
            eprintln!("[webhook] rejected payload: {message}");
            (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
        Err(err) => {
            eprintln!("[webhook] processing failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

async fn get_gateway_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = require_admin(&state, &headers).await {
        return err.into_response();
    }
    let config = sqlx::query(
        "SELECT id, base_url, api_key, webhook_url, created_by, created_at, updated_at \
         FROM gateway_config ORDER BY created_at ASC LIMIT 1",
    )
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
    .map(parse_gateway_config_row);
    (StatusCode::OK, Json(json!({ "config": config }))).into_response()
}

async fn put_gateway_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<GatewayConfigBody>,
) -> impl IntoResponse {
    let user = match require_admin(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let base_url = body.base_url.trim().trim_end_matches('/').to_string();
    let api_key = body.api_key.trim().to_string();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "base_url must be an http(s) URL" })),
        )
            .into_response();
    }
    if api_key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "api_key is required" })),
        )
            .into_response();
    }
    let webhook_url = derive_webhook_url(&state.public_base_url, &body.webhook_url);
    let now = now_iso();

    let existing_id = sqlx::query_scalar::<_, String>(
        "SELECT id FROM gateway_config ORDER BY created_at ASC LIMIT 1",
    )
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    let config = match existing_id {
        Some(id) => {
            let _ = sqlx::query(
                "UPDATE gateway_config SET base_url = $1, api_key = $2, webhook_url = $3, \
                 updated_at = $4 WHERE id = $5",
            )
            .bind(&base_url)
            .bind(&api_key)
            .bind(&webhook_url)
            .bind(&now)
            .bind(&id)
            .execute(&state.db)
            .await;
            sqlx::query(
                "SELECT id, base_url, api_key, webhook_url, created_by, created_at, updated_at \
                 FROM gateway_config WHERE id = $1",
            )
            .bind(&id)
            .fetch_optional(&state.db)
            .await
            .ok()
            .flatten()
            .map(parse_gateway_config_row)
        }
        None => {
            let config = GatewayConfig {
                id: Uuid::new_v4().to_string(),
                base_url,
                api_key,
                webhook_url,
                created_by: user.id.clone(),
                created_at: now.clone(),
                updated_at: now,
            };
            let inserted = sqlx::query(
                "INSERT INTO gateway_config (id, base_url, api_key, webhook_url, created_by, \
                 created_at, updated_at) VALUES ($1,$2,$3,$4,$5,$6,$7)",
            )
            .bind(&config.id)
            .bind(&config.base_url)
            .bind(&config.api_key)
            .bind(&config.webhook_url)
            .bind(&config.created_by)
            .bind(&config.created_at)
            .bind(&config.updated_at)
            .execute(&state.db)
            .await
            .is_ok();
            inserted.then_some(config)
        }
    };

    let Some(config) = config else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to save gateway configuration" })),
        )
            .into_response();
    };
    (StatusCode::OK, Json(json!({ "config": config }))).into_response()
}

async fn get_ai_config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(u) => u,
        Err(err) => return err.into_response(),
    };
    let row = sqlx::query(
        "SELECT id, mode, available_providers, provider_configs, created_at, updated_at \
         FROM ai_config ORDER BY created_at ASC LIMIT 1",
    )
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    let (mode, available_providers, provider_configs) = match &row {
        Some(row) => (
            row.get::<String, _>("mode"),
            parse_json_text(&row.get::<String, _>("available_providers")),
            parse_json_text(&row.get::<String, _>("provider_configs")),
        ),
        None => ("decentralized".to_string(), json!([]), json!({})),
    };

    // Centrally-held credentials stay with administrators.
    if user_has_role(&state, &user.id, "admin").await {
        (
            StatusCode::OK,
            Json(json!({
                "config": {
                    "mode": mode,
                    "availableProviders": available_providers,
                    "providerConfigs": provider_configs,
                }
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::OK,
            Json(json!({
                "config": {
                    "mode": mode,
                    "availableProviders": available_providers,
                }
            })),
        )
            .into_response()
    }
}

async fn put_ai_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AiConfigBody>,
) -> impl IntoResponse {
    if let Err(err) = require_admin(&state, &headers).await {
        return err.into_response();
    }
    let mode = body.mode.trim().to_ascii_lowercase();
    if !is_valid_ai_mode(&mode) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "mode must be centralized or decentralized" })),
        )
            .into_response();
    }
    let available_providers = body.available_providers.unwrap_or_else(|| json!([]));
    let provider_configs = body.provider_configs.unwrap_or_else(|| json!({}));
    let now = now_iso();

    let existing_id =
        sqlx::query_scalar::<_, String>("SELECT id FROM ai_config ORDER BY created_at ASC LIMIT 1")
            .fetch_optional(&state.db)
            .await
            .ok()
            .flatten();

    let saved = match existing_id {
        Some(id) => sqlx::query(
            "UPDATE ai_config SET mode = $1, available_providers = $2, provider_configs = $3, \
             updated_at = $4 WHERE id = $5",
        )
        .bind(&mode)
        .bind(json_text(&available_providers))
        .bind(json_text(&provider_configs))
        .bind(&now)
        .bind(&id)
        .execute(&state.db)
        .await
        .is_ok(),
        None => sqlx::query(
            "INSERT INTO ai_config (id, mode, available_providers, provider_configs, created_at, \
             updated_at) VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&mode)
        .bind(json_text(&available_providers))
        .bind(json_text(&provider_configs))
        .bind(&now)
        .bind(&now)
        .execute(&state.db)
        .await
        .is_ok(),
    };

    if !saved {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to save ai configuration" })),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        Json(json!({
            "config": {
                "mode": mode,
                "availableProviders": available_providers,
                "providerConfigs": provider_configs,
            }
        })),
    )
        .into_response()
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "agents_server".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let public_base_url = env::var("API_PUBLIC_URL")
        .unwrap_or_else(|_| format!("http://localhost:{port}"))
        .trim_end_matches('/')
        .to_string();

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let workflow = ConnectionWorkflow::new(
        Arc::new(PgAgentStore::new(db.clone())),
        Arc::new(PgGatewayConfigs::new(db.clone())),
        Arc::new(HttpGateway::new(reqwest::Client::new())),
    );

    let state = Arc::new(AppState {
        db,
        public_base_url,
        workflow,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/auth/signup", post(signup_user))
        .route("/api/auth/login", post(login_user))
        .route("/api/auth/me", get(get_me))
        .route("/api/setup/admin", post(setup_admin))
        .route("/api/profile", get(get_profile).patch(patch_profile))
        .route("/api/agents", get(get_agents).post(create_agent))
        .route(
            "/api/agents/{agent_id}",
            get(get_agent).patch(update_agent).delete(delete_agent),
        )
        .route(
            "/api/agents/{agent_id}/whatsapp",
            get(get_whatsapp_link),
        )
        .route(
            "/api/agents/{agent_id}/whatsapp/connect",
            post(connect_whatsapp),
        )
        .route("/api/agents/{agent_id}/whatsapp/poll", get(poll_whatsapp))
        .route(
            "/api/agents/{agent_id}/whatsapp/status",
            get(check_whatsapp_status),
        )
        .route(
            "/api/agents/{agent_id}/whatsapp/disconnect",
            post(disconnect_whatsapp),
        )
        .route("/api/whatsapp/webhook", post(gateway_webhook))
        .route(
            "/api/gateway-config",
            get(get_gateway_config).put(put_gateway_config),
        )
        .route("/api/ai-config", get(get_ai_config).put(put_ai_config))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    println!("agents server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::store::StoreError;

    #[test]
    fn emails_normalize_to_lowercase() {
        assert_eq!(normalize_email("  User@Example.COM "), "user@example.com");
    }

    #[test]
    fn agent_status_values_are_closed() {
        assert!(is_valid_agent_status("active"));
        assert!(is_valid_agent_status("draft"));
        assert!(is_valid_agent_status("inactive"));
        assert!(!is_valid_agent_status("archived"));
        assert!(!is_valid_agent_status(""));
    }

    #[test]
    fn knowledge_base_urls_must_be_http() {
        let valid = KnowledgeBase {
            text: String::new(),
            urls: vec![
                "https://example.com/docs".to_string(),
                "http://intranet/wiki".to_string(),
            ],
        };
        assert!(validate_knowledge_base(&valid).is_ok());

        let invalid = KnowledgeBase {
            text: String::new(),
            urls: vec!["ftp://example.com".to_string()],
        };
        assert!(validate_knowledge_base(&invalid).is_err());
    }

    #[test]
    fn webhook_url_defaults_to_public_base() {
        assert_eq!(
            derive_webhook_url("https://app.example.com/", ""),
            "https://app.example.com/api/whatsapp/webhook"
        );
        assert_eq!(
            derive_webhook_url("https://app.example.com", "https://hooks.example.com/custom"),
            "https://hooks.example.com/custom"
        );
    }

    #[test]
    fn workflow_errors_map_to_expected_status_codes() {
        let cases = [
            (WorkflowError::ConfigurationMissing, StatusCode::BAD_REQUEST),
            (WorkflowError::NotFound, StatusCode::NOT_FOUND),
            (WorkflowError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                WorkflowError::BadRequest("no instance provided".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                WorkflowError::Gateway(GatewayError::Status {
                    status: 500,
                    body: "boom".to_string(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                WorkflowError::Store(StoreError("down".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let (status, _) = workflow_error_response(&err);
            assert_eq!(status, expected, "{err}");
        }
    }

    #[test]
    fn malformed_webhook_bytes_become_an_empty_envelope() {
        let payload = serde_json::from_slice::<GatewayWebhookBody>(b"not json")
            .unwrap_or_default();
        assert_eq!(payload.instance, None);
        assert_eq!(payload.event, None);
    }

    #[test]
    fn link_json_reports_absent_status_as_disconnected() {
        let agent = Agent {
            id: "a1".to_string(),
            user_id: "u1".to_string(),
            name: "Support".to_string(),
            description: String::new(),
            avatar_url: String::new(),
            tags: Vec::new(),
            instructions: String::new(),
            knowledge_base: KnowledgeBase::default(),
            model_provider: String::new(),
            model_name: String::new(),
            ai_api_key: String::new(),
            status: "draft".to_string(),
            created_at: now_iso(),
            updated_at: now_iso(),
            whatsapp_instance_name: None,
            whatsapp_status: None,
            whatsapp_qr_code: None,
            whatsapp_phone_number: None,
            whatsapp_connected_at: None,
        };
        let link = whatsapp_link_json(&agent);
        assert_eq!(link["status"], "disconnected");
        assert!(link["qrCode"].is_null());
    }
}
