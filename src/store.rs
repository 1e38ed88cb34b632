use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;

use crate::types::{now_iso, Agent, GatewayConfig, KnowledgeBase, WhatsappStatus};

#[derive(Debug, Error)]
#[error("store failure: {0}")]
pub struct StoreError(pub String);

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError(err.to_string())
    }
}

/// The persistence operations the connection workflow relies on. Lookups are
/// owner-scoped except for the instance-name path, which serves the webhook
/// receiver and runs with elevated trust. The `record_*` transitions are
/// conditional: they return `false` instead of rewriting a row already in the
/// target sub-state, so replayed webhook deliveries and racing pollers cannot
/// produce lost updates.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn agent_for_user(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Option<Agent>, StoreError>;

    async fn agent_by_instance_name(
        &self,
        instance_name: &str,
    ) -> Result<Option<Agent>, StoreError>;

    /// Adopt a freshly created instance: name + `connecting` + initial QR.
    async fn begin_connection(
        &self,
        agent_id: &str,
        instance_name: &str,
        qr_code: Option<&str>,
    ) -> Result<(), StoreError>;

    /// QR rotation. Also forces status back to `connecting`, whatever it was.
    async fn record_qr_code(&self, agent_id: &str, qr_code: &str) -> Result<bool, StoreError>;

    async fn record_connected(
        &self,
        agent_id: &str,
        phone_number: Option<&str>,
        connected_at: &str,
    ) -> Result<bool, StoreError>;

    /// Gateway-reported drop: status + QR only, the instance name stays.
    async fn record_disconnected(&self, agent_id: &str) -> Result<bool, StoreError>;

    /// User-initiated disconnect: resets the entire link sub-state.
    async fn clear_connection(&self, agent_id: &str) -> Result<(), StoreError>;
}

/// Loader for the single global gateway configuration row. `Ok(None)` means
/// "not configured yet"; the workflow turns that into its typed error.
#[async_trait]
pub trait GatewayConfigSource: Send + Sync {
    async fn load(&self) -> Result<Option<GatewayConfig>, StoreError>;
}

const AGENT_COLUMNS: &str = "id, user_id, name, description, avatar_url, tags, instructions, \
     knowledge_base, model_provider, model_name, ai_api_key, status, created_at, updated_at, \
     whatsapp_instance_name, whatsapp_status, whatsapp_qr_code, whatsapp_phone_number, \
     whatsapp_connected_at";

pub fn parse_agent_row(row: sqlx::postgres::PgRow) -> Agent {
    Agent {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        description: row.get("description"),
        avatar_url: row.get("avatar_url"),
        tags: serde_json::from_str::<Vec<String>>(&row.get::<String, _>("tags"))
            .unwrap_or_default(),
        instructions: row.get("instructions"),
        knowledge_base: serde_json::from_str::<KnowledgeBase>(
            &row.get::<String, _>("knowledge_base"),
        )
        .unwrap_or_default(),
        model_provider: row.get("model_provider"),
        model_name: row.get("model_name"),
        ai_api_key: row.get("ai_api_key"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        whatsapp_instance_name: row.get("whatsapp_instance_name"),
        whatsapp_status: row
            .get::<Option<String>, _>("whatsapp_status")
            .as_deref()
            .and_then(WhatsappStatus::parse),
        whatsapp_qr_code: row.get("whatsapp_qr_code"),
        whatsapp_phone_number: row.get("whatsapp_phone_number"),
        whatsapp_connected_at: row.get("whatsapp_connected_at"),
    }
}

pub fn parse_gateway_config_row(row: sqlx::postgres::PgRow) -> GatewayConfig {
    GatewayConfig {
        id: row.get("id"),
        base_url: row.get("base_url"),
        api_key: row.get("api_key"),
        webhook_url: row.get("webhook_url"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub struct PgAgentStore {
    db: PgPool,
}

impl PgAgentStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AgentStore for PgAgentStore {
    async fn agent_for_user(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1 AND user_id = $2"
        ))
        .bind(agent_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(parse_agent_row))
    }

    async fn agent_by_instance_name(
        &self,
        instance_name: &str,
    ) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE whatsapp_instance_name = $1"
        ))
        .bind(instance_name)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(parse_agent_row))
    }

    async fn begin_connection(
        &self,
        agent_id: &str,
        instance_name: &str,
        qr_code: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE agents SET whatsapp_instance_name = $1, whatsapp_status = 'connecting', \
             whatsapp_qr_code = $2, whatsapp_phone_number = NULL, whatsapp_connected_at = NULL, \
             updated_at = $3 WHERE id = $4",
        )
        .bind(instance_name)
        .bind(qr_code)
        .bind(now_iso())
        .bind(agent_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn record_qr_code(&self, agent_id: &str, qr_code: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE agents SET whatsapp_status = 'connecting', whatsapp_qr_code = $1, \
             updated_at = $2 WHERE id = $3 \
             AND (whatsapp_status IS DISTINCT FROM 'connecting' \
                  OR whatsapp_qr_code IS DISTINCT FROM $1)",
        )
        .bind(qr_code)
        .bind(now_iso())
        .bind(agent_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_connected(
        &self,
        agent_id: &str,
        phone_number: Option<&str>,
        connected_at: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE agents SET whatsapp_status = 'connected', whatsapp_qr_code = NULL, \
             whatsapp_phone_number = $1, whatsapp_connected_at = $2, updated_at = $3 \
             WHERE id = $4 AND whatsapp_status IS DISTINCT FROM 'connected'",
        )
        .bind(phone_number)
        .bind(connected_at)
        .bind(now_iso())
        .bind(agent_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_disconnected(&self, agent_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE agents SET whatsapp_status = 'disconnected', whatsapp_qr_code = NULL, \
             updated_at = $1 \
             WHERE id = $2 AND whatsapp_status IS DISTINCT FROM 'disconnected'",
        )
        .bind(now_iso())
        .bind(agent_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_connection(&self, agent_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE agents SET whatsapp_status = 'disconnected', whatsapp_qr_code = NULL, \
             whatsapp_instance_name = NULL, whatsapp_phone_number = NULL, \
             whatsapp_connected_at = NULL, updated_at = $1 WHERE id = $2",
        )
        .bind(now_iso())
        .bind(agent_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

pub struct PgGatewayConfigs {
    db: PgPool,
}

impl PgGatewayConfigs {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl GatewayConfigSource for PgGatewayConfigs {
    async fn load(&self) -> Result<Option<GatewayConfig>, StoreError> {
        let row = sqlx::query(
            "SELECT id, base_url, api_key, webhook_url, created_by, created_at, updated_at \
             FROM gateway_config ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(parse_gateway_config_row))
    }
}
