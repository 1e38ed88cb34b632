use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::store::StoreError;
use crate::workflow::ConnectionWorkflow;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub struct AppState {
    pub db: PgPool,
    pub public_base_url: String,
    pub workflow: ConnectionWorkflow,
}

/// Observable WhatsApp link states. A row that has never been linked carries
/// no status at all, which the API reports the same way as `disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhatsappStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl WhatsappStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WhatsappStatus::Connecting => "connecting",
            WhatsappStatus::Connected => "connected",
            WhatsappStatus::Disconnected => "disconnected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "connecting" => Some(WhatsappStatus::Connecting),
            "connected" => Some(WhatsappStatus::Connected),
            "disconnected" => Some(WhatsappStatus::Disconnected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBase {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub avatar_url: String,
    pub tags: Vec<String>,
    pub instructions: String,
    pub knowledge_base: KnowledgeBase,
    pub model_provider: String,
    pub model_name: String,
    pub ai_api_key: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub whatsapp_instance_name: Option<String>,
    pub whatsapp_status: Option<WhatsappStatus>,
    pub whatsapp_qr_code: Option<String>,
    pub whatsapp_phone_number: Option<String>,
    pub whatsapp_connected_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub id: String,
    pub base_url: String,
    pub api_key: String,
    pub webhook_url: String,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    pub id: String,
    pub mode: String,
    pub available_providers: Value,
    pub provider_configs: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub full_name: String,
    pub avatar_url: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupBody {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupAdminBody {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchProfileBody {
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub knowledge_base: KnowledgeBase,
    #[serde(default)]
    pub model_provider: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub ai_api_key: String,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAgentBody {
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub tags: Option<Vec<String>>,
    pub instructions: Option<String>,
    pub knowledge_base: Option<KnowledgeBase>,
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
    pub ai_api_key: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfigBody {
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfigBody {
    pub mode: String,
    pub available_providers: Option<Value>,
    pub provider_configs: Option<Value>,
}

/// Inbound gateway webhook envelope. `data` keeps its raw shape; the event
/// handlers decode only the fields they rely on.
#[derive(Debug, Default, Deserialize)]
pub struct GatewayWebhookBody {
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("messaging gateway is not configured")]
    ConfigurationMissing,
    #[error("agent not found")]
    NotFound,
    #[error("missing or invalid caller identity")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent() -> Agent {
        Agent {
            id: "a1".to_string(),
            user_id: "u1".to_string(),
            name: "Support".to_string(),
            description: String::new(),
            avatar_url: String::new(),
            tags: vec!["sales".to_string()],
            instructions: "Be helpful.".to_string(),
            knowledge_base: KnowledgeBase {
                text: "FAQ".to_string(),
                urls: vec!["https://example.com/docs".to_string()],
            },
            model_provider: "openai".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            ai_api_key: String::new(),
            status: "active".to_string(),
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            updated_at: "2026-01-01T00:00:00+00:00".to_string(),
            whatsapp_instance_name: None,
            whatsapp_status: None,
            whatsapp_qr_code: None,
            whatsapp_phone_number: None,
            whatsapp_connected_at: None,
        }
    }

    #[test]
    fn whatsapp_substate_round_trip_keeps_null_qr() {
        let mut agent = sample_agent();
        agent.whatsapp_instance_name = Some("agent_abcd1234_1000".to_string());
        agent.whatsapp_status = Some(WhatsappStatus::Connecting);
        agent.whatsapp_qr_code = None;

        let encoded = serde_json::to_value(&agent).unwrap();
        assert!(encoded.get("whatsappQrCode").unwrap().is_null());

        let decoded: Agent = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.whatsapp_qr_code, None);
        assert_eq!(decoded, agent);
    }

    #[test]
    fn empty_qr_string_stays_distinct_from_null() {
        let mut agent = sample_agent();
        agent.whatsapp_status = Some(WhatsappStatus::Connecting);
        agent.whatsapp_qr_code = Some(String::new());

        let encoded = serde_json::to_string(&agent).unwrap();
        let decoded: Agent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.whatsapp_qr_code, Some(String::new()));
        assert_ne!(decoded.whatsapp_qr_code, None);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&WhatsappStatus::Connecting).unwrap(),
            "\"connecting\""
        );
        assert_eq!(WhatsappStatus::parse("connected"), Some(WhatsappStatus::Connected));
        assert_eq!(WhatsappStatus::parse("open"), None);
    }
}
