use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::types::GatewayConfig;

/// Events registered with the gateway for every instance. Message events are
/// delivered but not yet processed; they are reserved for the reply pipeline.
pub const WEBHOOK_EVENTS: [&str; 5] = [
    "QRCODE_UPDATED",
    "CONNECTION_UPDATE",
    "MESSAGES_UPSERT",
    "MESSAGES_UPDATE",
    "SEND_MESSAGE",
];

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Request(String),
    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct InstanceCreated {
    pub instance_name: String,
    pub qr_code: Option<String>,
}

/// The three gateway calls the connection workflow depends on. All of them
/// authenticate with the static `apikey` header from the shared gateway
/// configuration row.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn create_instance(
        &self,
        config: &GatewayConfig,
        instance_name: &str,
    ) -> Result<InstanceCreated, GatewayError>;

    async fn set_webhook(
        &self,
        config: &GatewayConfig,
        instance_name: &str,
        webhook_url: &str,
        events: &[&str],
    ) -> Result<(), GatewayError>;

    async fn connection_state(
        &self,
        config: &GatewayConfig,
        instance_name: &str,
    ) -> Result<String, GatewayError>;
}

/// QR payloads arrive either as an object carrying a `base64` field or as the
/// raw base64 string itself. Decoded in that order; an object without a
/// usable `base64` yields nothing rather than falling through to the raw
/// form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QrCodePayload {
    Object {
        #[serde(default)]
        base64: Option<String>,
    },
    Raw(String),
}

impl QrCodePayload {
    pub fn into_base64(self) -> Option<String> {
        match self {
            QrCodePayload::Object { base64 } => base64.filter(|v| !v.is_empty()),
            QrCodePayload::Raw(value) => {
                if value.is_empty() {
                    None
                } else {
                    Some(value)
                }
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct QrCodeUpdateData {
    #[serde(default)]
    pub qrcode: Option<QrCodePayload>,
}

/// `connection.update` events name the connection state under `state` or,
/// from older gateway builds, `connection`. `state` wins when both appear.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectionUpdateData {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default, rename = "phoneNumber")]
    pub phone_number: Option<String>,
}

impl ConnectionUpdateData {
    pub fn state(&self) -> Option<&str> {
        self.state
            .as_deref()
            .filter(|v| !v.is_empty())
            .or(self.connection.as_deref().filter(|v| !v.is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct CreateInstanceResponse {
    #[serde(default)]
    instance: Option<CreateInstanceInfo>,
    #[serde(default)]
    qrcode: Option<QrCodePayload>,
}

#[derive(Debug, Deserialize)]
struct CreateInstanceInfo {
    #[serde(default, rename = "instanceName")]
    instance_name: Option<String>,
}

/// Status responses carry the state at the top level or nested under
/// `instance`. Top level wins.
#[derive(Debug, Deserialize)]
struct ConnectionStateResponse {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    instance: Option<ConnectionStateInfo>,
}

#[derive(Debug, Deserialize)]
struct ConnectionStateInfo {
    #[serde(default)]
    state: Option<String>,
}

pub struct HttpGateway {
    http: reqwest::Client,
}

impl HttpGateway {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn read_success_body(response: reqwest::Response) -> Result<String, GatewayError> {
        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: raw_body,
            });
        }
        Ok(raw_body)
    }
}

fn gateway_url(config: &GatewayConfig, path: &str) -> String {
    format!("{}{}", config.base_url.trim_end_matches('/'), path)
}

#[async_trait]
impl MessagingGateway for HttpGateway {
    async fn create_instance(
        &self,
        config: &GatewayConfig,
        instance_name: &str,
    ) -> Result<InstanceCreated, GatewayError> {
        let response = self
            .http
            .post(gateway_url(config, "/instance/create"))
            .header("apikey", &config.api_key)
            .json(&json!({
                "instanceName": instance_name,
                "qrcode": true,
                "integration": "WHATSAPP-BAILEYS",
            }))
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        let raw_body = Self::read_success_body(response).await?;
        let body = serde_json::from_str::<CreateInstanceResponse>(&raw_body)
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        Ok(InstanceCreated {
            instance_name: body
                .instance
                .and_then(|i| i.instance_name)
                .unwrap_or_else(|| instance_name.to_string()),
            qr_code: body.qrcode.and_then(QrCodePayload::into_base64),
        })
    }

    async fn set_webhook(
        &self,
        config: &GatewayConfig,
        instance_name: &str,
        webhook_url: &str,
        events: &[&str],
    ) -> Result<(), GatewayError> {
        let response = self
            .http
            .post(gateway_url(config, &format!("/webhook/set/{instance_name}")))
            .header("apikey", &config.api_key)
            .json(&json!({
                "enabled": true,
                "url": webhook_url,
                "webhookByEvents": true,
                "webhookBase64": false,
                "events": events,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        Self::read_success_body(response).await?;
        Ok(())
    }

    async fn connection_state(
        &self,
        config: &GatewayConfig,
        instance_name: &str,
    ) -> Result<String, GatewayError> {
        let response = self
            .http
            .get(gateway_url(
                config,
                &format!("/instance/connectionState/{instance_name}"),
            ))
            .header("apikey", &config.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        let raw_body = Self::read_success_body(response).await?;
        let body = serde_json::from_str::<ConnectionStateResponse>(&raw_body)
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        body.state
            .filter(|v| !v.is_empty())
            .or(body.instance.and_then(|i| i.state).filter(|v| !v.is_empty()))
            .ok_or_else(|| GatewayError::Decode("missing connection state".to_string()))
    }
}
