use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::gateway::{
    ConnectionUpdateData, MessagingGateway, QrCodePayload, QrCodeUpdateData, WEBHOOK_EVENTS,
};
use crate::store::{AgentStore, GatewayConfigSource};
use crate::types::{now_iso, GatewayWebhookBody, WhatsappStatus, WorkflowError};

/// Drives an agent's WhatsApp link from unlinked to connected and reconciles
/// asynchronous gateway callbacks into the persisted sub-state. All
/// coordination between the caller-facing operations and the webhook path
/// goes through the store; the workflow itself holds no mutable state.
pub struct ConnectionWorkflow {
    store: Arc<dyn AgentStore>,
    configs: Arc<dyn GatewayConfigSource>,
    gateway: Arc<dyn MessagingGateway>,
}

#[derive(Debug, Clone)]
pub struct ConnectStarted {
    pub instance_name: String,
    pub qr_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub connected: bool,
    pub qr_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookReceipt {
    pub agent_id: Option<String>,
    pub applied: bool,
}

static LAST_INSTANCE_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Instance names must stay unique across rapid reconnect attempts, so the
/// millisecond component is bumped past the last issued value whenever two
/// calls land inside the same millisecond.
fn next_instance_millis() -> i64 {
    let mut prev = LAST_INSTANCE_MILLIS.load(Ordering::Relaxed);
    loop {
        let candidate = Utc::now().timestamp_millis().max(prev + 1);
        match LAST_INSTANCE_MILLIS.compare_exchange_weak(
            prev,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}

fn instance_name_for(agent_id: &str) -> String {
    let prefix: String = agent_id.chars().take(8).collect();
    format!("agent_{}_{}", prefix, next_instance_millis())
}

fn normalize_event_tag(event: &str) -> String {
    event.trim().to_ascii_lowercase().replace('_', ".")
}

impl ConnectionWorkflow {
    pub fn new(
        store: Arc<dyn AgentStore>,
        configs: Arc<dyn GatewayConfigSource>,
        gateway: Arc<dyn MessagingGateway>,
    ) -> Self {
        Self {
            store,
            configs,
            gateway,
        }
    }

    /// Creates a gateway instance for the agent and records the `connecting`
    /// sub-state. Nothing is persisted when instance creation fails; a failed
    /// webhook registration is logged and tolerated, since the QR can still be
    /// polled out of the store.
    pub async fn connect(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<ConnectStarted, WorkflowError> {
        let config = self
            .configs
            .load()
            .await?
            .ok_or(WorkflowError::ConfigurationMissing)?;
        let agent = self
            .store
            .agent_for_user(agent_id, user_id)
            .await?
            .ok_or(WorkflowError::NotFound)?;

        let instance_name = instance_name_for(&agent.id);
        let created = self.gateway.create_instance(&config, &instance_name).await?;

        if let Err(err) = self
            .gateway
            .set_webhook(&config, &instance_name, &config.webhook_url, &WEBHOOK_EVENTS)
            .await
        {
            eprintln!("[whatsapp] webhook registration failed for {instance_name}: {err}");
        }

        self.store
            .begin_connection(&agent.id, &instance_name, created.qr_code.as_deref())
            .await?;

        Ok(ConnectStarted {
            instance_name,
            qr_code: created.qr_code,
        })
    }

    /// Resets the entire link sub-state. The remote instance is not torn
    /// down; late events for its name are swallowed by the webhook path.
    pub async fn disconnect(&self, agent_id: &str, user_id: &str) -> Result<(), WorkflowError> {
        let agent = self
            .store
            .agent_for_user(agent_id, user_id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        self.store.clear_connection(&agent.id).await?;
        Ok(())
    }

    /// On-demand connection-state probe against the gateway, bypassing the
    /// persisted sub-state entirely.
    pub async fn check_status(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<String, WorkflowError> {
        let config = self
            .configs
            .load()
            .await?
            .ok_or(WorkflowError::ConfigurationMissing)?;
        let agent = self
            .store
            .agent_for_user(agent_id, user_id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        let instance_name = agent
            .whatsapp_instance_name
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or(WorkflowError::NotFound)?;
        Ok(self.gateway.connection_state(&config, instance_name).await?)
    }

    /// Store-only polling convenience for callers that render the QR. Not
    /// authoritative: the webhook path owns the transitions. Timing out is a
    /// normal outcome, not an error; the caller shows "still waiting". The
    /// latest QR observed is surfaced so a rotated code replaces a stale one.
    pub async fn poll_until_connected(
        &self,
        agent_id: &str,
        user_id: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<PollOutcome, WorkflowError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_qr: Option<String> = None;
        loop {
            let agent = self
                .store
                .agent_for_user(agent_id, user_id)
                .await?
                .ok_or(WorkflowError::NotFound)?;
            if agent.whatsapp_qr_code.is_some() {
                last_qr = agent.whatsapp_qr_code.clone();
            }
            if agent.whatsapp_status == Some(WhatsappStatus::Connected) {
                return Ok(PollOutcome {
                    connected: true,
                    qr_code: None,
                });
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Ok(PollOutcome {
                    connected: false,
                    qr_code: last_qr,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Translates one gateway callback into a state transition. Unknown
    /// instances and unrecognized events are acknowledged without mutation:
    /// the gateway keeps delivering events for superseded instance names
    /// after a disconnect, and retrying those forever would help nobody.
    pub async fn apply_webhook_event(
        &self,
        payload: &GatewayWebhookBody,
    ) -> Result<WebhookReceipt, WorkflowError> {
        let instance_name = payload
            .instance
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WorkflowError::BadRequest("no instance provided".to_string()))?;

        let Some(agent) = self.store.agent_by_instance_name(instance_name).await? else {
            eprintln!("[webhook] no agent for instance {instance_name}, ignoring");
            return Ok(WebhookReceipt {
                agent_id: None,
                applied: false,
            });
        };

        let event = payload.event.as_deref().unwrap_or("");
        let applied = match normalize_event_tag(event).as_str() {
            "qrcode.updated" => self.apply_qr_update(&agent.id, &payload.data).await?,
            "connection.update" => {
                self.apply_connection_update(&agent.id, &payload.data).await?
            }
            "messages.upsert" => {
                // Reserved for the AI reply pipeline.
                eprintln!("[webhook] message event for agent {}, not processed", agent.id);
                false
            }
            other => {
                eprintln!("[webhook] unhandled event '{other}' for instance {instance_name}");
                false
            }
        };

        Ok(WebhookReceipt {
            agent_id: Some(agent.id),
            applied,
        })
    }

    async fn apply_qr_update(&self, agent_id: &str, data: &Value) -> Result<bool, WorkflowError> {
        let update =
            serde_json::from_value::<QrCodeUpdateData>(data.clone()).unwrap_or_default();
        let Some(qr_code) = update.qrcode.and_then(QrCodePayload::into_base64) else {
            return Ok(false);
        };
        let applied = self.store.record_qr_code(agent_id, &qr_code).await?;
        if applied {
            eprintln!("[webhook] qr code updated for agent {agent_id}");
        }
        Ok(applied)
    }

    async fn apply_connection_update(
        &self,
        agent_id: &str,
        data: &Value,
    ) -> Result<bool, WorkflowError> {
        let update =
            serde_json::from_value::<ConnectionUpdateData>(data.clone()).unwrap_or_default();
        match update.state() {
            Some("open") | Some("connected") => {
                let applied = self
                    .store
                    .record_connected(agent_id, update.phone_number.as_deref(), &now_iso())
                    .await?;
                if applied {
                    eprintln!("[webhook] agent {agent_id} connected");
                }
                Ok(applied)
            }
            Some("close") | Some("disconnected") => {
                let applied = self.store.record_disconnected(agent_id).await?;
                if applied {
                    eprintln!("[webhook] agent {agent_id} disconnected");
                }
                Ok(applied)
            }
            // Intermediate states ("connecting", "refused", ...) carry no
            // transition of their own.
            _ => Ok(false),
        }
    }
}
