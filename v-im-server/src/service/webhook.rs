use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::WebhookConfig;

/// Webhook事件类型 / Webhook event kinds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    UserOnline,
    UserOffline,
    MsgRetryExceeded,
}

/// 推送给第三方的事件包裹 / Envelope delivered to the third-party endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub event_type: WebhookEventType,
    pub event_id: String,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

/// 在线状态事件数据 / Online/offline event payload.
#[derive(Debug, Clone, Serialize)]
pub struct OnlineStatusData {
    pub uid: String,
    pub device_flag: u8,
    pub conn_id: u64,
    /// 同uid同设备类型的在线连接数 / live connections for (uid, deviceFlag)
    pub online_count: u32,
    /// 该uid全部在线连接数 / live connections for the uid overall
    pub total_online_count: u32,
}

/// Webhook发射器 / Webhook emitter.
pub struct Webhook {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl Webhook {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .unwrap_or_default();
        Webhook { config, client }
    }

    /// webhook是否启用 / Whether the webhook is configured on.
    pub fn on(&self) -> bool {
        self.config.enabled && self.config.url.is_some()
    }

    /// 用户上线 / User came online.
    pub fn online(&self, uid: &str, device_flag: u8, conn_id: u64, online_count: u32, total_online_count: u32) {
        self.emit(
            WebhookEventType::UserOnline,
            serde_json::json!(OnlineStatusData {
                uid: uid.to_string(),
                device_flag,
                conn_id,
                online_count,
                total_online_count,
            }),
        );
    }

    /// 用户下线 / User went offline.
    pub fn offline(&self, uid: &str, device_flag: u8, conn_id: u64, online_count: u32, total_online_count: u32) {
        self.emit(
            WebhookEventType::UserOffline,
            serde_json::json!(OnlineStatusData {
                uid: uid.to_string(),
                device_flag,
                conn_id,
                online_count,
                total_online_count,
            }),
        );
    }

    /// 重试超限被放弃的消息 / A delivery dropped after exhausting retries.
    pub fn retry_exceeded(&self, uid: &str, device_id: &str, message_id: i64, send_count: u32) {
        self.emit(
            WebhookEventType::MsgRetryExceeded,
            serde_json::json!({
                "uid": uid,
                "device_id": device_id,
                "message_id": message_id,
                "send_count": send_count,
            }),
        );
    }

    fn emit(&self, event_type: WebhookEventType, data: serde_json::Value) {
        if !self.on() {
            return;
        }
        let event = WebhookEvent {
            event_type,
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        };
        let config = self.config.clone();
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = deliver(client, config, event).await {
                error!("❌ webhook事件投递失败 / webhook delivery failed: {}", e);
            }
        });
    }
}

async fn deliver(client: reqwest::Client, config: WebhookConfig, event: WebhookEvent) -> Result<()> {
    let Some(url) = config.url.as_ref() else {
        return Ok(());
    };
    let mut request = client.post(url).json(&event);
    if let Some(secret) = &config.secret {
        request = request.header("X-VIM-Signature", signature(&event, secret));
    }
    let response = request.send().await?;
    if response.status().is_success() {
        info!("✅ webhook事件已投递 / webhook event {} delivered", event.event_id);
        Ok(())
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!("webhook应答异常 / webhook responded {}: {}", status, body);
        Err(anyhow::anyhow!("webhook delivery failed with status {}", status))
    }
}

/// HMAC-SHA256 事件签名 / Event signature header value.
pub fn signature(event: &WebhookEvent, secret: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;
    let payload = serde_json::json!({
        "event_id": event.event_id,
        "event_type": event.event_type,
        "timestamp": event.timestamp,
    })
    .to_string();
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_webhook_is_off() {
        let webhook = Webhook::new(WebhookConfig { enabled: false, url: None, secret: None, timeout_ms: 100 });
        assert!(!webhook.on());
        let webhook = Webhook::new(WebhookConfig {
            enabled: true,
            url: None,
            secret: None,
            timeout_ms: 100,
        });
        // 开关打开但无地址仍视为关闭 / enabled without a url still counts as off
        assert!(!webhook.on());
    }

    #[test]
    fn signature_is_deterministic() {
        let event = WebhookEvent {
            event_type: WebhookEventType::UserOnline,
            event_id: "e1".to_string(),
            timestamp: 123,
            data: serde_json::json!({}),
        };
        let a = signature(&event, "s3cret");
        let b = signature(&event, "s3cret");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
        assert_ne!(a, signature(&event, "other"));
    }
}
