use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DatasourceConfig;
use crate::storage::ChannelInfo;

/// 第三方数据源：频道成员关系的外部权威
/// Third-party datasource: external authority for channel membership.
#[async_trait]
pub trait Datasource: Send + Sync {
    async fn get_subscribers(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>>;
    async fn get_blacklist(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>>;
    async fn get_whitelist(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>>;
    /// 系统账号可向任何频道发消息 / system accounts may message anyone
    async fn get_system_uids(&self) -> Result<Vec<String>>;
    async fn get_channel_info(&self, channel_id: &str, channel_type: u8) -> Result<Option<ChannelInfo>>;
}

#[derive(Serialize)]
struct CmdRequest<'a> {
    cmd: &'a str,
    data: serde_json::Value,
}

#[derive(Serialize)]
struct ChannelQuery<'a> {
    channel_id: &'a str,
    channel_type: u8,
}

/// 频道信息应答，0/1标志在边界处转换
/// Channel-info response; 0/1 flags are converted at this boundary.
#[derive(Deserialize, Default)]
struct ChannelInfoResp {
    #[serde(default)]
    ban: i32,
    #[serde(default)]
    large: i32,
}

impl ChannelInfoResp {
    fn into_channel_info(self, channel_id: &str, channel_type: u8) -> ChannelInfo {
        ChannelInfo {
            channel_id: channel_id.to_string(),
            channel_type,
            ban: self.ban == 1,
            large: self.large == 1,
        }
    }
}

/// HTTP数据源：POST {cmd, data}，应答为JSON
/// HTTP datasource: POST `{cmd, data}`, JSON responses.
pub struct HttpDatasource {
    addr: String,
    client: reqwest::Client,
}

impl HttpDatasource {
    pub fn new(config: &DatasourceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .unwrap_or_default();
        HttpDatasource { addr: config.addr.clone(), client }
    }

    async fn request_cmd(&self, cmd: &str, data: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(&self.addr)
            .json(&CmdRequest { cmd, data })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "数据源HTTP状态码错误 / datasource http status [{}] for cmd {}",
                response.status(),
                cmd
            ));
        }
        Ok(response.json().await?)
    }

    async fn uid_list(&self, cmd: &str, channel_id: &str, channel_type: u8) -> Result<Vec<String>> {
        let value = self
            .request_cmd(cmd, serde_json::to_value(ChannelQuery { channel_id, channel_type })?)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| anyhow!("数据源应答格式有误 / bad datasource reply for {}: {}", cmd, e))
    }
}

#[async_trait]
impl Datasource for HttpDatasource {
    async fn get_subscribers(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>> {
        self.uid_list("getSubscribers", channel_id, channel_type).await
    }

    async fn get_blacklist(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>> {
        self.uid_list("getBlacklist", channel_id, channel_type).await
    }

    async fn get_whitelist(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>> {
        self.uid_list("getWhitelist", channel_id, channel_type).await
    }

    async fn get_system_uids(&self) -> Result<Vec<String>> {
        let value = self.request_cmd("getSystemUIDs", serde_json::json!({})).await?;
        serde_json::from_value(value)
            .map_err(|e| anyhow!("数据源应答格式有误 / bad getSystemUIDs reply: {}", e))
    }

    async fn get_channel_info(&self, channel_id: &str, channel_type: u8) -> Result<Option<ChannelInfo>> {
        let value = self
            .request_cmd(
                "getChannelInfo",
                serde_json::to_value(ChannelQuery { channel_id, channel_type })?,
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let resp: ChannelInfoResp = serde_json::from_value(value)
            .map_err(|e| anyhow!("数据源应答格式有误 / bad getChannelInfo reply: {}", e))?;
        Ok(Some(resp.into_channel_info(channel_id, channel_type)))
    }
}
