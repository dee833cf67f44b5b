use anyhow::Result;

use crate::comm::get_global_config_manager;

/// 服务端监听与节点配置 / Listener and node options.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub tcp_port: u16,
    pub ws_port: u16,
    pub http_port: u16,
    pub node_id: u16,
    /// 连接最大空闲时长（秒） / max idle seconds for an authed connection
    pub conn_idle_secs: u64,
    /// 未认证连接的宽限（秒） / grace for connections that never authenticate
    pub auth_deadline_secs: u64,
}

/// 鉴权配置 / Auth options.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub token_auth_on: bool,
    pub manager_uid: String,
    pub manager_token_on: bool,
    pub manager_token: String,
}

/// 踢人宽限期，保留原有的非对称取值并开放配置
/// Kick grace periods; the asymmetric defaults are preserved and configurable.
#[derive(Clone, Debug)]
pub struct KickConfig {
    pub grace_same_device_ms: u64,
    pub grace_other_device_ms: u64,
    /// 鉴权失败应答后的关闭延迟 / close delay after a failed-auth response flush
    pub auth_fail_close_ms: u64,
}

/// Webhook配置 / Webhook options.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub secret: Option<String>,
    pub timeout_ms: u64,
}

/// 数据源配置 / Datasource options.
#[derive(Clone, Debug)]
pub struct DatasourceConfig {
    pub enabled: bool,
    pub addr: String,
    pub timeout_ms: u64,
}

/// 重试队列配置 / Retry queue options.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub interval_ms: u64,
    pub max_count: u32,
    pub wheel_size: usize,
    pub tick_ms: u64,
}

/// 频道配置 / Channel options.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// 个人频道存储键的分隔符 / delimiter of the canonical person-channel key
    pub fake_delimiter: String,
}

/// 全量选项 / Aggregated server options.
#[derive(Clone, Debug)]
pub struct Options {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub kick: KickConfig,
    pub webhook: WebhookConfig,
    pub datasource: DatasourceConfig,
    pub retry: RetryConfig,
    pub channel: ChannelConfig,
}

impl Options {
    /// 从全局配置管理器装载 / Load from the global config manager.
    pub fn load() -> Result<Options> {
        let cm = get_global_config_manager()?;
        Ok(Options {
            server: ServerConfig {
                host: cm.get_or("server.host", "0.0.0.0".to_string()),
                tcp_port: cm.get_or("server.tcp_port", 5100_i64) as u16,
                ws_port: cm.get_or("server.ws_port", 5200_i64) as u16,
                http_port: cm.get_or("server.http_port", 5300_i64) as u16,
                node_id: cm.get_or("server.node_id", 1_i64) as u16,
                conn_idle_secs: cm.get_or("server.conn_idle_secs", 90_i64) as u64,
                auth_deadline_secs: cm.get_or("server.auth_deadline_secs", 10_i64) as u64,
            },
            auth: AuthConfig {
                token_auth_on: cm.get_or("auth.token_auth_on", false),
                manager_uid: cm.get_or("auth.manager_uid", "____manager".to_string()),
                manager_token_on: cm.get_or("auth.manager_token_on", false),
                manager_token: cm.get_or("auth.manager_token", String::new()),
            },
            kick: KickConfig {
                grace_same_device_ms: cm.get_or("kick.grace_same_device_ms", 4000_i64) as u64,
                grace_other_device_ms: cm.get_or("kick.grace_other_device_ms", 5000_i64) as u64,
                auth_fail_close_ms: cm.get_or("kick.auth_fail_close_ms", 250_i64) as u64,
            },
            webhook: WebhookConfig {
                enabled: cm.get_or("webhook.enabled", false),
                url: cm.get::<String>("webhook.url").ok(),
                secret: cm.get::<String>("webhook.secret").ok(),
                timeout_ms: cm.get_or("webhook.timeout_ms", 3000_i64) as u64,
            },
            datasource: DatasourceConfig {
                enabled: cm.get_or("datasource.enabled", false),
                addr: cm.get_or("datasource.addr", String::new()),
                timeout_ms: cm.get_or("datasource.timeout_ms", 5000_i64) as u64,
            },
            retry: RetryConfig {
                interval_ms: cm.get_or("retry.interval_ms", 10_000_i64) as u64,
                max_count: cm.get_or("retry.max_count", 5_i64) as u32,
                wheel_size: cm.get_or("retry.wheel_size", 64_i64) as usize,
                tick_ms: cm.get_or("retry.tick_ms", 250_i64) as u64,
            },
            channel: ChannelConfig {
                fake_delimiter: cm.get_or("channel.fake_delimiter", "@".to_string()),
            },
        })
    }

    /// 判定外部传入的频道ID是否已是规范个人频道键
    /// Whether an externally minted id is already the canonical person-channel key.
    pub fn is_fake_channel(&self, channel_id: &str) -> bool {
        channel_id.contains(&self.channel.fake_delimiter)
    }
}

impl Default for Options {
    /// 测试用缺省选项 / Defaults used by tests.
    fn default() -> Self {
        Options {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                tcp_port: 5100,
                ws_port: 5200,
                http_port: 5300,
                node_id: 1,
                conn_idle_secs: 90,
                auth_deadline_secs: 10,
            },
            auth: AuthConfig {
                token_auth_on: false,
                manager_uid: "____manager".to_string(),
                manager_token_on: false,
                manager_token: String::new(),
            },
            kick: KickConfig {
                grace_same_device_ms: 4000,
                grace_other_device_ms: 5000,
                auth_fail_close_ms: 250,
            },
            webhook: WebhookConfig { enabled: false, url: None, secret: None, timeout_ms: 3000 },
            datasource: DatasourceConfig { enabled: false, addr: String::new(), timeout_ms: 5000 },
            retry: RetryConfig { interval_ms: 10_000, max_count: 5, wheel_size: 64, tick_ms: 250 },
            channel: ChannelConfig { fake_delimiter: "@".to_string() },
        }
    }
}
