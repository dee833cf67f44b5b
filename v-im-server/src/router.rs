use actix_web::web;

/// 路由配置包装 / Route configuration wrapper.
pub fn configure(cfg: &mut web::ServiceConfig) {
    crate::api::v1::health::basic::register(cfg, "/v1/health");
    crate::api::v1::channel::create::register(cfg, "/channel");
    crate::api::v1::channel::subscriber::register(cfg, "/channel");
    crate::api::v1::channel::blacklist::register(cfg, "/channel");
    crate::api::v1::channel::whitelist::register(cfg, "/channel");
    crate::api::v1::channel::messagesync::register(cfg, "/channel/messagesync");
    crate::api::v1::system::ip_blacklist::register(cfg, "/system/ip");
}
