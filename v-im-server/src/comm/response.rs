use actix_web::{http::StatusCode, HttpResponse};

// 通用 HTTP 响应封装 / Generic HTTP response helpers.

/// 结构体自动转 JSON，失败则原样文本
/// Auto JSON from struct, fallback to plain text.
pub fn respond_any<T: serde::Serialize + std::fmt::Debug>(code: StatusCode, data: T) -> HttpResponse {
    match serde_json::to_value(&data) {
        Ok(v) => HttpResponse::build(code).json(v),
        Err(_) => HttpResponse::build(code)
            .content_type("text/plain; charset=utf-8")
            .body(format!("{:?}", data)),
    }
}

/// 成功应答 / Plain OK envelope.
pub fn respond_ok() -> HttpResponse {
    respond_any(StatusCode::OK, serde_json::json!({"status": "ok"}))
}

/// 错误应答 / Error envelope with message.
pub fn respond_error(msg: impl std::fmt::Display) -> HttpResponse {
    respond_any(
        StatusCode::BAD_REQUEST,
        serde_json::json!({"status": "error", "msg": msg.to_string()}),
    )
}
