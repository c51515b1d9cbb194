// 请求监控中间件
use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Protocol label derived from the request path
pub fn protocol_of(path: &str) -> Option<&'static str> {
    if path.starts_with("/v1/messages") {
        Some("anthropic")
    } else if path.starts_with("/v1beta/models") {
        Some("gemini")
    } else {
        None
    }
}

/// Model name embedded in a Gemini native path
pub fn gemini_model_of(path: &str) -> Option<&str> {
    path.strip_prefix("/v1beta/models/")
        .and_then(|rest| rest.split(':').next())
        .filter(|m| !m.is_empty())
}

/// 请求监控中间件
///
/// 记录请求的方法、路径、状态码与耗时（流式响应只计到响应头）。
pub async fn monitor_middleware(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    // 提取客户端 IP
    let client_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        });

    let response = next.run(request).await;

    tracing::info!(
        "[Monitor] {} {} → {} ({}ms) client_ip={} model={} protocol={}",
        method,
        path,
        response.status().as_u16(),
        start.elapsed().as_millis(),
        client_ip.as_deref().unwrap_or("-"),
        gemini_model_of(&path).unwrap_or("-"),
        protocol_of(&path).unwrap_or("-"),
    );

    response
}
