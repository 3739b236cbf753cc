pub mod enforcer;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::net::TcpStream;

pub use enforcer::EnforcerApiHandler;

/// JSON envelope for every API response
#[derive(Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            message: Some(message),
        }
    }
}

/// Parsed HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub body: Option<String>,
}

/// HTTP response
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: String) -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_string(),
            body,
        }
    }

    pub fn error(status: u16, message: String) -> Self {
        let error_response = ApiResponse::<()>::error(message);
        let body = serde_json::to_string(&error_response).unwrap_or_else(|_| {
            r#"{"status":"error","message":"JSON serialization failed"}"#.to_string()
        });
        Self {
            status,
            content_type: "application/json".to_string(),
            body,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain".to_string(),
            body: "Not Found".to_string(),
        }
    }
}

/// Routes requests to the enforcer handler
#[derive(Clone)]
pub struct ApiRouter {
    handler: EnforcerApiHandler,
}

impl ApiRouter {
    pub fn new(handler: EnforcerApiHandler) -> Self {
        Self { handler }
    }

    pub async fn route_request(&self, request: &HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        for route in self.handler.supported_routes() {
            if request.path.starts_with(route) {
                return self.handler.handle_request(request).await;
            }
        }
        Ok(HttpResponse::not_found())
    }
}

/// Parse an HTTP request from raw bytes
pub fn parse_http_request(request_bytes: &[u8]) -> Result<HttpRequest, anyhow::Error> {
    let request_str = String::from_utf8_lossy(request_bytes);
    let lines: Vec<&str> = request_str.lines().collect();

    if lines.is_empty() {
        return Err(anyhow::anyhow!("Empty request"));
    }

    // Request line
    let parts: Vec<&str> = lines[0].split_whitespace().collect();
    if parts.len() < 2 {
        return Err(anyhow::anyhow!("Invalid request line"));
    }

    let method = parts[0].to_string();
    let path_with_query = parts[1];

    // Split path and query parameters
    let (path, query_str) = if let Some(pos) = path_with_query.find('?') {
        (
            path_with_query[..pos].to_string(),
            Some(&path_with_query[pos + 1..]),
        )
    } else {
        (path_with_query.to_string(), None)
    };

    let mut query_params = HashMap::new();
    if let Some(query) = query_str {
        for param in query.split('&') {
            if let Some(eq_pos) = param.find('=') {
                let key = param[..eq_pos].to_string();
                let value = param[eq_pos + 1..].to_string();
                query_params.insert(key, value);
            }
        }
    }

    // Body (if present)
    let body = request_str
        .find("\r\n\r\n")
        .map(|body_start| request_str[body_start + 4..].to_string());

    Ok(HttpRequest {
        method,
        path,
        query_params,
        body,
    })
}

/// Write an HTTP response back to the client
pub async fn send_http_response(
    stream: &mut TcpStream,
    response: &HttpResponse,
) -> Result<(), anyhow::Error> {
    use tokio::io::AsyncWriteExt;

    let status_text = match response.status {
        200 => "OK",
        400 => "BAD REQUEST",
        404 => "Not Found",
        500 => "INTERNAL SERVER ERROR",
        _ => "UNKNOWN",
    };

    let http_response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
        response.status,
        status_text,
        response.content_type,
        response.body.len(),
        response.body
    );

    stream.write_all(http_response.as_bytes()).await?;
    Ok(())
}
