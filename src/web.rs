use crate::api::{parse_http_request, send_http_response, ApiRouter};
use chrono::Local;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

/// Simple HTTP server, only depends on tokio. Listens on all interfaces:
/// the enforcer is driven by a remote controller.
pub async fn start_server(
    port: u16,
    api_router: ApiRouter,
    shutdown_notify: Arc<tokio::sync::Notify>,
) -> Result<(), anyhow::Error> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("RPC server listening on {}", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let api_router = api_router.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, api_router).await {
                                error!("Error handling connection: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_notify.notified() => {
                info!("RPC server received shutdown signal, stopping...");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    api_router: ApiRouter,
) -> Result<(), anyhow::Error> {
    // Large enough for a sizable update batch in a single read; callers are
    // expected to bound batch sizes
    let mut buffer = vec![0; 64 * 1024];
    let n = stream.read(&mut buffer).await?;

    let request = match parse_http_request(&buffer[..n]) {
        Ok(request) => request,
        Err(e) => {
            error!("Failed to parse HTTP request: {}", e);
            let response = crate::api::HttpResponse::error(400, "Bad Request".to_string());
            send_http_response(&mut stream, &response).await?;
            return Ok(());
        }
    };

    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    debug!("[{}] {} {}", timestamp, request.method, request.path);

    let response = match api_router.route_request(&request).await {
        Ok(response) => response,
        Err(e) => {
            error!("Error handling request: {}", e);
            crate::api::HttpResponse::error(500, "Internal Server Error".to_string())
        }
    };

    send_http_response(&mut stream, &response).await?;

    Ok(())
}
