//! Read-only status endpoint: one JSON document on `GET /`, served straight
//! off the socket. Everything else is a 404.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{AppError, Result};

pub struct StatusServer {
    listener: TcpListener,
    engine: Arc<Engine>,
}

impl StatusServer {
    pub async fn bind(engine: Arc<Engine>, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!(port = ?listener.local_addr()?.port(), "status endpoint listening");
        Ok(Self { listener, engine })
    }

    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = ?peer.to_string(), "status request accepted");
                    let engine = self.engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_request(stream, engine).await {
                            debug!(error = ?e.to_string(), "status request failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = ?e.to_string(), "status accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_request(stream: TcpStream, engine: Arc<Engine>) -> anyhow::Result<()> {
    let mut buf_client = BufReader::new(stream);

    let mut request_line = String::new();
    buf_client.read_line(&mut request_line).await?;
    let request_line = request_line.trim_end().to_string();
    if request_line.is_empty() {
        return Ok(());
    }

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        anyhow::bail!("malformed HTTP request line");
    }
    let method = parts[0];
    let target = parts[1];

    // Read and discard request headers.
    loop {
        let mut line = String::new();
        buf_client.read_line(&mut line).await?;
        if line.trim().is_empty() {
            break;
        }
    }

    let stream = buf_client.get_mut();
    if method.eq_ignore_ascii_case("GET") && target == "/" {
        let body = serde_json::to_string(&engine.status_report())?;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body,
        );
        stream.write_all(response.as_bytes()).await?;
    } else {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
    }
    stream.shutdown().await?;
    Ok(())
}

/// Fetch the status document from a running daemon. Used by the `status`
/// subcommand, outside any async runtime.
pub fn fetch(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{}/", port);
    let response = reqwest::blocking::get(&url)
        .map_err(|e| AppError::StatusUnreachable(e.to_string()))?;
    if !response.status().is_success() {
        return Err(AppError::StatusUnreachable(format!(
            "daemon answered HTTP {}",
            response.status()
        )));
    }
    response
        .text()
        .map_err(|e| AppError::StatusUnreachable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineConfig};
    use crate::mapping::MappingIndex;
    use crate::mux::MuxClient;
    use tokio::io::AsyncReadExt;

    fn idle_engine(dir: &std::path::Path) -> Arc<Engine> {
        let mapping_path = dir.join("mapping.json");
        std::fs::write(&mapping_path, "[]").unwrap();
        let mapping = MappingIndex::load(&mapping_path).unwrap();
        Engine::new(
            MuxClient::with_socket_path(dir.join("usbmuxd")),
            mapping,
            EngineConfig {
                mapping_path,
                tunnel_timeout: None,
                exit_on_os_error: false,
            },
        )
    }

    async fn request(port: u16, request: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_get_root_returns_status_json() {
        let dir = tempfile::tempdir().unwrap();
        let engine = idle_engine(dir.path());
        let server = StatusServer::bind(engine, 0).await.unwrap();
        let port = server.local_port();
        tokio::spawn(server.run());

        let response = request(port, "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.contains("Content-Type: application/json"));

        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert!(json["uptime"].as_f64().unwrap() >= 0.0);
        assert_eq!(json["async_exceptions_count"], 0);
        assert_eq!(json["tunnels_created_count"], 0);
        assert_eq!(json["tunnel_timeouts"], 0);
        assert!(json["mappings_file"]
            .as_str()
            .unwrap()
            .ends_with("mapping.json"));
        assert!(json["status_data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_routes_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = idle_engine(dir.path());
        let server = StatusServer::bind(engine, 0).await.unwrap();
        let port = server.local_port();
        tokio::spawn(server.run());

        let response = request(port, "GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

        let response = request(port, "POST / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
    }
}
