//! Monitoring endpoint
//!
//! A minimal HTTP responder serving the connection registry snapshot as JSON
//! on `GET /api/stats`. It is a pure consumer of
//! [`stats_snapshot`](crate::context::stats_snapshot): snapshots are copied
//! out from under the registry lock, so serving them never slows a relay.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use std::net::Shutdown;

use tokio::net::{TcpListener, TcpStream};

use crate::context::{self, SharedContext};

const MAX_REQUEST_SIZE: usize = 4 * 1024;

async fn read_request_head(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of request",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(buf);
        }
        if buf.len() > MAX_REQUEST_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request too large"));
        }
    }
}

async fn handle_client(mut stream: TcpStream) -> io::Result<()> {
    let head = read_request_head(&mut stream).await?;
    let head = String::from_utf8_lossy(&head);

    let mut parts = head.lines().next().unwrap_or("").split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    let response = if method == "GET" && (path == "/api/stats" || path.starts_with("/api/stats?")) {
        let body = serde_json::to_string(&context::stats_snapshot())?;
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_owned()
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown(Shutdown::Write)
}

async fn accept_loop(mut listener: TcpListener) -> io::Result<()> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(s) => s,
            Err(err) => {
                error!("accept failed: {}", err);
                continue;
            }
        };

        tokio::spawn(async move {
            if let Err(err) = handle_client(stream).await {
                debug!("stats request from {} failed: {}", peer_addr, err);
            }
        });
    }
}

/// Binds the stats endpoint on loopback and serves until shutdown
pub async fn run(context: SharedContext) -> io::Result<()> {
    let port = match context.config().monitor_port {
        Some(port) => port,
        None => return Ok(()),
    };

    // monitoring is operator-local; never exposed beyond loopback
    let listen_addr = format!("127.0.0.1:{}", port);

    let listener = TcpListener::bind(listen_addr.as_str()).await.map_err(|err| {
        error!("failed to listen on {}: {}", listen_addr, err);
        err
    })?;

    info!("stats endpoint listening on {}", listen_addr);

    match crate::relay::until_shutdown(accept_loop(listener)).await {
        Some(result) => result,
        None => {
            info!("stats endpoint on {} stopped", listen_addr);
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn stats_path_returns_json_snapshot() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_client(stream).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /api/stats HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        server.await.unwrap();

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert!(json.get("total_connections").is_some());
        assert!(json.get("connections").unwrap().is_array());
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_client(stream).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /secret HTTP/1.0\r\n\r\n").await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        server.await.unwrap();

        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 404"));
    }
}
