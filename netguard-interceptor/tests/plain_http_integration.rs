//! End-to-end exercise of the plain-HTTP interceptor loop against a real
//! loopback upstream, with no plugins registered (gate/request/response
//! phases all no-ops) so the test isolates wire framing and pooling
//! rather than policy behavior.

use netguard_core::events::noop;
use netguard_core::metrics::noop as noop_metrics;
use netguard_interceptor::ConnPool;
use netguard_plugin::engine::Engine;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_echo_upstream() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    let n = match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let _ = &buf[..n]; // drain the request, ignore its contents
                    let body = b"ok";
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: keep-alive\r\n\r\n",
                        body.len()
                    );
                    if sock.write_all(resp.as_bytes()).await.is_err() {
                        return;
                    }
                    if sock.write_all(body).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

async fn spawn_chunked_upstream() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = sock.read(&mut buf).await.unwrap();
        sock.write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nconnection: close\r\n\r\n").await.unwrap();
        sock.write_all(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").await.unwrap();
    });
    addr
}

#[tokio::test]
async fn relays_a_chunked_upstream_response_end_to_end() {
    let upstream_addr = spawn_chunked_upstream().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let engine = Arc::new(Engine::new("run-1", "test-agent", noop()));
    let pool = Arc::new(ConnPool::default());

    tokio::spawn(async move {
        let (sock, peer) = listener.accept().await.unwrap();
        netguard_interceptor::interceptor::handle_connection(sock, peer, engine, pool, noop_metrics())
            .await
            .unwrap();
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!("GET / HTTP/1.1\r\nHost: {upstream_addr}\r\nConnection: close\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "unexpected response: {text}");
    assert!(text.ends_with("hello world"), "unexpected response: {text}");
    assert!(text.to_lowercase().contains("content-length: 11"), "body not re-framed with Content-Length: {text}");
}

#[tokio::test]
async fn relays_a_request_end_to_end_through_an_unconfigured_engine() {
    let upstream_addr = spawn_echo_upstream().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let engine = Arc::new(Engine::new("run-1", "test-agent", noop()));
    let pool = Arc::new(ConnPool::default());

    let engine_clone = Arc::clone(&engine);
    let pool_clone = Arc::clone(&pool);
    tokio::spawn(async move {
        let (sock, peer) = listener.accept().await.unwrap();
        netguard_interceptor::interceptor::handle_connection(sock, peer, engine_clone, pool_clone, noop_metrics())
            .await
            .unwrap();
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!("GET / HTTP/1.1\r\nHost: {upstream_addr}\r\nConnection: close\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "unexpected response: {text}");
    assert!(text.ends_with("ok"));
}
