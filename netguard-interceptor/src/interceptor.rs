//! Plain-HTTP interceptor loop. Grounded on
//! `ando_proxy::connection::handle_connection`'s keepalive request loop,
//! ported from monoio's buffer-ownership `read`/`write_all` to
//! `tokio::io::{AsyncReadExt, AsyncWriteExt}`, and from a raw TCP-relay
//! model to running the guest's request/response through the policy
//! engine's Gate, Request and Response phases (Route is not run on this
//! path: plain HTTP carries no SNI to route on).

use crate::pool::ConnPool;
use crate::wire::{build_client_response, build_upstream_request, read_request, read_response, write_status_response};
use netguard_core::error::EngineError;
use netguard_core::glob::normalize_host;
use netguard_core::metrics::RequestMetrics;
use netguard_core::types::{HttpRequest, HttpResponse};
use netguard_plugin::engine::Engine;
use netguard_plugin::plugin::PluginContext;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle one guest connection end to end: parse each request, run it
/// through the engine, relay to (and from) the upstream, and loop while
/// both sides keep the connection alive.
pub async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    engine: Arc<Engine>,
    pool: Arc<ConnPool>,
    metrics: Arc<dyn RequestMetrics>,
) -> anyhow::Result<()> {
    let mut ctx = PluginContext::new(peer_addr.ip().to_string());
    let mut read_buf = Vec::with_capacity(8192);

    loop {
        let request_started = Instant::now();
        let (line, body) = match read_request(&mut client, &mut read_buf).await? {
            Some(parsed) => parsed,
            None => return Ok(()),
        };

        let host_header = line.host_header.clone().unwrap_or_default();
        let (host, port) = split_host_port(&host_header);
        if host.is_empty() {
            write_status_response(&mut client, 400, "text/plain", b"Missing Host header").await?;
            return Ok(());
        }

        let req = HttpRequest {
            method: line.method,
            scheme: "http".to_string(),
            host: host.clone(),
            port,
            path: line.path,
            query: line.query,
            headers: line.headers,
            body,
        };

        let outcome = process_request(&engine, &mut ctx, &host, req).await;
        let req = match outcome {
            Ok(req) => req,
            Err(e) => {
                write_status_response(&mut client, e.status_code(), e.content_type(), &e.body()).await?;
                return Ok(());
            }
        };

        let target = req.host_header();
        let mut upstream = match pool.take(&target).await {
            Some(s) => s,
            None => match tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&target)).await {
                Ok(Ok(s)) => {
                    let _ = s.set_nodelay(true);
                    s
                }
                Ok(Err(e)) => {
                    let err = EngineError::UpstreamDial(e.to_string());
                    write_status_response(&mut client, err.status_code(), err.content_type(), &err.body()).await?;
                    return Ok(());
                }
                Err(_) => {
                    let err = EngineError::UpstreamDial("connect timed out".to_string());
                    write_status_response(&mut client, err.status_code(), err.content_type(), &err.body()).await?;
                    return Ok(());
                }
            },
        };

        let upstream_started = Instant::now();
        let relayed = relay(&req, &host, &mut upstream, &engine, &mut ctx, &mut client, line.keep_alive).await;
        metrics.record_upstream_latency(&host, upstream_started.elapsed().as_secs_f64());

        let status = match relayed {
            Ok(status) => status,
            Err(e) => {
                let err = EngineError::UpstreamWrite(e.to_string());
                let _ = write_status_response(&mut client, err.status_code(), err.content_type(), &err.body()).await;
                return Ok(());
            }
        };
        if let Some(status) = status {
            metrics.record_request(&host, status, request_started.elapsed().as_secs_f64());
        }

        if line.keep_alive {
            pool.put(target, upstream).await;
        }
        if !line.keep_alive {
            return Ok(());
        }
    }
}

/// Gate + on_request. Route is deliberately skipped on the plain path.
async fn process_request(
    engine: &Engine,
    ctx: &mut PluginContext,
    host: &str,
    req: HttpRequest,
) -> Result<HttpRequest, EngineError> {
    let verdict = engine.gate(host, ctx);
    if !verdict.allowed {
        return Err(EngineError::host_blocked(verdict));
    }
    engine.on_request(req, host, ctx)
}

async fn relay<C>(
    req: &HttpRequest,
    host: &str,
    upstream: &mut TcpStream,
    engine: &Engine,
    ctx: &mut PluginContext,
    client: &mut C,
    client_keep_alive: bool,
) -> anyhow::Result<Option<u16>>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let wire = build_upstream_request(req);
    upstream.write_all(&wire).await?;

    let (parsed, body) = read_response(upstream).await?;
    let resp = HttpResponse { status: parsed.status, headers: parsed.headers, body };
    let resp = match engine.on_response(resp, req, host, ctx) {
        Ok(r) => r,
        Err(_) => return Ok(None), // connection dropped without a partial write, per phase-4 contract
    };

    let keep_alive = client_keep_alive && parsed.keep_alive;
    let out = build_client_response(resp.status, &resp.headers, &resp.body, keep_alive);
    client.write_all(&out).await?;
    Ok(Some(resp.status))
}

fn split_host_port(host_header: &str) -> (String, u16) {
    let normalized = normalize_host(host_header);
    match host_header.rsplit_once(':') {
        Some((_, p)) if p.chars().all(|c| c.is_ascii_digit()) => {
            (normalized, p.parse().unwrap_or(80))
        }
        _ => (normalized, 80),
    }
}
