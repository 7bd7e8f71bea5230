//! TLS interceptor loop. Grounded on `ando_proxy::worker`'s
//! per-connection accept loop for the overall shape, and on a per-SNI
//! certificate resolver for wiring the CA pool into a
//! `rustls::ServerConfig`. Unlike the plain path this one always runs
//! Route, re-validates the routed/unrouted host against Gate a second
//! time, and never pools upstream connections — a fresh dial per
//! request, since certificate/SNI state makes TLS connection reuse
//! awkward.

use crate::ca::CertificateAuthority;
use crate::wire::{build_client_response, build_upstream_request, read_request, read_response, write_status_response};
use netguard_core::error::EngineError;
use netguard_core::metrics::RequestMetrics;
use netguard_core::types::{HttpRequest, HttpResponse, RouteDirective};
use netguard_plugin::engine::Engine;
use netguard_plugin::plugin::PluginContext;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves a `rustls::sign::CertifiedKey` per SNI by minting (or
/// fetching a cached) leaf from the [`CertificateAuthority`].
#[derive(Debug)]
struct CaCertResolver {
    ca: Arc<CertificateAuthority>,
}

impl ResolvesServerCert for CaCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        let minted = self.ca.get_certificate(server_name).ok()?;
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(minted.private_key_der.clone()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der).ok()?;
        let chain = vec![
            CertificateDer::from(minted.leaf_der.clone()),
            CertificateDer::from(minted.root_der.clone()),
        ];
        Some(Arc::new(CertifiedKey::new(chain, signing_key)))
    }
}

/// Build the TLS-terminating acceptor used on the MITM port. The
/// process must install a default `rustls` crypto provider once at
/// startup (`netguard-server`'s `main.rs`) before calling this.
pub fn build_acceptor(ca: Arc<CertificateAuthority>) -> TlsAcceptor {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(CaCertResolver { ca }));
    TlsAcceptor::from(Arc::new(config))
}

/// Build the client config used to dial TLS upstreams, trusting the
/// standard web PKI root set (this is the MITM's real outbound leg, not
/// guest-facing, so it validates the upstream's actual certificate).
pub fn build_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

enum UpstreamConn {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamConn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamConn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamConn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamConn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamConn::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamConn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamConn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamConn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Handle one TLS-terminated guest connection.
pub async fn handle_connection(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    engine: Arc<Engine>,
    metrics: Arc<dyn RequestMetrics>,
) -> anyhow::Result<()> {
    let mut tls = acceptor.accept(tcp).await?;
    let server_name = tls
        .get_ref()
        .1
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| peer_addr.ip().to_string());

    let mut ctx = PluginContext::new(peer_addr.ip().to_string());
    let mut read_buf = Vec::with_capacity(8192);

    loop {
        let request_started = Instant::now();
        let (line, body) = match read_request(&mut tls, &mut read_buf).await? {
            Some(parsed) => parsed,
            None => return Ok(()),
        };

        let mut req = HttpRequest {
            method: line.method,
            scheme: "https".to_string(),
            host: server_name.clone(),
            port: 443,
            path: line.path,
            query: line.query,
            headers: line.headers,
            body,
        };

        // Gate once on the raw SNI before routing, per the generic
        // Gate -> Route -> OnRequest control flow.
        if let Err(e) = gate(&engine, &mut ctx, &server_name) {
            write_status_response(&mut tls, e.status_code(), e.content_type(), &e.body()).await?;
            return Ok(());
        }

        let route = engine.route(&mut req, &server_name, &mut ctx);
        let effective_host = route
            .directive
            .as_ref()
            .map(|d| d.backend_host.clone())
            .unwrap_or_else(|| server_name.clone());

        // Re-validate the resolved host a second time: a route directive
        // can point at a different host than the one the Gate phase
        // already cleared.
        if route.directive.is_some() {
            if let Err(e) = gate(&engine, &mut ctx, &effective_host) {
                write_status_response(&mut tls, e.status_code(), e.content_type(), &e.body()).await?;
                return Ok(());
            }
        }

        req.host = effective_host.clone();
        let req = match engine.on_request(req, &effective_host, &mut ctx) {
            Ok(req) => req,
            Err(e) => {
                write_status_response(&mut tls, e.status_code(), e.content_type(), &e.body()).await?;
                return Ok(());
            }
        };

        let routed = route.directive.clone();
        let upstream_started = Instant::now();
        let upstream = match dial(routed.as_ref(), &server_name, req.port, &connector).await {
            Ok(s) => s,
            Err(e) => {
                let err = EngineError::UpstreamDial(e.to_string());
                write_status_response(&mut tls, err.status_code(), err.content_type(), &err.body()).await?;
                return Ok(());
            }
        };

        let keep_alive = line.keep_alive;
        let relayed = relay(&req, &effective_host, upstream, routed.is_some(), &engine, &mut ctx, &mut tls, keep_alive).await;
        metrics.record_upstream_latency(&effective_host, upstream_started.elapsed().as_secs_f64());

        let status = match relayed {
            Ok(status) => status,
            Err(e) => {
                let err = EngineError::UpstreamWrite(e.to_string());
                let _ = write_status_response(&mut tls, err.status_code(), err.content_type(), &err.body()).await;
                return Ok(());
            }
        };
        if let Some(status) = status {
            metrics.record_request(&effective_host, status, request_started.elapsed().as_secs_f64());
        }

        if !keep_alive {
            return Ok(());
        }
    }
}

fn gate(engine: &Engine, ctx: &mut PluginContext, host: &str) -> Result<(), EngineError> {
    let verdict = engine.gate(host, ctx);
    if verdict.allowed {
        Ok(())
    } else {
        Err(EngineError::host_blocked(verdict))
    }
}

async fn dial(
    directive: Option<&RouteDirective>,
    server_name: &str,
    dst_port: u16,
    connector: &TlsConnector,
) -> anyhow::Result<UpstreamConn> {
    match directive {
        Some(d) if !d.use_tls => {
            let addr = format!("{}:{}", d.backend_host, d.backend_port);
            let stream = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&addr)).await??;
            let _ = stream.set_nodelay(true);
            Ok(UpstreamConn::Plain(stream))
        }
        Some(d) => {
            let addr = format!("{}:{}", d.backend_host, d.backend_port);
            let tcp = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&addr)).await??;
            let name = ServerName::try_from(d.backend_host.clone())?;
            let tls = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, connector.connect(name, tcp)).await??;
            Ok(UpstreamConn::Tls(Box::new(tls)))
        }
        None => {
            let addr = format!("{}:{}", server_name, dst_port);
            let tcp = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&addr)).await??;
            let name = ServerName::try_from(server_name.to_string())?;
            let tls = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, connector.connect(name, tcp)).await??;
            Ok(UpstreamConn::Tls(Box::new(tls)))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn relay<C>(
    req: &HttpRequest,
    host: &str,
    mut upstream: UpstreamConn,
    routed: bool,
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

    let (parsed, body) = read_response(&mut upstream).await?;
    let mut resp = HttpResponse { status: parsed.status, headers: parsed.headers, body };
    if routed {
        resp.headers.push("X-Routed-Via", "local-backend");
    }
    let resp = match engine.on_response(resp, req, host, ctx) {
        Ok(r) => r,
        Err(_) => return Ok(None),
    };

    let keep_alive = client_keep_alive && parsed.keep_alive;
    let out = build_client_response(resp.status, &resp.headers, &resp.body, keep_alive);
    client.write_all(&out).await?;
    Ok(Some(resp.status))
}
