//! HTTP/1.1 wire framing shared by the plain and TLS interceptor paths.
//!
//! Grounded on `ando_proxy::connection::handle_connection`'s manual
//! `httparse`-based parse loop and `ando_proxy::proxy::{build_response,
//! build_upstream_request}`, generalized from monoio's buffer-ownership
//! `read`/`write_all` API (which hands the buffer back on every call) to
//! `tokio::io::{AsyncRead, AsyncWrite}`'s borrow-based API, and from a
//! fixed 8 KiB read buffer to one that grows to fit the request/response.

use netguard_core::types::{HeaderMap, HttpRequest};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub struct ParsedRequestLine {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub host_header: Option<String>,
    pub keep_alive: bool,
}

fn split_path_query(raw: &str) -> (String, String) {
    match raw.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (raw.to_string(), String::new()),
    }
}

/// Read one HTTP/1.1 request off `stream` into `buf` (reused across
/// keep-alive iterations). Returns `None` on a clean EOF between
/// requests (the client closed the connection).
pub async fn read_request<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
) -> io::Result<Option<(ParsedRequestLine, Vec<u8>)>> {
    buf.clear();
    let mut tmp = [0u8; 8192];
    loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-request"));
        }
        buf.extend_from_slice(&tmp[..n]);

        let mut headers_raw = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers_raw);
        match parsed.parse(buf) {
            Ok(httparse::Status::Complete(body_offset)) => {
                let method = parsed.method.unwrap_or("GET").to_string();
                let (path, query) = split_path_query(parsed.path.unwrap_or("/"));

                let mut headers = HeaderMap::new();
                let mut keep_alive = true;
                let mut host_header = None;
                for h in parsed.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    let val = String::from_utf8_lossy(h.value).into_owned();
                    if h.name.eq_ignore_ascii_case("connection") {
                        keep_alive = !val.eq_ignore_ascii_case("close");
                    }
                    if h.name.eq_ignore_ascii_case("host") {
                        host_header = Some(val.clone());
                    }
                    headers.push(h.name.to_string(), val);
                }

                let content_length = headers
                    .get("content-length")
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if content_length > HttpRequest::MAX_BODY_BYTES {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "request body too large"));
                }

                let have = buf.len() - body_offset;
                if have < content_length {
                    let mut extra = vec![0u8; content_length - have];
                    stream.read_exact(&mut extra).await?;
                    buf.extend_from_slice(&extra);
                }
                let body = buf[body_offset..body_offset + content_length].to_vec();

                return Ok(Some((
                    ParsedRequestLine { method, path, query, headers, host_header, keep_alive },
                    body,
                )));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > HttpRequest::MAX_BODY_BYTES {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "request headers too large"));
                }
                continue;
            }
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        }
    }
}

pub struct ParsedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub keep_alive: bool,
}

/// Read one full HTTP/1.1 response (headers fully buffered, body fully
/// buffered per `Content-Length`) off `stream`.
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(ParsedResponse, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut tmp = [0u8; 8192];

    let (status, headers, body_offset) = loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed without a response"));
        }
        buf.extend_from_slice(&tmp[..n]);

        let mut headers_raw = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut headers_raw);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(offset)) => {
                let status = parsed.code.unwrap_or(502);
                let mut headers = HeaderMap::new();
                for h in parsed.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    headers.push(h.name.to_string(), String::from_utf8_lossy(h.value).into_owned());
                }
                break (status, headers, offset);
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        }
    };

    let keep_alive = !headers.get("connection").map(|v| v.eq_ignore_ascii_case("close")).unwrap_or(false);
    let content_length = headers.get("content-length").and_then(|v| v.trim().parse::<usize>().ok());

    let chunked = headers.get("transfer-encoding").map(|v| v.eq_ignore_ascii_case("chunked")).unwrap_or(false);

    let body = if chunked {
        read_chunked_body(stream, &mut buf, body_offset).await?
    } else if let Some(cl) = content_length {
        while buf.len() < body_offset + cl {
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
        }
        buf[body_offset..(body_offset + cl).min(buf.len())].to_vec()
    } else {
        // No Content-Length and not chunked: read until EOF (connection-close
        // delimited body), common for upstreams that close after one response.
        loop {
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
        }
        buf[body_offset..].to_vec()
    };

    Ok((ParsedResponse { status, headers, keep_alive }, body))
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Decode a `Transfer-Encoding: chunked` body starting at `cursor` within
/// `buf` (already holding the response headers and whatever chunk bytes
/// happened to arrive in the same read as the header terminator),
/// refilling from `stream` as needed until the terminating `0\r\n` chunk
/// and any trailers are consumed.
async fn read_chunked_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    mut cursor: usize,
) -> io::Result<Vec<u8>> {
    let mut tmp = [0u8; 8192];
    let mut body = Vec::new();

    loop {
        let size_line_end = loop {
            if let Some(pos) = find_crlf(&buf[cursor..]) {
                break cursor + pos;
            }
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed mid chunk-size line"));
            }
            buf.extend_from_slice(&tmp[..n]);
        };

        let size_line = std::str::from_utf8(&buf[cursor..size_line_end])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size line is not valid UTF-8"))?;
        // Chunk extensions (";name=value") are separated by a semicolon and ignored.
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("invalid chunk size {size_hex:?}")))?;
        cursor = size_line_end + 2;

        if body.len() + size > HttpRequest::MAX_BODY_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "chunked response body too large"));
        }

        if size == 0 {
            loop {
                match find_crlf(&buf[cursor..]) {
                    Some(0) => {
                        cursor += 2;
                        break;
                    }
                    Some(pos) => cursor += pos + 2,
                    None => {
                        let n = stream.read(&mut tmp).await?;
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&tmp[..n]);
                    }
                }
            }
            return Ok(body);
        }

        while buf.len() < cursor + size + 2 {
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed mid chunk body"));
            }
            buf.extend_from_slice(&tmp[..n]);
        }
        body.extend_from_slice(&buf[cursor..cursor + size]);
        cursor += size + 2;
    }
}

const HOP_BY_HOP: [&str; 4] = ["connection", "keep-alive", "transfer-encoding", "upgrade"];

/// Serialize `req` (as mutated by the engine) into an upstream-bound
/// HTTP/1.1 request, stripping hop-by-hop headers and recomputing
/// `Content-Length`.
pub fn build_upstream_request(req: &HttpRequest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(req.body.len() + 512);
    buf.extend_from_slice(req.method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(req.path.as_bytes());
    if !req.query.is_empty() {
        buf.push(b'?');
        buf.extend_from_slice(req.query.as_bytes());
    }
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    let mut wrote_host = false;
    for (name, value) in req.headers.iter() {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            wrote_host = true;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !wrote_host {
        buf.extend_from_slice(b"host: ");
        buf.extend_from_slice(req.host_header().as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"connection: keep-alive\r\n");
    if !req.body.is_empty() {
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(b"content-length: ");
        buf.extend_from_slice(itoa_buf.format(req.body.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&req.body);
    buf
}

fn write_status_line(buf: &mut Vec<u8>, status: u16) {
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(itoa_buf.format(status).as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(status_text(status).as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// Serialize a response (body already finalized by the engine) to send
/// back to the guest, recomputing `Content-Length`.
pub fn build_client_response(status: u16, headers: &HeaderMap, body: &[u8], keep_alive: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(body.len() + 256);
    write_status_line(&mut buf, status);
    for (name, value) in headers.iter() {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"content-length: ");
    buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(if keep_alive { b"connection: keep-alive\r\n" } else { b"connection: close\r\n" });
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
    buf
}

/// Write a plain error response (used for gate/plugin blocks and 502s
/// that never reach the engine's own body).
pub async fn write_status_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(body.len() + 128);
    write_status_line(&mut buf, status);
    buf.extend_from_slice(format!("content-type: {content_type}\r\n").as_bytes());
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"content-length: ");
    buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(b"connection: close\r\n\r\n");
    buf.extend_from_slice(body);
    stream.write_all(&buf).await
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netguard_core::types::HttpRequest;

    #[tokio::test]
    async fn read_request_parses_method_path_query_and_body() {
        let raw = b"POST /v1/x?a=1 HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\n\r\nbody";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let mut buf = Vec::new();
        let (line, body) = read_request(&mut cursor, &mut buf).await.unwrap().unwrap();
        assert_eq!(line.method, "POST");
        assert_eq!(line.path, "/v1/x");
        assert_eq!(line.query, "a=1");
        assert_eq!(line.host_header.as_deref(), Some("h"));
        assert_eq!(body, b"body");
    }

    #[tokio::test]
    async fn read_request_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let mut buf = Vec::new();
        assert!(read_request(&mut cursor, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_response_buffers_body_per_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let (resp, body) = read_response(&mut cursor).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn read_response_decodes_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let (resp, body) = read_response(&mut cursor).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn read_response_decodes_chunked_body_with_trailers_and_extension() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3;ext=1\r\nfoo\r\n0\r\nX-Trailer: ok\r\n\r\n";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let (resp, body) = read_response(&mut cursor).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(body, b"foo");
    }

    #[tokio::test]
    async fn read_response_decodes_chunked_body_split_across_reads() {
        struct Stutter {
            chunks: Vec<Vec<u8>>,
        }
        impl AsyncRead for Stutter {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                let this = self.get_mut();
                if let Some(next) = this.chunks.first() {
                    buf.put_slice(next);
                    this.chunks.remove(0);
                }
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut stream = Stutter {
            chunks: vec![
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec(),
                b"5\r\nhel".to_vec(),
                b"lo\r\n0\r\n\r\n".to_vec(),
            ],
        };
        let (resp, body) = read_response(&mut stream).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn build_upstream_request_strips_hop_by_hop_and_recomputes_length() {
        let mut headers = HeaderMap::new();
        headers.push("Connection", "close");
        headers.push("X-Foo", "bar");
        let req = HttpRequest {
            method: "POST".into(),
            scheme: "http".into(),
            host: "api.example.com".into(),
            port: 80,
            path: "/x".into(),
            query: String::new(),
            headers,
            body: b"abc".to_vec(),
        };
        let bytes = build_upstream_request(&req);
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.to_lowercase().contains("connection: close"));
        assert!(text.contains("x-foo: bar"));
        assert!(text.contains("content-length: 3\r\n"));
        assert!(text.ends_with("abc"));
    }

    #[test]
    fn build_client_response_sets_keep_alive() {
        let bytes = build_client_response(404, &HeaderMap::new(), b"missing", true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("connection: keep-alive"));
        assert!(text.contains("content-length: 7"));
    }
}
