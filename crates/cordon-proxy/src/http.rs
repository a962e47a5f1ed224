//! HTTP/1.1 forward proxy handler.
//!
//! Serves one request per connection, in two shapes:
//!
//! 1. **CONNECT** (`CONNECT host:port HTTP/1.1`) — policy-checks the host,
//!    dials the upstream, answers `200 Connection Established`, then relays
//!    raw bytes bidirectionally (the TLS handshake and everything after it
//!    pass through untouched).
//! 2. **Absolute-form plaintext** (`GET http://host[:port]/path HTTP/1.1`)
//!    — policy-checks the URL authority, rewrites the request to
//!    origin-form with hop-by-hop headers stripped, and streams request
//!    body and response verbatim.
//!
//! Denied hosts get `403 Forbidden` and the upstream is never dialed.
//! Keep-alive is not offered; every response carries `Connection: close`.

use crate::audit::{self, Protocol};
use crate::error::{ProxyError, Result};
use cordon::Policy;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Maximum total size of the request line plus headers (64 KiB).
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// How long to wait for the client to produce its request head. An idle
/// client must not pin a handler slot forever.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for upstream TCP connect.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers stripped from forwarded requests.
const HOP_BY_HOP: &[&str] = &[
    "proxy-connection",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Handle one client connection: read the request head, dispatch by
/// method, serve exactly one exchange, close.
pub(crate) async fn handle_connection(mut stream: TcpStream, policy: &Policy) -> Result<()> {
    let head = match tokio::time::timeout(HEAD_READ_TIMEOUT, read_request_head(&mut stream)).await
    {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) => return Ok(()), // client closed before sending anything
        Ok(Err(ProxyError::HttpParse(msg))) => {
            debug!("malformed request: {}", msg);
            write_error(&mut stream, 400, "Bad Request", "malformed request").await?;
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!("no complete request head within {:?}", HEAD_READ_TIMEOUT);
            write_error(&mut stream, 408, "Request Timeout", "timed out reading request").await?;
            return Ok(());
        }
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(stream, head, policy).await
    } else {
        handle_absolute_form(stream, head, policy).await
    }
}

/// Parsed request line, raw headers, and any body bytes the buffered
/// reader consumed past the blank line.
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
    /// Bytes read beyond the header terminator (start of the body, or the
    /// first tunneled bytes for a pipelined CONNECT).
    buffered: Vec<u8>,
}

async fn read_request_head(stream: &mut TcpStream) -> Result<Option<RequestHead>> {
    // The take limit caps the whole head, including a single line with no
    // newline: at the cap read_line hits apparent EOF mid-line.
    let mut reader = BufReader::new((&mut *stream).take(MAX_HEADER_SIZE as u64));

    let mut request_line = String::new();
    let n = reader.read_line(&mut request_line).await?;
    if n == 0 {
        return Ok(None);
    }
    if !request_line.ends_with('\n') {
        return Err(ProxyError::HttpParse("request head too large".into()));
    }

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ProxyError::HttpParse("unexpected EOF in headers".into()));
        }
        if !line.ends_with('\n') {
            return Err(ProxyError::HttpParse("request head too large".into()));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            return Err(ProxyError::HttpParse(format!("bad header line: {trimmed}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    // The reader may have pulled body bytes into its buffer; keep them.
    let buffered = reader.buffer().to_vec();
    drop(reader);

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::HttpParse(format!(
            "bad request line: {}",
            request_line.trim_end()
        )));
    };

    Ok(Some(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        buffered,
    }))
}

/// CONNECT tunnel: check policy, dial, `200`, relay.
async fn handle_connect(mut stream: TcpStream, head: RequestHead, policy: &Policy) -> Result<()> {
    let (host, port) = match parse_authority(&head.target, 443) {
        Ok(pair) => pair,
        Err(e) => {
            write_error(&mut stream, 400, "Bad Request", "malformed CONNECT target").await?;
            return Err(e);
        }
    };
    debug!("CONNECT request for {}:{}", host, port);

    let decision = policy.evaluate(&host);
    audit::log_decision(Protocol::Http, &host, &decision);
    if !decision.is_allowed() {
        write_error(&mut stream, 403, "Forbidden", "blocked by egress policy").await?;
        return Ok(());
    }

    let mut upstream = match dial(&host, port).await {
        Ok(s) => s,
        Err(ProxyError::UpstreamTimeout { .. }) => {
            write_error(&mut stream, 504, "Gateway Timeout", "upstream connect timed out").await?;
            return Ok(());
        }
        Err(_) => {
            write_error(&mut stream, 502, "Bad Gateway", "upstream connect failed").await?;
            return Ok(());
        }
    };

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;

    // A client may pipeline its first TLS bytes behind the CONNECT head.
    if !head.buffered.is_empty() {
        upstream.write_all(&head.buffered).await?;
    }

    let relay = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    debug!("CONNECT tunnel to {}:{} closed: {:?}", host, port, relay);
    Ok(())
}

/// Absolute-form plaintext request: check policy, rewrite to origin-form,
/// stream both directions until the upstream finishes the response.
async fn handle_absolute_form(
    mut stream: TcpStream,
    head: RequestHead,
    policy: &Policy,
) -> Result<()> {
    let (host, port, origin_target) = match parse_absolute_target(&head.target) {
        Ok(parts) => parts,
        Err(e) => {
            debug!("bad absolute-form target {}: {}", head.target, e);
            write_error(&mut stream, 400, "Bad Request", "expected absolute-form URL").await?;
            return Ok(());
        }
    };

    // The URL authority is authoritative for policy, even if the Host
    // header disagrees.
    let decision = policy.evaluate(&host);
    audit::log_decision(Protocol::Http, &host, &decision);
    if !decision.is_allowed() {
        write_error(&mut stream, 403, "Forbidden", "blocked by egress policy").await?;
        return Ok(());
    }

    let mut upstream = match dial(&host, port).await {
        Ok(s) => s,
        Err(ProxyError::UpstreamTimeout { .. }) => {
            write_error(&mut stream, 504, "Gateway Timeout", "upstream connect timed out").await?;
            return Ok(());
        }
        Err(_) => {
            write_error(&mut stream, 502, "Bad Gateway", "upstream connect failed").await?;
            return Ok(());
        }
    };

    // Rewrite the head to origin-form with hop-by-hop headers stripped.
    let mut request = format!("{} {} {}\r\n", head.method, origin_target, head.version);
    let strip = connection_named_headers(&head.headers);
    let mut chunked = false;
    let mut saw_host = false;
    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "transfer-encoding" && value.to_ascii_lowercase().contains("chunked") {
            // The body is relayed verbatim without re-chunking, so the
            // upstream must still see the chunked framing declared.
            chunked = true;
        }
        if HOP_BY_HOP.contains(&lower.as_str()) || strip.contains(&lower) {
            continue;
        }
        if lower == "host" {
            saw_host = true;
        }
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    if !saw_host {
        request.push_str(&format!("Host: {}\r\n", host_header_value(&host, port)));
    }
    if chunked {
        request.push_str("Transfer-Encoding: chunked\r\n");
    }
    request.push_str("Connection: close\r\n\r\n");

    upstream.write_all(request.as_bytes()).await?;
    if !head.buffered.is_empty() {
        upstream.write_all(&head.buffered).await?;
    }
    upstream.flush().await?;

    // Remaining request body flows client -> upstream; the response flows
    // back verbatim. `Connection: close` upstream bounds the exchange.
    let relay = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    debug!("forwarded request to {}:{} done: {:?}", host, port, relay);
    Ok(())
}

/// Dial `host:port` with a bounded connect timeout.
async fn dial(host: &str, port: u16) -> Result<TcpStream> {
    match tokio::time::timeout(
        UPSTREAM_CONNECT_TIMEOUT,
        TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            debug!("connect to {}:{} failed: {}", host, port, e);
            Err(ProxyError::UpstreamConnect {
                host: host.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => Err(ProxyError::UpstreamTimeout {
            host: host.to_string(),
        }),
    }
}

/// Value for an injected `Host` header. IPv6 literals are re-bracketed;
/// `parse_authority` strips the brackets on the way in.
fn host_header_value(host: &str, port: u16) -> String {
    let host = if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if port == 80 {
        host
    } else {
        format!("{host}:{port}")
    }
}

/// Headers named by the `Connection` header are hop-by-hop too.
fn connection_named_headers(headers: &[(String, String)]) -> Vec<String> {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Parse `host[:port]`, handling bracketed IPv6 literals.
fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    if authority.is_empty() {
        return Err(ProxyError::HttpParse("empty authority".into()));
    }

    if let Some(bracket_end) = authority.find(']') {
        if !authority.starts_with('[') {
            return Err(ProxyError::HttpParse(format!("bad authority: {authority}")));
        }
        let host = authority[1..bracket_end].to_string();
        let port = match authority[bracket_end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| ProxyError::HttpParse(format!("invalid port in {authority}")))?,
            None => default_port,
        };
        return Ok((host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProxyError::HttpParse(format!("invalid port in {authority}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

/// Split an absolute-form `http://host[:port]/path?query` target into
/// `(host, port, origin_form_target)`.
fn parse_absolute_target(target: &str) -> Result<(String, u16, String)> {
    let rest = target
        .strip_prefix("http://")
        .ok_or_else(|| ProxyError::HttpParse(format!("not an absolute http URL: {target}")))?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let (host, port) = parse_authority(authority, 80)?;
    Ok((host, port, path.to_string()))
}

/// Write a short plain-text error response and flush.
async fn write_error(stream: &mut TcpStream, status: u16, reason: &str, body: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cordon::{Action, Policy};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_request_line_exceeding_cap_gets_400() {
        let (mut client, server) = socket_pair().await;
        let handler = tokio::spawn(async move {
            let policy = Policy::build(Action::Allow, vec![]);
            handle_connection(server, &policy).await
        });

        // One request line, no newline, exactly at the cap.
        client.write_all(&vec![b'A'; MAX_HEADER_SIZE]).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));
        handler.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_client_gets_408() {
        let (mut client, server) = socket_pair().await;
        let handler = tokio::spawn(async move {
            let policy = Policy::build(Action::Allow, vec![]);
            handle_connection(server, &policy).await
        });

        // Client sends nothing; the head read must time out rather than
        // hold the handler open.
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 408"));
        handler.await.unwrap().unwrap();
    }

    #[test]
    fn test_parse_authority_with_port() {
        let (host, port) = parse_authority("api.example.com:8443", 443).unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_parse_authority_default_port() {
        let (host, port) = parse_authority("api.example.com", 443).unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_authority_ipv6() {
        let (host, port) = parse_authority("[2001:db8::1]:8080", 443).unwrap();
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, 8080);

        let (host, port) = parse_authority("[::1]", 443).unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_authority_rejects_garbage() {
        assert!(parse_authority("", 443).is_err());
        assert!(parse_authority("host:notaport", 443).is_err());
    }

    #[test]
    fn test_parse_absolute_target() {
        let (host, port, path) = parse_absolute_target("http://example.com/a/b?q=1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/a/b?q=1");

        let (host, port, path) = parse_absolute_target("http://example.com:8080").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8080);
        assert_eq!(path, "/");
    }

    #[test]
    fn test_parse_absolute_target_rejects_https_and_origin_form() {
        assert!(parse_absolute_target("https://example.com/").is_err());
        assert!(parse_absolute_target("/index.html").is_err());
    }

    #[test]
    fn test_host_header_value_brackets_ipv6() {
        assert_eq!(host_header_value("example.com", 80), "example.com");
        assert_eq!(host_header_value("example.com", 8080), "example.com:8080");
        assert_eq!(host_header_value("2001:db8::1", 8080), "[2001:db8::1]:8080");
        assert_eq!(host_header_value("::1", 80), "[::1]");
    }

    #[test]
    fn test_connection_named_headers() {
        let headers = vec![
            ("Connection".to_string(), "X-Tracking, Foo".to_string()),
            ("X-Tracking".to_string(), "abc".to_string()),
        ];
        let named = connection_named_headers(&headers);
        assert!(named.contains(&"x-tracking".to_string()));
        assert!(named.contains(&"foo".to_string()));
    }
}
