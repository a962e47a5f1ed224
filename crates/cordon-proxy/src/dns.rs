//! DNS forwarding resolver with policy filtering.
//!
//! Queries arrive over UDP (and TCP, for truncation fallback), the QNAME
//! of the first question is evaluated against the policy, and allowed
//! queries are forwarded byte-for-byte to the configured upstream
//! resolver. The upstream's response is relayed verbatim — no caching, no
//! rewriting, truncation flag included.
//!
//! Denied queries get a synthesized RFC 1035 response: original ID, QR=1,
//! RCODE=REFUSED, the question section copied, all answer sections empty.
//! Queries with no question or an undecodable QNAME are refused the same
//! way. An upstream that stays silent past the timeout yields SERVFAIL.

use crate::audit::{self, Protocol};
use crate::error::{ProxyError, Result};
use cordon::Policy;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Receive buffer size. Larger than classic 512-byte DNS; EDNS payloads
/// are common and are forwarded as-is.
pub(crate) const MAX_PACKET: usize = 4096;

/// How long to wait for the upstream resolver.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for a TCP client to produce a message frame. An idle
/// connection is closed so it cannot pin a handler slot.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(10);

const FLAG_QR: u16 = 0x8000;
const FLAG_OPCODE_MASK: u16 = 0x7800;
const FLAG_RD: u16 = 0x0100;

const RCODE_SERVFAIL: u16 = 2;
const RCODE_REFUSED: u16 = 5;

/// A decoded query: just enough structure to filter and to synthesize
/// error responses.
#[derive(Debug)]
pub(crate) struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    /// Lower-cased QNAME of the first question, without trailing dot.
    pub qname: String,
    /// End offset of the question section within the original packet.
    question_end: usize,
}

/// Parse the header and question section of a query packet.
pub(crate) fn parse_query(packet: &[u8]) -> Result<DnsQuery> {
    if packet.len() < 12 {
        return Err(ProxyError::DnsParse("packet shorter than header".into()));
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);

    if qdcount == 0 {
        return Err(ProxyError::DnsParse("query has no questions".into()));
    }

    let mut offset = 12;
    let mut first_qname = None;
    for _ in 0..qdcount {
        let (name, end) = decode_name(packet, offset)?;
        if first_qname.is_none() {
            first_qname = Some(name);
        }
        // QTYPE + QCLASS
        offset = end
            .checked_add(4)
            .filter(|&e| e <= packet.len())
            .ok_or_else(|| ProxyError::DnsParse("truncated question".into()))?;
    }

    Ok(DnsQuery {
        id,
        flags,
        qdcount,
        // qdcount >= 1 checked above
        qname: first_qname.unwrap_or_default(),
        question_end: offset,
    })
}

/// Decode an uncompressed domain name starting at `offset`. Returns the
/// lower-cased name and the offset just past its terminating zero label.
fn decode_name(packet: &[u8], mut offset: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    loop {
        let len = *packet
            .get(offset)
            .ok_or_else(|| ProxyError::DnsParse("truncated name".into()))? as usize;
        offset += 1;

        if len == 0 {
            return Ok((name, offset));
        }
        // Compression pointers never appear in a question the client
        // originates; reject rather than chase them.
        if len & 0xC0 != 0 {
            return Err(ProxyError::DnsParse("compressed or invalid label".into()));
        }
        let label = packet
            .get(offset..offset + len)
            .ok_or_else(|| ProxyError::DnsParse("truncated label".into()))?;
        if !label.iter().all(u8::is_ascii) {
            return Err(ProxyError::DnsParse("non-ASCII label".into()));
        }
        if !name.is_empty() {
            name.push('.');
        }
        for &b in label {
            name.push(b.to_ascii_lowercase() as char);
        }
        offset += len;

        if name.len() > 253 {
            return Err(ProxyError::DnsParse("name too long".into()));
        }
    }
}

/// Synthesize an error response for a parsed query, copying its question
/// section.
pub(crate) fn error_response(packet: &[u8], query: &DnsQuery, rcode: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(query.question_end);
    out.extend_from_slice(&query.id.to_be_bytes());
    let flags = FLAG_QR | (query.flags & (FLAG_OPCODE_MASK | FLAG_RD)) | rcode;
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&query.qdcount.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // ANCOUNT, NSCOUNT, ARCOUNT
    out.extend_from_slice(&packet[12..query.question_end]);
    out
}

/// Synthesize REFUSED for a packet whose question could not be decoded.
/// Only the ID is salvageable; the question section is left empty.
pub(crate) fn bare_refused(packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < 12 {
        return None; // not even an ID to echo
    }
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&packet[0..2]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    let flags = FLAG_QR | (flags & (FLAG_OPCODE_MASK | FLAG_RD)) | RCODE_REFUSED;
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&[0; 8]);
    Some(out)
}

/// Decide and serve one query; returns the response bytes to send back,
/// or `None` when no response is possible.
pub(crate) async fn process_query(
    packet: &[u8],
    policy: &Policy,
    upstream: SocketAddr,
) -> Option<Vec<u8>> {
    let query = match parse_query(packet) {
        Ok(q) => q,
        Err(e) => {
            debug!("refusing undecodable query: {}", e);
            return bare_refused(packet);
        }
    };

    let decision = policy.evaluate(&query.qname);
    audit::log_decision(Protocol::Dns, &query.qname, &decision);

    if !decision.is_allowed() {
        return Some(error_response(packet, &query, RCODE_REFUSED));
    }

    match forward_to_upstream(packet, query.id, upstream).await {
        Ok(response) => Some(response),
        Err(e) => {
            debug!("upstream exchange for {} failed: {}", query.qname, e);
            Some(error_response(packet, &query, RCODE_SERVFAIL))
        }
    }
}

/// Forward the query bytes unchanged over an ephemeral UDP socket and
/// return the upstream's response verbatim.
///
/// The socket is connect()ed to the upstream, so datagrams from any other
/// source are dropped by the kernel; on top of that, responses whose ID
/// does not match the query are ignored.
async fn forward_to_upstream(packet: &[u8], id: u16, upstream: SocketAddr) -> Result<Vec<u8>> {
    let bind_addr: SocketAddr = if upstream.is_ipv4() {
        "0.0.0.0:0".parse().map_err(|_| unreachable_addr())?
    } else {
        "[::]:0".parse().map_err(|_| unreachable_addr())?
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(upstream).await?;
    socket.send(packet).await?;

    let deadline = tokio::time::Instant::now() + UPSTREAM_TIMEOUT;
    let mut buf = [0u8; MAX_PACKET];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let n = tokio::time::timeout(remaining, socket.recv(&mut buf))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout {
                host: upstream.to_string(),
            })??;
        if n >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
            return Ok(buf[..n].to_vec());
        }
        debug!("dropping upstream datagram with mismatched ID");
    }
}

fn unreachable_addr() -> ProxyError {
    ProxyError::Config("invalid wildcard bind address".into())
}

/// Serve one UDP datagram: decide, forward or synthesize, and reply to
/// the exact client address that sent the query.
pub(crate) async fn handle_datagram(
    socket: &UdpSocket,
    packet: &[u8],
    client: SocketAddr,
    policy: &Policy,
    upstream: SocketAddr,
) {
    if let Some(response) = process_query(packet, policy, upstream).await {
        if let Err(e) = socket.send_to(&response, client).await {
            debug!("failed to send DNS response to {}: {}", client, e);
        }
    }
}

/// Serve DNS over a TCP connection: 2-byte length-prefixed messages, same
/// decision logic as UDP, one connection may carry several queries.
pub(crate) async fn handle_tcp_connection(
    mut stream: tokio::net::TcpStream,
    policy: &Policy,
    upstream: SocketAddr,
) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(CLIENT_READ_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Err(_) => return Ok(()), // idle client; free the slot
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_PACKET {
            return Err(ProxyError::DnsParse(format!("bad TCP message length {len}")));
        }
        let mut packet = vec![0u8; len];
        tokio::time::timeout(CLIENT_READ_TIMEOUT, stream.read_exact(&mut packet))
            .await
            .map_err(|_| ProxyError::DnsParse("timed out mid-message".into()))??;

        if let Some(response) = process_query(&packet, policy, upstream).await {
            let resp_len = u16::try_from(response.len())
                .map_err(|_| ProxyError::DnsParse("response too large for TCP frame".into()))?;
            stream.write_all(&resp_len.to_be_bytes()).await?;
            stream.write_all(&response).await?;
            stream.flush().await?;
        }
    }
}
