//! Transparent SNI-inspecting TLS pass-through.
//!
//! HTTPS clients inside the guest are not proxy-aware; the host firewall
//! redirects their flows here. The handler recovers the original
//! destination from the socket ([`origdst`](crate::origdst)), reads the
//! client's first bytes up to a bounded prefix, extracts the SNI from the
//! ClientHello ([`sni`](crate::sni)), and evaluates policy on it.
//!
//! On allow, the upstream is dialed and the captured prefix is replayed
//! before a raw bidirectional copy, so the server sees the ClientHello
//! exactly as sent, from byte zero. TLS is never terminated and nothing is
//! ever written to the client before the upstream dial. On deny, the
//! client socket is dropped (TCP FIN, no TLS alert).

use crate::audit::{self, Protocol};
use crate::error::Result;
use crate::origdst;
use crate::sni::{scan_client_hello, SniScan};
use cordon::Policy;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound on the prefix inspected for a ClientHello. Virtually all
/// real ClientHellos fit well under this.
const MAX_HELLO_BYTES: usize = 4096;

/// How long to wait for the client to produce its ClientHello.
const HELLO_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for dialing the original destination.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle one redirected TLS flow.
pub(crate) async fn handle_connection(mut stream: TcpStream, policy: &Policy) -> Result<()> {
    // Recover where the guest was actually going before the redirect.
    // Without it there is nowhere to forward, so the flow is dropped.
    let target = origdst::original_destination(&stream)?;

    let Some((prefix, sni)) = read_hello_prefix(&mut stream).await? else {
        // Oversized hello; nothing sane to inspect or replay.
        return Ok(());
    };

    let decision = policy.evaluate_opt(sni.as_deref());
    audit::log_decision(Protocol::Tls, sni.as_deref().unwrap_or(""), &decision);
    if !decision.is_allowed() {
        // Drop without writing anything; the client sees a bare FIN.
        return Ok(());
    }

    let mut upstream = match tokio::time::timeout(
        UPSTREAM_CONNECT_TIMEOUT,
        TcpStream::connect(target),
    )
    .await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!("dial {} failed: {}", target, e);
            return Ok(());
        }
        Err(_) => {
            debug!("dial {} timed out", target);
            return Ok(());
        }
    };

    // Replay the inspected prefix, then relay verbatim.
    upstream.write_all(&prefix).await?;
    let relay = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    debug!("tls tunnel to {} closed: {:?}", target, relay);
    Ok(())
}

/// Read the client's opening bytes until a complete ClientHello has been
/// scanned, the client goes quiet, or the bytes turn out not to be a
/// ClientHello.
///
/// Returns the captured prefix (to be replayed upstream on allow) and the
/// SNI, `None` SNI meaning the host is unidentifiable. Returns `Ok(None)`
/// when the hello is still incomplete at the prefix bound; such flows are
/// closed outright.
async fn read_hello_prefix(stream: &mut TcpStream) -> Result<Option<(Vec<u8>, Option<String>)>> {
    let mut prefix = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + HELLO_READ_TIMEOUT;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let n = match tokio::time::timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => return Ok(Some((prefix, None))), // EOF or quiet client
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
        };
        prefix.extend_from_slice(&chunk[..n]);

        match scan_client_hello(&prefix) {
            SniScan::Found(name) => return Ok(Some((prefix, Some(name)))),
            SniScan::Absent | SniScan::NotClientHello => return Ok(Some((prefix, None))),
            SniScan::NeedMoreData => {
                if prefix.len() >= MAX_HELLO_BYTES {
                    debug!("no complete ClientHello within {} bytes", MAX_HELLO_BYTES);
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sni::tests::client_hello_with_sni;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_prefix_capture_with_sni() {
        let (mut client, mut server) = socket_pair().await;
        let hello = client_hello_with_sni("x.example.com");
        client.write_all(&hello).await.unwrap();

        let (prefix, sni) = read_hello_prefix(&mut server).await.unwrap().unwrap();
        assert_eq!(prefix, hello);
        assert_eq!(sni.as_deref(), Some("x.example.com"));
    }

    #[tokio::test]
    async fn test_prefix_capture_split_across_writes() {
        let (mut client, mut server) = socket_pair().await;
        let hello = client_hello_with_sni("split.example.com");
        let (a, b) = hello.split_at(7);

        let a = a.to_vec();
        let b = b.to_vec();
        let writer = tokio::spawn(async move {
            client.write_all(&a).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(&b).await.unwrap();
            client
        });

        let (prefix, sni) = read_hello_prefix(&mut server).await.unwrap().unwrap();
        assert_eq!(prefix, hello);
        assert_eq!(sni.as_deref(), Some("split.example.com"));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_non_tls_prefix_is_unidentifiable() {
        let (mut client, mut server) = socket_pair().await;
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let (prefix, sni) = read_hello_prefix(&mut server).await.unwrap().unwrap();
        assert!(prefix.starts_with(b"GET"));
        assert!(sni.is_none());
    }

    #[tokio::test]
    async fn test_oversized_hello_is_closed() {
        let (mut client, mut server) = socket_pair().await;
        // Handshake record claiming far more payload than the bound allows.
        let mut oversized = vec![0x16, 0x03, 0x01, 0x40, 0x00];
        oversized.resize(MAX_HELLO_BYTES + 512, 0);
        client.write_all(&oversized).await.unwrap();

        let result = read_hello_prefix(&mut server).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_client_eof_is_unidentifiable() {
        let (client, mut server) = socket_pair().await;
        drop(client);

        let (prefix, sni) = read_hello_prefix(&mut server).await.unwrap().unwrap();
        assert!(prefix.is_empty());
        assert!(sni.is_none());
    }
}
