//! Listener lifecycle: bind, accept, dispatch, shut down.
//!
//! [`start`] validates the configuration, binds every enabled listener
//! (HTTP forward proxy, transparent TLS, DNS over UDP and TCP), and only
//! then returns — so once the caller has a [`ProxyHandle`], every
//! advertised port is accepting. Each accepted connection or datagram is
//! handled in its own task; the policy is shared read-only.
//!
//! Shutdown goes through a `watch` channel: accept loops drop their
//! listeners immediately, in-flight handlers get a grace period observed
//! via the active-handler count, then the process exits and the remaining
//! sockets close with it.

use crate::config::ProxyConfig;
use crate::dns;
use crate::error::{ProxyError, Result};
use crate::http;
use crate::tls;
use cordon::Policy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// The ports the proxy actually bound. The supervisor's parent persists
/// these (`proxy.json`) together with the PID; the proxy itself writes
/// nothing to stdout.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BoundPorts {
    pub http_port: u16,
    pub tls_port: Option<u16>,
    pub dns_port: Option<u16>,
}

/// Handle returned when the proxy starts.
pub struct ProxyHandle {
    /// Actual ports after OS assignment.
    pub ports: BoundPorts,
    shutdown_tx: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
}

impl ProxyHandle {
    /// Signal all listeners to stop accepting.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait up to `grace` for in-flight handlers to finish. Returns the
    /// number still running when the wait ended.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let active = self.active.load(Ordering::Acquire);
            if active == 0 {
                return 0;
            }
            if tokio::time::Instant::now() >= deadline {
                return active;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Number of in-flight connection handlers.
    #[must_use]
    pub fn active_handlers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Shared state for all accept loops.
struct ServerState {
    policy: Policy,
    /// Ceiling on concurrent handlers; accepts wait for a permit instead
    /// of refusing.
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    dns_upstream: SocketAddr,
}

/// Start every enabled listener and return once all are accepting.
///
/// # Errors
///
/// [`ProxyError::Config`] for invalid configuration (exit code 1 in the
/// binary), [`ProxyError::Bind`] when a port cannot be bound (exit 2).
pub async fn start(config: ProxyConfig) -> Result<ProxyHandle> {
    config.validate()?;

    let policy = Policy::from_specs(config.default_action, config.rules.clone())
        .map_err(|e| ProxyError::Config(e.to_string()))?;
    info!(
        default_action = %config.default_action,
        rules = policy.rule_count(),
        "egress policy compiled"
    );

    let http_listener = bind_tcp(SocketAddr::new(config.bind_addr, config.http_port)).await?;
    let http_port = local_port(&http_listener)?;

    let tls_listener = match config.tls_port {
        Some(port) => Some(bind_tcp(SocketAddr::new(config.bind_addr, port)).await?),
        None => None,
    };
    let tls_port = tls_listener.as_ref().map(local_port).transpose()?;

    let (dns_udp, dns_tcp) = match config.dns_port {
        Some(port) => {
            let udp_addr = SocketAddr::new(config.bind_addr, port);
            let udp = UdpSocket::bind(udp_addr)
                .await
                .map_err(|e| ProxyError::Bind {
                    addr: udp_addr.to_string(),
                    source: e,
                })?;
            // TCP rides on the same port number the UDP bind settled on.
            let udp_port = udp.local_addr()?.port();
            let tcp = bind_tcp(SocketAddr::new(config.bind_addr, udp_port)).await?;
            (Some(udp), Some(tcp))
        }
        None => (None, None),
    };
    let dns_port = match &dns_udp {
        Some(socket) => Some(socket.local_addr()?.port()),
        None => None,
    };

    let ports = BoundPorts {
        http_port,
        tls_port,
        dns_port,
    };
    info!(
        http_port = ports.http_port,
        tls_port = ports.tls_port,
        dns_port = ports.dns_port,
        bind = %config.bind_addr,
        "egress proxy listening"
    );

    let active = Arc::new(AtomicUsize::new(0));
    let state = Arc::new(ServerState {
        policy,
        permits: Arc::new(Semaphore::new(config.max_connections)),
        active: Arc::clone(&active),
        dns_upstream: config.dns_upstream,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(tcp_accept_loop(
        http_listener,
        Arc::clone(&state),
        shutdown_rx.clone(),
        Listener::Http,
    ));
    if let Some(listener) = tls_listener {
        tokio::spawn(tcp_accept_loop(
            listener,
            Arc::clone(&state),
            shutdown_rx.clone(),
            Listener::Tls,
        ));
    }
    if let Some(socket) = dns_udp {
        tokio::spawn(dns_udp_loop(socket, Arc::clone(&state), shutdown_rx.clone()));
    }
    if let Some(listener) = dns_tcp {
        tokio::spawn(tcp_accept_loop(
            listener,
            Arc::clone(&state),
            shutdown_rx,
            Listener::DnsTcp,
        ));
    }

    Ok(ProxyHandle {
        ports,
        shutdown_tx,
        active,
    })
}

async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| ProxyError::Bind {
        addr: addr.to_string(),
        source: e,
    })
}

fn local_port(listener: &TcpListener) -> Result<u16> {
    Ok(listener.local_addr()?.port())
}

/// Owns one handler's concurrency permit and its slot in the active
/// count. Dropping the guard restores both, so a panicking handler still
/// releases its permit and decrements the count.
struct HandlerGuard {
    active: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl HandlerGuard {
    fn new(active: Arc<AtomicUsize>, permit: OwnedSemaphorePermit) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self {
            active,
            _permit: permit,
        }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Which protocol handler a TCP accept loop dispatches to.
#[derive(Clone, Copy)]
enum Listener {
    Http,
    Tls,
    DnsTcp,
}

async fn tcp_accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
    kind: Listener,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        spawn_tcp_handler(stream, Arc::clone(&state), kind).await;
                    }
                    Err(e) => warn!("accept error: {}", e),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("listener shutting down");
                    return; // dropping the listener closes the port
                }
            }
        }
    }
}

async fn spawn_tcp_handler(stream: TcpStream, state: Arc<ServerState>, kind: Listener) {
    // Waiting here (rather than refusing) applies backpressure: accepts
    // are delayed until a handler slot frees up. The owned permit moves
    // into the task and is released with it.
    let permit = match Arc::clone(&state.permits).acquire_owned().await {
        Ok(p) => p,
        Err(_) => return, // semaphore closed, shutting down
    };

    let guard = HandlerGuard::new(Arc::clone(&state.active), permit);
    tokio::spawn(async move {
        let _guard = guard;
        let result = match kind {
            Listener::Http => http::handle_connection(stream, &state.policy).await,
            Listener::Tls => tls::handle_connection(stream, &state.policy).await,
            Listener::DnsTcp => {
                dns::handle_tcp_connection(stream, &state.policy, state.dns_upstream).await
            }
        };
        if let Err(e) = result {
            debug!("connection handler ended with error: {}", e);
        }
    });
}

async fn dns_udp_loop(
    socket: UdpSocket,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let mut buf = [0u8; dns::MAX_PACKET];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, client)) => {
                        let packet = buf[..n].to_vec();
                        let socket = Arc::clone(&socket);
                        let state = Arc::clone(&state);
                        let permit = match Arc::clone(&state.permits).acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        let guard = HandlerGuard::new(Arc::clone(&state.active), permit);
                        tokio::spawn(async move {
                            let _guard = guard;
                            dns::handle_datagram(
                                &socket,
                                &packet,
                                client,
                                &state.policy,
                                state.dns_upstream,
                            )
                            .await;
                        });
                    }
                    Err(e) => warn!("dns recv error: {}", e),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("dns listener shutting down");
                    return;
                }
            }
        }
    }
}
