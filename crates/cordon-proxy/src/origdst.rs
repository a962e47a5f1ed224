//! Original-destination recovery for redirected sockets.
//!
//! The host NAT rules rewrite the guest's outbound TLS flows to point at
//! the transparent listener. The pre-rewrite destination is recoverable on
//! Linux with `getsockopt(SOL_IP, SO_ORIGINAL_DST)`; redirected-socket
//! lookup is IPv4 only. On other platforms the transparent listener is
//! refused at configuration time, so the stub here is never reached in a
//! running proxy.

use crate::error::{ProxyError, Result};
use std::net::SocketAddrV4;
use tokio::net::TcpStream;

/// `SO_ORIGINAL_DST` socket option (netfilter).
#[cfg(target_os = "linux")]
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Recover the destination the client originally dialed, before the host
/// firewall redirected the connection to us.
#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> Result<SocketAddrV4> {
    use std::net::Ipv4Addr;
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // Safety: fd is a valid connected TCP socket owned by `stream`, and
    // addr/len describe a properly sized sockaddr_in out-buffer.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(ProxyError::Io(std::io::Error::last_os_error()));
    }

    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(not(target_os = "linux"))]
pub fn original_destination(_stream: &TcpStream) -> Result<SocketAddrV4> {
    Err(ProxyError::Unsupported(
        "SO_ORIGINAL_DST is only available on Linux",
    ))
}
