//! Original-destination recovery for transparent-redirect mode.
//!
//! When an OS-level redirect delivers a connection to the stub, the address
//! the service actually dialed is recoverable from the socket. On Linux this
//! is the `SO_ORIGINAL_DST` option set by the netfilter REDIRECT target;
//! other platforms report the operation as unsupported and transparent mode
//! is unavailable there.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Returns the destination the peer originally dialed.
#[cfg(target_os = "linux")]
pub fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use nix::sys::socket::{getsockopt, sockopt::OriginalDst};

    let addr = getsockopt(stream, OriginalDst).map_err(io::Error::from)?;
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Returns the destination the peer originally dialed.
#[cfg(not(target_os = "linux"))]
pub fn original_dst(_stream: &TcpStream) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "transparent mode requires SO_ORIGINAL_DST, which this platform does not expose",
    ))
}
