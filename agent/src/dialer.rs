use mio::net::{TcpStream, UdpSocket};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Creates the real sockets flows are spliced onto. The default goes straight
/// to the destination; a platform that has to keep these sockets out of its own
/// tunnel (android VpnService.protect for example) plugs in its own dialer.
pub trait Dialer: Send + Sync {
    /// Starts a non-blocking connect to `dst`. The connect is usually still in
    /// progress on return, completion shows up as a writable event.
    fn dial_tcp(&self, dst: SocketAddrV4) -> io::Result<TcpStream>;

    /// Opens a non-blocking datagram socket on an ephemeral port connected to `dst`
    fn open_udp(&self, dst: SocketAddrV4) -> io::Result<UdpSocket>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDialer;

impl Dialer for DirectDialer {
    fn dial_tcp(&self, dst: SocketAddrV4) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(SocketAddr::V4(dst))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    fn open_udp(&self, dst: SocketAddrV4) -> io::Result<UdpSocket> {
        let sock = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))?;
        sock.connect(SocketAddr::V4(dst))?;
        Ok(sock)
    }
}
