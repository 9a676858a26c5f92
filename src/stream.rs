use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio_native_tls::TlsStream;

/// The transport a dialog runs over. Owned by one connection test; dropping
/// it closes the socket and releases any TLS session.
#[derive(Debug)]
pub enum ProbeStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Udp(UdpSocket),
}

impl ProbeStream {
    /// Open a TCP connection, or a connected UDP socket when `udp` is set,
    /// binding `source` first if given.
    pub async fn connect(addr: SocketAddr, source: Option<IpAddr>, udp: bool) -> io::Result<Self> {
        if udp {
            let local = SocketAddr::new(source.unwrap_or_else(|| unspecified_for(&addr)), 0);
            let sock = UdpSocket::bind(local).await?;
            sock.connect(addr).await?;
            return Ok(ProbeStream::Udp(sock));
        }

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(src) = source {
            socket.bind(SocketAddr::new(src, 0))?;
        }
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(ProbeStream::Plain(stream))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ProbeStream::Tls(_))
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, ProbeStream::Udp(_))
    }
}

fn unspecified_for(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

impl AsyncRead for ProbeStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProbeStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ProbeStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            ProbeStream::Udp(s) => s.poll_recv(cx, buf),
        }
    }
}

impl AsyncWrite for ProbeStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProbeStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ProbeStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            ProbeStream::Udp(s) => s.poll_send(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProbeStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ProbeStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            ProbeStream::Udp(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProbeStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ProbeStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            ProbeStream::Udp(_) => Poll::Ready(Ok(())),
        }
    }
}
