use std::{borrow::Cow, io, net::SocketAddr};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::conduit::protocol::Address;

/// A bidirectional async byte stream.
///
/// Trait objects can only name one non-auto principal trait, so
/// `AsyncRead + AsyncWrite` is folded into a single trait here.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Opens the outbound connection for a tunnel.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &Address, port: u16) -> io::Result<BoxedStream>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &Address, port: u16) -> io::Result<BoxedStream> {
        let stream = match address {
            Address::Ipv4(ip) => TcpStream::connect(SocketAddr::from((*ip, port))).await?,
            Address::Ipv6(ip) => TcpStream::connect(SocketAddr::from((*ip, port))).await?,
            Address::Domain(host) => {
                if host.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "empty destination domain",
                    ));
                }
                TcpStream::connect((host.as_str(), port)).await?
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all interfaces",
/// which `SocketAddr` parsing does not accept, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}
