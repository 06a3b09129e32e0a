use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};

use crate::{config::PeerAddress, error::ConnectError};

const LISTEN_BACKLOG: i32 = 128;

/// Non-blocking TCP listener for inbound controller connections
#[derive(Debug)]
pub struct PlatformListener {
    listener:   TcpListener,
    local_addr: SocketAddr,
}

impl PlatformListener {
    /// Binds a listener with `SO_REUSEADDR` set and switches it to
    /// non-blocking mode.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        tracing::debug!("Binding listener on {}", addr);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if let Err(e) = socket.set_reuse_address(true) {
            tracing::warn!("Failed to set SO_REUSEADDR on {}: {}", addr, e);
        }
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Listener bound on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one pending connection, or `None` if none is waiting.
    ///
    /// The returned stream is already non-blocking with `TCP_NODELAY` set.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                prepare_stream(&stream)?;
                Ok(Some((stream, addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Connects to a peer controller, trying every resolved address in turn.
///
/// The connect itself is bounded by `timeout`; the returned stream is
/// non-blocking.
pub fn connect_socket(peer: &PeerAddress, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> = (peer.host(), peer.port())
        .to_socket_addrs()
        .map_err(|source| {
            ConnectError::Resolve {
                peer: peer.to_string(),
                source,
            }
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        tracing::debug!("Connecting to {} via {}", peer, addr);
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                prepare_stream(&stream).map_err(|source| {
                    ConnectError::Io {
                        peer: peer.to_string(),
                        source,
                    }
                })?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(source) => {
            Err(ConnectError::Io {
                peer: peer.to_string(),
                source,
            })
        }
        None => {
            Err(ConnectError::Unresolved {
                peer: peer.to_string(),
            })
        }
    }
}

fn prepare_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn accept_without_pending_connection_returns_none() {
        let listener = PlatformListener::bind(loopback()).unwrap();
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn connect_and_accept_over_loopback() {
        let listener = PlatformListener::bind(loopback()).unwrap();
        let port = listener.local_addr().port();
        let peer = PeerAddress::new("127.0.0.1", port).unwrap();

        let _client = connect_socket(&peer, Duration::from_secs(2)).unwrap();

        let mut accepted = None;
        for _ in 0..200 {
            if let Some(conn) = listener.accept().unwrap() {
                accepted = Some(conn);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(accepted.is_some());
    }

    #[test]
    fn refused_connection_is_reported() {
        let port = {
            let listener = PlatformListener::bind(loopback()).unwrap();
            listener.local_addr().port()
        };
        let peer = PeerAddress::new("127.0.0.1", port).unwrap();

        let err = connect_socket(&peer, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, ConnectError::Io { .. }));
    }
}
