//! UDP receive endpoint
//!
//! Binds an exclusive datagram socket with `socket2` and exposes a timed
//! receive. The endpoint is shared between the engine and the receive loop
//! through an `Arc`. Unbinding marks it closed, wakes a receive blocked in the
//! OS and closes the socket, so the port is free again even while other
//! handles are still alive.

use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Configuration;
use crate::error::{BindError, ReadError};

/// Longest wait for a woken receive to let go of the socket on unbind
const RELEASE_WAIT: Duration = Duration::from_millis(50);

/// Socket options applied at bind time
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Receive timeout, blocking without timeout when `None`
    pub read_timeout: Option<Duration>,
    /// Kernel receive buffer size
    pub recv_buffer_bytes: Option<usize>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_millis(crate::constants::DEFAULT_READ_TIMEOUT_MS)),
            recv_buffer_bytes: None,
        }
    }
}

impl TransportOptions {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            read_timeout: Some(config.read_timeout()),
            recv_buffer_bytes: config.recv_buffer_bytes,
        }
    }
}

/// A bound datagram endpoint
pub struct Endpoint {
    /// `None` once unbind has closed the socket
    socket: RwLock<Option<UdpSocket>>,
    local_addr: SocketAddr,
    open: AtomicBool,
}

/// Shared handle to a bound endpoint
pub type EndpointHandle = Arc<Endpoint>;

/// Bind a datagram socket on `addr:port`.
///
/// Address reuse is left disabled so the port is owned exclusively.
pub fn bind(addr: IpAddr, port: u16, options: &TransportOptions) -> Result<EndpointHandle, BindError> {
    let local = SocketAddr::new(addr, port);
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
        .map_err(BindError::Socket)?;

    if let Some(size) = options.recv_buffer_bytes {
        socket.set_recv_buffer_size(size).map_err(BindError::Configure)?;
    }
    socket
        .set_read_timeout(options.read_timeout)
        .map_err(BindError::Configure)?;

    socket
        .bind(&local.into())
        .map_err(|source| BindError::Bind { addr: local, source })?;

    let socket: UdpSocket = socket.into();
    let local_addr = socket.local_addr().map_err(BindError::Configure)?;

    tracing::info!("UDP endpoint bound on {}", local_addr);

    Ok(Arc::new(Endpoint {
        socket: RwLock::new(Some(socket)),
        local_addr,
        open: AtomicBool::new(true),
    }))
}

/// Release an endpoint. Calling this on a closed endpoint is a no-op.
///
/// A receive blocked in the OS is woken and reports [`ReadError::Closed`].
/// The socket is closed here rather than when the last handle drops; if a
/// woken receive does not let go within a short wait, closing falls back to
/// the last drop.
pub fn unbind(endpoint: &Endpoint) {
    if !endpoint.open.swap(false, Ordering::AcqRel) {
        return;
    }

    if let Some(socket) = endpoint.socket.read().as_ref() {
        // Unconnected UDP sockets may report ENOTCONN but still wake readers
        if let Err(e) = SockRef::from(socket).shutdown(Shutdown::Both) {
            tracing::trace!("Shutdown on {}: {}", endpoint.local_addr, e);
        }
    }
    wake(endpoint.local_addr);

    match endpoint.socket.try_write_for(RELEASE_WAIT) {
        Some(mut socket) => {
            socket.take();
            tracing::debug!("UDP endpoint {} unbound", endpoint.local_addr);
        }
        None => tracing::warn!(
            "UDP endpoint {} still in use, socket closes with its last handle",
            endpoint.local_addr
        ),
    }
}

/// Send an empty datagram to `addr` so a blocked receive returns
fn wake(addr: SocketAddr) {
    let target = match addr.ip() {
        ip if !ip.is_unspecified() => addr,
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
    };
    let unspecified = match target {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };

    if let Err(e) = UdpSocket::bind(unspecified).and_then(|waker| waker.send_to(&[], target)) {
        tracing::trace!("Wake datagram to {} failed: {}", target, e);
    }
}

impl Endpoint {
    /// Receive one datagram into `buf`.
    ///
    /// The last byte of `buf` acts as a sentinel: a datagram that fills the
    /// whole buffer may have been cut by the OS and is reported as
    /// [`ReadError::Truncated`]. Size `buf` one byte past the largest
    /// datagram you accept.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if !self.is_open() {
            return Err(ReadError::Closed);
        }

        let result = {
            let socket = self.socket.read();
            match socket.as_ref() {
                Some(socket) => socket.recv(buf),
                None => return Err(ReadError::Closed),
            }
        };

        match result {
            Ok(n) if !self.is_open() => {
                tracing::trace!("Dropping {} bytes received after unbind", n);
                Err(ReadError::Closed)
            }
            Ok(n) if n >= buf.len() => Err(ReadError::Truncated { capacity: buf.len() }),
            Ok(n) => Ok(n),
            Err(e) if !self.is_open() => {
                tracing::trace!("Receive error after unbind: {}", e);
                Err(ReadError::Closed)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(ReadError::TimedOut)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(ReadError::TimedOut),
            Err(e) => Err(ReadError::Io(e)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(options: &TransportOptions) -> EndpointHandle {
        bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, options).unwrap()
    }

    fn timed() -> TransportOptions {
        TransportOptions {
            read_timeout: Some(Duration::from_millis(20)),
            recv_buffer_bytes: None,
        }
    }

    #[test]
    fn test_receive_datagram() {
        let endpoint = loopback(&timed());
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[1, 2, 3, 4], endpoint.local_addr()).unwrap();

        let mut buf = [0u8; 16];
        let n = endpoint.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_oversized_datagram_is_truncated() {
        let endpoint = loopback(&timed());
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[7u8; 32], endpoint.local_addr()).unwrap();

        let mut buf = [0u8; 9];
        assert!(matches!(
            endpoint.receive(&mut buf),
            Err(ReadError::Truncated { capacity: 9 })
        ));
    }

    #[test]
    fn test_timeout_and_closed() {
        let endpoint = loopback(&timed());
        let mut buf = [0u8; 16];

        assert!(matches!(endpoint.receive(&mut buf), Err(ReadError::TimedOut)));

        unbind(&endpoint);
        unbind(&endpoint);
        assert!(!endpoint.is_open());
        assert!(matches!(endpoint.receive(&mut buf), Err(ReadError::Closed)));
    }

    #[test]
    fn test_bind_conflict() {
        let first = loopback(&timed());
        let second = bind(IpAddr::V4(Ipv4Addr::LOCALHOST), first.port(), &timed());

        assert!(matches!(second, Err(BindError::Bind { .. })));
    }

    #[test]
    fn test_unbind_wakes_untimed_receive_and_frees_port() {
        let blocking = TransportOptions {
            read_timeout: None,
            recv_buffer_bytes: None,
        };
        let endpoint = loopback(&blocking);
        let reader = {
            let endpoint = endpoint.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 16];
                endpoint.receive(&mut buf).map_err(|e| e.is_fatal())
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        let started = std::time::Instant::now();
        unbind(&endpoint);
        assert_eq!(reader.join().unwrap(), Err(true));
        assert!(started.elapsed() < Duration::from_millis(200));

        // the reader's clone is gone but this handle is still alive
        let rebound = bind(IpAddr::V4(Ipv4Addr::LOCALHOST), endpoint.port(), &timed());
        assert!(rebound.is_ok());
    }

    #[test]
    fn test_unbind_releases_port_while_handles_remain() {
        let endpoint = loopback(&timed());
        let lingering = endpoint.clone();

        unbind(&endpoint);

        assert!(!lingering.is_open());
        assert!(bind(IpAddr::V4(Ipv4Addr::LOCALHOST), endpoint.port(), &timed()).is_ok());
    }

    #[test]
    fn test_unbind_wakes_blocked_receive() {
        let endpoint = loopback(&timed());
        let reader = {
            let endpoint = endpoint.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 16];
                loop {
                    match endpoint.receive(&mut buf) {
                        Err(ReadError::TimedOut) => continue,
                        other => return other.map_err(|e| e.is_fatal()),
                    }
                }
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        unbind(&endpoint);
        assert_eq!(reader.join().unwrap(), Err(true));
    }
}
