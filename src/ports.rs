use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::debug;

/// Attempts before giving up on finding a port not already handed out
const MAX_ALLOCATION_ATTEMPTS: usize = 16;

/// Checks listening ports before launch and hands out dynamic ones.
///
/// A fixed port that is already bound means some stale server could answer
/// the readiness probe in place of the process we are about to launch, so it
/// is rejected up front. Dynamic ports are chosen by binding port 0 and
/// reading back what the OS picked; the socket is closed again before the
/// managed process binds it.
#[derive(Debug)]
pub struct PortAllocator {
    bind_address: IpAddr,
    assigned: HashSet<u16>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortAllocator {
    pub fn new(bind_address: IpAddr) -> Self {
        Self {
            bind_address,
            assigned: HashSet::new(),
        }
    }

    /// Verifies that nothing is listening on `port` and records it as taken.
    ///
    /// Health URLs usually say `localhost`, which may resolve to either
    /// loopback family, so a loopback bind address is checked on its sibling
    /// too (`127.0.0.1` and `::1`). A host without that family is skipped.
    pub fn claim(&mut self, port: u16) -> io::Result<u16> {
        if self.assigned.contains(&port) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("port {port} already assigned to another process"),
            ));
        }
        drop(Self::bind(self.bind_address, port)?);
        if let Some(sibling) = loopback_sibling(self.bind_address) {
            match Self::bind(sibling, port) {
                Ok(socket) => drop(socket),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => return Err(e),
                Err(e) => debug!("Skipping {} check for port {}: {}", sibling, port, e),
            }
        }
        self.assigned.insert(port);
        debug!("Port {} on {} is free", port, self.bind_address);
        Ok(port)
    }

    /// Picks a free port that has not been handed out by this allocator yet.
    pub fn allocate(&mut self) -> io::Result<u16> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let socket = Self::bind(self.bind_address, 0)?;
            let port = socket
                .local_addr()?
                .as_socket()
                .map(|addr| addr.port())
                .ok_or_else(|| io::Error::other("bound socket has no inet address"))?;
            if self.assigned.insert(port) {
                debug!("Allocated dynamic port {}", port);
                return Ok(port);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "could not allocate a distinct free port",
        ))
    }

    fn bind(address: IpAddr, port: u16) -> io::Result<Socket> {
        let socket_addr = SocketAddr::new(address, port);
        let socket = match address {
            IpAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?,
            IpAddr::V6(_) => {
                let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
                socket.set_only_v6(true)?;
                socket
            }
        };
        // Lingering TIME_WAIT connections from a previous run must not count
        // as "in use"; only a live listener should.
        socket.set_reuse_address(true)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(1)?;
        Ok(socket)
    }
}

/// The other loopback address of a loopback `address`.
fn loopback_sibling(address: IpAddr) -> Option<IpAddr> {
    match address {
        IpAddr::V4(v4) if v4.is_loopback() => Some(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        IpAddr::V6(v6) if v6.is_loopback() => Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        _ => None,
    }
}
