//! Owns the listening socket (server mode) or the single outbound socket
//! (client mode), the collection of `Connection`s, and the `mio`-based
//! readiness-wait primitive that multiplexes them on one thread.
//!
//! Sockets are created and connected/bound while still blocking, with
//! `SO_REUSEADDR`/`SO_REUSEPORT` set up front, and only switched to
//! non-blocking once the candidate address has succeeded.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Socket, Type};

use crate::connection::{Connection, Received};
use crate::error::Error;
use crate::router;

/// Default listener port.
pub const DEFAULT_PORT: u16 = 2115;
const LISTEN_BACKLOG: i32 = 64;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const LISTENER_TOKEN: Token = Token(0);

pub type AcceptHandler = Box<dyn FnMut(&mut Connection)>;

/// Address family to resolve candidate endpoints against. `Any` accepts
/// either, matching the reference `AF_UNSPEC` default.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Family {
    V4,
    V6,
    Any,
}

impl Family {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
            Family::Any => true,
        }
    }
}

fn candidates(family: Family, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let filtered: Vec<SocketAddr> = resolved.into_iter().filter(|a| family.accepts(a)).collect();
    if filtered.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {:?} addresses for {}:{}", family, host, port),
        ));
    }
    Ok(filtered)
}

fn try_each<T>(
    addrs: Vec<SocketAddr>,
    mut attempt: impl FnMut(SocketAddr) -> io::Result<T>,
) -> Result<(T, SocketAddr), Error> {
    let mut last_err = None;
    for addr in addrs {
        match attempt(addr) {
            Ok(v) => return Ok((v, addr)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::Io(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate addresses")
    })))
}

fn bind_one(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn connect_one(addr: SocketAddr) -> io::Result<std::net::TcpStream> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.connect(&addr.into())?;
    Ok(socket.into())
}

/// The event loop. In server mode, `listener` is `Some` and new peers
/// arrive via `accept`; in client mode it is `None` and the single
/// connection present at construction is the only peer that will ever
/// exist.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    next_id: u16,
    quit: Arc<AtomicBool>,
    on_accept: Option<AcceptHandler>,
}

impl EventLoop {
    /// Resolves `host:port` under `family`, binds and listens on the first
    /// address that works (backlog 64), and returns a server-mode loop.
    pub fn bind(family: Family, host: &str, port: u16) -> Result<Self, Error> {
        let addrs = candidates(family, host, port)?;
        let (std_listener, addr) = try_each(addrs, bind_one)?;
        log::info!("listening on {}", addr);
        std_listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(EventLoop {
            poll,
            events: Events::with_capacity(128),
            listener: Some(listener),
            connections: HashMap::new(),
            next_token: 1,
            next_id: 1,
            quit: Arc::new(AtomicBool::new(false)),
            on_accept: None,
        })
    }

    /// Resolves `host:port` under `family`, connects to the first address
    /// that works, and returns a client-mode loop with that single peer
    /// already registered.
    pub fn connect(family: Family, host: &str, port: u16) -> Result<Self, Error> {
        let addrs = candidates(family, host, port)?;
        let (std_stream, addr) = try_each(addrs, connect_one)?;
        log::info!("connected to {}", addr);
        std_stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(std_stream);

        let poll = Poll::new()?;
        let token = Token(1);
        poll.registry()
            .register(&mut stream, token, Interest::READABLE)?;

        let mut connections = HashMap::new();
        connections.insert(token, Connection::new(stream, 1));

        Ok(EventLoop {
            poll,
            events: Events::with_capacity(128),
            listener: None,
            connections,
            next_token: 2,
            next_id: 2,
            quit: Arc::new(AtomicBool::new(false)),
            on_accept: None,
        })
    }

    pub fn is_client(&self) -> bool {
        self.listener.is_none()
    }

    /// The bound local address in server mode, e.g. to discover the
    /// ephemeral port chosen when binding to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "not in server mode")),
        }
    }

    /// Registers a callback invoked once per newly accepted connection
    /// (server mode only).
    pub fn set_accept_callback(&mut self, cb: AcceptHandler) {
        self.on_accept = Some(cb);
    }

    /// A handle the caller can use to request shutdown from outside the
    /// loop (e.g. a worker thread), independent of `install_sigint_handler`.
    pub fn quit_handle(&self) -> Arc<AtomicBool> {
        self.quit.clone()
    }

    /// Installs a process-wide `SIGINT` handler that sets the loop's quit
    /// flag. Every peer is disconnected on the next `step`, so the loop
    /// exits within one poll timeout. Only one such handler may be
    /// installed per process, and it does not chain to any handler
    /// installed before it.
    pub fn install_sigint_handler(&self) -> Result<(), Error> {
        let quit = self.quit.clone();
        ctrlc::set_handler(move || {
            log::info!("received SIGINT, shutting down");
            quit.store(true, Ordering::SeqCst);
        })
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }

    /// Iterates the live connections (e.g. to register BARs on every peer
    /// up front in client mode, or to drive requests from outside the
    /// accept callback).
    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    fn register_connection(&mut self, mut stream: TcpStream) -> Result<(), Error> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let mut conn = Connection::new(stream, id);
        if let Some(cb) = self.on_accept.as_mut() {
            cb(&mut conn);
        }
        self.connections.insert(token, conn);
        Ok(())
    }

    fn accept_ready(&mut self) -> Result<(), Error> {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return Ok(()),
            };
            match accepted {
                Ok((stream, peer)) => {
                    log::info!("new connection from {}", peer);
                    self.register_connection(stream)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn sweep(&mut self) {
        let dead: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| !c.is_active())
            .map(|(t, _)| *t)
            .collect();
        for token in dead {
            if let Some(mut conn) = self.connections.remove(&token) {
                conn.drop_pending_completions();
                let _ = self.poll.registry().deregister(conn.socket_mut());
                log::debug!("connection {:?} destroyed", token);
            }
        }
    }

    /// Runs one iteration: waits up to one second for readiness, accepts
    /// new peers, decodes exactly one transport unit per ready connection
    /// and dispatches it, then reaps closed connections. Returns `true`
    /// once the loop should stop (client mode's sole peer is gone, or
    /// `SIGINT`/an external quit request has drained every peer).
    pub fn step(&mut self) -> Result<bool, Error> {
        if self.quit.load(Ordering::SeqCst) {
            for conn in self.connections.values_mut() {
                conn.close();
            }
        }

        self.poll.poll(&mut self.events, Some(POLL_TIMEOUT))?;

        let ready: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in ready {
            if token == LISTENER_TOKEN {
                self.accept_ready()?;
                continue;
            }
            if let Some(conn) = self.connections.get_mut(&token) {
                match conn.read_once() {
                    Ok(Received::Tlp(tlp)) => router::dispatch(conn, tlp),
                    Ok(Received::None) => {}
                    Err(e) => log::debug!("connection {:?} closing: {}", token, e),
                }
            }
        }

        self.sweep();

        let should_quit = if self.is_client() {
            self.connections.is_empty()
        } else {
            self.quit.load(Ordering::SeqCst) && self.connections.is_empty()
        };
        Ok(should_quit)
    }

    /// Drives `step` until it reports the loop should stop.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            if self.step()? {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_filters_candidates() {
        assert!(Family::V4.accepts(&"127.0.0.1:0".parse().unwrap()));
        assert!(!Family::V4.accepts(&"[::1]:0".parse().unwrap()));
        assert!(Family::Any.accepts(&"[::1]:0".parse().unwrap()));
    }

    #[test]
    fn bind_then_connect_registers_both_ends() {
        let mut server = EventLoop::bind(Family::V4, "127.0.0.1", 0).unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = EventLoop::connect(Family::V4, "127.0.0.1", addr.port()).unwrap();
        assert!(client.is_client());

        // one step lets the server accept the pending connection.
        assert!(!server.step().unwrap());
        assert_eq!(server.connections.len(), 1);
        assert_eq!(client.connections.len(), 1);
    }
}
