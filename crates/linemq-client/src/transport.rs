//! Transport abstraction and the plain TCP connecter.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// A bidirectional byte stream to the broker.
///
/// The client clones every fresh connection once: the clone feeds the read
/// loop while the original sits in the write slot, so reads never block
/// writes. `shutdown` must take down both halves, unblocking a parked read.
pub trait Transport: Read + Write + Send {
    /// Second handle onto the same connection.
    fn try_clone(&self) -> io::Result<Conn>;

    /// Terminate both directions.
    fn shutdown(&self) -> io::Result<()>;
}

/// A boxed transport, as produced by a [`Connecter`].
pub type Conn = Box<dyn Transport>;

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Conn> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Factory for broker connections, invoked on every (re)connect attempt.
pub trait Connecter: Send + Sync {
    fn connect(&self) -> io::Result<Conn>;
}

impl<F> Connecter for F
where
    F: Fn() -> io::Result<Conn> + Send + Sync,
{
    fn connect(&self) -> io::Result<Conn> {
        self()
    }
}

/// Connecter for plain TCP links.
///
/// The address is resolved on every attempt, so DNS changes take effect on
/// reconnect. The operating system may impose its own, earlier timeout on
/// top of `timeout`.
pub fn unsecured_connecter(address: impl Into<String>, timeout: Duration) -> impl Connecter {
    let address = address.into();
    move || -> io::Result<Conn> {
        let stream = dial(&address, timeout)?;
        Ok(Box::new(stream) as Conn)
    }
}

pub(crate) fn dial(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "could not resolve broker address")
    })?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
