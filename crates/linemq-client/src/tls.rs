//! TLS transport using rustls.
//!
//! The client reads and writes one connection from two threads, which rules
//! out `rustls::StreamOwned` (it wants exclusive access for both directions).
//! [`TlsTransport`] shares the session behind a mutex instead, and feeds it
//! from the socket outside the lock so a parked read never starves a writer.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::ClientConnection;

use crate::transport::{dial, Conn, Connecter, Transport};

/// A TLS link whose clones share one session over one TCP stream.
pub struct TlsTransport {
    session: Arc<Mutex<ClientConnection>>,
    sock: TcpStream,
}

impl TlsTransport {
    /// Wrap `sock` and run the handshake to completion.
    pub fn handshake(
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
        mut sock: TcpStream,
    ) -> io::Result<Self> {
        let mut session = ClientConnection::new(config, server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        while session.is_handshaking() {
            session.complete_io(&mut sock)?;
        }
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            sock,
        })
    }

    fn flush_tls(&self, session: &mut ClientConnection) -> io::Result<()> {
        while session.wants_write() {
            session.write_tls(&mut &self.sock)?;
        }
        Ok(())
    }
}

impl Read for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut session = self.session.lock();
                match session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                // session-level close pending? flush before blocking on the socket
                self.flush_tls(&mut session)?;
            }

            // fetch ciphertext without holding the session lock
            let mut raw = [0u8; 4096];
            let n = (&self.sock).read(&mut raw)?;
            if n == 0 {
                return Ok(0);
            }

            let mut session = self.session.lock();
            let mut feed: &[u8] = &raw[..n];
            while !feed.is_empty() {
                session.read_tls(&mut feed)?;
                session
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
        }
    }
}

impl Write for TlsTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut session = self.session.lock();
        let n = session.writer().write(buf)?;
        self.flush_tls(&mut session)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut session = self.session.lock();
        self.flush_tls(&mut session)?;
        (&self.sock).flush()
    }
}

impl Transport for TlsTransport {
    fn try_clone(&self) -> io::Result<Conn> {
        Ok(Box::new(TlsTransport {
            session: Arc::clone(&self.session),
            sock: self.sock.try_clone()?,
        }))
    }

    fn shutdown(&self) -> io::Result<()> {
        self.sock.shutdown(Shutdown::Both)
    }
}

/// Connecter for TLS links.
///
/// `config` is a prebuilt rustls client configuration; certificate loading
/// and verification policy are the caller's business. `server_name` is the
/// name presented for SNI and certificate validation.
pub fn secured_connecter(
    address: impl Into<String>,
    server_name: ServerName<'static>,
    config: Arc<rustls::ClientConfig>,
    timeout: Duration,
) -> impl Connecter {
    let address = address.into();
    move || -> io::Result<Conn> {
        let sock = dial(&address, timeout)?;
        let tls = TlsTransport::handshake(Arc::clone(&config), server_name.clone(), sock)?;
        Ok(Box::new(tls) as Conn)
    }
}
