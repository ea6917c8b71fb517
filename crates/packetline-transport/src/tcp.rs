use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::Transport;

const READ_CHUNK_SIZE: usize = 8 * 1024;
const WRITE_RETRY_SLEEP: Duration = Duration::from_millis(1);

/// Socket options applied to every TCP transport.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Timeout for dialing the remote address.
    pub connect_timeout: Duration,
    /// Upper bound on a single blocking write. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
    /// Disable Nagle's algorithm so small packets leave immediately.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            write_timeout: Some(Duration::from_secs(30)),
            nodelay: true,
        }
    }
}

struct ReadSide {
    stream: TcpStream,
    buf: BytesMut,
    peer_closed: bool,
}

/// A TCP connection exposed as a [`Transport`].
///
/// The socket runs in non-blocking mode. Reads are drained into an internal
/// buffer whenever [`Transport::bytes_available`] is called, so they never
/// wait on the network. Writes retry until every byte is sent, bounded by
/// [`TcpConfig::write_timeout`].
pub struct TcpTransport {
    remote: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    config: TcpConfig,
    read_side: Mutex<Option<ReadSide>>,
    write_side: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    disposed: AtomicBool,
}

impl TcpTransport {
    /// Create a disconnected transport that dials `remote` on [`Transport::connect`].
    pub fn new(remote: SocketAddr) -> Self {
        Self::with_config(remote, TcpConfig::default())
    }

    /// Create a disconnected transport with explicit socket options.
    pub fn with_config(remote: SocketAddr, config: TcpConfig) -> Self {
        Self {
            remote: Some(remote),
            peer_addr: Some(remote),
            config,
            read_side: Mutex::new(None),
            write_side: Mutex::new(None),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Wrap an already-connected stream (typically one returned by `accept`).
    ///
    /// Such a transport cannot be reconnected after [`Transport::disconnect`].
    pub fn from_stream(stream: TcpStream, config: TcpConfig) -> Result<Self> {
        let peer_addr = stream.peer_addr().ok();
        let transport = Self {
            remote: None,
            peer_addr,
            config,
            read_side: Mutex::new(None),
            write_side: Mutex::new(None),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        };
        transport.install(stream)?;
        Ok(transport)
    }

    /// Address of the remote end, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Disconnect (if connected) and refuse every later operation.
    pub fn dispose(&self) {
        if self.connected.load(Ordering::SeqCst) {
            let _ = self.disconnect();
        }
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn install(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(self.config.nodelay)?;
        // Both handles share one socket, so this also covers the write half.
        stream.set_nonblocking(true)?;
        let reader = stream.try_clone()?;

        let mut read_side = lock(&self.read_side);
        let mut write_side = lock(&self.write_side);
        *read_side = Some(ReadSide {
            stream: reader,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            peer_closed: false,
        });
        *write_side = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn bytes_available(&self) -> Result<usize> {
        self.ensure_usable()?;
        let mut guard = lock(&self.read_side);
        let side = guard.as_mut().ok_or(TransportError::NotConnected)?;

        if side.peer_closed {
            if side.buf.is_empty() {
                self.connected.store(false, Ordering::SeqCst);
                return Err(TransportError::Closed);
            }
            return Ok(side.buf.len());
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match side.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!(peer = ?self.peer_addr, "tcp peer closed the stream");
                    side.peer_closed = true;
                    if side.buf.is_empty() {
                        self.connected.store(false, Ordering::SeqCst);
                        return Err(TransportError::Closed);
                    }
                    break;
                }
                Ok(n) => side.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }

        Ok(side.buf.len())
    }

    fn read_exact(&self, n: usize) -> Result<Bytes> {
        self.ensure_usable()?;
        let mut guard = lock(&self.read_side);
        let side = guard.as_mut().ok_or(TransportError::NotConnected)?;
        if side.buf.len() < n {
            return Err(TransportError::InsufficientData {
                requested: n,
                available: side.buf.len(),
            });
        }
        Ok(side.buf.split_to(n).freeze())
    }

    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let mut guard = lock(&self.write_side);
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;
        write_all(stream, data, self.config.write_timeout)?;
        stream.flush()?;
        Ok(())
    }

    fn connect(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        let remote = self.remote.ok_or(TransportError::NotReconnectable)?;

        let stream = TcpStream::connect_timeout(&remote, self.config.connect_timeout)
            .map_err(|source| TransportError::Connect {
                addr: remote,
                source,
            })?;
        self.install(stream)?;
        info!(%remote, "tcp transport connected");
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let mut read_side = lock(&self.read_side);
        let mut write_side = lock(&self.write_side);
        read_side.take();
        if let Some(stream) = write_side.take() {
            // The peer may already be gone; shutdown failures carry no information.
            let _ = stream.shutdown(Shutdown::Both);
        }
        debug!(peer = ?self.peer_addr, "tcp transport disconnected");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer_addr", &self.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Listening TCP socket that hands out accepted connections as transports.
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: TcpConfig,
}

impl TcpAcceptor {
    /// Bind and listen on `addr`.
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        let shown = format!("{addr:?}");
        let listener = TcpListener::bind(&addr).map_err(|source| TransportError::Bind {
            addr: shown.clone(),
            source,
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                addr: shown,
                source,
            })?;

        info!(%local_addr, "listening on tcp");

        Ok(Self {
            listener,
            local_addr,
            config: TcpConfig::default(),
        })
    }

    /// Override socket options applied to accepted connections.
    pub fn with_config(mut self, config: TcpConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<TcpTransport> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        TcpTransport::from_stream(stream, self.config.clone())
    }

    /// Accept a pending connection without blocking. Returns `Ok(None)` when
    /// no client is waiting.
    pub fn try_accept(&self) -> Result<Option<TcpTransport>> {
        self.listener
            .set_nonblocking(true)
            .map_err(TransportError::Accept)?;
        let accepted = self.listener.accept();
        self.listener
            .set_nonblocking(false)
            .map_err(TransportError::Accept)?;
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                TcpTransport::from_stream(stream, self.config.clone()).map(Some)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(TransportError::Accept(err)),
        }
    }

    /// The address this acceptor is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// `write_all` for a non-blocking socket: waits out `WouldBlock` until `timeout`.
fn write_all(stream: &mut TcpStream, mut data: &[u8], timeout: Option<Duration>) -> Result<()> {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return Err(TransportError::Io(ErrorKind::WriteZero.into())),
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Err(TransportError::Io(ErrorKind::TimedOut.into()));
                }
                std::thread::sleep(WRITE_RETRY_SLEEP);
            }
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
