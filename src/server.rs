//! TCP server for the append-and-playback protocol.
//!
//! Connections are served strictly one at a time: the accept loop awaits
//! each connection's handler before accepting the next. This is what keeps
//! the log store single-writer, so do not spawn handlers onto the runtime.

use crate::config::PartialRecords;
use crate::session::{Session, SessionState};
use crate::storage::{LogStore, StoreError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Pending connection queue length for the listener.
const LISTEN_BACKLOG: i32 = 10;

/// Bytes requested per read from a client.
const RECV_CHUNK_SIZE: usize = 1024;

/// Bytes written per send during playback.
const PLAYBACK_CHUNK_SIZE: usize = 1024;

/// Pause after an accept failure that is likely to repeat (e.g. EMFILE).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Create the listening socket.
///
/// Done with plain blocking setup so it can run before the process
/// detaches and before the async runtime exists. The socket is left in
/// non-blocking mode, ready for `Server::new`.
pub fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener, ServerError> {
    let setup = |e: io::Error| ServerError::SocketSetup(addr, e);

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(setup)?;

    socket.set_reuse_address(true).map_err(setup)?;
    socket.set_nonblocking(true).map_err(setup)?;
    socket.bind(&addr.into()).map_err(setup)?;
    socket.listen(LISTEN_BACKLOG).map_err(setup)?;

    Ok(socket.into())
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    store: Arc<LogStore>,
    partial_records: PartialRecords,
}

impl Server {
    /// Wrap a bound listener. Must be called inside the tokio runtime.
    pub fn new(
        listener: std::net::TcpListener,
        store: Arc<LogStore>,
        partial_records: PartialRecords,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::from_std(listener).map_err(ServerError::Listener)?;
        let server = Server {
            listener,
            store,
            partial_records,
        };

        let addr = server.local_addr().map_err(ServerError::Listener)?;
        info!(address = %addr, "Server listening");
        Ok(server)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the future is dropped.
    pub async fn run(&self) {
        loop {
            match self.listener.accept().await {
                Ok((mut stream, peer)) => {
                    info!(peer = %peer.ip(), "Accepted connection");

                    let result =
                        handle_connection(&mut stream, &self.store, self.partial_records).await;
                    match result {
                        Ok(SessionOutcome::PlayedBack { received, returned }) => {
                            debug!(peer = %peer, received, returned, "Played back log")
                        }
                        Ok(SessionOutcome::Disconnected {
                            received,
                            discarded,
                        }) => {
                            debug!(peer = %peer, received, discarded, "Peer closed before newline")
                        }
                        Err(ConnectionError::Store(e)) => {
                            error!(peer = %peer, error = %e, "Log store failure")
                        }
                        Err(ConnectionError::Io(e)) => {
                            warn!(peer = %peer, error = %e, "Connection error")
                        }
                    }

                    drop(stream);
                    info!(peer = %peer.ip(), "Closed connection");
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    if let Some(delay) = accept_backoff(&e) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

/// How long to wait before accepting again after `e`.
///
/// Errors tied to a single connection are retried at once; anything else
/// (descriptor exhaustion, memory pressure) would otherwise spin.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

/// How a session ended when no error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A message was appended and the log was played back.
    PlayedBack { received: usize, returned: usize },
    /// The peer closed before sending a newline.
    Disconnected { received: usize, discarded: usize },
}

/// Serve one message-and-playback cycle on `stream`.
///
/// Reads until a chunk containing a newline arrives, appends what was
/// received, then writes the whole store back. Nothing past the completing
/// chunk is read. On error the caller just drops the connection; no
/// response has been sent for store failures.
pub async fn handle_connection<S>(
    stream: &mut S,
    store: &LogStore,
    partial_records: PartialRecords,
) -> Result<SessionOutcome, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new(partial_records);
    let mut chunk = [0u8; RECV_CHUNK_SIZE];

    while session.state() == SessionState::Receiving {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            let discarded = session.close();
            return Ok(SessionOutcome::Disconnected {
                received: session.received(),
                discarded,
            });
        }

        session.receive(&chunk[..n]);
        if let Some(bytes) = session.take_appendable() {
            store.append(&bytes).await?;
        }
    }

    let responding = session.start_responding();
    debug_assert!(responding, "session left Receiving without completing");

    let returned = play_back(stream, store).await?;
    let unstored = session.close();
    debug_assert_eq!(unstored, 0, "completed session still holds unstored bytes");

    Ok(SessionOutcome::PlayedBack {
        received: session.received(),
        returned,
    })
}

/// Write the whole store to `stream` in fixed-size pieces.
///
/// The store is read completely before anything is written, so a read
/// failure leaves the peer with no response at all.
async fn play_back<W>(stream: &mut W, store: &LogStore) -> Result<usize, ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let contents = store.read_all().await?;
    for piece in contents.chunks(PLAYBACK_CHUNK_SIZE) {
        stream.write_all(piece).await?;
    }
    stream.flush().await?;
    Ok(contents.len())
}

/// Fatal server errors
#[derive(Debug)]
pub enum ServerError {
    /// Socket creation, bind, or listen failed.
    SocketSetup(SocketAddr, io::Error),
    /// Registering the listener with the runtime failed.
    Listener(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::SocketSetup(addr, e) => {
                write!(f, "Failed to set up listening socket on {addr}: {e}")
            }
            ServerError::Listener(e) => write!(f, "Failed to register listener: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Errors that end a single connection
#[derive(Debug)]
pub enum ConnectionError {
    Io(io::Error),
    Store(StoreError),
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<StoreError> for ConnectionError {
    fn from(e: StoreError) -> Self {
        ConnectionError::Store(e)
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "connection I/O error: {e}"),
            ConnectionError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConnectionError {}
