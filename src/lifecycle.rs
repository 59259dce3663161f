//! Process lifecycle: startup ordering, detaching, and shutdown.
//!
//! Startup binds the listener first, then optionally detaches, then builds
//! the runtime. Forking is only safe while the process is single-threaded,
//! so detaching has to happen before tokio starts its threads.
//!
//! Shutdown is driven by SIGINT/SIGTERM. The signal future is raced against
//! the accept loop; whichever accept, read, or write was blocked is
//! cancelled, which drops the client connection and the listener. The log
//! store is deleted afterwards.

use crate::config::Config;
use crate::server::{bind_listener, Server, ServerError};
use crate::storage::LogStore;
use std::future::Future;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, error, info};

/// Bind, detach if requested, and serve until a termination signal.
pub fn start(config: Config) -> Result<(), LifecycleError> {
    let listener = bind_listener(config.listen)?;

    if config.daemon {
        info!("Detaching from terminal");
        daemonize().map_err(LifecycleError::Daemonize)?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(LifecycleError::Runtime)?;

    runtime.block_on(run(listener, &config))
}

async fn run(listener: std::net::TcpListener, config: &Config) -> Result<(), LifecycleError> {
    let mut signals = ShutdownSignals::install().map_err(LifecycleError::Signals)?;

    let store = LogStore::new(&config.data_file);
    let server = Server::new(listener, Arc::clone(&store), config.partial_records)?;

    serve_until(server, &store, async move {
        let name = signals.recv().await;
        info!(signal = name, "Caught signal, exiting");
    })
    .await;

    Ok(())
}

/// Run `server` until `shutdown` resolves, then release everything.
///
/// The server (listener plus any in-flight connection) is dropped before
/// the store is removed. Removal is best effort: a failure is logged and
/// shutdown still completes.
pub async fn serve_until<F>(server: Server, store: &LogStore, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = server.run() => {}
        _ = shutdown => {}
    }

    drop(server);
    cleanup(store).await;
}

async fn cleanup(store: &LogStore) {
    match store.remove().await {
        Ok(true) => info!(path = %store.path().display(), "Deleted log store"),
        Ok(false) => debug!(path = %store.path().display(), "No log store to delete"),
        Err(e) => error!(error = %e, "Failed to delete log store"),
    }
}

/// SIGINT and SIGTERM listeners.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    /// Register the handlers. From here on neither signal kills the process
    /// outright.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for either signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

/// Detach from the controlling terminal.
///
/// Classic double fork: the first child starts a new session, the second
/// can never reacquire a terminal. Standard streams go to `/dev/null`.
/// Parents exit with success.
pub fn daemonize() -> io::Result<()> {
    fork_and_exit_parent()?;

    // SAFETY: no threads exist yet; setsid has no memory-safety preconditions.
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    fork_and_exit_parent()?;

    // SAFETY: umask only updates the process file mode mask.
    unsafe {
        libc::umask(0);
    }
    std::env::set_current_dir("/")?;

    let dev_null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(dev_null.as_raw_fd(), fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

fn fork_and_exit_parent() -> io::Result<()> {
    // SAFETY: called before the runtime starts, while the process has one thread.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        _ => std::process::exit(0),
    }
}

/// Startup and shutdown errors
#[derive(Debug)]
pub enum LifecycleError {
    Server(ServerError),
    Daemonize(io::Error),
    Runtime(io::Error),
    Signals(io::Error),
}

impl From<ServerError> for LifecycleError {
    fn from(e: ServerError) -> Self {
        LifecycleError::Server(e)
    }
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::Server(e) => write!(f, "{e}"),
            LifecycleError::Daemonize(e) => write!(f, "Failed to detach from terminal: {e}"),
            LifecycleError::Runtime(e) => write!(f, "Failed to start runtime: {e}"),
            LifecycleError::Signals(e) => write!(f, "Failed to install signal handlers: {e}"),
        }
    }
}

impl std::error::Error for LifecycleError {}
