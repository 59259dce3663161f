//! logecho: an append-and-playback TCP service
//!
//! Each client sends one newline-terminated message. The server appends it
//! to a shared log file and answers with the entire log, then closes the
//! connection.
//!
//! Features:
//! - Listens on port 9000 by default, logs to `/var/tmp/aesdsocketdata`
//! - Serves one connection at a time, so the log has a single writer
//! - SIGINT/SIGTERM close sockets and delete the log file
//! - `-d` detaches from the terminal after the port is bound and logs to syslog
//! - Configuration via CLI arguments or TOML file

mod config;
mod lifecycle;
mod logging;
mod server;
mod session;
mod storage;

use config::Config;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging (syslog when detaching, stderr otherwise)
    logging::init(&config);

    info!(
        listen = %config.listen,
        data_file = %config.data_file.display(),
        daemon = config.daemon,
        partial_records = ?config.partial_records,
        "Starting logecho server"
    );

    if let Err(e) = lifecycle::start(config) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }

    Ok(())
}
