//! Terminal session conditions

use std::path::PathBuf;

/// Conditions that end a session.
///
/// The owning process logs these and exits so an external supervisor can
/// start a fresh incarnation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The source failed to open too many times while disk space was fine
    #[error("terminating camera process after {retries} retries")]
    TooManyFailures { retries: u32 },
    /// The tmp volume ran low while the session was running
    #[error("terminating camera due to low disk space on {}", path.display())]
    OutOfSpace { path: PathBuf },
    /// The embedded HTTP server could not be started
    #[error("web server: {0}")]
    Server(#[source] anyhow::Error),
}
