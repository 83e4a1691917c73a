use thiserror::Error;

/// Errors that can occur while supervising and talking to the engine
#[derive(Error, Debug)]
pub enum SessionError {
    /// Binding the listening socket failed for a reason other than a busy port
    #[error("failed to bind listening socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The loopback network is not usable at all
    #[error("no network available for the engine connection: {0}")]
    NoNetwork(#[source] std::io::Error),

    /// Every port in the configured range was busy
    #[error("no free port found after {attempts} attempts starting at {first_port}")]
    PortsExhausted { first_port: u16, attempts: u16 },

    /// Accepting the engine's connection failed
    #[error("failed to accept engine connection: {0}")]
    Accept(#[source] std::io::Error),

    /// Reading from or writing to the engine socket failed
    #[error("engine connection I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// Failed to spawn the engine subprocess
    #[error("failed to spawn engine process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The engine kept crashing before it produced a prompt
    #[error("engine keeps crashing before it reaches a prompt (penalty {attempts}); giving up")]
    RestartLimit { attempts: u32 },

    /// Delivering an interrupt or termination signal failed
    #[error("failed to signal engine process {pid}: {reason}")]
    Interrupt { pid: u32, reason: String },

    /// Error reading or parsing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation needed a live engine connection
    #[error("engine is not connected")]
    NotConnected,

    /// The session task is gone
    #[error("session closed")]
    SessionClosed,
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
