//! cas-session: drives a computer-algebra engine subprocess over a loopback
//! socket.
//!
//! The engine connects back to a listener owned by the session and streams
//! tag-delimited output. This crate decodes that stream into typed events,
//! schedules submitted commands one at a time against the engine's prompts,
//! validates commands before they are sent, and supervises the engine
//! process (restart on crash, interrupt, shutdown).

pub mod buffer;
pub mod classify;
pub mod config;
pub mod connection;
pub mod controller;
pub mod demux;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod monitor;
pub mod process;
pub mod queue;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod tokenizer;
pub mod validator;

pub use config::Config;
pub use controller::{Notification, SessionController};
pub use error::{Result, SessionError};
pub use events::{Event, PromptKind, Severity};
pub use queue::CellRef;
pub use session::{Session, SessionHandle};
pub use supervisor::{EngineLauncher, Launcher};
