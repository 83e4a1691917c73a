//! Delivering interrupt and kill signals to the engine.
//!
//! An interrupt asks the engine to abandon the running computation and
//! return to its prompt. It is fire-and-forget: the next main prompt is the
//! only confirmation.

use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::debug;

use crate::error::{Result, SessionError};

/// Platform mechanism for signalling the engine process
pub trait InterruptBackend: Send {
    /// Ask the process to stop its current computation
    fn interrupt(&mut self, pid: u32) -> Result<()>;

    /// Forcefully end the process
    fn terminate(&mut self, pid: u32) -> Result<()>;
}

/// POSIX signals through `kill(2)`
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct SignalInterrupt;

#[cfg(unix)]
impl SignalInterrupt {
    fn send(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid as UnixPid;

        let raw = i32::try_from(pid).map_err(|_| SessionError::Interrupt {
            pid,
            reason: "pid out of range".to_string(),
        })?;
        debug!(pid, ?signal, "signalling engine");
        kill(UnixPid::from_raw(raw), signal).map_err(|err| SessionError::Interrupt {
            pid,
            reason: err.to_string(),
        })
    }
}

#[cfg(unix)]
impl InterruptBackend for SignalInterrupt {
    fn interrupt(&mut self, pid: u32) -> Result<()> {
        Self::send(pid, nix::sys::signal::Signal::SIGINT)
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        Self::send(pid, nix::sys::signal::Signal::SIGKILL)
    }
}

/// Portable signalling through the process table
pub struct SysinfoInterrupt {
    system: System,
}

impl Default for SysinfoInterrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoInterrupt {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    fn with_process<F>(&mut self, pid: u32, action: &str, f: F) -> Result<()>
    where
        F: FnOnce(&sysinfo::Process) -> Option<bool>,
    {
        let target = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        let process = self
            .system
            .process(target)
            .ok_or_else(|| SessionError::Interrupt {
                pid,
                reason: "no such process".to_string(),
            })?;
        debug!(pid, action, "signalling engine");
        match f(process) {
            Some(true) => Ok(()),
            Some(false) => Err(SessionError::Interrupt {
                pid,
                reason: format!("{} was not delivered", action),
            }),
            None => Err(SessionError::Interrupt {
                pid,
                reason: format!("{} is not supported on this platform", action),
            }),
        }
    }
}

impl InterruptBackend for SysinfoInterrupt {
    fn interrupt(&mut self, pid: u32) -> Result<()> {
        self.with_process(pid, "interrupt", |p| p.kill_with(Signal::Interrupt))
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        self.with_process(pid, "kill", |p| Some(p.kill()))
    }
}

/// The backend for the current platform
pub fn default_backend() -> Box<dyn InterruptBackend> {
    #[cfg(unix)]
    {
        Box::new(SignalInterrupt)
    }
    #[cfg(not(unix))]
    {
        Box::new(SysinfoInterrupt::new())
    }
}
