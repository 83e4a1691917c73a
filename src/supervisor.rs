//! Engine process supervision: port negotiation, launching, liveness and
//! restart policy.

use async_trait::async_trait;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::process::{ChildStderr, ChildStdout};
use tracing::{debug, info, warn};

use crate::config::{Config, NetworkConfig};
use crate::error::{Result, SessionError};
use crate::process::EngineProcess;
use crate::state::ProcessState;

/// Bind the listener the engine connects back to.
///
/// Busy ports are skipped; any other failure means there is no usable
/// network and is returned at once.
pub async fn bind_listener(config: &NetworkConfig) -> Result<(TcpListener, u16)> {
    let attempts = config.max_port_attempts.max(1);
    for offset in 0..attempts {
        let Some(port) = config.port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((config.bind_address.as_str(), port)).await {
            Ok(listener) => {
                let bound = listener.local_addr().map_err(SessionError::Io)?.port();
                info!(port = bound, "listening for the engine");
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!(port, "port busy, trying the next one");
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::AddrNotAvailable | io::ErrorKind::PermissionDenied
                ) =>
            {
                return Err(SessionError::NoNetwork(e));
            }
            Err(e) => return Err(SessionError::Bind { port, source: e }),
        }
    }
    Err(SessionError::PortsExhausted {
        first_port: config.port,
        attempts,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart,
    GiveUp,
}

/// Crash penalty counter.
///
/// A crash costs two, a recognized prompt pays back one. Once the penalty
/// exceeds the threshold, automatic restarts stop.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    attempts: u32,
    threshold: u32,
}

impl RestartTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            attempts: 0,
            threshold,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_prompt(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
    }

    pub fn on_crash(&mut self) -> RestartDecision {
        self.attempts = self.attempts.saturating_add(2);
        if self.attempts > self.threshold {
            RestartDecision::GiveUp
        } else {
            RestartDecision::Restart
        }
    }

    /// Forget past crashes; used when the user restarts by hand
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Process-table view of the engine, independent of the child handle
pub struct LivenessProbe {
    system: System,
    pid: Pid,
}

impl LivenessProbe {
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(pid),
        }
    }

    fn refresh(&mut self) -> Option<&sysinfo::Process> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.system.process(self.pid)
    }

    /// The process exists and has not terminated
    pub fn is_alive(&mut self) -> bool {
        self.refresh()
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    /// CPU usage since the previous sample, in percent
    pub fn cpu_usage(&mut self) -> Option<f32> {
        self.refresh().map(|p| p.cpu_usage())
    }
}

/// Starts engine processes
#[async_trait]
pub trait Launcher: Send {
    /// Start an engine that will connect back to `port`
    async fn launch(&mut self, port: u16) -> Result<EngineProcess>;
}

/// Launches the configured engine binary
pub struct EngineLauncher {
    config: Arc<Config>,
}

impl EngineLauncher {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Launcher for EngineLauncher {
    async fn launch(&mut self, port: u16) -> Result<EngineProcess> {
        let args = self.config.engine_command_args(port);
        info!("starting engine: {} {}", self.config.engine_path, args.join(" "));
        EngineProcess::spawn(&self.config.engine_path, &args, &self.config.engine_env)
    }
}

pub type DiagnosticStreams = (
    Option<BufReader<ChildStdout>>,
    Option<BufReader<ChildStderr>>,
);

/// Owner of the engine process and its restart bookkeeping
pub struct ProcessSupervisor<L: Launcher> {
    launcher: L,
    process: Option<EngineProcess>,
    probe: Option<LivenessProbe>,
    tracker: RestartTracker,
    state: ProcessState,
}

impl<L: Launcher> ProcessSupervisor<L> {
    pub fn new(launcher: L, restart_threshold: u32) -> Self {
        Self {
            launcher,
            process: None,
            probe: None,
            tracker: RestartTracker::new(restart_threshold),
            state: ProcessState::NotStarted,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn restart_attempts(&self) -> u32 {
        self.tracker.attempts()
    }

    /// Pid of the spawned child
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(EngineProcess::id)
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    /// Launch the engine, replacing any running instance.
    ///
    /// `retry` marks an automatic restart after a crash.
    pub async fn start(&mut self, port: u16, retry: bool) -> Result<()> {
        if self.process.is_some() {
            self.stop().await;
        }
        if retry {
            info!(attempts = self.tracker.attempts(), "restarting engine");
        }
        let process = match self.launcher.launch(port).await {
            Ok(process) => process,
            Err(e) => {
                self.state = ProcessState::Crashed;
                return Err(e);
            }
        };
        self.probe = process.id().map(LivenessProbe::new);
        self.process = Some(process);
        self.state = ProcessState::Starting;
        Ok(())
    }

    /// Hand the engine's standard streams to the diagnostic monitors
    pub fn take_streams(&mut self) -> DiagnosticStreams {
        match self.process.as_mut() {
            Some(process) => (process.stdout.take(), process.stderr.take()),
            None => (None, None),
        }
    }

    /// Resolve when the engine exits; never resolves without an engine
    pub async fn wait_exit(&mut self) -> Result<ExitStatus> {
        match self.process.as_mut() {
            Some(process) => process.wait().await,
            None => std::future::pending().await,
        }
    }

    /// Whether the engine is still there, judged by both the child handle and
    /// the process table
    pub fn check_liveness(&mut self) -> bool {
        let Some(process) = self.process.as_mut() else {
            return false;
        };
        match process.try_wait() {
            Ok(Some(status)) => {
                debug!(?status, "engine exit noticed by liveness probe");
                return false;
            }
            Ok(None) => {}
            Err(e) => warn!("could not poll engine process: {}", e),
        }
        self.probe.as_mut().map_or(true, LivenessProbe::is_alive)
    }

    /// Probe `pid` instead of the child, once the engine announced its own pid
    pub fn watch_pid(&mut self, pid: u32) {
        if self.process.is_some() {
            self.probe = Some(LivenessProbe::new(pid));
        }
    }

    pub fn cpu_usage(&mut self) -> Option<f32> {
        self.probe.as_mut().and_then(LivenessProbe::cpu_usage)
    }

    /// A prompt showed the engine is working
    pub fn on_prompt(&mut self) {
        self.tracker.on_prompt();
        self.state = ProcessState::Running;
    }

    /// The engine went away without being asked to
    pub fn on_exit(&mut self) -> RestartDecision {
        self.process = None;
        self.probe = None;
        self.state = ProcessState::Crashed;
        let decision = self.tracker.on_crash();
        warn!(
            attempts = self.tracker.attempts(),
            ?decision,
            "engine process exited"
        );
        decision
    }

    /// Manual restart request
    pub fn reset_attempts(&mut self) {
        self.tracker.reset();
    }

    /// Kill the engine if it is running
    pub async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.kill().await {
                debug!("engine already gone: {}", e);
            }
        }
        self.probe = None;
        self.state = ProcessState::NotStarted;
    }

    /// Wait up to `grace` for the engine to exit by itself, then kill it.
    /// Returns true if the engine quit on its own.
    pub async fn stop_within(&mut self, grace: std::time::Duration) -> bool {
        let mut quit = false;
        if let Some(process) = self.process.as_mut() {
            match tokio::time::timeout(grace, process.wait()).await {
                Ok(Ok(status)) => {
                    info!(?status, "engine exited");
                    self.process = None;
                    quit = true;
                }
                Ok(Err(e)) => warn!("waiting for engine failed: {}", e),
                Err(_) => warn!("engine did not quit within {:?}; killing it", grace),
            }
        }
        self.stop().await;
        quit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_restart_escalation_stops_at_threshold() {
        let mut tracker = RestartTracker::new(4);
        tracker.on_prompt();
        assert_eq!(tracker.attempts(), 0);

        assert_eq!(tracker.on_crash(), RestartDecision::Restart);
        assert_eq!(tracker.attempts(), 2);
        assert_eq!(tracker.on_crash(), RestartDecision::Restart);
        assert_eq!(tracker.attempts(), 4);
        assert_eq!(tracker.on_crash(), RestartDecision::GiveUp);
        assert_eq!(tracker.attempts(), 6);
    }

    #[test]
    fn test_prompts_pay_back_crashes() {
        let mut tracker = RestartTracker::new(4);
        tracker.on_crash();
        tracker.on_prompt();
        tracker.on_crash();
        tracker.on_prompt();
        assert_eq!(tracker.attempts(), 2);
        assert_eq!(tracker.on_crash(), RestartDecision::Restart);
        tracker.reset();
        assert_eq!(tracker.attempts(), 0);
    }

    #[tokio::test]
    async fn test_bind_skips_busy_ports() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = taken.local_addr().unwrap().port();
        let config = NetworkConfig {
            port: busy,
            max_port_attempts: 20,
            bind_address: "127.0.0.1".to_string(),
        };
        let (_listener, port) = bind_listener(&config).await.unwrap();
        assert_ne!(port, busy);
        assert!(port > busy);
    }

    #[tokio::test]
    async fn test_bind_gives_up_after_attempts() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = NetworkConfig {
            port: taken.local_addr().unwrap().port(),
            max_port_attempts: 1,
            bind_address: "127.0.0.1".to_string(),
        };
        assert!(matches!(
            bind_listener(&config).await,
            Err(SessionError::PortsExhausted { attempts: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_unavailable_address_is_no_network() {
        let config = NetworkConfig {
            port: 4010,
            max_port_attempts: 3,
            // TEST-NET-1, never assigned to a local interface
            bind_address: "192.0.2.1".to_string(),
        };
        assert!(matches!(
            bind_listener(&config).await,
            Err(SessionError::NoNetwork(_))
        ));
    }

    #[cfg(unix)]
    struct SleepLauncher {
        launches: u32,
    }

    #[cfg(unix)]
    #[async_trait]
    impl Launcher for SleepLauncher {
        async fn launch(&mut self, _port: u16) -> Result<EngineProcess> {
            self.launches += 1;
            EngineProcess::spawn("sleep", &["30".to_string()], &HashMap::new())
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervisor_start_and_stop() {
        let mut supervisor = ProcessSupervisor::new(SleepLauncher { launches: 0 }, 4);
        supervisor.start(4010, false).await.unwrap();
        assert_eq!(supervisor.state(), ProcessState::Starting);
        assert!(supervisor.check_liveness());
        assert!(supervisor.pid().is_some());

        supervisor.start(4010, true).await.unwrap();
        assert_eq!(supervisor.launcher.launches, 2);

        supervisor.on_prompt();
        assert_eq!(supervisor.state(), ProcessState::Running);
        supervisor.stop().await;
        assert!(!supervisor.has_process());
        assert!(!supervisor.check_liveness());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_liveness_follows_watched_pid() {
        let mut supervisor = ProcessSupervisor::new(SleepLauncher { launches: 0 }, 4);
        supervisor.start(4010, false).await.unwrap();

        // A reaped process no longer exists, while the child keeps running
        let mut gone = std::process::Command::new("true").spawn().unwrap();
        let gone_pid = gone.id();
        gone.wait().unwrap();

        supervisor.watch_pid(gone_pid);
        assert!(!supervisor.check_liveness());
        assert!(supervisor.has_process());
        assert!(supervisor.cpu_usage().is_none());

        let child = supervisor.pid().unwrap();
        supervisor.watch_pid(child);
        assert!(supervisor.check_liveness());
        supervisor.stop().await;
    }

    struct FailingLauncher;

    #[async_trait]
    impl Launcher for FailingLauncher {
        async fn launch(&mut self, _port: u16) -> Result<EngineProcess> {
            Err(SessionError::Spawn(io::Error::new(
                io::ErrorKind::NotFound,
                "no engine",
            )))
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_crashed() {
        let mut supervisor = ProcessSupervisor::new(FailingLauncher, 4);
        assert!(matches!(
            supervisor.start(4010, false).await,
            Err(SessionError::Spawn(_))
        ));
        assert_eq!(supervisor.state(), ProcessState::Crashed);
    }
}
