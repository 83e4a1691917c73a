//! The session event loop.
//!
//! One task owns the controller, the listener, the engine connection and the
//! supervised process. Socket readiness, process exit, the safety-net timer,
//! diagnostics and collaborator requests are all dispatched from a single
//! `select!`, so decoding never runs concurrently with itself and none of the
//! shared state needs locking.

use std::future;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::controller::{Notification, SessionController};
use crate::error::{Result, SessionError};
use crate::interrupt::{default_backend, InterruptBackend};
use crate::monitor::{spawn_monitors, DiagnosticLine};
use crate::queue::CellRef;
use crate::state::{ConnectionState, ProcessState, SchedulerState};
use crate::supervisor::{bind_listener, Launcher, ProcessSupervisor, RestartDecision};

/// Requests a [`SessionHandle`] sends to the session task
#[derive(Debug)]
pub enum Request {
    Enqueue {
        text: String,
        answers: Vec<String>,
        record_history: bool,
        origin: Option<CellRef>,
    },
    Clear,
    Answer(String),
    AddSetupCommand(String),
    Interrupt,
    Abort,
    Restart,
    Length(oneshot::Sender<(usize, usize)>),
    History(oneshot::Sender<Vec<String>>),
    Shutdown,
}

/// Cloneable front door to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl SessionHandle {
    fn send(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| SessionError::SessionClosed)
    }

    pub fn enqueue(&self, text: &str, record_history: bool, origin: Option<CellRef>) -> Result<()> {
        self.enqueue_with_answers(text, Vec::new(), record_history, origin)
    }

    pub fn enqueue_with_answers(
        &self,
        text: &str,
        answers: Vec<String>,
        record_history: bool,
        origin: Option<CellRef>,
    ) -> Result<()> {
        self.send(Request::Enqueue {
            text: text.to_string(),
            answers,
            record_history,
            origin,
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.send(Request::Clear)
    }

    pub fn answer(&self, text: &str) -> Result<()> {
        self.send(Request::Answer(text.to_string()))
    }

    pub fn add_setup_command(&self, command: &str) -> Result<()> {
        self.send(Request::AddSetupCommand(command.to_string()))
    }

    /// Signal the engine to stop the working command
    pub fn interrupt(&self) -> Result<()> {
        self.send(Request::Interrupt)
    }

    /// Interrupt, clear the queue and mark the working cell as interrupted
    pub fn abort(&self) -> Result<()> {
        self.send(Request::Abort)
    }

    /// Start a fresh engine, also after supervision gave up
    pub fn restart(&self) -> Result<()> {
        self.send(Request::Restart)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Request::Shutdown)
    }

    /// `(queued commands, answers left in the current command)`
    pub async fn length(&self) -> Result<(usize, usize)> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Length(tx))?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    pub async fn history(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::History(tx))?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }
}

pub struct Session<L: Launcher> {
    config: Arc<Config>,
    controller: SessionController,
    supervisor: ProcessSupervisor<L>,
    interrupter: Box<dyn InterruptBackend>,
    listener: Option<TcpListener>,
    port: u16,
    connection: Option<Connection>,
    connection_state: ConnectionState,
    requests: mpsc::UnboundedReceiver<Request>,
    notifications: mpsc::UnboundedSender<Notification>,
    diag_tx: mpsc::UnboundedSender<DiagnosticLine>,
    diag_rx: mpsc::UnboundedReceiver<DiagnosticLine>,
    ticks: u64,
}

impl<L: Launcher> Session<L> {
    /// Create a session together with its handle and notification stream
    pub fn new(
        config: Config,
        launcher: L,
    ) -> Result<(Self, SessionHandle, mpsc::UnboundedReceiver<Notification>)> {
        let controller = SessionController::new(&config)?;
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let (diag_tx, diag_rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(launcher, config.supervision.restart_threshold);

        let session = Self {
            config: Arc::new(config),
            controller,
            supervisor,
            interrupter: default_backend(),
            listener: None,
            port: 0,
            connection: None,
            connection_state: ConnectionState::Disconnected,
            requests: req_rx,
            notifications: note_tx,
            diag_tx,
            diag_rx,
            ticks: 0,
        };
        Ok((session, SessionHandle { tx: req_tx }, note_rx))
    }

    /// Replace the platform interrupt mechanism
    pub fn with_interrupter(mut self, interrupter: Box<dyn InterruptBackend>) -> Self {
        self.interrupter = interrupter;
        self
    }

    /// Run until shutdown is requested or every handle is dropped.
    ///
    /// Returns an error for failures supervision cannot recover from: no
    /// network for the listener, or an engine that cannot be spawned.
    pub async fn run(mut self) -> Result<()> {
        let (listener, port) = match bind_listener(&self.config.network).await {
            Ok(bound) => bound,
            Err(e) => {
                self.fatal(&e);
                return Err(e);
            }
        };
        self.listener = Some(listener);
        self.port = port;
        self.connection_state = self.connection_state.on_bound();
        self.status(format!("listening on port {}", port));

        let result = self.event_loop().await;
        if let Err(e) = &result {
            self.fatal(e);
            self.kill_engine().await;
        }
        result
    }

    async fn event_loop(&mut self) -> Result<()> {
        self.start_engine(false).await?;

        let period = Duration::from_millis(self.config.supervision.poll_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = accept_next(self.listener.as_ref(), self.connection.is_none()) => {
                    self.on_accept(accepted);
                }
                ready = readable(self.connection.as_ref()) => {
                    if let Err(e) = ready {
                        warn!("engine socket error: {}", e);
                    }
                    self.drain_socket().await?;
                }
                status = self.supervisor.wait_exit() => {
                    self.on_engine_exit(status.ok()).await?;
                }
                _ = ticker.tick() => {
                    self.on_tick().await?;
                }
                Some(diag) = self.diag_rx.recv() => {
                    self.controller.notify(Notification::Diagnostic {
                        stream: diag.stream,
                        line: diag.line,
                    });
                }
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => {
                        self.shutdown().await;
                        self.flush_notifications();
                        return Ok(());
                    }
                    Some(request) => self.handle_request(request).await?,
                },
            }
            self.pump().await?;
        }
    }

    async fn start_engine(&mut self, retry: bool) -> Result<()> {
        if self.connection.take().is_some() {
            self.connection_state = self.connection_state.on_lost();
            self.controller.on_disconnected();
        }
        self.controller.clear();
        self.supervisor.start(self.port, retry).await?;
        self.connection_state = self.connection_state.on_bound();

        let (stdout, stderr) = self.supervisor.take_streams();
        spawn_monitors(stdout, stderr, self.diag_tx.clone());
        self.status(format!(
            "engine started (pid {})",
            self.supervisor
                .pid()
                .map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
        ));
        Ok(())
    }

    fn on_accept(&mut self, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, peer)) => {
                info!(%peer, "engine connected");
                self.connection = Some(Connection::new(stream, peer));
                self.connection_state = self.connection_state.on_accepted();
                self.controller.on_connected();
            }
            Err(e) => {
                let err = SessionError::Accept(e);
                warn!("{}", err);
                self.status(err.to_string());
            }
        }
    }

    /// Read whatever the engine sent and run it through the controller
    async fn drain_socket(&mut self) -> Result<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };
        match connection.try_drain() {
            Ok(drained) => {
                if !drained.data.is_empty() {
                    self.controller.on_bytes(&drained.data);
                }
                if drained.closed {
                    self.on_connection_lost("engine closed the connection")
                        .await?;
                }
            }
            Err(e) => {
                warn!("{}", e);
                self.on_connection_lost(&e.to_string()).await?;
            }
        }
        Ok(())
    }

    /// The socket is gone. An engine that is still running without its
    /// connection is of no use and is treated as crashed.
    async fn on_connection_lost(&mut self, reason: &str) -> Result<()> {
        if self.connection.take().is_none() {
            return Ok(());
        }
        debug!(reason, "engine connection lost");
        // Kill before the controller forgets the banner pid
        let running = self.supervisor.has_process();
        if running {
            self.kill_engine().await;
        }
        self.connection_state = self.connection_state.on_lost();
        self.controller.on_disconnected();
        if running {
            let decision = self.supervisor.on_exit();
            self.after_crash(decision).await?;
        }
        Ok(())
    }

    async fn on_engine_exit(&mut self, status: Option<ExitStatus>) -> Result<()> {
        match status {
            Some(status) => info!(%status, "engine process exited"),
            None => info!("engine process vanished"),
        }
        let decision = self.supervisor.on_exit();
        // Bytes written right before the exit are still worth decoding
        self.drain_socket().await?;
        if self.connection.take().is_some() {
            self.connection_state = self.connection_state.on_lost();
            self.controller.on_disconnected();
        }
        self.after_crash(decision).await
    }

    async fn after_crash(&mut self, decision: RestartDecision) -> Result<()> {
        match decision {
            RestartDecision::Restart => self.start_engine(true).await,
            RestartDecision::GiveUp => {
                let err = SessionError::RestartLimit {
                    attempts: self.supervisor.restart_attempts(),
                };
                error!("{}", err);
                self.controller.notify(Notification::Fatal {
                    message: err.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn on_tick(&mut self) -> Result<()> {
        self.ticks += 1;
        self.drain_socket().await?;

        if self.supervisor.has_process() && !self.supervisor.check_liveness() {
            return self.on_engine_exit(None).await;
        }

        let every = u64::from(self.config.supervision.cpu_poll_every);
        if every > 0 && self.ticks % every == 0 {
            if let Some(percent) = self.supervisor.cpu_usage() {
                self.controller.notify(Notification::CpuUsage { percent });
            }
        }
        Ok(())
    }

    async fn handle_request(&mut self, request: Request) -> Result<()> {
        match request {
            Request::Enqueue {
                text,
                answers,
                record_history,
                origin,
            } => {
                self.controller
                    .enqueue_with_answers(&text, answers, record_history, origin);
            }
            Request::Clear => self.controller.clear(),
            Request::Answer(text) => {
                if !self.controller.answer(&text) {
                    self.status("no question is pending".to_string());
                }
            }
            Request::AddSetupCommand(command) => self.controller.add_setup_command(&command),
            Request::Interrupt => self.interrupt(),
            Request::Abort => {
                self.interrupt();
                self.controller.abort();
            }
            Request::Restart => {
                info!("restart requested");
                self.kill_engine().await;
                self.supervisor.reset_attempts();
                self.start_engine(false).await?;
            }
            Request::Length(reply) => {
                let _ = reply.send(self.controller.length());
            }
            Request::History(reply) => {
                let _ = reply.send(self.controller.history().to_vec());
            }
            Request::Shutdown => {}
        }
        Ok(())
    }

    /// Signal the engine if a command is running; otherwise there is nothing
    /// to interrupt
    fn interrupt(&mut self) {
        if !matches!(
            self.controller.state(),
            SchedulerState::Working | SchedulerState::WaitingForAnswer
        ) {
            debug!("interrupt ignored: no command in flight");
            return;
        }
        let Some(pid) = self.controller.engine_pid().or_else(|| self.supervisor.pid()) else {
            warn!("interrupt ignored: engine pid unknown");
            return;
        };
        info!(pid, "interrupting engine");
        if let Err(e) = self.interrupter.interrupt(pid) {
            warn!("{}", e);
            self.status(e.to_string());
        }
    }

    /// Ask the engine to quit, killing it if it does not
    async fn shutdown(&mut self) {
        info!("shutting down session");
        let grace = Duration::from_millis(self.config.supervision.shutdown_grace_ms);
        let quit = format!("{}\n", self.config.supervision.quit_command.trim_end());
        let asked = match self.connection.as_mut() {
            Some(connection) => connection.write_command(&quit).await.is_ok(),
            None => false,
        };
        let exited = if asked {
            let child = self.supervisor.pid();
            if self.supervisor.stop_within(grace).await {
                true
            } else {
                self.terminate_detached(child);
                false
            }
        } else {
            self.kill_engine().await;
            false
        };
        debug!(exited, "engine stopped");
        if self.connection.take().is_some() {
            self.connection_state = self.connection_state.on_lost();
        }
        self.status("session closed".to_string());
    }

    /// Kill the engine process
    async fn kill_engine(&mut self) {
        let child = self.supervisor.pid();
        self.supervisor.stop().await;
        self.terminate_detached(child);
    }

    /// The banner pid can belong to a process below a launcher script, which
    /// killing the child does not reach
    fn terminate_detached(&mut self, child: Option<u32>) {
        let Some(pid) = self.controller.engine_pid() else {
            return;
        };
        if Some(pid) == child {
            return;
        }
        info!(pid, "terminating engine process");
        if let Err(e) = self.interrupter.terminate(pid) {
            debug!("{}", e);
        }
    }

    /// Transmit what the controller has ready, then deliver notifications
    async fn pump(&mut self) -> Result<()> {
        while self.connection.is_some() {
            let Some(text) = self.controller.poll_transmit() else {
                break;
            };
            let written = match self.connection.as_mut() {
                Some(connection) => connection.write_command(&text).await,
                None => Err(SessionError::NotConnected),
            };
            if let Err(e) = written {
                warn!("failed to send command: {}", e);
                self.on_connection_lost(&e.to_string()).await?;
            }
        }
        self.flush_notifications();
        Ok(())
    }

    fn flush_notifications(&mut self) {
        for notification in self.controller.take_notifications() {
            match &notification {
                Notification::Event { event, .. } if event.is_main_prompt() => {
                    self.supervisor.on_prompt();
                }
                Notification::EngineReady { pid: Some(pid) } => {
                    self.supervisor.watch_pid(*pid);
                }
                _ => {}
            }
            if self.notifications.send(notification).is_err() {
                debug!("notification receiver dropped");
            }
        }
    }

    fn status(&mut self, text: String) {
        self.controller.notify(Notification::Status { text });
    }

    fn fatal(&mut self, err: &SessionError) {
        error!("{}", err);
        self.controller.notify(Notification::Fatal {
            message: err.to_string(),
        });
        self.flush_notifications();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn process_state(&self) -> ProcessState {
        self.supervisor.state()
    }
}

async fn accept_next(
    listener: Option<&TcpListener>,
    enabled: bool,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) if enabled => listener.accept().await,
        _ => future::pending().await,
    }
}

async fn readable(connection: Option<&Connection>) -> Result<()> {
    match connection {
        Some(connection) => connection.readable().await,
        None => future::pending().await,
    }
}
