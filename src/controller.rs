//! Scheduling core of a session, free of any I/O.
//!
//! The controller owns the evaluation queue and the decode buffer. The session
//! event loop feeds it socket bytes and collaborator requests, writes whatever
//! [`SessionController::poll_transmit`] returns to the engine, and forwards the
//! collected [`Notification`]s. Keeping I/O out of here lets the scheduling
//! rules be exercised directly in tests.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::buffer::RawBuffer;
use crate::config::{Config, QueueConfig};
use crate::demux::Demultiplexer;
use crate::error::Result;
use crate::events::{Event, Severity};
use crate::monitor::DiagnosticStream;
use crate::queue::{CellRef, Command, EvaluationQueue};
use crate::state::SchedulerState;
use crate::validator::{ValidationError, ValidationFailure, Validator};

/// Everything the session reports to collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Notification {
    /// A decoded event, attributed to the cell of the command it belongs to
    Event {
        origin: Option<CellRef>,
        event: Event,
    },
    /// A command failed validation and was not sent
    Rejected {
        origin: Option<CellRef>,
        error: ValidationError,
    },
    /// The command working in this cell was aborted
    Interrupted { origin: Option<CellRef> },
    /// The engine showed its first prompt
    EngineReady { pid: Option<u32> },
    /// Lifecycle and transport messages
    Status { text: String },
    /// A line the engine wrote to stdout or stderr
    Diagnostic {
        stream: DiagnosticStream,
        line: String,
    },
    /// Sampled CPU usage of the engine, in percent
    CpuUsage { percent: f32 },
    /// Supervision stopped; the user has to intervene
    Fatal { message: String },
}

pub struct SessionController {
    config: QueueConfig,
    validator: Validator,
    demux: Demultiplexer,
    queue: EvaluationQueue,
    buffer: RawBuffer,
    state: SchedulerState,
    setup_commands: Vec<String>,
    pending_setup: Vec<String>,
    /// Answers that go out before anything from the queue
    outbox: VecDeque<String>,
    /// The head was working when the engine asked its question
    suspended: bool,
    output_events: usize,
    suppressed: bool,
    history: Vec<String>,
    engine_pid: Option<u32>,
    notifications: Vec<Notification>,
}

impl SessionController {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            config: config.queue.clone(),
            validator: Validator::new(config.validation.clone()),
            demux: Demultiplexer::new(&config.protocol)?,
            queue: EvaluationQueue::new(),
            buffer: RawBuffer::new(),
            state: SchedulerState::WaitingForEngine,
            setup_commands: config.setup_commands.clone(),
            pending_setup: Vec::new(),
            outbox: VecDeque::new(),
            suspended: false,
            output_events: 0,
            suppressed: false,
            history: Vec::new(),
            engine_pid: None,
            notifications: Vec::new(),
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn queue(&self) -> &EvaluationQueue {
        &self.queue
    }

    /// `(queued commands, answers left in the current command)`
    pub fn length(&self) -> (usize, usize) {
        self.queue.length()
    }

    /// Process id announced in the engine's startup banner
    pub fn engine_pid(&self) -> Option<u32> {
        self.engine_pid
    }

    /// Transmitted commands that asked to be recorded
    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn enqueue(&mut self, text: &str, record_history: bool, origin: Option<CellRef>) -> u64 {
        self.enqueue_with_answers(text, Vec::new(), record_history, origin)
    }

    /// Enqueue a command together with answers for the questions it will raise
    pub fn enqueue_with_answers(
        &mut self,
        text: &str,
        answers: Vec<String>,
        record_history: bool,
        origin: Option<CellRef>,
    ) -> u64 {
        let id = self.queue.push(text, record_history, origin, answers);
        debug!(id, queued = self.queue.len(), "command enqueued");
        id
    }

    /// Setup command prefixed to the next transmission
    pub fn add_setup_command(&mut self, command: &str) {
        self.pending_setup.push(command.to_string());
    }

    /// Drop every queued command.
    ///
    /// If the engine is still busy with a command it is left to finish; nothing
    /// new is transmitted until its main prompt arrives.
    pub fn clear(&mut self) {
        let dropped = self.queue.clear();
        self.outbox.clear();
        self.suspended = false;
        if !dropped.is_empty() {
            info!(count = dropped.len(), "evaluation queue cleared");
        }
        if matches!(
            self.state,
            SchedulerState::Working | SchedulerState::WaitingForAnswer
        ) {
            self.state = SchedulerState::WaitingForEngine;
        }
    }

    /// Abort the working command: report its cell as interrupted and clear
    /// the queue. Signalling the engine is the caller's business.
    pub fn abort(&mut self) {
        if self.in_flight() {
            let origin = self.current_origin();
            self.notifications
                .push(Notification::Interrupted { origin });
        }
        self.clear();
    }

    /// A new engine connection was accepted
    pub fn on_connected(&mut self) {
        self.buffer = RawBuffer::new();
        self.state = SchedulerState::WaitingForEngine;
        self.pending_setup = self.setup_commands.clone();
        self.outbox.clear();
        self.suspended = false;
        self.engine_pid = None;
        self.reset_output_count();
    }

    /// The engine connection is gone; nothing in flight survives
    pub fn on_disconnected(&mut self) {
        let dropped = self.queue.clear();
        self.outbox.clear();
        self.suspended = false;
        self.buffer = RawBuffer::new();
        self.state = SchedulerState::WaitingForEngine;
        self.engine_pid = None;
        let text = if dropped.is_empty() {
            "engine connection lost".to_string()
        } else {
            format!(
                "engine connection lost; {} queued command(s) discarded",
                dropped.len()
            )
        };
        warn!("{}", text);
        self.notifications.push(Notification::Status { text });
    }

    /// Feed bytes read from the engine socket
    pub fn on_bytes(&mut self, data: &[u8]) {
        self.buffer.push_bytes(data);
        let events = self.demux.decode_in_place(&mut self.buffer);
        for event in events {
            self.handle_event(event);
        }
    }

    /// Deliver a collaborator's answer to the engine's pending question.
    /// Returns false when no question is pending.
    pub fn answer(&mut self, text: &str) -> bool {
        if self.state != SchedulerState::WaitingForAnswer {
            warn!("answer ignored: the engine did not ask a question");
            return false;
        }
        self.send_answer(text);
        true
    }

    /// Next text to write to the engine, if the scheduler is ready to send
    pub fn poll_transmit(&mut self) -> Option<String> {
        if let Some(answer) = self.outbox.pop_front() {
            return Some(answer);
        }

        while self.state == SchedulerState::Idle {
            let head = self.queue.head()?;
            let text = head.text().to_string();
            let origin = head.origin();
            let record = head.record_history();

            if text.trim().is_empty() {
                debug!("skipping empty command");
                self.notifications.push(Notification::Rejected {
                    origin,
                    error: ValidationError {
                        offset: 0,
                        failure: ValidationFailure::EmptyStatement,
                    },
                });
                self.queue.pop_head();
                continue;
            }

            let analysis = match self.validator.analyze(&text) {
                Ok(analysis) => analysis,
                Err(error) => {
                    warn!(%error, "command rejected before transmission");
                    self.notifications
                        .push(Notification::Rejected { origin, error });
                    if self.config.abort_on_error {
                        self.clear();
                    } else {
                        self.queue.pop_head();
                    }
                    continue;
                }
            };

            let mut wire = String::new();
            for setup in self.pending_setup.drain(..) {
                wire.push_str(setup.trim_end());
                wire.push('\n');
            }
            wire.push_str(text.trim_end());
            if self.config.auto_terminate && analysis.needs_terminator() {
                wire.push(';');
            }
            wire.push('\n');

            if record {
                self.history.push(text);
            }
            self.queue.start_head();
            self.state = SchedulerState::Working;
            self.reset_output_count();
            debug!(len = wire.len(), "transmitting command");
            return Some(wire);
        }
        None
    }

    /// Collected notifications, oldest first
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Queue a notification produced outside the controller so that it is
    /// delivered in order with the controller's own
    pub fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    /// A transmitted command has not been acknowledged yet
    fn in_flight(&self) -> bool {
        self.queue.is_working() || self.suspended
    }

    fn current_origin(&self) -> Option<CellRef> {
        if self.in_flight() {
            self.queue.head().and_then(Command::origin)
        } else {
            None
        }
    }

    fn handle_event(&mut self, event: Event) {
        let origin = self.current_origin();

        if let Event::EngineStarted { pid } = event {
            info!(pid = ?pid, "engine ready");
            self.engine_pid = pid;
            self.notifications.push(Notification::EngineReady { pid });
            return;
        }

        if event.is_main_prompt() {
            if self.in_flight() {
                if let Some(done) = self.queue.pop_head() {
                    debug!(id = done.id(), "command acknowledged");
                }
            }
            self.suspended = false;
            self.state = SchedulerState::Idle;
            self.reset_output_count();
        } else if event.is_question() {
            if self.queue.is_working() {
                self.suspended = true;
                self.queue.suspend();
            }
            self.state = SchedulerState::WaitingForAnswer;
            self.notifications.push(Notification::Event { origin, event });
            let stored = if self.suspended {
                self.queue.take_answer()
            } else {
                None
            };
            if let Some(answer) = stored {
                debug!("answering question from stored answers");
                self.send_answer(&answer);
            }
            return;
        } else if event.is_content() {
            let is_error = event.is_error();
            self.forward_content(origin, event);
            if is_error && self.config.abort_on_error && self.in_flight() {
                info!("engine reported an error; clearing the queue");
                self.clear();
            }
            return;
        }
        self.notifications.push(Notification::Event { origin, event });
    }

    fn forward_content(&mut self, origin: Option<CellRef>, event: Event) {
        if self.output_events < self.config.max_output_events {
            self.output_events += 1;
            self.notifications.push(Notification::Event { origin, event });
        } else if !self.suppressed {
            self.suppressed = true;
            warn!(
                limit = self.config.max_output_events,
                "output limit reached; suppressing further output"
            );
            self.notifications.push(Notification::Event {
                origin,
                event: Event::PlainText {
                    text: format!(
                        "Output suppressed: more than {} output items for this command",
                        self.config.max_output_events
                    ),
                    severity: Severity::Warning,
                },
            });
        }
    }

    fn send_answer(&mut self, text: &str) {
        let mut wire = text.trim_end().to_string();
        let needs_terminator = self
            .validator
            .analyze(text)
            .map(|analysis| analysis.needs_terminator())
            .unwrap_or(false);
        if self.config.auto_terminate && needs_terminator {
            wire.push(';');
        }
        wire.push('\n');
        self.outbox.push_back(wire);

        self.state = if self.suspended {
            self.suspended = false;
            self.queue.resume();
            SchedulerState::Working
        } else {
            SchedulerState::WaitingForEngine
        };
    }

    fn reset_output_count(&mut self) {
        self.output_events = 0;
        self.suppressed = false;
    }
}
