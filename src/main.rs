use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use cas_session::config::Config;
use cas_session::controller::Notification;
use cas_session::error::SessionError;
use cas_session::events::{coalesce_text, Event, PromptKind, Severity};
use cas_session::queue::CellRef;
use cas_session::session::{Session, SessionHandle};
use cas_session::supervisor::EngineLauncher;

/// cas-session: evaluate commands in a supervised computer-algebra engine
#[derive(Parser, Debug)]
#[command(name = "cas-session")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Commands to evaluate; without any, commands are read from stdin
    commands: Vec<String>,

    /// Engine executable (default: "maxima")
    #[arg(short = 'e', long = "engine")]
    engine: Option<String>,

    /// First port to listen on for the engine connection (default: 4010)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Config file (TOML format)
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Script file with one command per line
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// Maximum output items per command before output is suppressed
    #[arg(long = "max-output")]
    max_output: Option<usize>,

    /// Clear the remaining queue when the engine reports an error
    #[arg(long = "abort-on-error")]
    abort_on_error: bool,

    /// Print notifications as JSON lines
    #[arg(long = "json")]
    json: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("cas_session=debug,info")
    } else {
        EnvFilter::new("cas_session=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match cli.config {
        Some(ref path) => Config::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => match Config::default_path().filter(|path| path.exists()) {
            Some(path) => {
                debug!("using config file {}", path.display());
                Config::from_file(&path)
                    .with_context(|| format!("loading config {}", path.display()))?
            }
            None => Config::default(),
        },
    };

    config.merge_cli_args(
        cli.engine.clone(),
        cli.port,
        cli.max_output,
        cli.abort_on_error,
    );
    Ok(config)
}

fn load_commands(cli: &Cli) -> anyhow::Result<Vec<String>> {
    let mut commands = cli.commands.clone();
    if let Some(ref file) = cli.file {
        let script = std::fs::read_to_string(file)
            .with_context(|| format!("reading script {}", file.display()))?;
        commands.extend(
            script
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        );
    }
    Ok(commands)
}

/// Terminal rendering of notifications
struct Printer {
    json: bool,
    verbose: bool,
    events: Vec<Event>,
}

impl Printer {
    fn new(json: bool, verbose: bool) -> Self {
        Self {
            json,
            verbose,
            events: Vec::new(),
        }
    }

    fn print(&mut self, notification: &Notification) {
        if self.json {
            match serde_json::to_string(notification) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("could not serialize notification: {}", e),
            }
            return;
        }

        match notification {
            Notification::Event { event, .. } => {
                self.events.push(event.clone());
                return;
            }
            Notification::Rejected { error, .. } => {
                self.flush();
                println!("{} {}", "REJECTED:".red().bold(), error);
            }
            Notification::Interrupted { .. } => {
                self.flush();
                println!("{}", "INTERRUPTED".yellow().bold());
            }
            Notification::EngineReady { pid } => match pid {
                Some(pid) => info!("engine ready (pid {})", pid),
                None => info!("engine ready"),
            },
            Notification::Status { text } => info!("{}", text),
            Notification::Diagnostic { stream, line } => {
                if self.verbose {
                    self.flush();
                    eprintln!("{}", format!("[{:?}] {}", stream, line).dimmed());
                }
            }
            Notification::CpuUsage { percent } => debug!("engine cpu: {:.1}%", percent),
            Notification::Fatal { message } => {
                self.flush();
                eprintln!("{} {}", "FATAL:".red().bold(), message);
            }
        }
    }

    /// Print buffered events, merging consecutive text lines
    fn flush(&mut self) {
        for event in coalesce_text(std::mem::take(&mut self.events)) {
            match event {
                Event::MathOutput { text, label } => match label {
                    Some(label) => println!("{} {}", label.cyan(), text),
                    None => println!("{}", text),
                },
                Event::PlainText { text, severity } => match severity {
                    Severity::Error => println!("{}", text.red()),
                    Severity::Warning => println!("{}", text.yellow()),
                    Severity::Default => println!("{}", text),
                },
                Event::Prompt {
                    text,
                    kind: PromptKind::Question,
                } => println!("{}", text.yellow().bold()),
                Event::Prompt { text, .. } => debug!("prompt: {}", text.trim()),
                Event::StatusBarText { text } => println!("{}", text.dimmed()),
                Event::SymbolAnnouncement { symbols } => debug!("symbols: {:?}", symbols),
                Event::VariableAnnouncement { name, value } => {
                    debug!("variable {} = {}", name, value)
                }
                Event::EngineStarted { .. } => {}
            }
        }
    }
}

/// What a batch of notifications means for the terminal loop
#[derive(Debug, Default)]
struct BatchOutcome {
    prompt_or_rejection: bool,
    question: bool,
    fatal: bool,
}

fn inspect(batch: &[Notification]) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for notification in batch {
        match notification {
            Notification::Event { event, .. } if event.is_main_prompt() => {
                outcome.prompt_or_rejection = true;
                outcome.question = false;
            }
            Notification::Event { event, .. } if event.is_question() => outcome.question = true,
            Notification::Rejected { .. } | Notification::Interrupted { .. } => {
                outcome.prompt_or_rejection = true;
            }
            Notification::Fatal { .. } => outcome.fatal = true,
            _ => {}
        }
    }
    outcome
}

/// Drive the session from the terminal until the input is exhausted and the
/// queue has drained. Returns false if supervision gave up.
async fn run(
    handle: SessionHandle,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    commands: Vec<String>,
    printer: &mut Printer,
) -> Result<bool, SessionError> {
    let batch = !commands.is_empty();
    for (cell, command) in commands.iter().enumerate() {
        handle.enqueue(command, true, Some(CellRef(cell as u64)))?;
    }
    let mut next_cell = commands.len() as u64;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = !batch;
    let mut awaiting_answer = false;
    let mut interrupts = 0u32;

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Some(first) = notification else {
                    printer.flush();
                    return Err(SessionError::SessionClosed);
                };
                let mut received = vec![first];
                while let Ok(more) = notifications.try_recv() {
                    received.push(more);
                }
                for notification in &received {
                    printer.print(notification);
                }
                printer.flush();

                let outcome = inspect(&received);
                if outcome.fatal {
                    return Ok(false);
                }
                if outcome.prompt_or_rejection {
                    interrupts = 0;
                    awaiting_answer = false;
                }
                if outcome.question {
                    awaiting_answer = true;
                }
                if outcome.prompt_or_rejection
                    && !input_open
                    && handle.length().await? == (0, 0)
                {
                    return Ok(true);
                }
            }
            line = stdin.next_line(), if input_open => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if awaiting_answer {
                            awaiting_answer = false;
                            handle.answer(line)?;
                        } else {
                            handle.enqueue(line, true, Some(CellRef(next_cell)))?;
                            next_cell += 1;
                        }
                    }
                    Ok(None) => {
                        input_open = false;
                        if handle.length().await? == (0, 0) {
                            return Ok(true);
                        }
                    }
                    Err(e) => {
                        warn!("stdin read error: {}", e);
                        input_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    info!("Received Ctrl+C, interrupting the running command");
                    handle.interrupt()?;
                } else {
                    info!("Received Ctrl+C again, aborting");
                    handle.abort()?;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };
    let commands = match load_commands(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let launcher = EngineLauncher::new(Arc::new(config.clone()));
    let (session, handle, notifications) = match Session::new(config, launcher) {
        Ok(parts) => parts,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let session_task = tokio::spawn(session.run());

    let mut printer = Printer::new(cli.json, cli.verbose);
    let outcome = run(handle.clone(), notifications, commands, &mut printer).await;
    let _ = handle.shutdown();
    drop(handle);

    let session_result = match session_task.await {
        Ok(result) => result,
        Err(e) => {
            error!("session task failed: {}", e);
            std::process::exit(1);
        }
    };

    match (outcome, session_result) {
        (_, Err(e)) => {
            error!("{}", e);
            std::process::exit(1);
        }
        (Ok(true), Ok(())) | (Err(SessionError::SessionClosed), Ok(())) => std::process::exit(0),
        (Ok(false), Ok(())) => std::process::exit(1),
        (Err(e), Ok(())) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
