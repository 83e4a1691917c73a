//! Full sessions over a loopback socket against a scripted stand-in engine.
#![cfg(unix)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

use cas_session::config::Config;
use cas_session::controller::Notification;
use cas_session::error::Result;
use cas_session::events::Event;
use cas_session::interrupt::InterruptBackend;
use cas_session::process::EngineProcess;
use cas_session::queue::CellRef;
use cas_session::session::Session;
use cas_session::supervisor::Launcher;

fn test_config() -> Config {
    let mut config = Config::default();
    config.network.port = 0;
    config.supervision.poll_interval_ms = 10;
    config.supervision.shutdown_grace_ms = 200;
    config
}

/// Connects back to the session and answers commands the way the engine
/// would, splitting replies across writes
async fn scripted_engine(port: u16, banner: String) {
    let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await else {
        return;
    };
    let (read, mut write) = stream.into_split();
    let greeting = format!("{}\n<PROMPT-P/>(%i1) <PROMPT-S/>", banner);
    if write.write_all(greeting.as_bytes()).await.is_err() {
        return;
    }

    let mut lines = BufReader::new(read).lines();
    let mut n = 1;
    while let Ok(Some(line)) = lines.next_line().await {
        let value = match line.as_str() {
            "quit();" => break,
            "slow;" => continue,
            "1+1;" => "2".to_string(),
            other => other.trim_end_matches(';').to_string(),
        };
        let _ = write.write_all(b"<mth>").await;
        let _ = write.flush().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reply = format!(
            "<lbl>(%o{})</lbl>{}</mth><PROMPT-P/>(%i{}) <PROMPT-S/>",
            n,
            value,
            n + 1
        );
        let _ = write.write_all(reply.as_bytes()).await;
        n += 1;
    }
}

struct ScriptedLauncher {
    launches: Arc<AtomicU32>,
    banner: String,
}

impl ScriptedLauncher {
    fn new(launches: &Arc<AtomicU32>) -> Self {
        Self::with_banner(launches, "Scripted engine")
    }

    fn with_banner(launches: &Arc<AtomicU32>, banner: &str) -> Self {
        Self {
            launches: Arc::clone(launches),
            banner: banner.to_string(),
        }
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&mut self, port: u16) -> Result<EngineProcess> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let process = EngineProcess::spawn("sleep", &["30".to_string()], &HashMap::new())?;
        tokio::spawn(scripted_engine(port, self.banner.clone()));
        Ok(process)
    }
}

/// An engine that dies right after starting
struct CrashingLauncher {
    launches: Arc<AtomicU32>,
}

#[async_trait]
impl Launcher for CrashingLauncher {
    async fn launch(&mut self, _port: u16) -> Result<EngineProcess> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        EngineProcess::spawn(
            "sh",
            &["-c".to_string(), "exit 3".to_string()],
            &HashMap::new(),
        )
    }
}

#[derive(Default)]
struct RecordingInterrupt {
    interrupted: Arc<Mutex<Vec<u32>>>,
    terminated: Arc<Mutex<Vec<u32>>>,
}

impl InterruptBackend for RecordingInterrupt {
    fn interrupt(&mut self, pid: u32) -> Result<()> {
        self.interrupted.lock().unwrap().push(pid);
        Ok(())
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        self.terminated.lock().unwrap().push(pid);
        Ok(())
    }
}

/// Pid of a process that has already exited and been reaped
fn vanished_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

async fn collect_until<F>(rx: &mut UnboundedReceiver<Notification>, done: F) -> Vec<Notification>
where
    F: Fn(&Notification) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let notification = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("session ended early");
        let finished = done(&notification);
        seen.push(notification);
        if finished {
            return seen;
        }
    }
}

fn is_main_prompt(notification: &Notification) -> bool {
    matches!(notification, Notification::Event { event, .. } if event.is_main_prompt())
}

fn is_fatal(notification: &Notification) -> bool {
    matches!(notification, Notification::Fatal { .. })
}

fn gave_up(notifications: &[Notification]) -> bool {
    match notifications.last() {
        Some(Notification::Fatal { message }) => message.contains("giving up"),
        _ => false,
    }
}

#[tokio::test]
async fn evaluates_commands_over_loopback() {
    let launches = Arc::new(AtomicU32::new(0));
    let launcher = ScriptedLauncher::new(&launches);
    let (session, handle, mut rx) = Session::new(test_config(), launcher).unwrap();
    let task = tokio::spawn(session.run());

    let startup = collect_until(&mut rx, is_main_prompt).await;
    assert!(startup.contains(&Notification::EngineReady { pid: None }));

    handle.enqueue("1+1", true, Some(CellRef(1))).unwrap();
    handle.enqueue("x;", false, Some(CellRef(2))).unwrap();

    let first = collect_until(&mut rx, is_main_prompt).await;
    assert!(first.contains(&Notification::Event {
        origin: Some(CellRef(1)),
        event: Event::MathOutput {
            text: "2".to_string(),
            label: Some("(%o1)".to_string())
        }
    }));
    let second = collect_until(&mut rx, is_main_prompt).await;
    assert!(second.contains(&Notification::Event {
        origin: Some(CellRef(2)),
        event: Event::MathOutput {
            text: "x".to_string(),
            label: Some("(%o2)".to_string())
        }
    }));

    assert_eq!(handle.length().await.unwrap(), (0, 0));
    assert_eq!(handle.history().await.unwrap(), vec!["1+1".to_string()]);

    handle.shutdown().unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn interrupt_and_abort_target_running_command() {
    let launcher = ScriptedLauncher::new(&Arc::new(AtomicU32::new(0)));
    let recorder = RecordingInterrupt::default();
    let signalled = Arc::clone(&recorder.interrupted);
    let (session, handle, mut rx) = Session::new(test_config(), launcher).unwrap();
    let session = session.with_interrupter(Box::new(recorder));
    let task = tokio::spawn(session.run());

    collect_until(&mut rx, is_main_prompt).await;

    // Nothing is running yet
    handle.interrupt().unwrap();
    assert_eq!(handle.length().await.unwrap(), (0, 0));
    assert!(signalled.lock().unwrap().is_empty());

    handle.enqueue("slow;", true, Some(CellRef(7))).unwrap();
    handle.enqueue("after;", true, Some(CellRef(8))).unwrap();
    assert_eq!(handle.length().await.unwrap(), (2, 0));

    handle.interrupt().unwrap();
    assert_eq!(handle.length().await.unwrap(), (2, 0));
    assert_eq!(signalled.lock().unwrap().len(), 1);

    handle.abort().unwrap();
    let aborted = collect_until(&mut rx, |n| matches!(n, Notification::Interrupted { .. })).await;
    assert_eq!(
        aborted.last(),
        Some(&Notification::Interrupted {
            origin: Some(CellRef(7))
        })
    );
    assert_eq!(handle.length().await.unwrap(), (0, 0));
    assert_eq!(signalled.lock().unwrap().len(), 2);

    handle.shutdown().unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn repeated_crashes_stop_automatic_restarts() {
    let launches = Arc::new(AtomicU32::new(0));
    let launcher = CrashingLauncher {
        launches: Arc::clone(&launches),
    };
    let (session, handle, mut rx) = Session::new(test_config(), launcher).unwrap();
    let task = tokio::spawn(session.run());

    let seen = collect_until(&mut rx, is_fatal).await;
    assert!(gave_up(&seen));
    assert_eq!(launches.load(Ordering::SeqCst), 3);

    // Supervision stays down until asked
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(launches.load(Ordering::SeqCst), 3);

    handle.restart().unwrap();
    collect_until(&mut rx, is_fatal).await;
    assert_eq!(launches.load(Ordering::SeqCst), 6);

    handle.shutdown().unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn vanished_engine_pid_counts_as_crash() {
    // The child stays up, but the pid the engine announced is gone, as when
    // the runtime never reports the engine's death
    let launches = Arc::new(AtomicU32::new(0));
    let banner = format!("Scripted engine\npid={}", vanished_pid());
    let launcher = ScriptedLauncher::with_banner(&launches, &banner);
    let (session, handle, mut rx) = Session::new(test_config(), launcher).unwrap();
    let task = tokio::spawn(session.run());

    let seen = collect_until(&mut rx, is_fatal).await;
    assert!(gave_up(&seen));
    // Every start reached a prompt before dying: 2-1+2-1+2-1+2 exceeds 4
    // on the fourth crash
    assert_eq!(launches.load(Ordering::SeqCst), 4);
    let ready = seen
        .iter()
        .filter(|n| matches!(n, Notification::EngineReady { pid: Some(_) }))
        .count();
    assert_eq!(ready, 4);

    handle.shutdown().unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_terminates_announced_engine_pid() {
    let mut engine = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let engine_pid = engine.id();

    let launches = Arc::new(AtomicU32::new(0));
    let banner = format!("Scripted engine\npid={}", engine_pid);
    let launcher = ScriptedLauncher::with_banner(&launches, &banner);
    let recorder = RecordingInterrupt::default();
    let terminated = Arc::clone(&recorder.terminated);
    let (session, handle, mut rx) = Session::new(test_config(), launcher).unwrap();
    let session = session.with_interrupter(Box::new(recorder));
    let task = tokio::spawn(session.run());

    let startup = collect_until(&mut rx, is_main_prompt).await;
    assert!(startup.contains(&Notification::EngineReady {
        pid: Some(engine_pid)
    }));

    // The launched child ignores the quit command, so shutdown has to force it
    handle.shutdown().unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(*terminated.lock().unwrap(), vec![engine_pid]);

    engine.kill().unwrap();
    engine.wait().unwrap();
}
