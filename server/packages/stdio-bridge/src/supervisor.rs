use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::error::BridgeError;
use crate::framing::{FramedReader, LineDecoder};
use crate::launch::LaunchSpec;

const STDERR_TAIL_LINES: usize = 20;
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Everything the supervisor reports about the processes it owns.
#[derive(Debug)]
pub enum ProcessEvent {
    Message { generation: u64, payload: Value },
    Exited { generation: u64, exit: ExitInfo },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stderr_tail: Vec<String>,
}

impl ExitInfo {
    pub fn into_error(self) -> BridgeError {
        BridgeError::ProcessExited {
            code: self.code,
            signal: self.signal,
            stderr: if self.stderr_tail.is_empty() {
                None
            } else {
                Some(self.stderr_tail.join("\n"))
            },
        }
    }
}

/// One spawned engine process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    generation: u64,
    stdin: Mutex<ChildStdin>,
    alive: AtomicBool,
    kill: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<Option<ExitInfo>>,
    spawned_at: Instant,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Exclusive access to the engine's stdin. Holding the writer is the only
    /// way to put bytes on the pipe, so frames never interleave.
    pub async fn writer(&self) -> Result<LineWriter<'_>, BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::NotRunning);
        }
        Ok(LineWriter {
            stdin: self.stdin.lock().await,
            handle: self,
        })
    }

    /// Requests a hard kill. Returns false if the process was already gone or
    /// a kill was already requested.
    pub fn kill(&self) -> bool {
        let sender = match self.kill.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        sender.is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Waits for the process to exit and returns how it ended.
    pub async fn wait_exit(&self) -> Option<ExitInfo> {
        let mut exited = self.exited.clone();
        let info = match exited.wait_for(Option::is_some).await {
            Ok(info) => info.clone(),
            Err(_) => None,
        };
        info
    }
}

pub struct LineWriter<'a> {
    stdin: MutexGuard<'a, ChildStdin>,
    handle: &'a ProcessHandle,
}

impl LineWriter<'_> {
    /// Writes one already-terminated frame and flushes it.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), BridgeError> {
        if !self.handle.is_alive() {
            return Err(BridgeError::NotRunning);
        }
        self.stdin.write_all(frame).await.map_err(|err| {
            tracing::error!(
                generation = self.handle.generation,
                error = %err,
                "stdin: write_all failed"
            );
            BridgeError::write(err)
        })?;
        self.stdin.flush().await.map_err(|err| {
            tracing::error!(
                generation = self.handle.generation,
                error = %err,
                "stdin: flush failed"
            );
            BridgeError::write(err)
        })
    }
}

/// Owns the engine process lifecycle: at most one live process, spawned on
/// demand, replaced on the next call after it exits.
#[derive(Debug)]
pub struct ProcessSupervisor {
    launch: LaunchSpec,
    max_line_bytes: usize,
    slot: Mutex<Option<Arc<ProcessHandle>>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl ProcessSupervisor {
    pub fn new(
        launch: LaunchSpec,
        max_line_bytes: usize,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Self {
        Self {
            launch,
            max_line_bytes,
            slot: Mutex::new(None),
            events,
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    /// Number of processes spawned so far.
    pub fn spawn_count(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns the live process, spawning one if there is none. The slot lock
    /// is held across the spawn so racing callers share one process.
    pub async fn ensure_running(&self) -> Result<Arc<ProcessHandle>, BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Shutdown);
        }

        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.as_ref() {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
            tracing::debug!(
                generation = handle.generation,
                "supervisor: previous engine process exited, respawning"
            );
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Shutdown);
        }

        let handle = self.spawn()?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// The live process, if any, without spawning.
    pub async fn current(&self) -> Option<Arc<ProcessHandle>> {
        self.slot
            .lock()
            .await
            .as_ref()
            .filter(|handle| handle.is_alive())
            .cloned()
    }

    /// Kills the live process; the next `ensure_running` spawns a fresh one.
    pub async fn kill_current(&self) -> Option<ExitInfo> {
        let handle = self.slot.lock().await.take()?;
        if !handle.kill() {
            return None;
        }
        tokio::time::timeout(SHUTDOWN_WAIT, handle.wait_exit())
            .await
            .ok()
            .flatten()
    }

    /// Kills the live process and refuses to spawn again. Returns how the
    /// process ended if one was running.
    pub async fn shutdown(&self) -> Option<ExitInfo> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let handle = self.slot.lock().await.take()?;
        tracing::info!(
            pid = handle.pid,
            generation = handle.generation,
            age_ms = handle.uptime().as_millis() as u64,
            "shutting down engine process"
        );
        handle.kill();
        match tokio::time::timeout(SHUTDOWN_WAIT, handle.wait_exit()).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(
                    pid = handle.pid,
                    "engine process did not exit within shutdown window"
                );
                None
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn spawn(&self) -> Result<Arc<ProcessHandle>, BridgeError> {
        let spawn_start = Instant::now();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut command = Command::new(&self.launch.program);
        command
            .args(&self.launch.args)
            .envs(&self.launch.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.launch.cwd {
            command.current_dir(cwd);
        }

        tracing::info!(
            program = ?self.launch.program,
            args = ?self.launch.args,
            generation = generation,
            "spawning engine process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(
                program = ?self.launch.program,
                args = ?self.launch.args,
                error = %err,
                "failed to spawn engine process"
            );
            BridgeError::Spawn {
                command: self.launch.display(),
                source: Arc::new(err),
            }
        })?;

        let stdin = child.stdin.take().ok_or(BridgeError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(BridgeError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(BridgeError::MissingPipe("stderr"))?;

        let pid = child.id();
        tracing::info!(
            pid = pid,
            generation = generation,
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "engine process spawned"
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = Arc::new(ProcessHandle {
            pid,
            generation,
            stdin: Mutex::new(stdin),
            alive: AtomicBool::new(true),
            kill: std::sync::Mutex::new(Some(kill_tx)),
            exited: exit_rx,
            spawned_at: spawn_start,
        });

        let stderr_tail = Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(
            STDERR_TAIL_LINES,
        )));
        let stdout_task = spawn_stdout_loop(
            stdout,
            generation,
            self.max_line_bytes,
            self.events.clone(),
        );
        let stderr_task = spawn_stderr_loop(stderr, generation, stderr_tail.clone());
        spawn_exit_watcher(ExitWatch {
            child,
            kill_rx,
            exit_tx,
            handle: handle.clone(),
            stdout_task,
            stderr_task,
            stderr_tail,
            events: self.events.clone(),
        });

        Ok(handle)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.try_lock() {
            if let Some(handle) = slot.take() {
                handle.kill();
            }
        }
    }
}

fn spawn_stdout_loop(
    stdout: ChildStdout,
    generation: u64,
    max_line_bytes: usize,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader =
            FramedReader::with_decoder(stdout, LineDecoder::with_max_line_bytes(max_line_bytes));
        let mut message_count: u64 = 0;

        loop {
            match reader.next_message().await {
                Ok(Some(payload)) => {
                    message_count += 1;
                    if events
                        .send(ProcessEvent::Message {
                            generation,
                            payload,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(generation = generation, error = %err, "engine stdout: read failed");
                    break;
                }
            }
        }

        tracing::debug!(
            generation = generation,
            total_messages = message_count,
            "engine stdout: stream ended"
        );
    })
}

fn spawn_stderr_loop(
    stderr: ChildStderr,
    generation: u64,
    tail: Arc<std::sync::Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut line_count: u64 = 0;

        while let Ok(Some(line)) = lines.next_line().await {
            line_count += 1;
            tracing::info!(
                generation = generation,
                line_number = line_count,
                "engine stderr: {}",
                line
            );
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }

        tracing::debug!(
            generation = generation,
            total_lines = line_count,
            "engine stderr: stream ended"
        );
    })
}

struct ExitWatch {
    child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    handle: Arc<ProcessHandle>,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    stderr_tail: Arc<std::sync::Mutex<VecDeque<String>>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

fn spawn_exit_watcher(watch: ExitWatch) {
    let ExitWatch {
        mut child,
        kill_rx,
        exit_tx,
        handle,
        mut stdout_task,
        mut stderr_task,
        stderr_tail,
        events,
    } = watch;

    tokio::spawn(async move {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill_rx => None,
        };
        let killed = exited.is_none();
        let status = match exited {
            Some(status) => status,
            None => {
                if let Err(err) = child.start_kill() {
                    tracing::debug!(error = %err, "engine process: kill failed");
                }
                child.wait().await
            }
        };

        handle.alive.store(false, Ordering::SeqCst);
        if let Ok(mut kill) = handle.kill.lock() {
            kill.take();
        }

        // Lines written before exit must reach the bridge before the exit event.
        if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, &mut stdout_task)
            .await
            .is_err()
        {
            tracing::warn!(
                generation = handle.generation,
                "engine stdout still open after exit, abandoning reader"
            );
            stdout_task.abort();
        }
        if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, &mut stderr_task)
            .await
            .is_err()
        {
            stderr_task.abort();
        }

        let stderr_tail = stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        let exit = match status {
            Ok(status) => ExitInfo {
                code: status.code(),
                signal: exit_signal(&status),
                stderr_tail,
            },
            Err(err) => {
                tracing::error!(
                    generation = handle.generation,
                    error = %err,
                    "engine process: failed to get exit status"
                );
                ExitInfo {
                    code: None,
                    signal: None,
                    stderr_tail,
                }
            }
        };

        tracing::warn!(
            pid = handle.pid,
            generation = handle.generation,
            code = exit.code,
            signal = exit.signal,
            killed = killed,
            age_ms = handle.uptime().as_millis() as u64,
            "engine process exited"
        );

        exit_tx.send_replace(Some(exit.clone()));
        let _ = events.send(ProcessEvent::Exited {
            generation: handle.generation,
            exit,
        });
    });
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> LaunchSpec {
        LaunchSpec::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn concurrent_ensure_running_spawns_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(ProcessSupervisor::new(shell("cat"), 1024, tx));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let supervisor = supervisor.clone();
            tasks.push(tokio::spawn(async move {
                supervisor.ensure_running().await.map(|h| h.generation())
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 1);
        }
        assert_eq!(supervisor.spawn_count(), 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn exit_is_reported_after_final_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(
            shell("echo '{\"method\":\"bye\"}'; echo oops >&2; exit 3"),
            1024,
            tx,
        );
        let handle = supervisor.ensure_running().await.unwrap();

        match rx.recv().await.unwrap() {
            ProcessEvent::Message { generation, payload } => {
                assert_eq!(generation, 1);
                assert_eq!(payload["method"], "bye");
            }
            other => panic!("expected message, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ProcessEvent::Exited { generation, exit } => {
                assert_eq!(generation, 1);
                assert_eq!(exit.code, Some(3));
                assert_eq!(exit.stderr_tail, vec!["oops".to_string()]);
            }
            other => panic!("expected exit, got {other:?}"),
        }

        assert!(!handle.is_alive());
        assert!(matches!(
            handle.writer().await.err(),
            Some(BridgeError::NotRunning)
        ));

        let next = supervisor.ensure_running().await.unwrap();
        assert_eq!(next.generation(), 2);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn kill_current_reports_signal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(shell("sleep 30"), 1024, tx);
        supervisor.ensure_running().await.unwrap();

        let exit = supervisor.kill_current().await.expect("exit info");
        assert_eq!(exit.code, None);
        assert!(exit.signal.is_some());
        assert!(supervisor.current().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_refuses_further_spawns() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(shell("cat"), 1024, tx);
        supervisor.ensure_running().await.unwrap();
        supervisor.shutdown().await;
        assert!(matches!(
            supervisor.ensure_running().await,
            Err(BridgeError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(
            LaunchSpec::new("/nonexistent/engine-binary"),
            1024,
            tx,
        );
        assert!(matches!(
            supervisor.ensure_running().await,
            Err(BridgeError::Spawn { .. })
        ));
    }
}
