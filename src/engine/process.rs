use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::mem::take;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread::{sleep, Builder};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use lazy_static::lazy_static;
use log::{debug, info, log_enabled, Level};

use crate::engine::{EngineError, StreamKind};

/// How long a child gets to exit on its own before it is killed.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_POLL_STEP: Duration = Duration::from_millis(100);

/// Stand-in for an unbounded wait. `Duration::MAX` would overflow the
/// deadline arithmetic inside the channel select.
const FOREVER: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// One complete (or, on timeout, partial) line received from an engine.
#[derive(Debug, Clone)]
pub struct Line {
    pub text: String,
    pub stream: StreamKind,
    pub received: DateTime<Local>,
    /// Set when the line was flushed on timeout without a terminating LF.
    pub partial: bool,
}

#[derive(Debug)]
pub enum StderrMode {
    Discard,
    /// Multiplex stderr lines into `read_output`, tagged with their stream.
    Pipe,
    ToFile(PathBuf),
}

enum StreamEvent {
    Data(StreamKind, Vec<u8>),
    Closed(StreamKind),
    Failed(StreamKind, std::io::Error),
}

/// Splits a byte stream at LF boundaries, keeping the trailing partial line
/// across reads so it can be flushed when a deadline expires.
#[derive(Debug, Default)]
struct LineSplitter {
    complete: VecDeque<String>,
    partial: Vec<u8>,
}

impl LineSplitter {
    fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                if !self.partial.is_empty() {
                    let raw = take(&mut self.partial);
                    let mut text = String::from_utf8_lossy(&raw).into_owned();
                    if text.ends_with('\r') {
                        text.pop();
                    }
                    // empty lines carry no protocol meaning
                    if !text.is_empty() {
                        self.complete.push_back(text);
                    }
                }
            } else {
                self.partial.push(b);
            }
        }
    }

    fn pop(&mut self) -> Option<String> {
        self.complete.pop_front()
    }

    fn take_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let raw = take(&mut self.partial);
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

/// An entry in the process-wide registry of running engines. The registry
/// exists so that a fatal signal or an exit path can wake every in-flight
/// `read_output` and, as a last resort, kill anything still running.
#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: u32,
    interrupt: Sender<()>,
}

lazy_static! {
    static ref PROCESS_REGISTRY: Mutex<Vec<ProcessInfo>> = Mutex::new(Vec::new());
}

fn register(pid: u32, interrupt: Sender<()>) {
    PROCESS_REGISTRY.lock().unwrap().push(ProcessInfo { pid, interrupt });
}

fn deregister(pid: u32) {
    PROCESS_REGISTRY.lock().unwrap().retain(|p| p.pid != pid);
}

pub fn registered_processes() -> usize {
    PROCESS_REGISTRY.lock().unwrap().len()
}

pub fn registry_contains(pid: u32) -> bool {
    PROCESS_REGISTRY.lock().unwrap().iter().any(|p| p.pid == pid)
}

/// Wakes every blocked `read_output` in the process. Used to propagate
/// cancellation; the processes themselves keep running.
pub fn interrupt_all() {
    for p in PROCESS_REGISTRY.lock().unwrap().iter() {
        _ = p.interrupt.send(());
    }
}

/// Drains the registry and kills whatever is still alive. Never expected to
/// find anything on a clean run; called from the exit path after the workers
/// have shut their engines down.
pub fn kill_remaining() {
    let drained: Vec<ProcessInfo> = take(&mut *PROCESS_REGISTRY.lock().unwrap());
    for p in &drained {
        _ = p.interrupt.send(());
    }
    #[cfg(unix)]
    for p in &drained {
        info!("killing orphaned engine process {}", p.pid);
        // SAFETY: sending SIGKILL to a pid cannot cause memory unsafety.
        unsafe {
            libc::kill(p.pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    if !drained.is_empty() {
        info!("{} engine process(es) were still registered at exit", drained.len());
    }
}

/// Owns one engine child process, its pipes and its interrupt channel, and
/// provides line-oriented reads with deadline semantics on top of them.
///
/// The blocking `poll(2)` multiplex of classical tournament managers maps to
/// two reader threads forwarding raw chunks over a channel, plus a wakeable
/// interrupt channel; `read_output` selects over both under a deadline and
/// owns the partial-line buffers so it can flush them when time runs out.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    stdin: ChildStdin,
    events: Receiver<StreamEvent>,
    interrupt: Receiver<()>,
    interrupt_tx: Sender<()>,
    out_lines: LineSplitter,
    err_lines: LineSplitter,
    exit_status: Option<ExitStatus>,
    log_name: String,
    terminated: bool,
}

impl ProcessHandle {
    pub fn spawn(
        working_dir: Option<&Path>,
        command: &str,
        args: &[String],
        log_name: &str,
        stderr: StderrMode,
    ) -> Result<ProcessHandle, EngineError> {
        let mut cmd = Command::new(command);
        cmd.args(args).stdin(Stdio::piped()).stdout(Stdio::piped());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        let pipe_stderr = matches!(stderr, StderrMode::Pipe);
        match stderr {
            StderrMode::Discard => cmd.stderr(Stdio::null()),
            StderrMode::Pipe => cmd.stderr(Stdio::piped()),
            StderrMode::ToFile(path) => {
                let file = File::create(&path).map_err(|err| {
                    EngineError::SpawnFailed(format!(
                        "couldn't create stderr file '{}': {err}",
                        path.display()
                    ))
                })?;
                cmd.stderr(Stdio::from(file))
            }
        };

        let mut child = cmd
            .spawn()
            .map_err(|err| EngineError::SpawnFailed(format!("'{command}': {err}")))?;

        // `take` cannot fail: both pipes were requested above
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        let (tx, events) = unbounded();
        spawn_reader(stdout, StreamKind::Stdout, tx.clone(), log_name);
        if pipe_stderr {
            let child_stderr = child.stderr.take().expect("stderr was piped");
            spawn_reader(child_stderr, StreamKind::Stderr, tx, log_name);
        }

        let (interrupt_tx, interrupt) = unbounded();
        register(child.id(), interrupt_tx.clone());
        debug!("started engine process '{log_name}' with pid {}", child.id());

        Ok(ProcessHandle {
            child,
            stdin,
            events,
            interrupt,
            interrupt_tx,
            out_lines: LineSplitter::default(),
            err_lines: LineSplitter::default(),
            exit_status: None,
            log_name: log_name.to_string(),
            terminated: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// A clone of the writable interrupt end. Signalling it wakes any
    /// concurrent or future `read_output` immediately.
    pub fn interrupt_handle(&self) -> Sender<()> {
        self.interrupt_tx.clone()
    }

    /// Non-blocking liveness check, caching the exit status once observed.
    pub fn alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Writes one line to the engine's stdin, appending the LF if missing.
    pub fn write_input(&mut self, input: &str) -> Result<(), EngineError> {
        if !self.alive() {
            return Err(EngineError::NotAlive);
        }
        if log_enabled!(Level::Debug) {
            debug!("> {} '{}'", self.log_name, input.trim_end());
        }
        if input.ends_with('\n') {
            self.stdin.write_all(input.as_bytes())?;
        } else {
            writeln!(self.stdin, "{input}")?;
        }
        self.stdin.flush()?;
        Ok(())
    }

    /// Reads lines from the child until the latest stdout line starts with
    /// `sentinel`, the deadline expires, the interrupt fires, or the child
    /// hangs up. Lines (including stderr lines when piped) are appended to
    /// `lines` in arrival order; empty lines are dropped. `None` waits
    /// forever, `Some(Duration::ZERO)` times out immediately, flushing any
    /// buffered partial line as a final synthetic entry.
    pub fn read_output(
        &mut self,
        lines: &mut Vec<Line>,
        sentinel: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<(), EngineError> {
        let deadline_at = deadline.map(|d| Instant::now() + d);
        loop {
            // lines can be left queued from the read that hit the previous sentinel
            if self.drain_queued(lines, sentinel) {
                return Ok(());
            }

            let timeout = match deadline_at {
                None => FOREVER,
                Some(at) => {
                    let left = at.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        self.flush_partials(lines);
                        return Err(EngineError::Timeout);
                    }
                    left
                }
            };

            // the select only picks what happened; processing runs after the
            // channel borrows are released again
            let event = select! {
                recv(self.events) -> event => Some(event),
                recv(self.interrupt) -> _ => return Err(EngineError::Interrupted),
                default(timeout) => None,
            };
            match event {
                Some(Ok(StreamEvent::Data(stream, bytes))) => self.splitter(stream).feed(&bytes),
                Some(Ok(StreamEvent::Closed(stream))) | Some(Ok(StreamEvent::Failed(stream, _))) => {
                    self.flush_partials(lines);
                    return Err(EngineError::Disconnected(stream));
                }
                // both reader threads are gone, which means both pipes closed
                Some(Err(_)) => return Err(EngineError::Disconnected(StreamKind::Stdout)),
                None => {
                    if deadline_at.is_some() {
                        self.flush_partials(lines);
                        return Err(EngineError::Timeout);
                    }
                }
            }
        }
    }

    fn splitter(&mut self, stream: StreamKind) -> &mut LineSplitter {
        match stream {
            StreamKind::Stdout => &mut self.out_lines,
            StreamKind::Stderr => &mut self.err_lines,
        }
    }

    /// Moves complete lines out of the splitters. Returns true as soon as a
    /// stdout line matches the sentinel prefix; later lines stay queued.
    fn drain_queued(&mut self, lines: &mut Vec<Line>, sentinel: Option<&str>) -> bool {
        while let Some(text) = self.err_lines.pop() {
            self.push_line(lines, text, StreamKind::Stderr, false);
        }
        while let Some(text) = self.out_lines.pop() {
            let hit = sentinel.is_some_and(|s| text.starts_with(s));
            self.push_line(lines, text, StreamKind::Stdout, false);
            if hit {
                return true;
            }
        }
        false
    }

    fn push_line(&self, lines: &mut Vec<Line>, text: String, stream: StreamKind, partial: bool) {
        if log_enabled!(Level::Debug) {
            debug!("< {} [{stream}] '{text}'", self.log_name);
        }
        lines.push(Line { text, stream, received: Local::now(), partial });
    }

    fn flush_partials(&mut self, lines: &mut Vec<Line>) {
        if let Some(text) = self.out_lines.take_partial() {
            self.push_line(lines, text, StreamKind::Stdout, true);
        }
        if let Some(text) = self.err_lines.take_partial() {
            self.push_line(lines, text, StreamKind::Stderr, true);
        }
    }

    /// Idempotent shutdown: deregister, give the child `KILL_TIMEOUT` to exit
    /// on its own (the session has already sent `quit` at this point), then
    /// kill and reap it. The exit status ends up in the log.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        deregister(self.child.id());

        if self.exit_status.is_none() {
            let start = Instant::now();
            loop {
                if let Ok(Some(status)) = self.child.try_wait() {
                    self.exit_status = Some(status);
                    break;
                }
                if start.elapsed() >= KILL_TIMEOUT {
                    debug!("force terminating engine process '{}' ({})", self.log_name, self.child.id());
                    _ = self.child.kill();
                    if let Ok(status) = self.child.wait() {
                        self.exit_status = Some(status);
                    }
                    break;
                }
                sleep(KILL_POLL_STEP);
            }
        }
        match self.exit_status {
            Some(status) => debug!("engine process '{}' exited with {status}", self.log_name),
            None => debug!("engine process '{}' could not be reaped", self.log_name),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut stream: R,
    kind: StreamKind,
    tx: Sender<StreamEvent>,
    log_name: &str,
) {
    Builder::new()
        .name(format!("{kind} reader for engine {log_name}"))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        _ = tx.send(StreamEvent::Closed(kind));
                        return;
                    }
                    Ok(n) => {
                        if tx.send(StreamEvent::Data(kind, buf[..n].to_vec())).is_err() {
                            // the handle is gone, nobody cares about this stream anymore
                            return;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        _ = tx.send(StreamEvent::Failed(kind, err));
                        return;
                    }
                }
            }
        })
        .expect("failed to spawn engine reader thread");
}
