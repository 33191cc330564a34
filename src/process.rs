//! Ownership of a single spawned OS process.
//!
//! Every [`ProcessHandle`] is backed by one worker thread. The worker performs the
//! actual `spawn`, blocks on the child's exit, publishes the [`ExitInfo`] and then
//! runs the optional exit callback. Spawning from the worker keeps the Linux
//! parent-death signal tied to a thread that lives exactly as long as the child.
use std::{
    collections::HashMap,
    fmt,
    fs::{self, OpenOptions},
    io::{self, Read, Write},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::PathBuf,
    process::{ChildStdin, Command, ExitStatus, Stdio},
    sync::{Arc, Condvar, Mutex, mpsc},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, error, warn};

use crate::constants::{KILL_REAP_TIMEOUT, PROCESS_CHECK_INTERVAL, TERM_GRACE_PERIOD};

/// Writer shared between the supervisor and a capture thread.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Where one standard stream of a child goes.
#[derive(Clone, Default)]
pub enum OutputSink {
    /// Discard the stream.
    #[default]
    Null,
    /// Share the supervisor's own stream.
    Inherit,
    /// Append to a file, creating it (and its directory) when missing.
    File(PathBuf),
    /// Copy every byte into an in-process writer.
    Shared(SharedWriter),
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Inherit => write!(f, "Inherit"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Shared(_) => write!(f, "Shared(..)"),
        }
    }
}

/// Destinations for a child's stdout and stderr.
#[derive(Debug, Clone, Default)]
pub struct OutputSinks {
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl OutputSinks {
    /// Appends both streams to the given files.
    pub fn files(stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        Self {
            stdout: OutputSink::File(stdout.into()),
            stderr: OutputSink::File(stderr.into()),
        }
    }

    /// Whether neither stream was configured by the caller.
    pub fn is_unset(&self) -> bool {
        matches!(
            (&self.stdout, &self.stderr),
            (OutputSink::Null, OutputSink::Null)
        )
    }
}

/// Everything needed to launch a process.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    /// Label used in logs and thread names, usually the service key.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
    pub sinks: OutputSinks,
    /// Keep a pipe to the child's stdin for live commands.
    pub stdin_pipe: bool,
}

impl SpawnSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn sinks(mut self, sinks: OutputSinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn stdin_pipe(mut self, enabled: bool) -> Self {
        self.stdin_pipe = enabled;
        self
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Used when `wait` itself failed and the real status is unknown.
    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Callback run by the worker thread once the process has exited.
pub type ExitCallback = Box<dyn FnOnce(ExitInfo) + Send + 'static>;

#[derive(Default)]
struct ExitSlot {
    status: Mutex<Option<ExitInfo>>,
    cond: Condvar,
}

impl ExitSlot {
    fn publish(&self, info: ExitInfo) {
        let mut guard = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(info);
        self.cond.notify_all();
    }

    fn get(&self) -> Option<ExitInfo> {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<ExitInfo> {
        let guard = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match timeout {
            None => {
                let guard = self
                    .cond
                    .wait_while(guard, |status| status.is_none())
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *guard
            }
            Some(timeout) => {
                let (guard, _) = self
                    .cond
                    .wait_timeout_while(guard, timeout, |status| status.is_none())
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *guard
            }
        }
    }
}

/// One live (or recently exited) child process.
pub struct ProcessHandle {
    label: String,
    pid: u32,
    exit: Arc<ExitSlot>,
    commands: Option<mpsc::Sender<String>>,
    armed: Mutex<Option<mpsc::Sender<()>>>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("exited", &self.exit.get())
            .field("stdin_pipe", &self.commands.is_some())
            .finish()
    }
}

impl ProcessHandle {
    /// Launches the process described by `spec`.
    ///
    /// `on_exit` runs on the worker thread after the process has been reaped, but
    /// never before [`ProcessHandle::arm`] is called or the handle is dropped. This
    /// lets the caller finish recording the PID before exit bookkeeping starts.
    pub fn spawn(spec: SpawnSpec, on_exit: Option<ExitCallback>) -> io::Result<Self> {
        let label = spec.label.clone();
        let exit = Arc::new(ExitSlot::default());
        let slot = Arc::clone(&exit);
        let (launch_tx, launch_rx) = mpsc::channel::<io::Result<(u32, Option<ChildStdin>)>>();
        let (armed_tx, armed_rx) = mpsc::channel::<()>();

        thread::Builder::new()
            .name(format!("proc-{label}"))
            .spawn(move || {
                let mut child = match build_command(&spec).and_then(|mut cmd| cmd.spawn()) {
                    Ok(child) => child,
                    Err(err) => {
                        let _ = launch_tx.send(Err(err));
                        return;
                    }
                };

                if let Some(stdout) = child.stdout.take()
                    && let OutputSink::Shared(writer) = &spec.sinks.stdout
                {
                    spawn_capture(&spec.label, "stdout", stdout, Arc::clone(writer));
                }
                if let Some(stderr) = child.stderr.take()
                    && let OutputSink::Shared(writer) = &spec.sinks.stderr
                {
                    spawn_capture(&spec.label, "stderr", stderr, Arc::clone(writer));
                }

                let pid = child.id();
                if launch_tx.send(Ok((pid, child.stdin.take()))).is_err() {
                    // Nobody is left to own the process.
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }

                let info = match child.wait() {
                    Ok(status) => ExitInfo::from(status),
                    Err(err) => {
                        error!("Failed to wait on '{}' (PID {pid}): {err}", spec.label);
                        ExitInfo::unknown()
                    }
                };
                debug!("Process '{}' (PID {pid}) exited with {info}", spec.label);
                slot.publish(info);

                if let Some(callback) = on_exit {
                    // Returns immediately once armed or once the handle is dropped.
                    let _ = armed_rx.recv();
                    callback(info);
                }
            })?;

        let (pid, stdin) = launch_rx.recv().map_err(|err| {
            io::Error::new(
                io::ErrorKind::Interrupted,
                format!("worker failed to report launch status: {err}"),
            )
        })??;

        let commands = stdin.map(|stdin| spawn_stdin_writer(&label, stdin));
        debug!("Process '{label}' started with PID {pid}");

        Ok(Self {
            label,
            pid,
            exit,
            commands,
            armed: Mutex::new(Some(armed_tx)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Releases the exit callback. Idempotent.
    pub fn arm(&self) {
        let sender = self
            .armed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// Exit status if the process has already been reaped.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.get()
    }

    pub fn is_alive(&self) -> bool {
        self.exit.get().is_none()
    }

    /// Whether live commands can be written to the process.
    pub fn has_pipe(&self) -> bool {
        self.commands.is_some()
    }

    /// Queues one line for the child's stdin. Never blocks; returns whether the
    /// line was queued. Delivery and its effect are not confirmed.
    pub fn send(&self, line: &str) -> bool {
        match &self.commands {
            Some(tx) if self.is_alive() => tx.send(format!("{line}\n")).is_ok(),
            _ => false,
        }
    }

    /// Blocks until the process exits.
    pub fn wait(&self) -> ExitInfo {
        self.exit.wait(None).unwrap_or_else(ExitInfo::unknown)
    }

    /// Waits up to `timeout`; `None` means the process is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitInfo> {
        self.exit.wait(Some(timeout))
    }

    /// Sends `sig` to the process. Signalling a process that is already gone is
    /// not an error.
    pub fn signal(&self, sig: Signal) -> Result<(), Errno> {
        if !self.is_alive() {
            return Ok(());
        }
        match signal::kill(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Graceful stop: SIGTERM to the process group, bounded wait, then SIGKILL.
    pub fn kill(&self) -> io::Result<ExitInfo> {
        self.kill_with_grace(TERM_GRACE_PERIOD)
    }

    /// Like [`ProcessHandle::kill`] with a custom grace period.
    pub fn kill_with_grace(&self, grace: Duration) -> io::Result<ExitInfo> {
        if let Some(info) = self.exit_info() {
            return Ok(info);
        }

        signal_process_tree(self.pid, Signal::SIGTERM, &self.label)?;
        if let Some(info) = self.wait_timeout(grace) {
            return Ok(info);
        }

        warn!(
            "Process '{}' (PID {}) did not exit after SIGTERM; sending SIGKILL",
            self.label, self.pid
        );
        self.force_kill()
    }

    /// Immediate SIGKILL followed by a bounded wait for the reap.
    pub fn force_kill(&self) -> io::Result<ExitInfo> {
        if let Some(info) = self.exit_info() {
            return Ok(info);
        }

        signal_process_tree(self.pid, Signal::SIGKILL, &self.label)?;
        self.wait_timeout(KILL_REAP_TIMEOUT).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("PID {} survived SIGKILL", self.pid),
            )
        })
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.arm();
    }
}

fn build_command(spec: &SpawnSpec) -> io::Result<Command> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    cmd.envs(&spec.env);
    if let Some(dir) = &spec.workdir {
        cmd.current_dir(dir);
    }

    cmd.stdin(if spec.stdin_pipe {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(sink_stdio(&spec.sinks.stdout)?);
    cmd.stderr(sink_stdio(&spec.sinks.stderr)?);

    unsafe {
        cmd.pre_exec(|| {
            // Own process group so the whole tree can be signalled without touching
            // the supervisor's group.
            if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    debug!("Executing command: {cmd:?}");
    Ok(cmd)
}

fn sink_stdio(sink: &OutputSink) -> io::Result<Stdio> {
    Ok(match sink {
        OutputSink::Null => Stdio::null(),
        OutputSink::Inherit => Stdio::inherit(),
        OutputSink::Shared(_) => Stdio::piped(),
        OutputSink::File(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Stdio::from(file)
        }
    })
}

fn spawn_capture<R>(label: &str, stream: &'static str, mut source: R, sink: SharedWriter)
where
    R: Read + Send + 'static,
{
    let label = label.to_string();
    let _ = thread::Builder::new()
        .name(format!("{stream}-{label}"))
        .spawn(move || {
            let mut buffer = [0u8; 8192];
            loop {
                match source.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut guard = sink.lock().unwrap_or_else(|p| p.into_inner());
                        if let Err(err) = guard.write_all(&buffer[..n]) {
                            warn!("Dropping {stream} of '{label}': {err}");
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!("Stopped capturing {stream} of '{label}': {err}");
                        break;
                    }
                }
            }
        });
}

fn spawn_stdin_writer(label: &str, mut stdin: ChildStdin) -> mpsc::Sender<String> {
    let (tx, rx) = mpsc::channel::<String>();
    let label = label.to_string();
    let _ = thread::Builder::new()
        .name(format!("stdin-{label}"))
        .spawn(move || {
            for line in rx {
                if let Err(err) = stdin.write_all(line.as_bytes()).and_then(|_| stdin.flush()) {
                    debug!("Pipe to '{label}' closed: {err}");
                    break;
                }
            }
        });
    tx
}

/// Signals the process group led by `pid` (when it is not ours) and the process
/// itself. A missing process is not an error.
fn signal_process_tree(pid: u32, sig: Signal, label: &str) -> io::Result<()> {
    let target = Pid::from_raw(pid as i32);
    let supervisor_pgid = nix::unistd::getpgrp();

    match nix::unistd::getpgid(Some(target)) {
        Ok(child_pgid) if child_pgid != supervisor_pgid => {
            match signal::killpg(child_pgid, sig) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(Errno::EPERM) => {
                    warn!(
                        "Insufficient permissions to signal process group {child_pgid} for '{label}'. Falling back to direct signal"
                    );
                }
                Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
            }
        }
        Ok(_) | Err(Errno::ESRCH) => {}
        Err(err) => {
            debug!("Could not resolve process group of '{label}' (PID {pid}): {err}");
        }
    }

    match signal::kill(target, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
    }
}

/// Whether a PID that is not our child still exists.
pub fn pid_is_alive(pid: u32) -> bool {
    !matches!(
        signal::kill(Pid::from_raw(pid as i32), None),
        Err(Errno::ESRCH)
    )
}

/// Terminates a PID we do not own (e.g. one read from a stale PID file).
///
/// Sends SIGTERM to the process tree, polls for up to `grace`, then escalates to
/// SIGKILL. A process that is already gone counts as success.
pub fn terminate_pid(pid: u32, label: &str, grace: Duration) -> io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Ok(());
    }

    if !pid_is_alive(pid) {
        debug!("'{label}' (PID {pid}) no longer has a live process");
        return Ok(());
    }

    debug!("Stopping '{label}' (PID {pid})");
    signal_process_tree(pid, Signal::SIGTERM, label)?;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return Ok(());
        }
        thread::sleep(PROCESS_CHECK_INTERVAL);
    }

    warn!("'{label}' (PID {pid}) did not exit after SIGTERM; sending SIGKILL");
    signal_process_tree(pid, Signal::SIGKILL, label)
}
