//! Supervised external processes
//!
//! This module is the ONLY sanctioned way to run the external tools of the
//! data path (`nbdkit`, `nbdcopy`, the extent-copy helper, `virt-v2v-in-place`).
//! Everything goes through `Supervisor` to ensure:
//!
//! - Process group isolation and parent-death signal (see `process_guard`)
//! - PID registration for cleanup on shutdown
//! - stdout and stderr drained concurrently, each on its own thread, into the
//!   session log; a slow log never blocks the child and neither stream
//!   waits on the other
//! - Bulk input (the extent list of an incremental copy) fed through stdin
//!   from a separate thread, never through the argument vector
//! - A uniform outcome: succeeded, failed with the stderr tail, or cancelled

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{MigrationError, Result};
use crate::logging::SessionLog;
use crate::process_guard::{self, CommandProcessGroup};

/// A fully specified external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    label: String,
    stdin: Option<Arc<[u8]>>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let label = std::path::Path::new(&program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());
        Self {
            program,
            args: Vec::new(),
            env: Vec::new(),
            label,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Name used to tag forwarded output lines
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Bytes written to the child's stdin, which is closed afterwards
    pub fn with_stdin(mut self, data: impl Into<Arc<[u8]>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn env_vars(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stdin_data(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Command line for logs. Values of `password=` arguments are masked.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        for arg in &self.args {
            if let Some((key, _)) = arg.split_once('=')
                && key == "password"
            {
                parts.push(format!("{}=***", key));
                continue;
            }
            parts.push(arg.clone());
        }
        parts.join(" ")
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exit status zero
    Succeeded,
    /// Non-zero exit or killed by a signal nobody asked for
    Failed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },
    /// Terminated because the cancel token fired
    Cancelled,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Map onto the error taxonomy
    pub fn into_result(self, program: &str, stage: &str) -> Result<()> {
        match self {
            Self::Succeeded => Ok(()),
            Self::Failed {
                exit_code,
                stderr_tail,
            } => Err(MigrationError::SubprocessFailed {
                program: program.to_string(),
                exit_code,
                stderr_tail,
            }),
            Self::Cancelled => Err(MigrationError::cancelled(stage)),
        }
    }
}

/// Spawns and watches external commands.
#[derive(Debug, Clone)]
pub struct Supervisor {
    /// Time between SIGTERM and SIGKILL when stopping a process
    pub stop_grace: Duration,
    /// How many stderr lines to keep for diagnostics
    pub tail_lines: usize,
    /// Exit/cancel polling interval
    pub poll_interval: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            tail_lines: 20,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl Supervisor {
    pub fn new(stop_grace: Duration, tail_lines: usize) -> Self {
        Self {
            stop_grace,
            tail_lines: tail_lines.max(1),
            ..Self::default()
        }
    }

    /// Start `cmd` and return immediately with a handle to it.
    pub fn spawn(&self, cmd: &ExternalCommand, log: &SessionLog) -> Result<RunningProcess> {
        log.info(format_args!("Running {}", cmd.display()));

        let mut command = Command::new(cmd.program());
        let stdin = if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        command
            .args(cmd.arguments())
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        for (key, value) in cmd.env_vars() {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| MigrationError::Spawn {
            program: cmd.program().to_string(),
            source,
        })?;
        let pid = child.id();
        process_guard::register_child(pid);

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.tail_lines)));
        let mut drains = Vec::with_capacity(3);
        if let (Some(data), Some(stdin)) = (cmd.stdin.clone(), child.stdin.take()) {
            drains.push(feed(stdin, data, cmd.label(), log.clone()));
        }
        if let Some(stdout) = child.stdout.take() {
            drains.push(drain(stdout, cmd.label(), "stdout", log.clone(), None, 0));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(drain(
                stderr,
                cmd.label(),
                "stderr",
                log.clone(),
                Some(Arc::clone(&tail)),
                self.tail_lines,
            ));
        }

        Ok(RunningProcess {
            child,
            pid,
            label: cmd.label().to_string(),
            drains,
            tail,
            stop_grace: self.stop_grace,
            poll_interval: self.poll_interval,
            log: log.clone(),
            reaped: false,
        })
    }

    /// Run `cmd` to completion or until `cancel` fires.
    pub fn run(
        &self,
        cmd: &ExternalCommand,
        log: &SessionLog,
        cancel: &CancelToken,
    ) -> Result<ProcessOutcome> {
        if cancel.is_cancelled() {
            return Ok(ProcessOutcome::Cancelled);
        }
        self.spawn(cmd, log)?.wait(cancel)
    }
}

fn feed(mut stdin: ChildStdin, data: Arc<[u8]>, label: &str, log: SessionLog) -> JoinHandle<()> {
    let label = label.to_string();
    std::thread::spawn(move || {
        match stdin.write_all(&data) {
            Ok(()) => {}
            // The child exited (or was stopped) before reading everything
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                log.debug(format_args!("{} closed its stdin early", label));
            }
            Err(e) => log.warn(format_args!("Error writing stdin of {}: {}", label, e)),
        }
    })
}

fn drain<R: Read + Send + 'static>(
    stream: R,
    label: &str,
    stream_name: &'static str,
    log: SessionLog,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
    tail_lines: usize,
) -> JoinHandle<()> {
    let label = label.to_string();
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if line.is_empty() {
                        continue;
                    }
                    log.stream_line(&label, stream_name, line);
                    if let Some(tail) = &tail
                        && let Ok(mut tail) = tail.lock()
                    {
                        if tail.len() == tail_lines {
                            tail.pop_front();
                        }
                        tail.push_back(line.to_string());
                    }
                }
                Err(e) => {
                    log.warn(format_args!("Error reading {} of {}: {}", stream_name, label, e));
                    break;
                }
            }
        }
    })
}

/// Handle to a live supervised process.
///
/// Dropping it without `wait` or `stop` kills the process group, so a
/// forgotten handle can never leak a running export.
pub struct RunningProcess {
    child: Child,
    pid: u32,
    label: String,
    drains: Vec<JoinHandle<()>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    stop_grace: Duration,
    poll_interval: Duration,
    log: SessionLog,
    reaped: bool,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// `Some(status)` once the process has exited.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Last captured stderr lines, newline-joined.
    pub fn stderr_tail(&self) -> String {
        self.tail
            .lock()
            .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    /// Block until exit or cancellation.
    pub fn wait(mut self, cancel: &CancelToken) -> Result<ProcessOutcome> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.finish();
                return Ok(self.outcome(status));
            }
            if cancel.is_cancelled() {
                self.log.warn(format_args!(
                    "Cancellation requested, terminating {} (PID {})",
                    self.label, self.pid
                ));
                self.terminate()?;
                return Ok(ProcessOutcome::Cancelled);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Terminate the process group and reap it. Returns the exit status.
    pub fn stop(mut self) -> Result<ExitStatus> {
        self.terminate()
    }

    fn terminate(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            self.finish();
            return Ok(status);
        }
        let pid = self.pid;
        process_guard::terminate_group(pid, self.stop_grace, || {
            !process_guard::is_process_alive(pid)
        });
        let status = self.child.wait()?;
        self.finish();
        Ok(status)
    }

    fn finish(&mut self) {
        if self.reaped {
            return;
        }
        self.reaped = true;
        process_guard::unregister_child(self.pid);
        for handle in self.drains.drain(..) {
            let _ = handle.join();
        }
    }

    fn outcome(&self, status: ExitStatus) -> ProcessOutcome {
        if status.success() {
            self.log
                .info(format_args!("{} (PID {}) exited successfully", self.label, self.pid));
            ProcessOutcome::Succeeded
        } else {
            let stderr_tail = self.stderr_tail();
            self.log.error(format_args!(
                "{} (PID {}) failed: {}",
                self.label, self.pid, status
            ));
            ProcessOutcome::Failed {
                exit_code: status.code(),
                stderr_tail,
            }
        }
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        self.log.warn(format_args!(
            "{} (PID {}) dropped while running, killing it",
            self.label, self.pid
        ));
        let pid = self.pid;
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(-(pid as i32)),
            nix::sys::signal::Signal::SIGKILL,
        );
        let _ = self.child.wait();
        self.finish();
    }
}
