//! VM/process runner.
//!
//! Every external program the gate drives goes through [`ProcessRunner::run`].
//! It owns teeing of child output, the optional de-obfuscation pass, the
//! timeout watchdog and the exit-code policy.

use crate::fsutil::shell_join;
use crate::unstrip::{find_map_files, unstrip_output, MappingRetracer, Retracer};
use crate::GateError;
use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// Child writes straight to the orchestrator's stdout/stderr.
    #[default]
    Inherit,
    /// Output is buffered only.
    Capture,
    /// Output is echoed live and buffered.
    Tee,
}

/// A single external command. Built by value, consumed by
/// [`ProcessRunner::run`].
#[derive(Debug, Clone)]
pub struct ProcessInvocation {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    capture: CaptureMode,
    merge_stderr: bool,
    suppress_duplicates: Vec<String>,
    map_files: Vec<PathBuf>,
    non_zero_is_fatal: bool,
}

impl ProcessInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
            capture: CaptureMode::Inherit,
            merge_stderr: false,
            suppress_duplicates: Vec::new(),
            map_files: Vec::new(),
            non_zero_is_fatal: true,
        }
    }

    /// Splits `[program, args...]`; an empty command is a configuration error.
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| GateError::config("empty command"))?;
        Ok(Self::new(program).args(args.iter().cloned()))
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

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn capture(mut self, mode: CaptureMode) -> Self {
        self.capture = mode;
        self
    }

    /// Routes stderr into the stdout buffer.
    pub fn merge_stderr(mut self) -> Self {
        self.merge_stderr = true;
        self
    }

    /// Lines starting with one of `prefixes` are echoed only the first time
    /// they appear.
    pub fn suppress_duplicates<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suppress_duplicates
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    /// Mapping files used to de-obfuscate the output in addition to the ones
    /// found next to the arguments.
    pub fn map_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.map_files.extend(files.into_iter().map(Into::into));
        self
    }

    /// Returns non-zero exits and timeouts as outcomes instead of errors.
    pub fn allow_failure(mut self) -> Self {
        self.non_zero_is_fatal = false;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatusKind {
    Exited(i32),
    Signaled,
    TimedOut,
}

impl ExitStatusKind {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitStatusKind::Exited(code),
            None => ExitStatusKind::Signaled,
        }
    }
}

impl fmt::Display for ExitStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatusKind::Exited(code) => write!(f, "exit {}", code),
            ExitStatusKind::Signaled => write!(f, "killed by signal"),
            ExitStatusKind::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitOutcome {
    pub status: ExitStatusKind,
    pub stdout: String,
    pub stderr: String,
    /// De-obfuscated output, when it differed from the raw capture.
    pub unstripped: Option<String>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.status == ExitStatusKind::Exited(0)
    }

    pub fn code(&self) -> Option<i32> {
        match self.status {
            ExitStatusKind::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.status == ExitStatusKind::TimedOut
    }
}

#[derive(Clone)]
pub struct ProcessRunner {
    strip_jars: bool,
    retracer: Arc<dyn Retracer>,
}

impl fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("strip_jars", &self.strip_jars)
            .finish()
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(false, Arc::new(MappingRetracer))
    }
}

#[derive(Clone, Copy)]
enum Sink {
    Stdout,
    Stderr,
}

struct Echo {
    enabled: bool,
    prefixes: Vec<String>,
    seen: Mutex<HashSet<String>>,
}

impl Echo {
    fn line(&self, sink: Sink, line: &str) {
        if !self.enabled {
            return;
        }
        if self.prefixes.iter().any(|p| line.starts_with(p.as_str())) {
            let mut seen = match self.seen.lock() {
                Ok(seen) => seen,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !seen.insert(line.to_string()) {
                return;
            }
        }
        match sink {
            Sink::Stdout => {
                let mut out = io::stdout().lock();
                let _ = out.write_all(line.as_bytes());
                let _ = out.flush();
            }
            Sink::Stderr => {
                let mut err = io::stderr().lock();
                let _ = err.write_all(line.as_bytes());
                let _ = err.flush();
            }
        }
    }
}

fn pump<R: Read + Send + 'static>(
    reader: R,
    sink: Sink,
    buffer: Arc<Mutex<String>>,
    echo: Arc<Echo>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    echo.line(sink, &line);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.push_str(&line);
                    }
                }
            }
        }
    })
}

fn take_buffer(buffer: &Arc<Mutex<String>>) -> String {
    match buffer.lock() {
        Ok(mut buf) => std::mem::take(&mut *buf),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Result<ExitStatusKind> {
    let Some(timeout) = timeout else {
        return Ok(ExitStatusKind::from_status(child.wait()?));
    };
    let started = Instant::now();
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(ExitStatusKind::from_status(status)),
            None => {
                if started.elapsed() >= timeout {
                    kill_tree(child);
                    let _ = child.wait();
                    return Ok(ExitStatusKind::TimedOut);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Kills the child and everything it forked. A child run under a timeout
/// leads its own process group.
#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret == -1 {
        debug!(error = %io::Error::last_os_error(), "process group kill failed");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

impl ProcessRunner {
    pub fn new(strip_jars: bool, retracer: Arc<dyn Retracer>) -> Self {
        Self {
            strip_jars,
            retracer,
        }
    }

    pub fn strip_jars(&self) -> bool {
        self.strip_jars
    }

    pub fn run(&self, invocation: ProcessInvocation) -> Result<ExitOutcome> {
        let mut inv = invocation;
        let map_files = if inv.capture != CaptureMode::Inherit {
            Vec::new()
        } else if self.strip_jars {
            let mut files = find_map_files(&inv.args);
            files.extend(inv.map_files.iter().cloned());
            files.sort();
            files.dedup();
            files
        } else {
            inv.map_files.clone()
        };
        if !map_files.is_empty() {
            inv.capture = CaptureMode::Tee;
            inv.merge_stderr = true;
        }

        let command_line = inv.command_line();
        debug!(command = %command_line, "running");

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args);
        if let Some(dir) = &inv.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&inv.env);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            if inv.timeout.is_some() {
                cmd.process_group(0);
            }
        }
        let capturing = inv.capture != CaptureMode::Inherit;
        if capturing {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                GateError::config(format!(
                    "missing required command: {}",
                    inv.program.display()
                ))
            } else {
                anyhow!("failed to start {}: {}", command_line, e)
            }
        })?;

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = if inv.merge_stderr {
            Arc::clone(&stdout_buf)
        } else {
            Arc::new(Mutex::new(String::new()))
        };
        let echo = Arc::new(Echo {
            enabled: inv.capture == CaptureMode::Tee,
            prefixes: inv.suppress_duplicates.clone(),
            seen: Mutex::new(HashSet::new()),
        });
        let mut pumps = Vec::new();
        if let Some(out) = child.stdout.take() {
            pumps.push(pump(out, Sink::Stdout, Arc::clone(&stdout_buf), Arc::clone(&echo)));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(pump(err, Sink::Stderr, Arc::clone(&stderr_buf), Arc::clone(&echo)));
        }

        let status = wait_with_deadline(&mut child, inv.timeout)?;
        for handle in pumps {
            let _ = handle.join();
        }
        let stdout = take_buffer(&stdout_buf);
        let stderr = if inv.merge_stderr {
            String::new()
        } else {
            take_buffer(&stderr_buf)
        };
        let unstripped = if map_files.is_empty() {
            None
        } else {
            unstrip_output(self.retracer.as_ref(), &map_files, &stdout)
        };
        let outcome = ExitOutcome {
            status,
            stdout,
            stderr,
            unstripped,
        };

        if !inv.non_zero_is_fatal || outcome.success() {
            return Ok(outcome);
        }
        match outcome.status {
            ExitStatusKind::TimedOut => Err(GateError::Timeout {
                command: command_line,
                timeout: inv.timeout.unwrap_or_default(),
            }
            .into()),
            _ => {
                let tail = if capturing {
                    last_line(&outcome.stderr).or_else(|| last_line(&outcome.stdout))
                } else {
                    None
                };
                Err(GateError::ProcessFailure {
                    command: command_line,
                    code: outcome.code(),
                    detail: tail,
                }
                .into())
            }
        }
    }
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
}
