//! Narrow interfaces to the desktop: keystroke injection, clipboard, and the
//! foreground window. The agent ships thin command-backed adapters; anything
//! platform-specific lives in the configured programs.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// How long a helper program may run when no deadline is configured.
pub const DEFAULT_HELPER_DEADLINE: Duration = Duration::from_secs(10);

const WAIT_POLL: Duration = Duration::from_millis(10);

/// Errors from a desktop capability.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The capability is not configured or not usable on this desktop.
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    /// The capability ran and reported failure.
    #[error("capability failed: {0}")]
    Failed(String),
    /// The capability did not finish within its deadline.
    #[error("capability timed out after {0:?}")]
    TimedOut(Duration),
    /// Spawning or talking to a helper failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Types a secret into the focused control.
pub trait Injector: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Delivers `secret` to the focused control.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError`] if delivery failed.
    fn inject(&self, secret: &[u8]) -> Result<(), CapabilityError>;
}

/// Places a secret on the clipboard.
pub trait ClipboardSetter: Send + Sync {
    /// # Errors
    ///
    /// Returns [`CapabilityError`] if the clipboard could not be set.
    fn set(&self, secret: &[u8]) -> Result<(), CapabilityError>;
}

/// The foreground process and window title.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FocusTarget {
    /// Executable or application name.
    pub process: String,
    /// Window title.
    pub title: String,
}

/// Reports which window currently has keyboard focus.
pub trait FocusInspector: Send + Sync {
    /// # Errors
    ///
    /// Returns [`CapabilityError`] if the target cannot be determined.
    fn current_target(&self) -> Result<FocusTarget, CapabilityError>;
}

/// The set of desktop capabilities available to the dispatcher.
#[derive(Clone)]
pub struct Capabilities {
    /// Required injector.
    pub injector: Arc<dyn Injector>,
    /// Optional clipboard for degraded delivery.
    pub clipboard: Option<Arc<dyn ClipboardSetter>>,
    /// Optional focus inspector for target policy.
    pub focus: Option<Arc<dyn FocusInspector>>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("injector", &self.injector.name())
            .field("clipboard", &self.clipboard.is_some())
            .field("focus", &self.focus.is_some())
            .finish()
    }
}

// ── Command adapters ────────────────────────────────────────────────────────

/// A helper program, its arguments and how long it may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    deadline: Duration,
}

impl CommandSpec {
    /// Splits a command line on whitespace. Returns `None` for a blank line.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_owned);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            deadline: DEFAULT_HELPER_DEADLINE,
        })
    }

    /// Sets how long the program may run before it is killed.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Runs the program with `input` on stdin and waits for it.
    ///
    /// Stdin is fed from a separate thread so a helper that never reads
    /// cannot stall the deadline. The child is reaped on every path.
    fn run_with_stdin(&self, input: &[u8]) -> Result<(), CapabilityError> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let Some(mut stdin) = child.stdin.take() else {
            reap(&mut child);
            return Err(CapabilityError::Failed("stdin not captured".into()));
        };
        let payload = Zeroizing::new(input.to_vec());
        let writer = std::thread::spawn(move || stdin.write_all(&payload));

        let status = self.wait(&mut child);
        let fed = writer
            .join()
            .map_err(|_| CapabilityError::Failed("stdin writer panicked".into()))?;
        let status = status?;
        fed?;
        self.check(status)
    }

    /// Runs the program with stdin closed and returns its stdout.
    fn run_for_output(&self) -> Result<String, CapabilityError> {
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let status = self.wait(&mut child)?;
        self.check(status)?;
        let mut out = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_string(&mut out)?;
        }
        Ok(out)
    }

    /// Waits for `child` up to the deadline; kills and reaps it otherwise.
    fn wait(&self, child: &mut Child) -> Result<ExitStatus, CapabilityError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if started.elapsed() >= self.deadline => {
                    warn!(program = %self.program, deadline = ?self.deadline, "helper timed out, killing");
                    reap(child);
                    return Err(CapabilityError::TimedOut(self.deadline));
                }
                Ok(None) => std::thread::sleep(WAIT_POLL),
                Err(e) => {
                    reap(child);
                    return Err(e.into());
                }
            }
        }
    }

    fn check(&self, status: ExitStatus) -> Result<(), CapabilityError> {
        if status.success() {
            Ok(())
        } else {
            Err(CapabilityError::Failed(format!(
                "{} exited with {status}",
                self.program
            )))
        }
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Injects by piping the secret to a helper program (for example a
/// keystroke typer).
#[derive(Debug, Clone)]
pub struct CommandInjector {
    spec: CommandSpec,
}

impl CommandInjector {
    /// Wraps a helper command.
    #[must_use]
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl Injector for CommandInjector {
    fn name(&self) -> &str {
        self.spec.program()
    }

    fn inject(&self, secret: &[u8]) -> Result<(), CapabilityError> {
        self.spec.run_with_stdin(secret)
    }
}

/// Sets the clipboard by piping the secret to a helper program.
#[derive(Debug, Clone)]
pub struct CommandClipboard {
    spec: CommandSpec,
}

impl CommandClipboard {
    /// Wraps a helper command.
    #[must_use]
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl ClipboardSetter for CommandClipboard {
    fn set(&self, secret: &[u8]) -> Result<(), CapabilityError> {
        self.spec.run_with_stdin(secret)
    }
}

/// Reads `process<TAB>title` from a helper program's stdout.
#[derive(Debug, Clone)]
pub struct CommandFocusInspector {
    spec: CommandSpec,
}

impl CommandFocusInspector {
    /// Wraps a helper command.
    #[must_use]
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl FocusInspector for CommandFocusInspector {
    fn current_target(&self) -> Result<FocusTarget, CapabilityError> {
        parse_focus_line(&self.spec.run_for_output()?)
    }
}

fn parse_focus_line(out: &str) -> Result<FocusTarget, CapabilityError> {
    let line = out.lines().next().unwrap_or("").trim_end();
    if line.is_empty() {
        return Err(CapabilityError::Failed("empty focus report".into()));
    }
    let (process, title) = line.split_once('\t').unwrap_or((line, ""));
    Ok(FocusTarget {
        process: process.trim().to_owned(),
        title: title.trim().to_owned(),
    })
}

/// Tries each injector in order until one succeeds.
pub struct FallbackInjector {
    chain: Vec<Box<dyn Injector>>,
}

impl FallbackInjector {
    /// Builds a chain; the first entry is preferred.
    #[must_use]
    pub fn new(chain: Vec<Box<dyn Injector>>) -> Self {
        Self { chain }
    }
}

impl Injector for FallbackInjector {
    fn name(&self) -> &str {
        "fallback"
    }

    fn inject(&self, secret: &[u8]) -> Result<(), CapabilityError> {
        let mut last = CapabilityError::Unavailable("no injector configured".into());
        for injector in &self.chain {
            match injector.inject(secret) {
                Ok(()) => {
                    debug!(injector = injector.name(), "injection delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(injector = injector.name(), error = %e, "injector failed, trying next");
                    last = e;
                }
            }
        }
        Err(last)
    }
}
