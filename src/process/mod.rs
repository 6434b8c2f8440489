//! External command execution for pinroll
//!
//! Every side effect on the project checkout, the upstream clone, the build
//! system and the remote goes through a [`CommandRunner`]. The production
//! implementation is [`SystemRunner`]; tests substitute a scripted runner.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

/// A fully described external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    /// Block on a human acknowledgement before running (credential prompts).
    pub interactive: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            interactive: false,
        }
    }

    /// Build a spec from an argv list. An empty list yields an empty program,
    /// which fails to spawn.
    pub fn from_argv(argv: &[String]) -> Self {
        let mut iter = argv.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program).args(iter)
    }

    /// Run a command line through `sh -c`.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// The argv joined with shell escaping, without the working directory.
    pub fn argv_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| shell_escape::escape(Cow::Borrowed(a.as_str())).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Render as `<cwd> $ <argv>`, the form used in logs and failure reports.
    pub fn command_line(&self) -> String {
        let cwd = match &self.cwd {
            Some(dir) => dir.display().to_string(),
            None => std::env::current_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|_| ".".to_string()),
        };
        format!("{cwd} $ {}", self.argv_line())
    }

    /// True when the program and leading args equal `prefix`.
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        let mut argv =
            std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        prefix.iter().all(|p| argv.next() == Some(*p))
    }
}

/// Shorthand for a `git` invocation inside `dir`.
pub fn git<I, A>(dir: &Path, args: I) -> CommandSpec
where
    I: IntoIterator<Item = A>,
    A: Into<String>,
{
    CommandSpec::new("git").args(args).current_dir(dir)
}

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The process ran and exited non-zero (`None` when killed by a signal).
    Exit(Option<i32>),
    /// The process could not be started.
    Spawn(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Exit(Some(code)) => write!(f, "exit code {code}"),
            FailureReason::Exit(None) => write!(f, "terminated by signal"),
            FailureReason::Spawn(err) => write!(f, "failed to start: {err}"),
        }
    }
}

/// A command that exited non-zero or could not be started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command `{command}` failed ({reason})")]
pub struct CommandFailure {
    pub command: String,
    pub reason: FailureReason,
    pub stdout: String,
    pub stderr: String,
}

impl CommandFailure {
    pub fn new(spec: &CommandSpec, reason: FailureReason) -> Self {
        Self {
            command: spec.command_line(),
            reason,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }
}

/// Runs external commands to completion and returns their trimmed stdout.
///
/// Retry policy is never decided here; callers see every failure.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<String, CommandFailure>;
}

/// [`CommandRunner`] backed by real subprocesses.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    acknowledge_interactive: bool,
}

impl SystemRunner {
    /// `acknowledge_interactive` makes interactive commands wait for Enter.
    pub fn new(acknowledge_interactive: bool) -> Self {
        Self {
            acknowledge_interactive,
        }
    }

    fn wait_for_acknowledgement(&self) {
        print!("Press enter and monitor for ~10 seconds for more prompts...");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if let Err(e) = io::stdin().lock().read_line(&mut line) {
            tracing::warn!(error = %e, "could not read acknowledgement from stdin");
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<String, CommandFailure> {
        if spec.interactive && self.acknowledge_interactive {
            self.wait_for_acknowledgement();
        }
        tracing::info!("{}", spec.command_line());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CommandFailure::new(spec, FailureReason::Spawn(e.to_string())))?;

        // Feed stdin from a separate thread so a chatty child cannot deadlock
        // against a full stdout pipe.
        let writer = match (spec.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(std::thread::spawn(move || {
                // A child that exits without reading stdin closes the pipe;
                // its exit status is what matters.
                if let Err(e) = pipe.write_all(input.as_bytes()) {
                    tracing::debug!(error = %e, "child closed stdin early");
                }
            })),
            _ => None,
        };

        let output = child
            .wait_with_output()
            .map_err(|e| CommandFailure::new(spec, FailureReason::Spawn(e.to_string())))?;
        if let Some(handle) = writer {
            let _ = handle.join();
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            Ok(stdout)
        } else {
            let failure = CommandFailure::new(spec, FailureReason::Exit(output.status.code()))
                .with_output(stdout, stderr);
            tracing::info!("{failure}");
            Err(failure)
        }
    }
}
