//! Compose and run trees of child processes with shell-like expressiveness
//! and none of the usual raw-process hazards.
//!
//! An [`Expression`] is an immutable description of a command, a pipeline, or
//! a redirected sub-expression. Executing one spawns the processes, wires the
//! pipes, drives background IO threads, and reduces the exit statuses with
//! pipefail semantics: non-zero statuses are errors by default, the rightmost
//! checked failure of a pipeline wins, and [`Expression::unchecked`] opts a
//! subtree out without masking its siblings. Running handles support safe
//! concurrent kill/wait from multiple threads.
//!
//! ```
//! # fn main() -> sluice::Result<()> {
//! use sluice::cmd;
//!
//! // Read output like $() in the shell.
//! let out = cmd("echo", ["hi"]).read()?;
//! assert_eq!(out, "hi");
//!
//! // Pipelines, with pipefail.
//! let out = cmd("echo", ["hi"]).pipe(&cmd("sed", ["s/i/o/"])).read()?;
//! assert_eq!(out, "ho");
//!
//! // Non-zero statuses are errors unless unchecked.
//! assert!(cmd("false", None::<&str>).run().is_err());
//! let output = cmd("false", None::<&str>).unchecked().run()?;
//! assert_eq!(output.status, 1);
//! # Ok(())
//! # }
//! ```

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

mod error;
mod exec;
mod expr;
mod handle;
mod platform;
mod pump;
mod status;

pub use crate::error::{Error, Result};
pub use crate::handle::{Handle, ReaderHandle};

use crate::expr::{ExprNode, IoRedirect};

/// Build a command expression from a program and its arguments.
///
/// The program can be a string, which is handed to the OS as-is (so `PATH`
/// lookup applies), or a typed path, which always names a file: a relative
/// `Path` is spawned with a leading `./` so it can neither fall through to a
/// `PATH` lookup nor silently fail on POSIX.
///
/// ```no_run
/// use std::path::Path;
/// use sluice::cmd;
///
/// let from_path_lookup = cmd("echo", ["hi"]);
/// let this_file_here = cmd(Path::new("build.sh"), ["--release"]);
/// ```
pub fn cmd<P, A>(program: P, args: A) -> Expression
where
    P: IntoProgramPath,
    A: IntoIterator,
    A::Item: Into<OsString>,
{
    let mut argv = vec![program.into_program_path()];
    argv.extend(args.into_iter().map(Into::into));
    Expression::from_node(ExprNode::Exec(argv))
}

/// An immutable description of a process tree to execute.
///
/// Every builder method returns a new expression sharing the old one as a
/// subtree; nothing is mutated, so expressions can be cloned cheaply, kept
/// around, and executed any number of times.
#[derive(Clone)]
pub struct Expression(Arc<ExprNode>);

impl Expression {
    fn from_node(node: ExprNode) -> Expression {
        Expression(Arc::new(node))
    }

    pub(crate) fn node(&self) -> &ExprNode {
        &self.0
    }

    fn wrap(&self, redirect: IoRedirect) -> Expression {
        Expression::from_node(ExprNode::Io(redirect, self.clone()))
    }

    /// Execute the expression and collect its [`Output`].
    ///
    /// Returns [`Error::Status`] when the reduced status is checked and
    /// non-zero; see [`Expression::unchecked`].
    pub fn run(&self) -> Result<Output> {
        self.start()?.into_output()
    }

    /// Execute the expression and return its captured standard output as
    /// UTF-8 text with trailing newlines stripped, like `$()` in the shell.
    pub fn read(&self) -> Result<String> {
        let output = self.stdout_capture().run()?;
        let mut text = String::from_utf8(output.stdout.unwrap_or_default())?;
        while text.ends_with('\n') || text.ends_with('\r') {
            text.pop();
        }
        Ok(text)
    }

    /// Start the expression and return a [`Handle`] to the running children.
    ///
    /// If any part of the tree fails to start, everything that did start is
    /// killed and reaped before the error is returned.
    pub fn start(&self) -> Result<Handle> {
        Handle::start(self)
    }

    /// Start the expression with stdout captured and return a
    /// [`ReaderHandle`] streaming it.
    ///
    /// Unlike [`Expression::start`], no background thread drains stdout; the
    /// caller reads at its own pace, and closing the reader early kills and
    /// reaps the children.
    pub fn reader(&self) -> Result<ReaderHandle> {
        Handle::start_reader(self)
    }

    /// Feed this expression's standard output into `right`'s standard input.
    ///
    /// If both sides fail, the right side's status wins, unless only one
    /// side is checked, in which case the checked one wins.
    pub fn pipe(&self, right: &Expression) -> Expression {
        Expression::from_node(ExprNode::Pipe(self.clone(), right.clone()))
    }

    /// Read standard input from an in-memory buffer, written into the child
    /// by a background thread.
    pub fn stdin_bytes(&self, bytes: impl Into<Vec<u8>>) -> Expression {
        self.wrap(IoRedirect::StdinBytes(Arc::new(bytes.into())))
    }

    /// Open the file at `path` for reading and use it as standard input.
    pub fn stdin_path(&self, path: impl Into<PathBuf>) -> Expression {
        self.wrap(IoRedirect::StdinPath(path.into()))
    }

    /// Use an already-open file as standard input.
    pub fn stdin_file(&self, file: File) -> Expression {
        self.wrap(IoRedirect::StdinFile(file))
    }

    /// Read standard input from `/dev/null` (`NUL` on Windows).
    pub fn stdin_null(&self) -> Expression {
        self.wrap(IoRedirect::StdinNull)
    }

    /// Open (and truncate) the file at `path` and use it as standard output.
    pub fn stdout_path(&self, path: impl Into<PathBuf>) -> Expression {
        self.wrap(IoRedirect::StdoutPath(path.into()))
    }

    /// Use an already-open file as standard output.
    pub fn stdout_file(&self, file: File) -> Expression {
        self.wrap(IoRedirect::StdoutFile(file))
    }

    /// Send standard output to `/dev/null` (`NUL` on Windows).
    pub fn stdout_null(&self) -> Expression {
        self.wrap(IoRedirect::StdoutNull)
    }

    /// Capture standard output; the bytes become [`Output::stdout`].
    pub fn stdout_capture(&self) -> Expression {
        self.wrap(IoRedirect::StdoutCapture)
    }

    /// Make standard output a duplicate of the effective standard error.
    pub fn stdout_to_stderr(&self) -> Expression {
        self.wrap(IoRedirect::StdoutToStderr)
    }

    /// Open (and truncate) the file at `path` and use it as standard error.
    pub fn stderr_path(&self, path: impl Into<PathBuf>) -> Expression {
        self.wrap(IoRedirect::StderrPath(path.into()))
    }

    /// Use an already-open file as standard error.
    pub fn stderr_file(&self, file: File) -> Expression {
        self.wrap(IoRedirect::StderrFile(file))
    }

    /// Send standard error to `/dev/null` (`NUL` on Windows).
    pub fn stderr_null(&self) -> Expression {
        self.wrap(IoRedirect::StderrNull)
    }

    /// Capture standard error; the bytes become [`Output::stderr`].
    pub fn stderr_capture(&self) -> Expression {
        self.wrap(IoRedirect::StderrCapture)
    }

    /// Make standard error a duplicate of the effective standard output.
    pub fn stderr_to_stdout(&self) -> Expression {
        self.wrap(IoRedirect::StderrToStdout)
    }

    /// Swap the effective standard output and standard error.
    pub fn stdout_stderr_swap(&self) -> Expression {
        self.wrap(IoRedirect::StdoutStderrSwap)
    }

    /// Set the working directory for every command in the expression.
    ///
    /// This does not change which file a relative program path names: in
    /// `cmd(Path::new("script.sh"), ...).dir("elsewhere")` the script is
    /// still resolved against the parent's working directory.
    pub fn dir(&self, path: impl Into<PathBuf>) -> Expression {
        self.wrap(IoRedirect::Dir(path.into()))
    }

    /// Set one environment variable for every command in the expression.
    pub fn env<N, V>(&self, name: N, value: V) -> Expression
    where
        N: AsRef<OsStr>,
        V: Into<OsString>,
    {
        self.wrap(IoRedirect::Env(name.as_ref().to_os_string(), value.into()))
    }

    /// Unset one environment variable for every command in the expression.
    ///
    /// Name matching follows OS rules: case-insensitive on Windows,
    /// case-sensitive elsewhere.
    pub fn env_remove<N: AsRef<OsStr>>(&self, name: N) -> Expression {
        self.wrap(IoRedirect::EnvRemove(name.as_ref().to_os_string()))
    }

    /// Replace the entire environment for every command in the expression.
    ///
    /// Some variables are load-bearing (`SystemRoot` on Windows, notably);
    /// overlaying the parent environment with [`Expression::env`] is usually
    /// the better tool.
    pub fn full_env<E, N, V>(&self, vars: E) -> Expression
    where
        E: IntoIterator<Item = (N, V)>,
        N: AsRef<OsStr>,
        V: Into<OsString>,
    {
        let vars = vars
            .into_iter()
            .map(|(name, value)| (name.as_ref().to_os_string(), value.into()))
            .collect();
        self.wrap(IoRedirect::FullEnv(vars))
    }

    /// Keep a non-zero exit status from becoming an error.
    ///
    /// The status still appears unchanged in the [`Output`]. Uncheckedness
    /// sticks to this subtree's statuses as they bubble up through pipelines
    /// but never masks a sibling's failure.
    pub fn unchecked(&self) -> Expression {
        self.wrap(IoRedirect::Unchecked)
    }

    /// Register a hook that can adjust the platform [`Command`] right before
    /// each leaf in this subtree spawns, after all other features have been
    /// applied. Innermost hooks run last and therefore win.
    ///
    /// This is the escape hatch for rare needs like process-group setup via
    /// `CommandExt::pre_exec`; most callers never need it.
    pub fn before_spawn<F>(&self, hook: F) -> Expression
    where
        F: Fn(&mut Command) -> io::Result<()> + Send + Sync + 'static,
    {
        self.wrap(IoRedirect::BeforeSpawn(Arc::new(hook)))
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_chain(f)
    }
}

/// The collected outcome of a finished expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// The reduced exit status: the exit code, or `128 + N` for a child
    /// terminated by signal N on Unix.
    pub status: i32,
    /// Captured standard output, when [`Expression::stdout_capture`] was
    /// used.
    pub stdout: Option<Vec<u8>>,
    /// Captured standard error, when [`Expression::stderr_capture`] was
    /// used.
    pub stderr: Option<Vec<u8>>,
}

impl Output {
    /// True when the reduced status is zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Program-name conversion for [`cmd`]: strings keep OS `PATH` semantics,
/// typed paths always name a file.
pub trait IntoProgramPath {
    fn into_program_path(self) -> OsString;
}

impl IntoProgramPath for &str {
    fn into_program_path(self) -> OsString {
        self.into()
    }
}

impl IntoProgramPath for String {
    fn into_program_path(self) -> OsString {
        self.into()
    }
}

impl IntoProgramPath for &OsStr {
    fn into_program_path(self) -> OsString {
        self.to_os_string()
    }
}

impl IntoProgramPath for OsString {
    fn into_program_path(self) -> OsString {
        self
    }
}

impl IntoProgramPath for &Path {
    fn into_program_path(self) -> OsString {
        platform::dot_prefix(self)
    }
}

impl IntoProgramPath for PathBuf {
    fn into_program_path(self) -> OsString {
        platform::dot_prefix(&self)
    }
}
