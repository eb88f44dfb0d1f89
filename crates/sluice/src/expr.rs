//! The immutable expression tree.
//!
//! Builder methods on [`Expression`](crate::Expression) allocate new nodes
//! that point at their predecessors through `Arc`s; nothing here is ever
//! mutated after construction, so expressions are cheap to clone, shareable
//! across threads, and reusable across starts.

use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

/// A `before_spawn` hook: last-minute access to the platform `Command`.
pub(crate) type SpawnHook = dyn Fn(&mut Command) -> io::Result<()> + Send + Sync;

pub(crate) enum ExprNode {
    /// A single program invocation: the program followed by its arguments.
    Exec(Vec<OsString>),
    /// Left's stdout feeds right's stdin.
    Pipe(crate::Expression, crate::Expression),
    /// One redirection or modifier applied to an inner expression.
    Io(IoRedirect, crate::Expression),
}

pub(crate) enum IoRedirect {
    StdinBytes(Arc<Vec<u8>>),
    StdinPath(PathBuf),
    StdinFile(File),
    StdinNull,
    StdoutPath(PathBuf),
    StdoutFile(File),
    StdoutNull,
    StdoutCapture,
    StdoutToStderr,
    StderrPath(PathBuf),
    StderrFile(File),
    StderrNull,
    StderrCapture,
    StderrToStdout,
    StdoutStderrSwap,
    Dir(PathBuf),
    Env(OsString, OsString),
    EnvRemove(OsString),
    FullEnv(Vec<(OsString, OsString)>),
    Unchecked,
    BeforeSpawn(Arc<SpawnHook>),
}

impl ExprNode {
    /// Renders the builder-call chain that would construct this expression,
    /// e.g. `cmd("false").unchecked()`. Status errors embed this.
    pub(crate) fn fmt_chain(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprNode::Exec(argv) => {
                write!(f, "cmd(")?;
                for (i, arg) in argv.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", arg)?;
                }
                write!(f, ")")
            }
            ExprNode::Pipe(left, right) => {
                left.node().fmt_chain(f)?;
                write!(f, ".pipe(")?;
                right.node().fmt_chain(f)?;
                write!(f, ")")
            }
            ExprNode::Io(redirect, inner) => {
                inner.node().fmt_chain(f)?;
                redirect.fmt_suffix(f)
            }
        }
    }
}

impl IoRedirect {
    fn fmt_suffix(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoRedirect::StdinBytes(bytes) => write!(f, ".stdin_bytes({} bytes)", bytes.len()),
            IoRedirect::StdinPath(path) => write!(f, ".stdin_path({:?})", path),
            IoRedirect::StdinFile(_) => write!(f, ".stdin_file(..)"),
            IoRedirect::StdinNull => write!(f, ".stdin_null()"),
            IoRedirect::StdoutPath(path) => write!(f, ".stdout_path({:?})", path),
            IoRedirect::StdoutFile(_) => write!(f, ".stdout_file(..)"),
            IoRedirect::StdoutNull => write!(f, ".stdout_null()"),
            IoRedirect::StdoutCapture => write!(f, ".stdout_capture()"),
            IoRedirect::StdoutToStderr => write!(f, ".stdout_to_stderr()"),
            IoRedirect::StderrPath(path) => write!(f, ".stderr_path({:?})", path),
            IoRedirect::StderrFile(_) => write!(f, ".stderr_file(..)"),
            IoRedirect::StderrNull => write!(f, ".stderr_null()"),
            IoRedirect::StderrCapture => write!(f, ".stderr_capture()"),
            IoRedirect::StderrToStdout => write!(f, ".stderr_to_stdout()"),
            IoRedirect::StdoutStderrSwap => write!(f, ".stdout_stderr_swap()"),
            IoRedirect::Dir(path) => write!(f, ".dir({:?})", path),
            IoRedirect::Env(name, value) => write!(f, ".env({:?}, {:?})", name, value),
            IoRedirect::EnvRemove(name) => write!(f, ".env_remove({:?})", name),
            IoRedirect::FullEnv(map) => write!(f, ".full_env({} vars)", map.len()),
            IoRedirect::Unchecked => write!(f, ".unchecked()"),
            IoRedirect::BeforeSpawn(_) => write!(f, ".before_spawn(..)"),
        }
    }
}
